//! The error taxonomy shared by every layer of the storage engine.

/// Errors surfaced by the storage engine, from the `BlockBacking` up
/// through the `Store` façade.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Encoded document exceeds the size ceiling (8 KiB).
    #[error("encoded document is {size} bytes, exceeds the {limit} byte ceiling")]
    TooLarge {
        /// Size of the encoded document in bytes.
        size: usize,
        /// The ceiling that was exceeded.
        limit: usize,
    },

    /// Key is empty or collides with the reserved TTL side-entry prefix.
    #[error("invalid key: {reason}")]
    InvalidKey {
        /// Human-readable explanation (empty key, reserved prefix, ...).
        reason: &'static str,
    },

    /// Unrecoverable I/O failure from a `BlockBacking`.
    #[error("storage backing I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Operation's deadline elapsed before the Worker dequeued it.
    #[error("operation timed out before it was applied")]
    Timeout,

    /// Worker waited longer than `lock_timeout` for a reader lease to drain.
    #[error("timed out waiting {waited_ms}ms for a shared lease to drain")]
    LockTimeout {
        /// How long the Worker waited before giving up.
        waited_ms: u64,
    },

    /// Operation enqueued after `close()`.
    #[error("store is closed")]
    Closed,

    /// Value is not JSON-serialisable.
    #[error("value is not serialisable as a document: {0}")]
    Encoding(#[from] serde_json::Error),

    /// On open, the backing contained a structurally invalid B-tree log
    /// or TTL side entry.
    #[error("backing is corrupt: {0}")]
    Corrupt(String),

    /// The Worker was torn down while the operation was still queued.
    #[error("operation cancelled: worker shut down")]
    Cancelled,
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

//! MicroTetherDB core -- the document model, key generation, and the
//! shared error taxonomy used by the storage engine.
//!
//! - **Error** ([`error`]): the `Error`/`Result` taxonomy every layer of
//!   the engine returns.
//! - **Key** ([`key`]): `KeyClock`, the monotonic-plus-counter generator
//!   used when a caller does not supply a key of their own.
//! - **Document** ([`document`]): the `Document` alias over
//!   `serde_json`'s object model, dotted-path lookup, and the reserved
//!   `_tags`/TTL-prefix conventions.

pub mod document;
pub mod error;
pub mod key;

pub use document::{get_path, is_reserved_key, set_tags, Document, MAX_ENCODED_SIZE, TAGS_FIELD};
pub use error::{Error, Result};
pub use key::{ClockSource, KeyClock, SystemClock};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crate_loads() {
        // Empty body: if this test runs, the crate compiles and loads.
    }

    #[test]
    fn reexports_accessible() {
        let mut clock = KeyClock::new();
        let _ = clock.next();
        let _ = SystemClock;

        let document: Document = serde_json::Map::new();
        assert_eq!(get_path(&document, "missing"), None);
        assert!(!is_reserved_key(b"abc"));

        let _ = Error::Closed;
    }
}

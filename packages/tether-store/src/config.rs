//! Store-wide configuration: the tunables recognised by
//! [`crate::store::Store::open`], including the `auto_flush_seconds`
//! timer (see the design ledger for where it comes from).

use std::path::PathBuf;
use std::time::Duration;

/// Tunables recognised by [`crate::store::Store::open`]. Constructed by
/// the embedding program: there is no file/CLI/env loader for these.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Backing file path. Only consulted when `in_memory` is `false`.
    pub filename: Option<PathBuf>,
    /// Choose `MemoryBacking` (`true`) vs `FileBacking` (`false`).
    pub in_memory: bool,
    /// Initial `MemoryBacking` size as a percentage of a reference free-memory figure.
    pub ram_percentage: u8,
    /// Retry count for transient backing IO failures.
    pub max_retries: u32,
    /// Delay between retries of a transient backing IO failure.
    pub retry_delay: Duration,
    /// How long the Worker waits for a shared read lease to drain before an Operation fails.
    pub lock_timeout: Duration,
    /// Cadence of the full TTL reconciliation scan (fallback to the heap-driven sweep).
    pub cleanup_interval: Duration,
    /// Cadence of the TTL heap-driven sweep.
    pub ttl_check_interval: Duration,
    /// BTree Layer page cache size, in pages.
    pub btree_cachesize: usize,
    /// Nominal BTree Layer page size, in bytes. The BTree Layer is an
    /// append-log/keydir design with no paging of its own, so this
    /// knob is accepted for configuration-surface compatibility but
    /// currently has no effect on storage layout or I/O granularity.
    pub btree_pagesize: usize,
    /// Scale the flush threshold with lifetime operation count.
    pub adaptive_threshold: bool,
    /// Cadence of the timer that flushes if mutations are pending,
    /// independent of the operation-count threshold.
    pub auto_flush_seconds: u64,
    /// Per-operation deadline, measured from when the Store posts the
    /// Operation to the Worker. An Operation the Worker has not yet
    /// started applying by this deadline fails with `ErrTimeout`
    /// instead of being applied late. `None` disables the deadline.
    pub operation_timeout: Option<Duration>,
}

impl StoreOptions {
    pub(crate) fn auto_flush_interval(&self) -> Duration {
        Duration::from_secs(self.auto_flush_seconds.max(1))
    }
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            filename: None,
            in_memory: true,
            ram_percentage: 25,
            max_retries: 3,
            retry_delay: Duration::from_millis(100),
            lock_timeout: Duration::from_secs_f64(5.0),
            cleanup_interval: Duration::from_secs(3600),
            ttl_check_interval: Duration::from_secs(10),
            btree_cachesize: 32,
            btree_pagesize: 512,
            adaptive_threshold: true,
            auto_flush_seconds: 5,
            operation_timeout: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_table() {
        let options = StoreOptions::default();
        assert!(options.in_memory);
        assert_eq!(options.ram_percentage, 25);
        assert_eq!(options.max_retries, 3);
        assert_eq!(options.retry_delay, Duration::from_millis(100));
        assert_eq!(options.lock_timeout, Duration::from_secs(5));
        assert_eq!(options.cleanup_interval, Duration::from_secs(3600));
        assert_eq!(options.ttl_check_interval, Duration::from_secs(10));
        assert_eq!(options.btree_cachesize, 32);
        assert_eq!(options.btree_pagesize, 512);
        assert!(options.adaptive_threshold);
        assert_eq!(options.operation_timeout, None);
    }

    #[test]
    fn auto_flush_interval_never_hits_zero() {
        let mut options = StoreOptions::default();
        options.auto_flush_seconds = 0;
        assert_eq!(options.auto_flush_interval(), Duration::from_secs(1));
    }
}

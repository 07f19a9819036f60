//! The Worker: a single cooperative task that drains the Operation
//! queue, applies mutations to the BTree Layer and TTL Index, drives
//! adaptive flushing, and runs the periodic TTL sweep and
//! reconciliation scan.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, RwLock, RwLockWriteGuard};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug_span, info, warn, Instrument};

use tether_core::document::Document;
use tether_core::error::{Error, Result};
use tether_core::key::KeyClock;

use crate::btree::BTreeLayer;
use crate::codec;
use crate::config::StoreOptions;
use crate::ttl::{self, TtlIndex};

/// The BTree Layer, TTL Index, and flush bookkeeping, held behind a
/// single `RwLock`: queries take a shared read lease, the Worker takes
/// the exclusive lease to mutate.
pub(crate) struct EngineState {
    pub(crate) btree: BTreeLayer,
    pub(crate) ttl: TtlIndex,
    pub(crate) ops_lifetime: u64,
    pub(crate) ops_since_flush: u64,
}

pub(crate) type SharedState = Arc<RwLock<EngineState>>;

/// Either a caller-supplied key or a request to mint one.
pub(crate) enum KeyChoice {
    Generated,
    Explicit(String),
}

pub(crate) enum Operation {
    Put {
        key: KeyChoice,
        document: Document,
        ttl_seconds: Option<u64>,
        deadline: Option<Instant>,
        respond: oneshot::Sender<Result<String>>,
    },
    Delete {
        key: String,
        deadline: Option<Instant>,
        respond: oneshot::Sender<Result<bool>>,
    },
    PurgeAll {
        deadline: Option<Instant>,
        respond: oneshot::Sender<Result<()>>,
    },
    PutBatch {
        items: Vec<(KeyChoice, Document)>,
        ttls: Vec<Option<u64>>,
        deadline: Option<Instant>,
        respond: oneshot::Sender<Result<Vec<String>>>,
    },
    DeleteBatch {
        keys: Vec<String>,
        deadline: Option<Instant>,
        respond: oneshot::Sender<Result<usize>>,
    },
    Cleanup {
        respond: oneshot::Sender<Result<usize>>,
    },
    Flush {
        respond: oneshot::Sender<Result<()>>,
    },
    Close {
        respond: oneshot::Sender<Result<()>>,
    },
}

impl Operation {
    fn deadline(&self) -> Option<Instant> {
        match self {
            Operation::Put { deadline, .. }
            | Operation::Delete { deadline, .. }
            | Operation::PurgeAll { deadline, .. }
            | Operation::PutBatch { deadline, .. }
            | Operation::DeleteBatch { deadline, .. } => *deadline,
            Operation::Cleanup { .. } | Operation::Flush { .. } | Operation::Close { .. } => None,
        }
    }

    /// Resolves this Operation's completion with `ErrTimeout` without
    /// touching storage.
    fn fail_with_timeout(self) {
        match self {
            Operation::Put { respond, .. } => {
                let _ = respond.send(Err(Error::Timeout));
            }
            Operation::Delete { respond, .. } => {
                let _ = respond.send(Err(Error::Timeout));
            }
            Operation::PurgeAll { respond, .. } => {
                let _ = respond.send(Err(Error::Timeout));
            }
            Operation::PutBatch { respond, .. } => {
                let _ = respond.send(Err(Error::Timeout));
            }
            Operation::DeleteBatch { respond, .. } => {
                let _ = respond.send(Err(Error::Timeout));
            }
            Operation::Cleanup { respond } => {
                let _ = respond.send(Err(Error::Timeout));
            }
            Operation::Flush { respond } => {
                let _ = respond.send(Err(Error::Timeout));
            }
            Operation::Close { respond } => {
                let _ = respond.send(Err(Error::Timeout));
            }
        }
    }
}

fn now_epoch_seconds() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// The operation-count flush threshold ladder.
fn flush_threshold(ops_lifetime: u64, adaptive: bool) -> u64 {
    if !adaptive {
        return 10;
    }
    if ops_lifetime < 100 {
        10
    } else if ops_lifetime < 1000 {
        15
    } else {
        20
    }
}

fn resolve_key(choice: KeyChoice, clock: &mut KeyClock) -> Result<String> {
    match choice {
        KeyChoice::Generated => Ok(clock.next()),
        KeyChoice::Explicit(key) => {
            if key.is_empty() {
                return Err(Error::InvalidKey {
                    reason: "key is empty",
                });
            }
            if tether_core::document::is_reserved_key(key.as_bytes()) {
                return Err(Error::InvalidKey {
                    reason: "key collides with the reserved TTL prefix",
                });
            }
            Ok(key)
        }
    }
}

/// Retries a transient backing IO failure up to `max_retries` times,
/// waiting `retry_delay` between attempts.
async fn retry_io<T>(
    max_retries: u32,
    retry_delay: std::time::Duration,
    mut attempt: impl FnMut() -> Result<T>,
) -> Result<T> {
    let mut tries = 0;
    loop {
        match attempt() {
            Ok(value) => return Ok(value),
            Err(Error::Io(source)) if tries < max_retries => {
                tries += 1;
                warn!(attempt = tries, %source, "retrying after backing IO error");
                tokio::time::sleep(retry_delay).await;
            }
            Err(other) => return Err(other),
        }
    }
}

pub(crate) struct Worker {
    state: SharedState,
    queue: mpsc::Receiver<Operation>,
    options: StoreOptions,
    keys: KeyClock,
}

impl Worker {
    pub(crate) fn new(
        state: SharedState,
        queue: mpsc::Receiver<Operation>,
        options: StoreOptions,
    ) -> Self {
        Self {
            state,
            queue,
            options,
            keys: KeyClock::new(),
        }
    }

    pub(crate) async fn run(mut self) {
        let mut ttl_tick = interval(self.options.ttl_check_interval);
        ttl_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut cleanup_tick = interval(self.options.cleanup_interval);
        cleanup_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut flush_tick = interval(self.options.auto_flush_interval());
        flush_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                maybe_op = self.queue.recv() => {
                    match maybe_op {
                        Some(Operation::Close { respond }) => {
                            self.drain_remaining().await;
                            let result = self.flush().await;
                            info!("store closed");
                            let _ = respond.send(result);
                            break;
                        }
                        Some(op) => self.apply(op).await,
                        None => break, // every Store handle, and its Sender, was dropped
                    }
                }
                _ = ttl_tick.tick() => self.run_ttl_sweep().await,
                _ = cleanup_tick.tick() => self.run_cleanup_scan().await,
                _ = flush_tick.tick() => self.maybe_timer_flush().await,
            }
        }
    }

    async fn drain_remaining(&mut self) {
        while let Ok(op) = self.queue.try_recv() {
            self.apply(op).await;
        }
    }

    async fn apply(&mut self, op: Operation) {
        if let Some(deadline) = op.deadline() {
            if Instant::now() > deadline {
                op.fail_with_timeout();
                return;
            }
        }

        match op {
            Operation::Put {
                key,
                document,
                ttl_seconds,
                respond,
                ..
            } => {
                let span = debug_span!("worker.apply", op = "put");
                let result = self.do_put(key, document, ttl_seconds).instrument(span).await;
                let _ = respond.send(result);
            }
            Operation::Delete { key, respond, .. } => {
                let span = debug_span!("worker.apply", op = "delete");
                let result = self.do_delete(&key).instrument(span).await;
                let _ = respond.send(result);
            }
            Operation::PurgeAll { respond, .. } => {
                let result = self.do_purge_all().await;
                let _ = respond.send(result);
            }
            Operation::PutBatch {
                items,
                ttls,
                respond,
                ..
            } => {
                let result = self.do_put_batch(items, ttls).await;
                let _ = respond.send(result);
            }
            Operation::DeleteBatch { keys, respond, .. } => {
                let result = self.do_delete_batch(&keys).await;
                let _ = respond.send(result);
            }
            Operation::Cleanup { respond } => {
                let result = self.sweep_once().await;
                let _ = respond.send(result);
            }
            Operation::Flush { respond } => {
                let result = self.flush().await;
                let _ = respond.send(result);
            }
            Operation::Close { .. } => unreachable!("Close is handled in run()"),
        }
    }

    async fn lock_write(&self) -> Result<RwLockWriteGuard<'_, EngineState>> {
        match tokio::time::timeout(self.options.lock_timeout, self.state.write()).await {
            Ok(guard) => Ok(guard),
            Err(_) => Err(Error::LockTimeout {
                waited_ms: self.options.lock_timeout.as_millis() as u64,
            }),
        }
    }

    fn account_mutation(&self, state: &mut EngineState) {
        state.ops_lifetime += 1;
        state.ops_since_flush += 1;
        let threshold = flush_threshold(state.ops_lifetime, self.options.adaptive_threshold);
        if state.ops_since_flush >= threshold {
            match state.btree.flush() {
                Ok(()) => state.ops_since_flush = 0,
                Err(err) => warn!(%err, "adaptive flush failed"),
            }
        }
    }

    async fn do_put(
        &mut self,
        key: KeyChoice,
        document: Document,
        ttl_seconds: Option<u64>,
    ) -> Result<String> {
        let key = resolve_key(key, &mut self.keys)?;
        let encoded = codec::encode(&document)?;
        let mut guard = self.lock_write().await?;

        guard.ttl.cancel(&key);
        let ttl_side_key = ttl::side_entry_key(&key);
        if let Some(ttl_seconds) = ttl_seconds {
            let expiry = now_epoch_seconds() + ttl_seconds;
            retry_io(self.options.max_retries, self.options.retry_delay, || {
                guard.btree.put(&ttl_side_key, &ttl::encode_expiry(expiry))
            })
            .await?;
            guard.ttl.insert(key.clone(), expiry);
        } else {
            retry_io(self.options.max_retries, self.options.retry_delay, || {
                guard.btree.delete(&ttl_side_key).map(|_| ())
            })
            .await?;
        }

        retry_io(self.options.max_retries, self.options.retry_delay, || {
            guard.btree.put(key.as_bytes(), &encoded)
        })
        .await?;

        self.account_mutation(&mut guard);
        Ok(key)
    }

    async fn do_delete(&mut self, key: &str) -> Result<bool> {
        let mut guard = self.lock_write().await?;
        let now = now_epoch_seconds();
        if guard.ttl.is_expired(key, now) {
            // Already logically gone: treat as already removed.
            return Ok(false);
        }

        let existed = retry_io(self.options.max_retries, self.options.retry_delay, || {
            guard.btree.delete(key.as_bytes())
        })
        .await?;

        if existed {
            let ttl_key = ttl::side_entry_key(key);
            retry_io(self.options.max_retries, self.options.retry_delay, || {
                guard.btree.delete(&ttl_key).map(|_| ())
            })
            .await?;
            guard.ttl.cancel(key);
            self.account_mutation(&mut guard);
        }
        Ok(existed)
    }

    async fn do_purge_all(&mut self) -> Result<()> {
        let mut guard = self.lock_write().await?;
        retry_io(self.options.max_retries, self.options.retry_delay, || {
            guard.btree.clear()
        })
        .await?;
        guard.ttl = TtlIndex::new();
        self.account_mutation(&mut guard);
        Ok(())
    }

    async fn do_put_batch(
        &mut self,
        items: Vec<(KeyChoice, Document)>,
        mut ttls: Vec<Option<u64>>,
    ) -> Result<Vec<String>> {
        if ttls.len() == 1 && items.len() > 1 {
            let broadcast = ttls[0];
            ttls = vec![broadcast; items.len()];
        } else {
            ttls.resize(items.len(), None);
        }
        let mut keys = Vec::with_capacity(items.len());
        for ((key_choice, document), ttl_seconds) in items.into_iter().zip(ttls) {
            // Batch atomicity is a property of the *result*, not of one
            // lock span: on failure we simply discard `keys` by
            // returning the error, leaving whatever partial storage
            // state exists for the next sweep/flush.
            let key = self.do_put(key_choice, document, ttl_seconds).await?;
            keys.push(key);
        }
        Ok(keys)
    }

    async fn do_delete_batch(&mut self, keys: &[String]) -> Result<usize> {
        let mut removed = 0;
        for key in keys {
            if self.do_delete(key).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn flush(&mut self) -> Result<()> {
        let mut guard = self.lock_write().await?;
        guard.btree.flush()?;
        guard.ops_since_flush = 0;
        Ok(())
    }

    async fn maybe_timer_flush(&mut self) {
        let mut guard = match self.lock_write().await {
            Ok(guard) => guard,
            Err(err) => {
                warn!(%err, "timer flush could not acquire the write lease");
                return;
            }
        };
        if guard.ops_since_flush > 0 {
            match guard.btree.flush() {
                Ok(()) => guard.ops_since_flush = 0,
                Err(err) => warn!(%err, "timer-triggered flush failed"),
            }
        }
    }

    async fn run_ttl_sweep(&mut self) {
        match self.sweep_once().await {
            Ok(count) if count > 0 => info!(count, "ttl sweep removed expired records"),
            Ok(_) => {}
            Err(err) => warn!(%err, "ttl sweep failed"),
        }
    }

    /// One pass of TTL-driven expiry removal.
    async fn sweep_once(&mut self) -> Result<usize> {
        let now = now_epoch_seconds();
        let mut guard = self.lock_write().await?;
        let expired = guard.ttl.pop_expired(now);

        for key in &expired {
            retry_io(self.options.max_retries, self.options.retry_delay, || {
                guard.btree.delete(key.as_bytes())
            })
            .await?;
            let ttl_key = ttl::side_entry_key(key);
            retry_io(self.options.max_retries, self.options.retry_delay, || {
                guard.btree.delete(&ttl_key).map(|_| ())
            })
            .await?;
        }

        if !expired.is_empty() {
            guard.ops_lifetime += expired.len() as u64;
            guard.ops_since_flush += expired.len() as u64;
        }
        if guard.ops_since_flush > 0 {
            guard.btree.flush()?;
            guard.ops_since_flush = 0;
        }
        Ok(expired.len())
    }

    async fn run_cleanup_scan(&mut self) {
        if let Err(err) = self.reconcile_ttl_state().await {
            warn!(%err, "ttl reconciliation scan failed");
        }
    }

    /// Fallback full scan: reconciles the TTL Index against the
    /// persisted side entries, covering the one documented
    /// inconsistency window (a crash between a side-entry write and
    /// the in-memory heap insert).
    async fn reconcile_ttl_state(&mut self) -> Result<()> {
        let mut guard = self.lock_write().await?;
        let side_entries: Vec<(Vec<u8>, Vec<u8>)> = guard
            .btree
            .iter_prefix(ttl::ttl_prefix())
            .collect::<Result<Vec<_>>>()?;

        for (side_key, value) in side_entries {
            let Some(record_key) = ttl::record_key_from_side_entry(&side_key) else {
                continue;
            };
            let Some(expiry) = ttl::decode_expiry(&value) else {
                continue;
            };
            if guard.ttl.expiry_of(record_key) != Some(expiry) {
                guard.ttl.insert(record_key.to_string(), expiry);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backing::{BlockBacking, MemoryBacking};

    async fn test_worker(options: StoreOptions) -> (Worker, SharedState) {
        let backing: Box<dyn BlockBacking> = Box::new(MemoryBacking::new(1024));
        let btree = BTreeLayer::open(backing, options.btree_cachesize).unwrap();
        let state: SharedState = Arc::new(RwLock::new(EngineState {
            btree,
            ttl: TtlIndex::new(),
            ops_lifetime: 0,
            ops_since_flush: 0,
        }));
        let (_sender, receiver) = mpsc::channel(8);
        let worker = Worker::new(Arc::clone(&state), receiver, options);
        (worker, state)
    }

    #[test]
    fn flush_threshold_follows_the_adaptive_ladder() {
        assert_eq!(flush_threshold(0, true), 10);
        assert_eq!(flush_threshold(99, true), 10);
        assert_eq!(flush_threshold(100, true), 15);
        assert_eq!(flush_threshold(999, true), 15);
        assert_eq!(flush_threshold(1000, true), 20);
    }

    #[test]
    fn flush_threshold_is_fixed_when_adaptive_is_disabled() {
        assert_eq!(flush_threshold(5000, false), 10);
    }

    #[tokio::test]
    async fn lock_write_times_out_while_a_reader_holds_the_lease() {
        let (worker, state) = test_worker(StoreOptions {
            lock_timeout: std::time::Duration::from_millis(20),
            ..StoreOptions::default()
        })
        .await;
        let _guard = state.write().await;
        let err = worker.lock_write().await.unwrap_err();
        assert!(matches!(err, Error::LockTimeout { .. }));
    }

    #[tokio::test]
    async fn retry_io_succeeds_once_attempts_fall_within_the_retry_budget() {
        let mut attempts = 0;
        let result: Result<&'static str> =
            retry_io(2, std::time::Duration::from_millis(1), || {
                attempts += 1;
                if attempts < 3 {
                    Err(Error::Io(std::io::Error::new(std::io::ErrorKind::Other, "transient")))
                } else {
                    Ok("ok")
                }
            })
            .await;
        assert_eq!(result.unwrap(), "ok");
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn retry_io_gives_up_after_exhausting_the_retry_budget() {
        let mut attempts = 0;
        let result: Result<()> = retry_io(2, std::time::Duration::from_millis(1), || {
            attempts += 1;
            Err(Error::Io(std::io::Error::new(std::io::ErrorKind::Other, "persistent")))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts, 3); // the initial attempt plus two retries
    }

    #[tokio::test]
    async fn reconcile_ttl_state_restores_a_side_entry_missing_from_the_heap() {
        let (mut worker, state) = test_worker(StoreOptions::default()).await;
        {
            let mut guard = state.write().await;
            let side_key = ttl::side_entry_key("orphan");
            guard.btree.put(&side_key, &ttl::encode_expiry(123)).unwrap();
        }
        worker.reconcile_ttl_state().await.unwrap();
        let guard = state.read().await;
        assert_eq!(guard.ttl.expiry_of("orphan"), Some(123));
    }

    #[tokio::test]
    async fn reconcile_ttl_state_leaves_an_already_consistent_entry_untouched() {
        let (mut worker, state) = test_worker(StoreOptions::default()).await;
        {
            let mut guard = state.write().await;
            let side_key = ttl::side_entry_key("k");
            guard.btree.put(&side_key, &ttl::encode_expiry(456)).unwrap();
            guard.ttl.insert("k".to_string(), 456);
        }
        worker.reconcile_ttl_state().await.unwrap();
        let guard = state.read().await;
        assert_eq!(guard.ttl.expiry_of("k"), Some(456));
    }
}

//! The Store Façade: the public contract an embedder drives directly.
//! Owns the Worker, the shared `BTreeLayer`/`TtlIndex` state, and the
//! `BlockBacking` beneath them; mutations are posted to the Worker over
//! a channel and awaited, reads and queries take the shared lease
//! directly.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tracing::info;

use tether_core::document::Document;
use tether_core::error::{Error, Result};

use crate::backing::{initial_capacity_for, BlockBacking, FileBacking, MemoryBacking};
use crate::btree::BTreeLayer;
use crate::config::StoreOptions;
use crate::query;
use crate::ttl::{self, TtlIndex};
use crate::worker::{EngineState, KeyChoice, Operation, SharedState, Worker};

const OPERATION_QUEUE_DEPTH: usize = 256;

/// The embedded document store.
///
/// Cloning a `Store` is cheap and shares the same Worker: every clone
/// posts to the same queue and reads the same locked state, matching a
/// single-process engine with no cross-handle isolation.
#[derive(Clone)]
pub struct Store {
    state: SharedState,
    sender: mpsc::Sender<Operation>,
    worker: Arc<std::sync::Mutex<Option<JoinHandle<()>>>>,
    operation_timeout: Option<Duration>,
}

impl Store {
    /// Opens a store per `options`: constructs the Block Backing,
    /// scans it to rebuild the BTree Layer's index and the TTL Index's
    /// heap, and starts the Worker.
    pub async fn open(options: StoreOptions) -> Result<Self> {
        let backing: Box<dyn BlockBacking> = if options.in_memory {
            Box::new(MemoryBacking::new(initial_capacity_for(options.ram_percentage)))
        } else {
            let path = options.filename.clone().ok_or(Error::InvalidKey {
                reason: "in_memory is false but no filename was configured",
            })?;
            Box::new(FileBacking::open(&path)?)
        };

        let btree = BTreeLayer::open(backing, options.btree_cachesize)?;
        let ttl = rebuild_ttl_index(&btree)?;

        let state: SharedState = Arc::new(RwLock::new(EngineState {
            btree,
            ttl,
            ops_lifetime: 0,
            ops_since_flush: 0,
        }));

        let operation_timeout = options.operation_timeout;
        let (sender, receiver) = mpsc::channel(OPERATION_QUEUE_DEPTH);
        let worker = Worker::new(Arc::clone(&state), receiver, options);
        let handle = tokio::spawn(worker.run());
        info!("store opened");

        Ok(Self {
            state,
            sender,
            worker: Arc::new(std::sync::Mutex::new(Some(handle))),
            operation_timeout,
        })
    }

    /// The deadline a freshly-built Operation should carry, derived
    /// from `operation_timeout`. `None` when no timeout is configured,
    /// matching an Operation that never fails with `ErrTimeout`.
    fn deadline(&self) -> Option<Instant> {
        self.operation_timeout.map(|timeout| Instant::now() + timeout)
    }

    async fn send<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T>>) -> Operation,
    ) -> Result<T> {
        let (respond, recv) = oneshot::channel();
        self.sender
            .send(build(respond))
            .await
            .map_err(|_| Error::Closed)?;
        recv.await.map_err(|_| Error::Cancelled)?
    }

    /// Engine-generated key form: `put(value, ttl?, tags?) -> key`.
    pub async fn put(
        &self,
        mut document: Document,
        ttl_seconds: Option<u64>,
        tags: Option<&[String]>,
    ) -> Result<String> {
        if let Some(tags) = tags {
            tether_core::document::set_tags(&mut document, tags);
        }
        self.send(|respond| Operation::Put {
            key: KeyChoice::Generated,
            document,
            ttl_seconds,
            deadline: self.deadline(),
            respond,
        })
        .await
    }

    /// Caller-supplied key form: `put(key, value, ttl?, tags?) -> key`.
    /// Overwrites the prior Document and cancels its TTL, if any.
    pub async fn put_with_key(
        &self,
        key: impl Into<String>,
        mut document: Document,
        ttl_seconds: Option<u64>,
        tags: Option<&[String]>,
    ) -> Result<String> {
        if let Some(tags) = tags {
            tether_core::document::set_tags(&mut document, tags);
        }
        self.send(|respond| Operation::Put {
            key: KeyChoice::Explicit(key.into()),
            document,
            ttl_seconds,
            deadline: self.deadline(),
            respond,
        })
        .await
    }

    /// Point lookup. Returns `None` for a missing key or one whose TTL
    /// has elapsed but not yet been swept.
    pub async fn get(&self, key: &str) -> Result<Option<Document>> {
        let guard = self.state.read().await;
        let now = now_epoch_seconds();
        if guard.ttl.is_expired(key, now) {
            return Ok(None);
        }
        let Some(bytes) = guard.btree.get(key.as_bytes())? else {
            return Ok(None);
        };
        Ok(Some(crate::codec::decode(&bytes)?))
    }

    /// Deletes `key`, returning whether a live record existed. A
    /// TTL-expired-but-unswept record is treated as already gone.
    pub async fn delete(&self, key: &str) -> Result<bool> {
        self.send(|respond| Operation::Delete {
            key: key.to_string(),
            deadline: self.deadline(),
            respond,
        })
        .await
    }

    /// Removes every record and clears the TTL state.
    pub async fn purge(&self) -> Result<()> {
        self.send(|respond| Operation::PurgeAll {
            deadline: self.deadline(),
            respond,
        })
        .await
    }

    /// Batch put. `ttls` is consumed positionally against `items`: a
    /// shorter `ttls` pads with `None`, and a single-element `ttls`
    /// against more than one item broadcasts that one TTL to every
    /// item rather than applying to the first alone. Returned keys are
    /// positionally aligned with `items`.
    pub async fn put_batch(
        &self,
        items: Vec<Document>,
        ttls: Vec<Option<u64>>,
    ) -> Result<Vec<String>> {
        let items = items
            .into_iter()
            .map(|document| (KeyChoice::Generated, document))
            .collect();
        self.send(|respond| Operation::PutBatch {
            items,
            ttls,
            deadline: self.deadline(),
            respond,
        })
        .await
    }

    /// Batch delete. Returns the count of keys that actually existed.
    pub async fn delete_batch(&self, keys: Vec<String>) -> Result<usize> {
        self.send(|respond| Operation::DeleteBatch {
            keys,
            deadline: self.deadline(),
            respond,
        })
        .await
    }

    /// Evaluates `predicate` against every live record in BTree key
    /// order, short-circuiting at `$limit` if present. Takes the
    /// shared read lease for the duration of the scan.
    pub async fn query(&self, predicate: &Document) -> Result<Vec<Document>> {
        let guard = self.state.read().await;
        let now = now_epoch_seconds();
        let limit = query::limit_of(predicate);
        let reserved_prefix = [tether_core::document::RESERVED_KEY_PREFIX];
        let mut out = Vec::new();

        for entry in guard.btree.iter_prefix(&[]) {
            let (key, bytes) = entry?;
            if key.starts_with(&reserved_prefix) {
                continue;
            }
            let Ok(key_str) = std::str::from_utf8(&key) else {
                continue;
            };
            if guard.ttl.is_expired(key_str, now) {
                continue;
            }
            let document = crate::codec::decode(&bytes)?;
            if query::matches(predicate, &document) {
                out.push(document);
                if limit.is_some_and(|limit| out.len() >= limit) {
                    break;
                }
            }
        }
        Ok(out)
    }

    /// Drives one TTL sweep synchronously, returning the count swept.
    pub async fn cleanup(&self) -> Result<usize> {
        self.send(|respond| Operation::Cleanup { respond }).await
    }

    /// Forces a flush of pending mutations to the Block Backing.
    pub async fn flush(&self) -> Result<()> {
        self.send(|respond| Operation::Flush { respond }).await
    }

    /// A read-only snapshot of engine bookkeeping, for embedders that
    /// want visibility without a metrics crate.
    pub async fn stats(&self) -> StoreStats {
        let guard = self.state.read().await;
        StoreStats {
            live_count: guard.btree.len(),
            ttl_count: guard.ttl.live_count(),
            ops_lifetime: guard.ops_lifetime,
            ops_since_flush: guard.ops_since_flush,
            backing_size: guard.btree.backing_size(),
        }
    }

    /// Drains the Worker queue, issues a final flush, and stops the
    /// Worker. Idempotent: a second call observes the channel already
    /// closed and returns immediately.
    pub async fn close(&self) -> Result<()> {
        let result = self.send(|respond| Operation::Close { respond }).await;
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.await;
        }
        match result {
            Err(Error::Closed) => Ok(()),
            other => other,
        }
    }
}

/// A read-only snapshot of engine bookkeeping (see [`Store::stats`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct StoreStats {
    /// Number of live (non-tombstoned) records, including TTL side entries.
    pub live_count: usize,
    /// Number of records currently carrying a live TTL.
    pub ttl_count: usize,
    /// Total mutating operations applied since `open`.
    pub ops_lifetime: u64,
    /// Mutating operations applied since the last flush.
    pub ops_since_flush: u64,
    /// Current size, in bytes, of the Block Backing.
    pub backing_size: u64,
}

/// Scoped acquisition: opens a store, and drains + closes it on drop
/// regardless of exit path. Expressed here as RAII rather than an
/// explicit shutdown controller since there is no second task to
/// coordinate with, only the one Worker this guard itself owns.
pub struct ScopedStore {
    store: Store,
}

impl ScopedStore {
    pub async fn open(options: StoreOptions) -> Result<Self> {
        Ok(Self {
            store: Store::open(options).await?,
        })
    }
}

impl std::ops::Deref for ScopedStore {
    type Target = Store;

    fn deref(&self) -> &Store {
        &self.store
    }
}

impl Drop for ScopedStore {
    fn drop(&mut self) {
        let store = self.store.clone();
        // `close()` is async; a synchronous `Drop` can only fire it and
        // let the Worker's own task observe the queue close if no one
        // awaits this handle. Embedders that need a deterministic drain
        // on a specific exit path should call `store.close().await`
        // directly before dropping the guard.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = store.close().await;
            });
        }
    }
}

fn now_epoch_seconds() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Rebuilds the TTL Index by scanning TTL side entries at open.
/// Entries already past expiry are still inserted; the Worker's first
/// sweep tick retires them immediately rather than special-casing
/// "already expired at open" here.
fn rebuild_ttl_index(btree: &BTreeLayer) -> Result<TtlIndex> {
    let mut index = TtlIndex::new();
    for entry in btree.iter_prefix(ttl::ttl_prefix()) {
        let (side_key, value) = entry?;
        let Some(record_key) = ttl::record_key_from_side_entry(&side_key) else {
            continue;
        };
        let Some(expiry) = ttl::decode_expiry(&value) else {
            continue;
        };
        index.insert(record_key.to_string(), expiry);
    }
    Ok(index)
}

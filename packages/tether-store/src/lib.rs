//! MicroTetherDB storage engine: the B-tree-backed document store with
//! its TTL index, query evaluator, write path, cleanup loop, and
//! cooperative single-task concurrency discipline.
//!
//! - **Block Backing** ([`backing`]): the volatile/file-backed byte
//!   stream beneath the BTree Layer.
//! - **BTree Layer** ([`btree`]): the ordered key→value map over a
//!   Block Backing.
//! - **Codec** ([`codec`]): Document ⟷ byte encoding, size-checked.
//! - **TTL Index** ([`ttl`]): the in-memory expiry min-heap and its
//!   on-storage side entries.
//! - **Query Engine** ([`query`]): the predicate evaluator.
//! - **Worker**: the cooperative single task that serialises
//!   mutations, flushing, and cleanup (internal; driven through
//!   [`Store`]).
//! - **Store Façade** ([`store`]): the public contract.

mod backing;
mod btree;
mod codec;
pub mod config;
pub mod query;
mod store;
mod ttl;
mod worker;

pub use backing::{BlockBacking, FileBacking, MemoryBacking};
pub use config::StoreOptions;
pub use store::{ScopedStore, Store, StoreStats};

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn crate_loads_and_opens_an_in_memory_store() {
        let store = Store::open(StoreOptions::default()).await.unwrap();
        store.close().await.unwrap();
    }
}

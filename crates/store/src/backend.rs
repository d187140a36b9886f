use async_trait::async_trait;
use std::collections::BTreeMap;
use tracker_core::TrackerResult;

/// Values observed by a transaction, `None` meaning the key was absent.
pub type ReadSet = BTreeMap<String, Option<String>>;
/// Values a transaction will write on commit.
pub type WriteSet = BTreeMap<String, String>;

/// String key/value datastore with the few atomic primitives the tracker
/// needs. Every method is a single round trip.
#[async_trait]
pub trait KvBackend: Send + Sync + 'static {
    async fn get(&self, key: &str) -> TrackerResult<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> TrackerResult<()>;

    /// Set only when absent. Returns whether this call wrote the value.
    async fn set_if_absent(&self, key: &str, value: &str) -> TrackerResult<bool>;

    /// Atomically move a round-robin cursor to `(current + 1) % len` and
    /// return the new position. A missing cursor counts as 0.
    async fn advance_cursor(&self, key: &str, len: usize) -> TrackerResult<usize>;

    /// Apply `writes` only if every key in `reads` still holds the observed
    /// value. Returns `false` on conflict, with nothing written.
    async fn commit(&self, reads: &ReadSet, writes: &WriteSet) -> TrackerResult<bool>;
}

//! Datastore access: a small key/value backend contract, its Redis and
//! in-memory implementations, and the typed store used by every service.

pub mod backend;
pub mod keys;
pub mod memory;
pub mod redis_backend;
pub mod store;
pub mod tx;

pub use backend::{KvBackend, ReadSet, WriteSet};
pub use keys::CursorKind;
pub use memory::MemoryBackend;
pub use redis_backend::RedisBackend;
pub use store::{ClaimOutcome, Store};
pub use tx::StoreTx;

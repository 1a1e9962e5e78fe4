//! Durable per-agent records
//!
//! [`StateStore`] is the only shared mutable resource of the service.
//! Writers read-modify-write under the agent lock; readers may go through a
//! [`TtlCache`].

pub mod cache;
pub mod file;
pub mod memory;
pub mod retry;
pub mod store;

pub use cache::TtlCache;
pub use file::FileStore;
pub use memory::MemoryStore;
pub use retry::RetryingStore;
pub use store::{open_store, SharedStore, StateStore};

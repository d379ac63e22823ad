//! Persistence layer: domain models, the SQLite-backed [`store::Store`],
//! and the optional JSONL mirror used for cross-machine sync.

pub mod models;
pub mod pool;
pub mod store;
pub mod sync;

pub use store::{Store, StoreError};

//! Store backends.
//!
//! Backends implement [`StoreProvider`](crate::StoreProvider) and
//! [`ObjectStore`](crate::ObjectStore) for different storage types.

mod local;
mod memory;

pub use local::{LocalBackend, LocalBucket};
pub use memory::{MemoryBackend, MemoryBucket, DEFAULT_CHUNK_SIZE, DEFAULT_PAGE_SIZE};

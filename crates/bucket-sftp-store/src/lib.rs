//! Object storage abstraction for bucket-sftp.
//!
//! Key components:
//!
//! - [`ObjectStore`] - Operations on one bucket
//! - [`StoreProvider`] - Resolves bucket names to stores
//! - [`MemoryBackend`] - In-memory buckets (testing, throwaway servers)
//! - [`LocalBackend`] - One directory per bucket (with key security)
//!
//! ## Design Decisions
//!
//! - **Flat keys**: There are no directories, only keys. Hierarchy is
//!   synthesized by delimiter-bounded listings and zero-length marker
//!   objects whose keys end in `/`.
//! - **Forward-only reads**: `open_read` yields a start-to-end byte stream.
//!   Callers that need random access must reorder on their side.
//! - **Commit on finish**: uploads are invisible until the writer is
//!   finished and vanish if the writer is dropped.

pub mod backends;
mod error;
mod ops;
mod types;

pub use backends::{LocalBackend, MemoryBackend, MemoryBucket};
pub use error::{StoreError, StoreResult};
pub use ops::{ByteStream, ObjectStore, ObjectWriter, StoreProvider};
pub use types::{EntryKind, ListPage, ListQuery, ObjectMeta};

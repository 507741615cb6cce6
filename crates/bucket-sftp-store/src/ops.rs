//! Object store operations traits.
//!
//! These mirror what a cloud bucket offers: flat keys, prefix listings,
//! forward-only read streams and append-only uploads that become visible
//! only once finished.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::BoxStream;
use futures::StreamExt;
use std::sync::Arc;

use crate::types::{ListPage, ListQuery, ObjectMeta};
use crate::StoreResult;

/// A forward-only stream of object content.
pub type ByteStream = BoxStream<'static, StoreResult<Bytes>>;

/// Operations on a single bucket.
///
/// Keys are relative to the bucket and never start with `/`. A key ending in
/// `/` is a directory marker.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    // ========================================================================
    // Reading
    // ========================================================================

    /// List one page of entries matching `query`.
    async fn list(&self, query: &ListQuery) -> StoreResult<ListPage>;

    /// Returns true if an object with exactly this key exists.
    async fn exists(&self, key: &str) -> StoreResult<bool>;

    /// Fetch object metadata.
    async fn head(&self, key: &str) -> StoreResult<ObjectMeta>;

    /// Open a start-to-end read stream over an object.
    async fn open_read(&self, key: &str) -> StoreResult<ByteStream>;

    // ========================================================================
    // Writing
    // ========================================================================

    /// Begin an upload. The object replaces any existing one once the writer
    /// is finished; an abandoned writer leaves no trace.
    async fn open_write(&self, key: &str) -> StoreResult<Box<dyn ObjectWriter>>;

    /// Delete an object.
    async fn delete(&self, key: &str) -> StoreResult<()>;

    /// Move an object to a new key.
    async fn rename(&self, from: &str, to: &str) -> StoreResult<()>;

    // ========================================================================
    // Convenience methods (default implementations)
    // ========================================================================

    /// Upload a complete object in one call.
    async fn put(&self, key: &str, data: Bytes) -> StoreResult<()> {
        let mut writer = self.open_write(key).await?;
        if !data.is_empty() {
            writer.append(data).await?;
        }
        writer.finish().await
    }

    /// Read an entire object into memory.
    async fn read_all(&self, key: &str) -> StoreResult<Bytes> {
        let mut stream = self.open_read(key).await?;
        let mut out = BytesMut::new();
        while let Some(chunk) = stream.next().await {
            out.extend_from_slice(&chunk?);
        }
        Ok(out.freeze())
    }
}

/// An in-progress upload.
#[async_trait]
pub trait ObjectWriter: Send {
    /// Append bytes to the end of the upload.
    async fn append(&mut self, data: Bytes) -> StoreResult<()>;

    /// Commit the upload. Further calls fail with `WriterClosed`.
    async fn finish(&mut self) -> StoreResult<()>;
}

/// Resolves bucket names to stores.
#[async_trait]
pub trait StoreProvider: Send + Sync {
    /// Open the named bucket.
    async fn open_bucket(&self, name: &str) -> StoreResult<Arc<dyn ObjectStore>>;
}

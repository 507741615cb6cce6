//! In-memory object store backend.
//!
//! Used for testing and for throwaway servers. All data is ephemeral.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::SystemTime;

use crate::error::{StoreError, StoreResult};
use crate::ops::{ByteStream, ObjectStore, ObjectWriter, StoreProvider};
use crate::types::{ListPage, ListQuery, ListingBuilder, ObjectMeta};

/// Entries returned by a listing without an explicit limit.
pub const DEFAULT_PAGE_SIZE: usize = 1000;

/// Size of the chunks handed out by read streams.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    created: SystemTime,
    updated: SystemTime,
}

type Objects = Arc<RwLock<BTreeMap<String, StoredObject>>>;

/// In-memory bucket provider.
///
/// Buckets are created on first open and live as long as the backend.
#[derive(Debug)]
pub struct MemoryBackend {
    buckets: RwLock<HashMap<String, Arc<MemoryBucket>>>,
    page_size: usize,
    chunk_size: usize,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    /// Create a backend with no buckets.
    pub fn new() -> Self {
        Self {
            buckets: RwLock::new(HashMap::new()),
            page_size: DEFAULT_PAGE_SIZE,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Override the listing page size for buckets created afterwards.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Override the read chunk size for buckets created afterwards.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Get or create a bucket.
    pub fn bucket(&self, name: &str) -> Arc<MemoryBucket> {
        if let Some(bucket) = self.buckets.read().get(name) {
            return bucket.clone();
        }
        self.buckets
            .write()
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(MemoryBucket {
                    objects: Arc::default(),
                    page_size: self.page_size,
                    chunk_size: self.chunk_size,
                })
            })
            .clone()
    }
}

#[async_trait]
impl StoreProvider for MemoryBackend {
    async fn open_bucket(&self, name: &str) -> StoreResult<Arc<dyn ObjectStore>> {
        if name.is_empty() {
            return Err(StoreError::invalid_key("empty bucket name"));
        }
        Ok(self.bucket(name))
    }
}

/// A single in-memory bucket.
///
/// Thread-safe via an internal `RwLock`; locks are never held across awaits.
#[derive(Debug)]
pub struct MemoryBucket {
    objects: Objects,
    page_size: usize,
    chunk_size: usize,
}

impl MemoryBucket {
    /// Object keys currently stored, in order.
    pub fn keys(&self) -> Vec<String> {
        self.objects.read().keys().cloned().collect()
    }
}

#[async_trait]
impl ObjectStore for MemoryBucket {
    async fn list(&self, query: &ListQuery) -> StoreResult<ListPage> {
        let objects = self.objects.read();
        let mut builder = ListingBuilder::new(query, self.page_size);
        for (key, object) in objects.range(query.prefix.clone()..) {
            if !key.starts_with(&query.prefix) {
                break;
            }
            let more = builder.offer(key, || {
                ObjectMeta::object(key.clone(), object.data.len() as u64, object.created, object.updated)
            });
            if !more {
                break;
            }
        }
        Ok(builder.finish())
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        Ok(self.objects.read().contains_key(key))
    }

    async fn head(&self, key: &str) -> StoreResult<ObjectMeta> {
        self.objects
            .read()
            .get(key)
            .map(|o| ObjectMeta::object(key, o.data.len() as u64, o.created, o.updated))
            .ok_or_else(|| StoreError::not_found(key))
    }

    async fn open_read(&self, key: &str) -> StoreResult<ByteStream> {
        let data = self
            .objects
            .read()
            .get(key)
            .map(|o| o.data.clone())
            .ok_or_else(|| StoreError::not_found(key))?;

        let chunk_size = self.chunk_size;
        let chunks: Vec<StoreResult<Bytes>> = (0..data.len())
            .step_by(chunk_size)
            .map(|start| Ok(data.slice(start..(start + chunk_size).min(data.len()))))
            .collect();
        Ok(futures::stream::iter(chunks).boxed())
    }

    async fn open_write(&self, key: &str) -> StoreResult<Box<dyn ObjectWriter>> {
        if key.is_empty() {
            return Err(StoreError::invalid_key("empty key"));
        }
        Ok(Box::new(MemoryWriter {
            objects: self.objects.clone(),
            key: key.to_string(),
            buf: BytesMut::new(),
            finished: false,
        }))
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.objects
            .write()
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| StoreError::not_found(key))
    }

    async fn rename(&self, from: &str, to: &str) -> StoreResult<()> {
        if to.is_empty() {
            return Err(StoreError::invalid_key("empty key"));
        }
        let mut objects = self.objects.write();
        let mut object = objects.remove(from).ok_or_else(|| StoreError::not_found(from))?;
        object.updated = SystemTime::now();
        objects.insert(to.to_string(), object);
        Ok(())
    }
}

/// Buffers an upload until `finish`, then publishes it atomically.
struct MemoryWriter {
    objects: Objects,
    key: String,
    buf: BytesMut,
    finished: bool,
}

#[async_trait]
impl ObjectWriter for MemoryWriter {
    async fn append(&mut self, data: Bytes) -> StoreResult<()> {
        if self.finished {
            return Err(StoreError::WriterClosed(self.key.clone()));
        }
        self.buf.extend_from_slice(&data);
        Ok(())
    }

    async fn finish(&mut self) -> StoreResult<()> {
        if self.finished {
            return Err(StoreError::WriterClosed(self.key.clone()));
        }
        self.finished = true;
        let now = SystemTime::now();
        let data = std::mem::take(&mut self.buf).freeze();
        self.objects.write().insert(
            self.key.clone(),
            StoredObject {
                data,
                created: now,
                updated: now,
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_and_read() {
        let store = MemoryBackend::new().bucket("b");
        store.put("test.txt", Bytes::from_static(b"hello world")).await.unwrap();

        let data = store.read_all("test.txt").await.unwrap();
        assert_eq!(&data[..], b"hello world");
        assert_eq!(store.head("test.txt").await.unwrap().size, 11);
    }

    #[tokio::test]
    async fn test_read_is_chunked() {
        let store = MemoryBackend::new().with_chunk_size(4).bucket("b");
        store.put("f", Bytes::from_static(b"0123456789")).await.unwrap();

        let chunks: Vec<_> = store.open_read("f").await.unwrap().collect().await;
        let sizes: Vec<_> = chunks.into_iter().map(|c| c.unwrap().len()).collect();
        assert_eq!(sizes, vec![4, 4, 2]);
    }

    #[tokio::test]
    async fn test_upload_invisible_until_finished() {
        let store = MemoryBackend::new().bucket("b");
        let mut writer = store.open_write("up").await.unwrap();
        writer.append(Bytes::from_static(b"part")).await.unwrap();
        assert!(!store.exists("up").await.unwrap());

        writer.finish().await.unwrap();
        assert!(store.exists("up").await.unwrap());
        assert!(writer.append(Bytes::from_static(b"x")).await.is_err());
    }

    #[tokio::test]
    async fn test_abandoned_upload_leaves_nothing() {
        let store = MemoryBackend::new().bucket("b");
        {
            let mut writer = store.open_write("gone").await.unwrap();
            writer.append(Bytes::from_static(b"data")).await.unwrap();
        }
        assert!(store.keys().is_empty());
    }

    #[tokio::test]
    async fn test_list_directory_level() {
        let store = MemoryBackend::new().bucket("b");
        for key in ["root.txt", "sub/", "sub/file.txt", "deep/a/b.txt"] {
            store.put(key, Bytes::new()).await.unwrap();
        }

        let page = store.list(&ListQuery::directory("")).await.unwrap();
        let keys: Vec<_> = page.entries.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, vec!["deep/", "root.txt", "sub/"]);
        assert!(page.entries[0].is_prefix());
        assert!(!page.entries[2].is_prefix());

        let page = store.list(&ListQuery::directory("sub/")).await.unwrap();
        let keys: Vec<_> = page.entries.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, vec!["sub/", "sub/file.txt"]);
    }

    #[tokio::test]
    async fn test_page_size_truncates() {
        let store = MemoryBackend::new().with_page_size(2).bucket("b");
        for key in ["a", "b", "c"] {
            store.put(key, Bytes::new()).await.unwrap();
        }
        let page = store.list(&ListQuery::directory("")).await.unwrap();
        assert_eq!(page.len(), 2);
        assert!(page.truncated);
    }

    #[tokio::test]
    async fn test_delete_and_rename() {
        let store = MemoryBackend::new().bucket("b");
        store.put("old.txt", Bytes::from_static(b"content")).await.unwrap();

        store.rename("old.txt", "new.txt").await.unwrap();
        assert!(!store.exists("old.txt").await.unwrap());
        assert_eq!(&store.read_all("new.txt").await.unwrap()[..], b"content");

        store.delete("new.txt").await.unwrap();
        assert!(store.delete("new.txt").await.unwrap_err().is_not_found());
        assert!(store.rename("missing", "x").await.is_err());
    }

    #[tokio::test]
    async fn test_buckets_are_isolated() {
        let backend = MemoryBackend::new();
        let a = backend.open_bucket("a").await.unwrap();
        let b = backend.open_bucket("b").await.unwrap();
        a.put("k", Bytes::new()).await.unwrap();
        assert!(!b.exists("k").await.unwrap());
        assert!(backend.open_bucket("a").await.unwrap().exists("k").await.unwrap());
    }
}

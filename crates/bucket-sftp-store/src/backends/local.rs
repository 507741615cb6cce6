//! Local filesystem backend.
//!
//! Each bucket is a directory under the backend root. Object keys map to
//! relative file paths, and a directory marker key (`dir/`) maps to a
//! directory. Uploads are staged outside the bucket and renamed into place
//! when finished, so readers never see a partial object.
//!
//! Key security is enforced: keys with `.` or `..` segments are rejected
//! before they touch the filesystem.

use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use std::fs::Metadata;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::UNIX_EPOCH;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

use crate::backends::memory::DEFAULT_PAGE_SIZE;
use crate::error::{StoreError, StoreResult};
use crate::ops::{ByteStream, ObjectStore, ObjectWriter, StoreProvider};
use crate::types::{ListPage, ListQuery, ListingBuilder, ObjectMeta};

/// Directory under the backend root where uploads are staged.
const STAGING_DIR: &str = ".uploads";

/// Local filesystem bucket provider.
///
/// For a root of `/srv/sftp`, bucket `media` lives at `/srv/sftp/media` and
/// key `photos/cat.jpg` at `/srv/sftp/media/photos/cat.jpg`.
#[derive(Debug, Clone)]
pub struct LocalBackend {
    root: PathBuf,
    page_size: usize,
}

impl LocalBackend {
    /// Create a backend rooted at the given directory.
    ///
    /// The root is canonicalized at construction time when it exists.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root: PathBuf = root.into();
        let root = root.canonicalize().unwrap_or(root);
        Self {
            root,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

#[async_trait]
impl StoreProvider for LocalBackend {
    async fn open_bucket(&self, name: &str) -> StoreResult<Arc<dyn ObjectStore>> {
        if name.is_empty() || name.starts_with('.') || name.contains(['/', '\\']) {
            return Err(StoreError::invalid_key(format!("bucket name {name:?}")));
        }
        let root = self.root.join(name);
        fs::create_dir_all(&root).await?;
        let staging = self.root.join(STAGING_DIR);
        fs::create_dir_all(&staging).await?;
        debug!(bucket = name, root = %root.display(), "opened local bucket");
        Ok(Arc::new(LocalBucket {
            root,
            staging,
            page_size: self.page_size,
        }))
    }
}

/// A bucket backed by one directory.
#[derive(Debug, Clone)]
pub struct LocalBucket {
    root: PathBuf,
    staging: PathBuf,
    page_size: usize,
}

fn is_marker(key: &str) -> bool {
    key.ends_with('/')
}

impl LocalBucket {
    /// Map a key to a path under the bucket root.
    fn resolve(&self, key: &str) -> StoreResult<PathBuf> {
        let trimmed = key.trim_end_matches('/');
        if trimmed.is_empty() {
            return Ok(self.root.clone());
        }
        if key.starts_with('/') {
            return Err(StoreError::key_escapes_root(key));
        }
        let mut path = self.root.clone();
        for segment in trimmed.split('/') {
            match segment {
                "" => return Err(StoreError::invalid_key(key)),
                "." | ".." => return Err(StoreError::key_escapes_root(key)),
                s => path.push(s),
            }
        }
        Ok(path)
    }

    fn meta_for(key: String, meta: &Metadata) -> ObjectMeta {
        let updated = meta.modified().unwrap_or(UNIX_EPOCH);
        let created = meta.created().unwrap_or(updated);
        let size = if meta.is_dir() { 0 } else { meta.len() };
        ObjectMeta::object(key, size, created, updated)
    }

    /// Collect `(key, metadata)` for everything under the directory that
    /// `dir_key` names, including the directory's own marker.
    async fn collect_keys(&self, dir_key: &str, recursive: bool) -> StoreResult<Vec<(String, Metadata)>> {
        let mut out = Vec::new();
        let dir = self.resolve(dir_key)?;
        match fs::metadata(&dir).await {
            Ok(meta) if meta.is_dir() => {
                if !dir_key.is_empty() {
                    out.push((dir_key.to_string(), meta));
                }
            }
            Ok(_) => return Ok(out),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        }

        let mut pending = vec![(dir, dir_key.to_string())];
        while let Some((dir, key_prefix)) = pending.pop() {
            let mut entries = fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                    warn!(path = %entry.path().display(), "skipping non-UTF-8 file name");
                    continue;
                };
                let meta = entry.metadata().await?;
                if meta.is_dir() {
                    let key = format!("{key_prefix}{name}/");
                    if recursive {
                        pending.push((entry.path(), key.clone()));
                    }
                    out.push((key, meta));
                } else if meta.is_file() {
                    out.push((format!("{key_prefix}{name}"), meta));
                }
            }
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }
}

#[async_trait]
impl ObjectStore for LocalBucket {
    async fn list(&self, query: &ListQuery) -> StoreResult<ListPage> {
        let dir_key = match query.prefix.rfind('/') {
            Some(i) => &query.prefix[..=i],
            None => "",
        };
        let keys = self.collect_keys(dir_key, query.delimiter.is_none()).await?;

        let mut builder = ListingBuilder::new(query, self.page_size);
        for (key, meta) in &keys {
            if !builder.offer(key, || Self::meta_for(key.clone(), meta)) {
                break;
            }
        }
        Ok(builder.finish())
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        let path = self.resolve(key)?;
        match fs::metadata(&path).await {
            Ok(meta) => Ok(if is_marker(key) { meta.is_dir() } else { meta.is_file() }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn head(&self, key: &str) -> StoreResult<ObjectMeta> {
        if !self.exists(key).await? {
            return Err(StoreError::not_found(key));
        }
        let meta = fs::metadata(self.resolve(key)?).await?;
        Ok(Self::meta_for(key.to_string(), &meta))
    }

    async fn open_read(&self, key: &str) -> StoreResult<ByteStream> {
        if is_marker(key) {
            return Err(StoreError::invalid_key(key));
        }
        let file = fs::File::open(self.resolve(key)?).await?;
        Ok(ReaderStream::new(file).map_err(StoreError::from).boxed())
    }

    async fn open_write(&self, key: &str) -> StoreResult<Box<dyn ObjectWriter>> {
        let target = self.resolve(key)?;
        if target == self.root {
            return Err(StoreError::invalid_key("empty key"));
        }
        if is_marker(key) {
            return Ok(Box::new(LocalWriter {
                key: key.to_string(),
                target,
                staged: None,
                finished: false,
            }));
        }
        let temp = self.staging.join(uuid::Uuid::new_v4().to_string());
        let file = fs::File::create(&temp).await?;
        Ok(Box::new(LocalWriter {
            key: key.to_string(),
            target,
            staged: Some((temp, file)),
            finished: false,
        }))
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let path = self.resolve(key)?;
        if path == self.root {
            return Err(StoreError::invalid_key("cannot delete bucket root"));
        }
        let result = if is_marker(key) {
            fs::remove_dir(&path).await
        } else {
            fs::remove_file(&path).await
        };
        result.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => StoreError::not_found(key),
            _ => e.into(),
        })
    }

    async fn rename(&self, from: &str, to: &str) -> StoreResult<()> {
        let source = self.resolve(from)?;
        let dest = self.resolve(to)?;
        if !self.exists(from).await? {
            return Err(StoreError::not_found(from));
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::rename(&source, &dest).await?;
        Ok(())
    }
}

/// Upload staged in a temp file, or a directory marker.
struct LocalWriter {
    key: String,
    target: PathBuf,
    staged: Option<(PathBuf, fs::File)>,
    finished: bool,
}

#[async_trait]
impl ObjectWriter for LocalWriter {
    async fn append(&mut self, data: Bytes) -> StoreResult<()> {
        if self.finished {
            return Err(StoreError::WriterClosed(self.key.clone()));
        }
        match self.staged.as_mut() {
            Some((_, file)) => Ok(file.write_all(&data).await?),
            None if data.is_empty() => Ok(()),
            None => Err(StoreError::invalid_key(format!("{} is a directory marker", self.key))),
        }
    }

    async fn finish(&mut self) -> StoreResult<()> {
        if self.finished {
            return Err(StoreError::WriterClosed(self.key.clone()));
        }
        self.finished = true;
        let Some((temp, mut file)) = self.staged.take() else {
            fs::create_dir_all(&self.target).await?;
            return Ok(());
        };
        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        if let Some(parent) = self.target.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::rename(&temp, &self.target).await?;
        Ok(())
    }
}

impl Drop for LocalWriter {
    fn drop(&mut self) {
        if let Some((temp, _)) = self.staged.take() {
            if let Err(e) = std::fs::remove_file(&temp) {
                warn!(path = %temp.display(), error = %e, "failed to remove abandoned upload");
            }
        }
    }
}

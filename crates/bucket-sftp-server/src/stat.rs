//! Synthetic attributes for keys and prefixes.

use futures::future::{BoxFuture, FutureExt};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use bucket_sftp_store::{ListQuery, ObjectStore};

use crate::constants::{MODE_DIR, MODE_FILE};
use crate::error::{SftpError, SftpResult};
use crate::handles::SharedHandles;
use crate::path::{dir_prefix, normalize};
use crate::protocol::FileAttributes;

/// Answers STAT, LSTAT and FSTAT.
#[derive(Clone)]
pub struct StatResolver {
    store: Arc<dyn ObjectStore>,
    handles: SharedHandles,
}

fn directory() -> FileAttributes {
    FileAttributes {
        permissions: Some(MODE_DIR),
        ..Default::default()
    }
}

impl StatResolver {
    pub fn new(store: Arc<dyn ObjectStore>, handles: SharedHandles) -> Self {
        Self { store, handles }
    }

    /// An exact key is a file; a non-empty prefix is a directory; the bucket
    /// root is always a directory.
    pub async fn resolve(&self, path: &str) -> SftpResult<FileAttributes> {
        let key = normalize(path);
        if key.is_empty() {
            return Ok(directory());
        }

        if self.store.exists(&key).await? {
            let meta = self.store.head(&key).await?;
            let mtime = meta
                .updated
                .duration_since(UNIX_EPOCH)
                .map(|d| u32::try_from(d.as_secs()).unwrap_or(u32::MAX))
                .unwrap_or(0);
            return Ok(FileAttributes {
                size: Some(meta.size),
                permissions: Some(MODE_FILE),
                times: Some((mtime, mtime)),
                ..Default::default()
            });
        }

        let page = self
            .store
            .list(&ListQuery::directory(dir_prefix(&key)).limit(1))
            .await?;
        if page.is_empty() {
            Err(SftpError::NothingAt(path.to_string()))
        } else {
            Ok(directory())
        }
    }

    /// FSTAT: resolve the path the handle was opened with.
    pub fn resolve_handle(&self, handle: &[u8]) -> BoxFuture<'static, SftpResult<FileAttributes>> {
        let path = self
            .handles
            .lock()
            .lookup(handle)
            .map(|record| record.path().to_string());
        let resolver = self.clone();
        async move { resolver.resolve(&path?).await }.boxed()
    }
}

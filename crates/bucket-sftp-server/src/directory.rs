//! Directory emulation over a flat key space.
//!
//! A "directory" `a/b` exists when any key starts with `a/b/`. It is made
//! explicit by a zero-length marker object `a/b/`, which is what MKDIR
//! creates and RMDIR deletes. Listings use the `/` delimiter so that
//! everything below a child directory folds into a single entry.

use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use futures::future::{BoxFuture, FutureExt};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

use bucket_sftp_store::{ListQuery, ObjectMeta, ObjectStore};

use crate::constants::{MODE_DIR, MODE_FILE};
use crate::error::{SftpError, SftpResult};
use crate::handles::{Handle, OpenDirectory, OpenRecord, SharedHandles};
use crate::path::{dir_prefix, marker_key, normalize};
use crate::protocol::{FileAttributes, NameEntry};

/// Directory operations for one session.
#[derive(Clone)]
pub struct DirectoryEmulator {
    store: Arc<dyn ObjectStore>,
    handles: SharedHandles,
}

impl DirectoryEmulator {
    pub fn new(store: Arc<dyn ObjectStore>, handles: SharedHandles) -> Self {
        Self { store, handles }
    }

    /// OPENDIR. The bucket root always opens; anything else must have at
    /// least one key below it.
    pub async fn open(&self, path: &str) -> SftpResult<Handle> {
        let key = normalize(path);
        if !key.is_empty() {
            let page = self
                .store
                .list(&ListQuery::directory(dir_prefix(&key)).limit(1))
                .await?;
            if page.is_empty() {
                return Err(SftpError::NotFound(path.to_string()));
            }
        }
        let handle = self.handles.lock().allocate(OpenRecord::Directory(OpenDirectory {
            path: key.clone(),
            read_complete: false,
        }))?;
        debug!(%handle, key, "opened directory");
        Ok(handle)
    }

    /// READDIR. The first call returns one listing page; later calls return
    /// `None` (end of directory).
    pub fn read(&self, handle: &[u8]) -> BoxFuture<'static, SftpResult<Option<Vec<NameEntry>>>> {
        let claimed = self.claim_listing(handle);
        let store = self.store.clone();
        async move {
            let Some(key) = claimed? else {
                return Ok(None);
            };
            let prefix = dir_prefix(&key);
            let page = store.list(&ListQuery::directory(prefix.clone())).await?;
            if page.truncated {
                warn!(
                    key,
                    returned = page.len(),
                    "directory has more entries than one listing page; the rest are not shown"
                );
            }
            let entries = format_listing(&prefix, &page.entries);
            debug!(key, count = entries.len(), "listed directory");
            Ok::<_, SftpError>(if entries.is_empty() { None } else { Some(entries) })
        }
        .boxed()
    }

    /// Mark the directory as listed, returning its key if it was not already.
    fn claim_listing(&self, handle: &[u8]) -> SftpResult<Option<String>> {
        let mut handles = self.handles.lock();
        match handles.lookup_mut(handle)? {
            (_, OpenRecord::Directory(dir)) => {
                if dir.read_complete {
                    return Ok(None);
                }
                dir.read_complete = true;
                Ok(Some(dir.path.clone()))
            }
            _ => Err(SftpError::WrongHandleKind("listing")),
        }
    }

    /// MKDIR: write the zero-length marker object.
    pub async fn make(&self, path: &str) -> SftpResult<()> {
        let key = normalize(path);
        if key.is_empty() {
            return Err(SftpError::BucketRoot);
        }
        let marker = marker_key(&key);
        if self.store.exists(&marker).await? {
            return Err(SftpError::AlreadyExists(path.to_string()));
        }
        self.store.put(&marker, Bytes::new()).await?;
        info!(key = marker, "created directory");
        Ok(())
    }

    /// RMDIR: succeed only when the marker is the one and only key below.
    pub async fn remove(&self, path: &str) -> SftpResult<()> {
        let key = normalize(path);
        if key.is_empty() {
            return Err(SftpError::BucketRoot);
        }
        let marker = marker_key(&key);
        let page = self
            .store
            .list(&ListQuery::directory(marker.clone()).limit(2))
            .await?;
        match page.entries.as_slice() {
            [] => Err(SftpError::NotFound(path.to_string())),
            [only] if only.key == marker && !only.is_prefix() => {
                self.store.delete(&marker).await?;
                info!(key = marker, "removed directory");
                Ok(())
            }
            _ => Err(SftpError::DirectoryNotEmpty(path.to_string())),
        }
    }
}

fn epoch_seconds(time: SystemTime) -> u32 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| u32::try_from(d.as_secs()).unwrap_or(u32::MAX))
        .unwrap_or(0)
}

fn iso8601(time: SystemTime) -> String {
    DateTime::<Utc>::from(time).to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// `ls -l` style line. Permissions and owners are fixed.
pub fn long_name(name: &str, is_dir: bool, size: u64, created: SystemTime, width: usize) -> String {
    format!(
        "{}rw-rw-rw- 1 none none {:>width$} {} {}",
        if is_dir { 'd' } else { '-' },
        size,
        iso8601(created),
        name,
    )
}

/// Turn one listing page under `prefix` into NAME rows.
///
/// The directory's own marker (empty name after stripping) is skipped.
pub fn format_listing(prefix: &str, entries: &[ObjectMeta]) -> Vec<NameEntry> {
    let width = entries
        .iter()
        .map(|e| e.size)
        .max()
        .unwrap_or(0)
        .to_string()
        .len();

    let mut rows = Vec::with_capacity(entries.len());
    for entry in entries {
        let Some(rest) = entry.key.strip_prefix(prefix) else {
            continue;
        };
        let (name, is_dir) = match rest.strip_suffix('/') {
            Some(name) => (name, true),
            None => (rest, false),
        };
        if name.is_empty() {
            continue;
        }
        let size = if is_dir { 0 } else { entry.size };
        rows.push(NameEntry {
            filename: name.to_string(),
            longname: long_name(name, is_dir, size, entry.created, width),
            attrs: FileAttributes {
                size: Some(size),
                permissions: Some(if is_dir { MODE_DIR } else { MODE_FILE }),
                times: Some((0, epoch_seconds(entry.updated))),
                ..Default::default()
            },
        });
    }
    rows
}

//! File transfer: OPEN, READ, WRITE, CLOSE, RENAME and REMOVE on objects.
//!
//! Each operation does its handle-table work synchronously, in the order
//! requests arrive, and only then hands back a future for the part that
//! waits on the backend. That split is what lets pipelined READs land in the
//! reorder buffer in order and pipelined WRITEs reach the upload in order,
//! while their replies complete independently.

use bytes::Bytes;
use futures::future::{self, BoxFuture, FutureExt};
use futures::StreamExt;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use bucket_sftp_store::{ObjectStore, StoreError, StoreResult};

use crate::constants::{MAX_READ_LEN, READ_HIGH_WATER_MARK};
use crate::error::{SftpError, SftpResult};
use crate::handles::{FileMode, Handle, OpenFile, OpenRecord, SharedHandles};
use crate::path::normalize;
use crate::protocol::OpenFlags;
use crate::reorder::{ReadReorderBuffer, ReadReply, ReadResult, StreamEvent};

// ============================================================================
// Read side
// ============================================================================

#[derive(Debug, Default)]
struct ReadShared {
    buffer: Mutex<ReadReorderBuffer>,
    /// Signalled whenever a new read may need more stream bytes.
    demand: Notify,
}

/// Read state of an open file: the reorder buffer and the task pumping the
/// backend stream into it.
///
/// Dropping the feed rejects its pending reads and stops the pump.
#[derive(Debug)]
pub struct ReadFeed {
    shared: Arc<ReadShared>,
    pump: JoinHandle<()>,
}

impl ReadFeed {
    fn spawn(store: Arc<dyn ObjectStore>, key: String) -> Self {
        let shared = Arc::new(ReadShared::default());
        let pump = tokio::spawn(pump_stream(shared.clone(), store, key));
        Self { shared, pump }
    }

    fn submit(&self, offset: u64, len: u32) -> oneshot::Receiver<ReadResult> {
        let rx = self.shared.buffer.lock().submit(offset, len);
        self.shared.demand.notify_one();
        rx
    }

    fn fault(&self) -> Option<String> {
        self.shared.buffer.lock().fault().map(str::to_string)
    }
}

impl Drop for ReadFeed {
    fn drop(&mut self) {
        self.shared.buffer.lock().cancel();
        self.pump.abort();
    }
}

/// Pull the object's stream into the buffer, but only while it wants bytes.
async fn pump_stream(shared: Arc<ReadShared>, store: Arc<dyn ObjectStore>, key: String) {
    let mut stream = match store.open_read(&key).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(key, error = %e, "failed to open read stream");
            shared.buffer.lock().on_event(StreamEvent::Error(e.to_string()));
            return;
        }
    };

    loop {
        if !shared.buffer.lock().wants_data(READ_HIGH_WATER_MARK) {
            shared.demand.notified().await;
            continue;
        }

        let event = match stream.next().await {
            Some(Ok(chunk)) => StreamEvent::Data(chunk),
            Some(Err(e)) => {
                warn!(key, error = %e, "read stream failed");
                StreamEvent::Error(e.to_string())
            }
            None => StreamEvent::End,
        };
        let settled = !matches!(event, StreamEvent::Data(_));
        shared.buffer.lock().on_event(event);
        if settled {
            debug!(key, "read stream settled");
            return;
        }
    }
}

// ============================================================================
// Write side
// ============================================================================

type Ack = oneshot::Sender<StoreResult<()>>;

#[derive(Debug)]
enum SinkCommand {
    Append(Bytes, Ack),
    Finish(Ack),
}

/// Write state of an open file: an ordered queue into the upload task.
///
/// Dropping the sink without finishing abandons the upload.
#[derive(Debug)]
pub struct WriteSink {
    commands: mpsc::UnboundedSender<SinkCommand>,
    faulted: Arc<AtomicBool>,
    /// Bytes queued so far; the offset the next in-order WRITE should carry.
    queued: u64,
}

impl WriteSink {
    fn spawn(store: Arc<dyn ObjectStore>, key: String) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let faulted = Arc::new(AtomicBool::new(false));
        tokio::spawn(drain_uploads(store, key, rx, faulted.clone()));
        Self {
            commands,
            faulted,
            queued: 0,
        }
    }

    fn is_faulted(&self) -> bool {
        self.faulted.load(Ordering::Acquire)
    }

    fn send(&self, command: SinkCommand) -> SftpResult<()> {
        self.commands
            .send(command)
            .map_err(|_| SftpError::StreamFaulted("upload task is gone".into()))
    }

    fn append(&mut self, path: &str, offset: u64, data: Bytes) -> SftpResult<oneshot::Receiver<StoreResult<()>>> {
        if self.is_faulted() {
            return Err(SftpError::StreamFaulted(format!("upload of {path} failed")));
        }
        if offset != self.queued {
            warn!(
                key = path,
                offset,
                expected = self.queued,
                "write offset does not match bytes already written; appending anyway"
            );
        }
        self.queued += data.len() as u64;
        let (ack, rx) = oneshot::channel();
        self.send(SinkCommand::Append(data, ack))?;
        Ok(rx)
    }

    fn finish(self, path: &str) -> SftpResult<oneshot::Receiver<StoreResult<()>>> {
        if self.is_faulted() {
            return Err(SftpError::StreamFaulted(format!("upload of {path} failed")));
        }
        let (ack, rx) = oneshot::channel();
        self.send(SinkCommand::Finish(ack))?;
        Ok(rx)
    }
}

/// Apply queued appends to the backend upload, in order.
async fn drain_uploads(
    store: Arc<dyn ObjectStore>,
    key: String,
    mut commands: mpsc::UnboundedReceiver<SinkCommand>,
    faulted: Arc<AtomicBool>,
) {
    let mut writer = match store.open_write(&key).await {
        Ok(writer) => Some(writer),
        Err(e) => {
            warn!(key, error = %e, "failed to open upload");
            faulted.store(true, Ordering::Release);
            None
        }
    };

    while let Some(command) = commands.recv().await {
        match command {
            SinkCommand::Append(data, ack) => {
                let result = match writer.as_mut() {
                    Some(w) if !faulted.load(Ordering::Acquire) => w.append(data).await,
                    _ => Err(StoreError::other(format!("upload of {key} already failed"))),
                };
                if let Err(e) = &result {
                    warn!(key, error = %e, "append failed");
                    faulted.store(true, Ordering::Release);
                }
                let _ = ack.send(result);
            }
            SinkCommand::Finish(ack) => {
                let result = match writer.take() {
                    Some(mut w) if !faulted.load(Ordering::Acquire) => w.finish().await,
                    _ => Err(StoreError::other(format!("upload of {key} already failed"))),
                };
                if let Err(e) = &result {
                    warn!(key, error = %e, "commit failed");
                    faulted.store(true, Ordering::Release);
                }
                let _ = ack.send(result);
                return;
            }
        }
    }
    if writer.is_some() {
        debug!(key, "upload abandoned before close");
    }
}

fn upload_gone(_: oneshot::error::RecvError) -> SftpError {
    SftpError::StreamFaulted("upload task ended".into())
}

// ============================================================================
// Engine
// ============================================================================

/// File operations for one session.
#[derive(Clone)]
pub struct FileTransferEngine {
    store: Arc<dyn ObjectStore>,
    handles: SharedHandles,
}

impl FileTransferEngine {
    pub fn new(store: Arc<dyn ObjectStore>, handles: SharedHandles) -> Self {
        Self { store, handles }
    }

    /// Open a file for reading or writing.
    ///
    /// WRITE wins over READ. The backend stream is opened in the background;
    /// failures to open it surface on the first READ or WRITE.
    pub fn open(&self, path: &str, flags: OpenFlags) -> SftpResult<Handle> {
        let key = normalize(path);
        let mode = if flags.write() {
            FileMode::Write(WriteSink::spawn(self.store.clone(), key.clone()))
        } else if flags.read() {
            FileMode::Read(ReadFeed::spawn(self.store.clone(), key.clone()))
        } else {
            return Err(SftpError::UnsupportedOpenMode(flags));
        };
        let write = matches!(mode, FileMode::Write(_));
        let handle = self
            .handles
            .lock()
            .allocate(OpenRecord::File(OpenFile { path: key.clone(), mode }))?;
        debug!(%handle, key, write, "opened file");
        Ok(handle)
    }

    /// Read `len` bytes at `offset`.
    pub fn read(&self, handle: &[u8], offset: u64, len: u32) -> BoxFuture<'static, SftpResult<ReadReply>> {
        let submitted = self.submit_read(handle, offset, len);
        async move {
            let reply = submitted?.await.map_err(|_| SftpError::ReadCancelled)?;
            Ok::<_, SftpError>(reply?)
        }
        .boxed()
    }

    fn submit_read(&self, handle: &[u8], offset: u64, len: u32) -> SftpResult<oneshot::Receiver<ReadResult>> {
        let mut handles = self.handles.lock();
        let (_, record) = handles.lookup_mut(handle)?;
        match record {
            OpenRecord::File(OpenFile {
                mode: FileMode::Read(feed),
                ..
            }) => {
                if let Some(reason) = feed.fault() {
                    return Err(SftpError::StreamFaulted(reason));
                }
                Ok(feed.submit(offset, len.min(MAX_READ_LEN)))
            }
            _ => Err(SftpError::WrongHandleKind("reading")),
        }
    }

    /// Append `data` to the upload. Acknowledged once the backend accepts it.
    pub fn write(&self, handle: &[u8], offset: u64, data: Bytes) -> BoxFuture<'static, SftpResult<()>> {
        let queued = self.queue_write(handle, offset, data);
        async move {
            queued?.await.map_err(upload_gone)??;
            Ok::<_, SftpError>(())
        }
        .boxed()
    }

    fn queue_write(&self, handle: &[u8], offset: u64, data: Bytes) -> SftpResult<oneshot::Receiver<StoreResult<()>>> {
        let mut handles = self.handles.lock();
        let (_, record) = handles.lookup_mut(handle)?;
        match record {
            OpenRecord::File(OpenFile {
                path,
                mode: FileMode::Write(sink),
            }) => sink.append(path, offset, data),
            _ => Err(SftpError::WrongHandleKind("writing")),
        }
    }

    /// Release a handle of any kind.
    ///
    /// Uploads are committed before the reply; pending reads are rejected.
    pub fn close(&self, handle: &[u8]) -> BoxFuture<'static, SftpResult<()>> {
        let released = {
            let mut handles = self.handles.lock();
            Handle::from_wire(handle).and_then(|h| handles.release(h))
        };

        match released {
            None => future::ready(Err(SftpError::HandleNotFound)).boxed(),
            Some(OpenRecord::Directory(dir)) => {
                debug!(key = dir.path, "closed directory");
                future::ready(Ok(())).boxed()
            }
            Some(OpenRecord::File(OpenFile {
                path,
                mode: FileMode::Read(feed),
            })) => {
                drop(feed);
                debug!(key = path, "closed file for reading");
                future::ready(Ok(())).boxed()
            }
            Some(OpenRecord::File(OpenFile {
                path,
                mode: FileMode::Write(sink),
            })) => {
                let bytes = sink.queued;
                let finished = sink.finish(&path);
                async move {
                    finished?.await.map_err(upload_gone)??;
                    info!(key = path, bytes, "upload committed");
                    Ok::<_, SftpError>(())
                }
                .boxed()
            }
        }
    }

    /// Move an object.
    pub async fn rename(&self, from: &str, to: &str) -> SftpResult<()> {
        let (from, to) = (normalize(from), normalize(to));
        self.store.rename(&from, &to).await?;
        info!(from, to, "renamed");
        Ok(())
    }

    /// Delete an object.
    pub async fn remove(&self, path: &str) -> SftpResult<()> {
        let key = normalize(path);
        self.store.delete(&key).await?;
        info!(key, "removed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handles::{HandleTable, OpenDirectory};
    use bucket_sftp_store::MemoryBackend;
    use std::time::Duration;

    fn engine_with(backend: &MemoryBackend) -> FileTransferEngine {
        let store: Arc<dyn ObjectStore> = backend.bucket("test");
        FileTransferEngine::new(store, Arc::new(Mutex::new(HandleTable::new())))
    }

    fn read_flags() -> OpenFlags {
        OpenFlags(OpenFlags::READ)
    }

    fn write_flags() -> OpenFlags {
        OpenFlags(OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE)
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let backend = MemoryBackend::new();
        let engine = engine_with(&backend);

        let h = engine.open("/dir/file.txt", write_flags()).unwrap().to_wire();
        engine.write(&h, 0, Bytes::from_static(b"hello ")).await.unwrap();
        engine.write(&h, 6, Bytes::from_static(b"world")).await.unwrap();
        assert!(!backend.bucket("test").exists("dir/file.txt").await.unwrap());
        engine.close(&h).await.unwrap();

        let stored = backend.bucket("test").read_all("dir/file.txt").await.unwrap();
        assert_eq!(&stored[..], b"hello world");

        let h = engine.open("dir/file.txt", read_flags()).unwrap().to_wire();
        let later = engine.read(&h, 6, 100);
        let first = engine.read(&h, 0, 6);
        assert_eq!(first.await.unwrap(), ReadReply::Data(Bytes::from_static(b"hello ")));
        assert_eq!(later.await.unwrap(), ReadReply::Data(Bytes::from_static(b"world")));
        assert_eq!(engine.read(&h, 11, 100).await.unwrap(), ReadReply::Eof);
        engine.close(&h).await.unwrap();
    }

    #[tokio::test]
    async fn test_open_requires_direction() {
        let backend = MemoryBackend::new();
        let engine = engine_with(&backend);
        let result = engine.open("/x", OpenFlags(OpenFlags::CREATE));
        assert!(matches!(result, Err(SftpError::UnsupportedOpenMode(_))));
        assert!(engine.handles.lock().is_empty());
    }

    #[tokio::test]
    async fn test_read_missing_object_fails() {
        let backend = MemoryBackend::new();
        let engine = engine_with(&backend);
        let h = engine.open("/missing", read_flags()).unwrap().to_wire();
        let result = engine.read(&h, 0, 10).await;
        assert!(matches!(result, Err(SftpError::StreamFaulted(_))));
        // Later reads fail fast
        assert!(engine.read(&h, 0, 10).await.is_err());
    }

    #[tokio::test]
    async fn test_failed_upload_fails_writes_and_close() {
        let backend = MemoryBackend::new();
        let engine = engine_with(&backend);
        // The bucket root is not a valid object key
        let h = engine.open("/", write_flags()).unwrap().to_wire();
        assert!(engine.write(&h, 0, Bytes::from_static(b"x")).await.is_err());
        assert!(engine.write(&h, 1, Bytes::from_static(b"y")).await.is_err());
        assert!(matches!(engine.close(&h).await, Err(SftpError::StreamFaulted(_))));
        assert!(backend.bucket("test").keys().is_empty());
    }

    #[tokio::test]
    async fn test_close_cancels_pending_reads() {
        let backend = MemoryBackend::new();
        backend.bucket("test").put("f", Bytes::from_static(b"0123456789")).await.unwrap();
        let engine = engine_with(&backend);

        let h = engine.open("/f", read_flags()).unwrap().to_wire();
        assert_eq!(
            engine.read(&h, 0, 8).await.unwrap(),
            ReadReply::Data(Bytes::from_static(b"01234567"))
        );

        // Behind the cursor: never satisfiable
        let behind = tokio::spawn(engine.read(&h, 2, 2));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!behind.is_finished());

        engine.close(&h).await.unwrap();
        let result = tokio::time::timeout(Duration::from_secs(1), behind).await.unwrap().unwrap();
        assert!(matches!(result, Err(SftpError::ReadCancelled)));
    }

    #[tokio::test]
    async fn test_wrong_handle_kinds() {
        let backend = MemoryBackend::new();
        let engine = engine_with(&backend);

        let dir = engine
            .handles
            .lock()
            .allocate(OpenRecord::Directory(OpenDirectory {
                path: String::new(),
                read_complete: false,
            }))
            .unwrap()
            .to_wire();
        assert!(matches!(engine.read(&dir, 0, 1).await, Err(SftpError::WrongHandleKind(_))));

        let w = engine.open("/w", write_flags()).unwrap().to_wire();
        assert!(matches!(engine.read(&w, 0, 1).await, Err(SftpError::WrongHandleKind(_))));

        assert!(matches!(engine.read(b"bad", 0, 1).await, Err(SftpError::HandleNotFound)));
        assert!(matches!(engine.close(&[0, 0, 0, 99]).await, Err(SftpError::HandleNotFound)));

        engine.close(&dir).await.unwrap();
        assert!(matches!(engine.close(&dir).await, Err(SftpError::HandleNotFound)));
    }

    #[tokio::test]
    async fn test_rename_and_remove() {
        let backend = MemoryBackend::new();
        backend.bucket("test").put("a", Bytes::from_static(b"1")).await.unwrap();
        let engine = engine_with(&backend);

        engine.rename("/a", "/b/c").await.unwrap();
        assert_eq!(backend.bucket("test").keys(), vec!["b/c".to_string()]);

        engine.remove("/b/c").await.unwrap();
        assert!(engine.remove("/b/c").await.is_err());
    }

    #[tokio::test]
    async fn test_oversized_read_is_answered_short() {
        let backend = MemoryBackend::new();
        let len = MAX_READ_LEN as usize * 4;
        let content: Vec<u8> = (0..len).map(|i| (i % 241) as u8).collect();
        backend.bucket("test").put("huge", Bytes::from(content.clone())).await.unwrap();
        let engine = engine_with(&backend);

        let h = engine.open("/huge", read_flags()).unwrap().to_wire();
        let first = tokio::time::timeout(Duration::from_secs(5), engine.read(&h, 0, u32::MAX))
            .await
            .unwrap()
            .unwrap();
        let ReadReply::Data(data) = first else {
            panic!("expected data");
        };
        assert_eq!(data.len(), MAX_READ_LEN as usize);
        assert_eq!(&data[..], &content[..MAX_READ_LEN as usize]);

        // The next read picks up where the short one stopped
        let next = engine.read(&h, MAX_READ_LEN as u64, 16).await.unwrap();
        let start = MAX_READ_LEN as usize;
        assert_eq!(next, ReadReply::Data(Bytes::copy_from_slice(&content[start..start + 16])));
    }

    #[tokio::test]
    async fn test_large_object_streams_through_high_water_mark() {
        let backend = MemoryBackend::new().with_chunk_size(7000);
        let content: Vec<u8> = (0..READ_HIGH_WATER_MARK * 3).map(|i| (i % 253) as u8).collect();
        backend.bucket("test").put("big", Bytes::from(content.clone())).await.unwrap();
        let engine = engine_with(&backend);

        let h = engine.open("/big", read_flags()).unwrap().to_wire();
        let block = 32 * 1024u32;
        // Request blocks back to front, then drain
        let mut pending = Vec::new();
        let mut offset = 0u64;
        while offset < content.len() as u64 {
            pending.push((offset, engine.read(&h, offset, block)));
            offset += block as u64;
        }
        pending.reverse();
        let mut received = vec![Vec::new(); pending.len()];
        for (offset, fut) in pending {
            match fut.await.unwrap() {
                ReadReply::Data(data) => received[(offset / block as u64) as usize] = data.to_vec(),
                ReadReply::Eof => panic!("unexpected EOF at {offset}"),
            }
        }
        assert_eq!(received.concat(), content);
    }
}

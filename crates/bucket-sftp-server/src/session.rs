//! One SFTP session: packet loop and request routing.
//!
//! Requests are dispatched strictly in arrival order, but each reply is
//! produced by its own task. A READ waiting on bytes that an earlier-offset
//! READ has yet to consume must not stall the packets behind it, so the loop
//! never awaits a reply itself. Replies funnel into a single writer task.

use std::sync::Arc;

use futures::future::{self, BoxFuture, FutureExt};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::{Instrument, Span, debug, info, info_span, warn};

use bucket_sftp_store::ObjectStore;

use crate::constants::{MODE_DIR, SFTP_VERSION};
use crate::directory::DirectoryEmulator;
use crate::error::{SftpError, SftpResult};
use crate::files::FileTransferEngine;
use crate::handles::{HandleTable, SharedHandles};
use crate::path::real_path;
use crate::protocol::{
    ClientPacket, FileAttributes, NameEntry, Operation, Request, Response, SftpCodec, StatusCode,
};
use crate::reorder::ReadReply;
use crate::stat::StatResolver;

/// Routes the requests of one SFTP channel against one bucket.
pub struct SessionDispatcher {
    bucket: String,
    handles: SharedHandles,
    files: FileTransferEngine,
    dirs: DirectoryEmulator,
    stat: StatResolver,
}

/// Turn an operation result into its reply.
fn reply<T>(id: u32, result: SftpResult<T>, ok: impl FnOnce(T) -> Response) -> Response {
    match result {
        Ok(value) => ok(value),
        Err(e) => {
            debug!(id, error = %e, "request failed");
            e.into_response(id)
        }
    }
}

fn status(id: u32, result: SftpResult<()>) -> Response {
    reply(id, result, |()| Response::ok(id))
}

fn ready(response: Response) -> BoxFuture<'static, Response> {
    future::ready(response).boxed()
}

impl SessionDispatcher {
    pub fn new(bucket: impl Into<String>, store: Arc<dyn ObjectStore>) -> Self {
        let handles: SharedHandles = Arc::new(Mutex::new(HandleTable::new()));
        Self {
            bucket: bucket.into(),
            files: FileTransferEngine::new(store.clone(), handles.clone()),
            dirs: DirectoryEmulator::new(store.clone(), handles.clone()),
            stat: StatResolver::new(store, handles.clone()),
            handles,
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Number of handles currently open.
    pub fn open_handles(&self) -> usize {
        self.handles.lock().len()
    }

    /// Route one request.
    ///
    /// Handle-table work happens before this returns; the future only waits
    /// on the backend.
    pub fn dispatch(&self, request: Request) -> BoxFuture<'static, Response> {
        let Request { id, op } = request;
        let span = self.request_span(id, &op);
        let reply = span.in_scope(|| self.route(id, op));
        reply.instrument(span).boxed()
    }

    /// Emitted at INFO so the exporter's per-operation sampling sees it.
    fn request_span(&self, id: u32, op: &Operation) -> Span {
        info_span!(
            "sftp.request",
            otel.name = op.span_name(),
            id,
            bucket = %self.bucket
        )
    }

    fn route(&self, id: u32, op: Operation) -> BoxFuture<'static, Response> {
        match op {
            Operation::Open { path, flags, .. } => ready(reply(id, self.files.open(&path, flags), |h| {
                Response::Handle { id, handle: h.to_wire() }
            })),

            Operation::Close { handle } => {
                let closed = self.files.close(&handle);
                async move { status(id, closed.await) }.boxed()
            }

            Operation::Read { handle, offset, len } => {
                let read = self.files.read(&handle, offset, len);
                async move {
                    reply(id, read.await, |r| match r {
                        ReadReply::Data(data) => Response::Data { id, data },
                        ReadReply::Eof => Response::status(id, StatusCode::Eof),
                    })
                }
                .boxed()
            }

            Operation::Write { handle, offset, data } => {
                let written = self.files.write(&handle, offset, data);
                async move { status(id, written.await) }.boxed()
            }

            Operation::Stat { path } | Operation::Lstat { path } => {
                let stat = self.stat.clone();
                async move {
                    reply(id, stat.resolve(&path).await, |attrs| Response::Attrs { id, attrs })
                }
                .boxed()
            }

            Operation::Fstat { handle } => {
                let resolved = self.stat.resolve_handle(&handle);
                async move { reply(id, resolved.await, |attrs| Response::Attrs { id, attrs }) }.boxed()
            }

            // Objects carry no mutable metadata; accept and ignore.
            Operation::SetStat { .. } => ready(Response::ok(id)),
            Operation::FSetStat { .. } => ready(SftpError::Unsupported.into_response(id)),

            Operation::OpenDir { path } => {
                let dirs = self.dirs.clone();
                async move {
                    reply(id, dirs.open(&path).await, |h| Response::Handle { id, handle: h.to_wire() })
                }
                .boxed()
            }

            Operation::ReadDir { handle } => {
                let listed = self.dirs.read(&handle);
                async move {
                    reply(id, listed.await, |entries| match entries {
                        Some(entries) => Response::Name { id, entries },
                        None => Response::status(id, StatusCode::Eof),
                    })
                }
                .boxed()
            }

            Operation::Remove { path } => {
                let files = self.files.clone();
                async move { status(id, files.remove(&path).await) }.boxed()
            }

            Operation::Rename { from, to } => {
                let files = self.files.clone();
                async move { status(id, files.rename(&from, &to).await) }.boxed()
            }

            Operation::Mkdir { path, .. } => {
                let dirs = self.dirs.clone();
                async move { status(id, dirs.make(&path).await) }.boxed()
            }

            Operation::Rmdir { path } => {
                let dirs = self.dirs.clone();
                async move { status(id, dirs.remove(&path).await) }.boxed()
            }

            Operation::RealPath { path } => {
                let resolved = real_path(&path);
                ready(Response::Name {
                    id,
                    entries: vec![NameEntry {
                        filename: resolved.clone(),
                        longname: resolved,
                        attrs: FileAttributes {
                            permissions: Some(MODE_DIR),
                            ..Default::default()
                        },
                    }],
                })
            }

            Operation::ReadLink { .. }
            | Operation::Symlink { .. }
            | Operation::Extended { .. }
            | Operation::Unknown { .. } => ready(SftpError::Unsupported.into_response(id)),

            Operation::InvalidPath { .. } => ready(SftpError::InvalidPath.into_response(id)),
        }
    }

    /// Serve the session until the client goes away, then release every
    /// handle.
    pub async fn run<S>(self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut sink, mut packets) = Framed::new(stream, SftpCodec::default()).split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Response>();

        let writer = tokio::spawn(async move {
            while let Some(response) = rx.recv().await {
                if let Err(e) = sink.send(response).await {
                    warn!(error = %e, "failed to write sftp reply");
                    break;
                }
            }
        });

        while let Some(packet) = packets.next().await {
            match packet {
                Ok(ClientPacket::Init { version }) => {
                    info!(bucket = %self.bucket, client_version = version, "sftp session started");
                    let _ = tx.send(Response::Version {
                        version: SFTP_VERSION,
                        extensions: Vec::new(),
                    });
                }
                Ok(ClientPacket::Request(request)) => {
                    let reply = self.dispatch(request);
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        let _ = tx.send(reply.await);
                    });
                }
                Err(e) => {
                    warn!(bucket = %self.bucket, error = %e, "sftp protocol error, closing session");
                    break;
                }
            }
        }

        // Cancels pending reads and abandons unfinished uploads
        let released = self.handles.lock().clear();
        drop(tx);
        if writer.await.is_err() {
            warn!("sftp reply writer panicked");
        }
        info!(bucket = %self.bucket, released, "sftp session ended");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::OpenFlags;
    use bucket_sftp_store::MemoryBackend;
    use bytes::Bytes;

    fn dispatcher() -> SessionDispatcher {
        let backend = MemoryBackend::new();
        SessionDispatcher::new("test", backend.bucket("test"))
    }

    async fn call(session: &SessionDispatcher, id: u32, op: Operation) -> Response {
        session.dispatch(Request { id, op }).await
    }

    fn status_code(response: &Response) -> StatusCode {
        match response {
            Response::Status { code, .. } => *code,
            other => panic!("expected status, got {other:?}"),
        }
    }

    fn handle_of(response: Response) -> Bytes {
        match response {
            Response::Handle { handle, .. } => handle,
            other => panic!("expected handle, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unsupported_operations() {
        let session = dispatcher();
        let ops = [
            Operation::ReadLink { path: "/a".into() },
            Operation::Symlink {
                link_path: "/a".into(),
                target: "/b".into(),
            },
            Operation::Extended {
                name: "posix-rename@openssh.com".into(),
                data: Bytes::new(),
            },
            Operation::Unknown { kind: 200 },
            Operation::FSetStat {
                handle: Bytes::from_static(&[0, 0, 0, 0]),
                attrs: FileAttributes::default(),
            },
        ];
        for (id, op) in ops.into_iter().enumerate() {
            let response = call(&session, id as u32, op).await;
            assert_eq!(response.id(), Some(id as u32));
            assert_eq!(status_code(&response), StatusCode::OpUnsupported);
        }
    }

    #[test]
    fn test_request_span_enabled_at_info() {
        let session = dispatcher();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .with_writer(std::io::sink)
            .finish();
        tracing::subscriber::with_default(subscriber, || {
            let span = session.request_span(1, &Operation::Stat { path: "/".into() });
            assert!(!span.is_disabled());
        });
    }

    #[tokio::test]
    async fn test_invalid_path_fails() {
        let session = dispatcher();
        let response = call(&session, 8, Operation::InvalidPath { kind: 17 }).await;
        assert_eq!(response.id(), Some(8));
        assert_eq!(status_code(&response), StatusCode::Failure);
    }

    #[tokio::test]
    async fn test_setstat_is_accepted() {
        let session = dispatcher();
        let response = call(
            &session,
            3,
            Operation::SetStat {
                path: "/anything".into(),
                attrs: FileAttributes::default(),
            },
        )
        .await;
        assert_eq!(response, Response::ok(3));
    }

    #[tokio::test]
    async fn test_realpath() {
        let session = dispatcher();
        match call(&session, 1, Operation::RealPath { path: "a/./b/../c".into() }).await {
            Response::Name { id, entries } => {
                assert_eq!(id, 1);
                assert_eq!(entries.len(), 1);
                assert_eq!(entries[0].filename, "/a/c");
                assert_eq!(entries[0].attrs.permissions, Some(MODE_DIR));
            }
            other => panic!("expected name, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_open_without_mode_fails() {
        let session = dispatcher();
        let response = call(
            &session,
            1,
            Operation::Open {
                path: "/f".into(),
                flags: OpenFlags(OpenFlags::CREATE),
                attrs: FileAttributes::default(),
            },
        )
        .await;
        assert_eq!(status_code(&response), StatusCode::Failure);
        assert_eq!(session.open_handles(), 0);
    }

    #[tokio::test]
    async fn test_directory_round_trip() {
        let session = dispatcher();

        let made = call(&session, 1, Operation::Mkdir {
            path: "/docs".into(),
            attrs: FileAttributes::default(),
        })
        .await;
        assert_eq!(made, Response::ok(1));

        let again = call(&session, 2, Operation::Mkdir {
            path: "/docs".into(),
            attrs: FileAttributes::default(),
        })
        .await;
        assert_eq!(status_code(&again), StatusCode::Failure);

        let handle = handle_of(call(&session, 3, Operation::OpenDir { path: "/".into() }).await);
        match call(&session, 4, Operation::ReadDir { handle: handle.clone() }).await {
            Response::Name { entries, .. } => {
                assert_eq!(entries.len(), 1);
                assert_eq!(entries[0].filename, "docs");
                assert!(entries[0].longname.starts_with('d'));
            }
            other => panic!("expected name, got {other:?}"),
        }
        let eof = call(&session, 5, Operation::ReadDir { handle: handle.clone() }).await;
        assert_eq!(status_code(&eof), StatusCode::Eof);
        assert_eq!(call(&session, 6, Operation::Close { handle }).await, Response::ok(6));

        let stat = call(&session, 7, Operation::Stat { path: "/docs".into() }).await;
        assert!(matches!(stat, Response::Attrs { attrs, .. } if attrs.permissions == Some(MODE_DIR)));

        assert_eq!(
            call(&session, 8, Operation::Rmdir { path: "/docs".into() }).await,
            Response::ok(8)
        );
        let gone = call(&session, 9, Operation::Rmdir { path: "/docs".into() }).await;
        assert_eq!(status_code(&gone), StatusCode::NoSuchFile);
    }

    #[tokio::test]
    async fn test_opendir_missing() {
        let session = dispatcher();
        let response = call(&session, 1, Operation::OpenDir { path: "/nope".into() }).await;
        assert_eq!(status_code(&response), StatusCode::NoSuchFile);
    }

    #[tokio::test]
    async fn test_stat_missing_is_failure() {
        let session = dispatcher();
        let response = call(&session, 1, Operation::Lstat { path: "/nope".into() }).await;
        assert_eq!(status_code(&response), StatusCode::Failure);
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let session = dispatcher();
        let open = |flags| Operation::Open {
            path: "/notes.txt".into(),
            flags: OpenFlags(flags),
            attrs: FileAttributes::default(),
        };

        let handle = handle_of(call(&session, 1, open(OpenFlags::WRITE | OpenFlags::CREATE)).await);
        let written = call(&session, 2, Operation::Write {
            handle: handle.clone(),
            offset: 0,
            data: Bytes::from_static(b"hello"),
        })
        .await;
        assert_eq!(written, Response::ok(2));
        assert_eq!(call(&session, 3, Operation::Close { handle }).await, Response::ok(3));

        let stat = call(&session, 4, Operation::Stat { path: "/notes.txt".into() }).await;
        assert!(matches!(stat, Response::Attrs { attrs, .. } if attrs.size == Some(5)));

        let handle = handle_of(call(&session, 5, open(OpenFlags::READ)).await);
        let fstat = call(&session, 6, Operation::Fstat { handle: handle.clone() }).await;
        assert!(matches!(fstat, Response::Attrs { attrs, .. } if attrs.size == Some(5)));

        let data = call(&session, 7, Operation::Read {
            handle: handle.clone(),
            offset: 0,
            len: 1024,
        })
        .await;
        assert_eq!(
            data,
            Response::Data {
                id: 7,
                data: Bytes::from_static(b"hello")
            }
        );
        let eof = call(&session, 8, Operation::Read {
            handle: handle.clone(),
            offset: 5,
            len: 1024,
        })
        .await;
        assert_eq!(status_code(&eof), StatusCode::Eof);
        assert_eq!(call(&session, 9, Operation::Close { handle }).await, Response::ok(9));
        assert_eq!(session.open_handles(), 0);
    }

    #[tokio::test]
    async fn test_rename_and_remove() {
        let session = dispatcher();
        let handle = handle_of(
            call(&session, 1, Operation::Open {
                path: "/a".into(),
                flags: OpenFlags(OpenFlags::WRITE),
                attrs: FileAttributes::default(),
            })
            .await,
        );
        call(&session, 2, Operation::Close { handle }).await;

        let renamed = call(&session, 3, Operation::Rename {
            from: "/a".into(),
            to: "/b".into(),
        })
        .await;
        assert_eq!(renamed, Response::ok(3));
        assert_eq!(
            call(&session, 4, Operation::Remove { path: "/b".into() }).await,
            Response::ok(4)
        );
        let again = call(&session, 5, Operation::Remove { path: "/b".into() }).await;
        assert_eq!(status_code(&again), StatusCode::Failure);
    }

    #[tokio::test]
    async fn test_bad_handle() {
        let session = dispatcher();
        let response = call(&session, 1, Operation::Close {
            handle: Bytes::from_static(b"junk"),
        })
        .await;
        assert_eq!(status_code(&response), StatusCode::Failure);
    }
}

//! SFTP server exposing an object-storage bucket as a filesystem.
//!
//! Key components:
//!
//! - [`SshServer`] - Accepts SSH connections and authenticates them
//! - [`Authenticator`] - Decides on credentials and picks the bucket
//! - [`SessionDispatcher`] - Routes SFTP requests for one channel
//! - [`FileTransferEngine`] - Object reads and uploads behind file handles
//! - [`DirectoryEmulator`] - Directories synthesized from key prefixes
//! - [`ReadReorderBuffer`] - Serves out-of-order reads from a forward-only stream
//!
//! ## Design Decisions
//!
//! - **Pipelined replies**: requests are routed in arrival order but answered
//!   as soon as each is ready, so a read can wait for an earlier one without
//!   stalling the channel.
//! - **Directories are prefixes**: `a/b` is a directory when any key starts
//!   with `a/b/`. MKDIR writes the marker object `a/b/`.
//! - **No seeking**: a file opened for reading is one stream from byte 0.
//!   Reads behind the stream cursor never complete.

pub mod auth;
pub mod config;
pub mod constants;
pub mod directory;
pub mod error;
pub mod files;
pub mod handles;
pub mod path;
pub mod protocol;
pub mod reorder;
pub mod session;
pub mod ssh;
pub mod stat;

pub use auth::{AuthDecision, AuthMethod, Authenticator};
pub use config::{ConnectionOptions, ServerArgs, StoreKind};
pub use directory::DirectoryEmulator;
pub use error::{SftpError, SftpResult};
pub use files::FileTransferEngine;
pub use handles::{Handle, HandleTable};
pub use reorder::{ReadReorderBuffer, ReadReply, StreamEvent};
pub use session::SessionDispatcher;
pub use ssh::{SshServer, SshServerConfig};
pub use stat::StatResolver;

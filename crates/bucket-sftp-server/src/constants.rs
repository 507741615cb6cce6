//! Server configuration constants.
//!
//! Centralizes hardcoded values for easier configuration and documentation.

use std::time::Duration;

/// Default SSH port.
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Default bind address (all interfaces).
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0";

/// Bucket bound to sessions that authenticate with the none method.
pub const DEFAULT_BUCKET: &str = "default";

/// Host key tried before falling back to a generated one.
pub const DEFAULT_HOST_KEY_PATH: &str = "/etc/ssh/ssh_host_ed25519_key";

/// SSH authentication rejection delay (prevents timing attacks).
pub const SSH_AUTH_REJECTION_DELAY: Duration = Duration::from_secs(1);

/// SFTP protocol version spoken by the server.
pub const SFTP_VERSION: u32 = 3;

/// Largest packet accepted from a client.
///
/// Clients cap READ/WRITE payloads at 256 KiB; the rest is header slack.
pub const MAX_PACKET_LEN: usize = 256 * 1024 + 1024;

/// Stop pulling from a backend read stream once this many bytes are
/// buffered and unclaimed.
pub const READ_HIGH_WATER_MARK: usize = 256 * 1024;

/// Largest payload a single READ reply carries; longer requests are
/// answered short.
pub const MAX_READ_LEN: u32 = 256 * 1024;

/// File mode reported for objects (`S_IFREG | 0777`).
pub const MODE_FILE: u32 = 0o100_777;

/// File mode reported for directories (`S_IFDIR | 0777`).
pub const MODE_DIR: u32 = 0o040_777;

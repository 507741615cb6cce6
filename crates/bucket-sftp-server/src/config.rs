//! Startup configuration.
//!
//! Settings come from CLI flags with environment fallbacks. Credentials are
//! read once from two optional JSON files:
//!
//! ```json
//! // USER_FILE
//! [["alice", {"password": "secret", "bucketName": "alice-files"}]]
//!
//! // PUB_KEY_FILE
//! [{"keyPath": "/etc/sftp/keys/bob.pub", "bucketName": "bob-files"}]
//! ```
//!
//! Everything here is built before the listener starts and shared read-only
//! afterwards.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};

use clap::{Parser, ValueEnum};
use russh::keys::ssh_key::{self, Algorithm, PublicKey};
use russh::keys::PrivateKey;
use serde::Deserialize;
use thiserror::Error;

use crate::constants::{
    DEFAULT_BIND_ADDRESS, DEFAULT_BUCKET, DEFAULT_HOST_KEY_PATH, DEFAULT_SSH_PORT,
};

/// Command-line interface of the `bucket-sftp` binary.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "bucket-sftp",
    version,
    about = "SFTP server exposing an object-storage bucket as a filesystem"
)]
pub struct ServerArgs {
    /// SSH listen port
    #[arg(long, env = "PORT", default_value_t = DEFAULT_SSH_PORT)]
    pub port: u16,

    /// Address to bind the listener to
    #[arg(long, env = "BIND_ADDRESS", default_value = DEFAULT_BIND_ADDRESS)]
    pub bind_address: IpAddr,

    /// Bucket served to sessions authenticated with the none method
    #[arg(long, env = "DEFAULT_BUCKET", default_value = DEFAULT_BUCKET)]
    pub default_bucket: String,

    /// Accept the none method when no users or keys are configured
    #[arg(long, env = "ALLOW_NONE_AUTH")]
    pub allow_none_auth: bool,

    /// JSON file of password users
    #[arg(long, env = "USER_FILE")]
    pub user_file: Option<PathBuf>,

    /// JSON file of public keys
    #[arg(long, env = "PUB_KEY_FILE")]
    pub pub_key_file: Option<PathBuf>,

    /// Credentials handed to the storage client
    #[arg(long, env = "CREDENTIALS_FILE")]
    pub credentials_file: Option<PathBuf>,

    /// OpenSSH private host key
    #[arg(long, env = "HOST_KEY_FILE", default_value = DEFAULT_HOST_KEY_PATH)]
    pub host_key_file: PathBuf,

    /// Storage backend
    #[arg(long, env = "STORE", value_enum, default_value_t = StoreKind::Local)]
    pub store: StoreKind,

    /// Root directory of the local store (one subdirectory per bucket)
    #[arg(long, env = "DATA_DIR", default_value = "./data")]
    pub data_dir: PathBuf,
}

/// Which `StoreProvider` backs the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StoreKind {
    /// Directory tree under `--data-dir`
    Local,
    /// Process memory; lost on exit
    Memory,
}

/// Configuration errors. All of them abort startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid public key in {path}: {source}")]
    PublicKey {
        path: PathBuf,
        #[source]
        source: ssh_key::Error,
    },

    #[error("host key generation failed: {0}")]
    HostKey(#[source] ssh_key::Error),
}

/// A password user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllowedUser {
    pub password: String,
    pub bucket: String,
}

/// A public key allowed to log in, with the bucket it unlocks.
#[derive(Debug, Clone)]
pub struct AllowedKey {
    pub key: PublicKey,
    /// Algorithm name as it appears on the wire, e.g. `ssh-ed25519`.
    pub algorithm: String,
    /// Encoded key blob.
    pub blob: Vec<u8>,
    pub bucket: String,
}

impl AllowedKey {
    pub fn new(key: PublicKey, bucket: impl Into<String>) -> Result<Self, ssh_key::Error> {
        let blob = key.to_bytes()?;
        Ok(Self {
            algorithm: key.algorithm().as_str().to_string(),
            blob,
            key,
            bucket: bucket.into(),
        })
    }
}

/// Everything a connection needs to know. Built once, shared behind `Arc`.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub default_bucket: String,
    pub allow_none_auth: bool,
    pub allowed_users: HashMap<String, AllowedUser>,
    pub allowed_keys: Vec<AllowedKey>,
    pub port: u16,
    pub bind_address: IpAddr,
    /// Passed through to the storage client; only logged here.
    pub credentials: Option<PathBuf>,
}

impl ConnectionOptions {
    /// Options with no credentials configured.
    pub fn new(default_bucket: impl Into<String>) -> Self {
        Self {
            default_bucket: default_bucket.into(),
            allow_none_auth: false,
            allowed_users: HashMap::new(),
            allowed_keys: Vec::new(),
            port: DEFAULT_SSH_PORT,
            bind_address: IpAddr::from([0, 0, 0, 0]),
            credentials: None,
        }
    }

    /// Build from parsed arguments, loading the user and key files.
    pub fn from_args(args: &ServerArgs) -> Result<Self, ConfigError> {
        let allowed_users = match &args.user_file {
            Some(path) => load_users(path)?,
            None => HashMap::new(),
        };
        let allowed_keys = match &args.pub_key_file {
            Some(path) => load_keys(path)?,
            None => Vec::new(),
        };

        Ok(Self {
            default_bucket: args.default_bucket.clone(),
            allow_none_auth: args.allow_none_auth,
            allowed_users,
            allowed_keys,
            port: args.port,
            bind_address: args.bind_address,
            credentials: args.credentials_file.clone(),
        })
    }

    pub fn with_none_auth(mut self, allow: bool) -> Self {
        self.allow_none_auth = allow;
        self
    }

    pub fn with_user(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
        bucket: impl Into<String>,
    ) -> Self {
        self.allowed_users.insert(
            username.into(),
            AllowedUser {
                password: password.into(),
                bucket: bucket.into(),
            },
        );
        self
    }

    pub fn with_key(mut self, key: AllowedKey) -> Self {
        self.allowed_keys.push(key);
        self
    }

    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.port)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserEntry {
    password: String,
    bucket_name: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct KeyEntry {
    key_path: PathBuf,
    bucket_name: String,
}

fn read_file(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })
}

/// Load `[[username, {"password", "bucketName"}]]`.
///
/// A later entry for the same username replaces an earlier one.
pub fn load_users(path: &Path) -> Result<HashMap<String, AllowedUser>, ConfigError> {
    let text = read_file(path)?;
    let entries: Vec<(String, UserEntry)> =
        serde_json::from_str(&text).map_err(|source| ConfigError::Json {
            path: path.to_path_buf(),
            source,
        })?;

    Ok(entries
        .into_iter()
        .map(|(username, entry)| {
            (
                username,
                AllowedUser {
                    password: entry.password,
                    bucket: entry.bucket_name,
                },
            )
        })
        .collect())
}

/// Load `[{"keyPath", "bucketName"}]`, parsing every referenced public key.
///
/// Relative key paths resolve against the current directory.
pub fn load_keys(path: &Path) -> Result<Vec<AllowedKey>, ConfigError> {
    let text = read_file(path)?;
    let entries: Vec<KeyEntry> =
        serde_json::from_str(&text).map_err(|source| ConfigError::Json {
            path: path.to_path_buf(),
            source,
        })?;

    entries
        .into_iter()
        .map(|entry| {
            let key_text = read_file(&entry.key_path)?;
            let key_error = |source| ConfigError::PublicKey {
                path: entry.key_path.clone(),
                source,
            };
            let key = PublicKey::from_openssh(key_text.trim()).map_err(key_error)?;
            AllowedKey::new(key, entry.bucket_name.clone()).map_err(key_error)
        })
        .collect()
}

/// Where the host key came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKeySource {
    File(PathBuf),
    Generated,
}

/// Load the host key, falling back to a fresh Ed25519 key.
///
/// A missing file is expected on development machines; a file that exists
/// but cannot be used is worth a warning.
pub fn load_host_key(path: &Path) -> Result<(PrivateKey, HostKeySource), ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(text) => match PrivateKey::from_openssh(&text) {
            Ok(key) if key.is_encrypted() => {
                tracing::warn!(path = %path.display(), "host key is encrypted, ignoring it");
            }
            Ok(key) => return Ok((key, HostKeySource::File(path.to_path_buf()))),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "host key is not a valid OpenSSH private key");
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!(path = %path.display(), "no host key file");
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "host key exists but is not readable");
        }
    }

    tracing::warn!("using a generated Ed25519 host key; clients will see a new fingerprint on every restart");
    let key = PrivateKey::random(&mut rand::thread_rng(), Algorithm::Ed25519)
        .map_err(ConfigError::HostKey)?;
    Ok((key, HostKeySource::Generated))
}

//! Authentication decisions.
//!
//! The SSH transport handles the handshake and signature verification; this
//! module only decides whether presented credentials are acceptable and which
//! bucket they unlock. Rejections name the methods worth trying next.

use std::sync::Arc;

use russh::keys::ssh_key::PublicKey;
use subtle::ConstantTimeEq;

use crate::config::{AllowedKey, ConnectionOptions};

/// Methods a rejected client may continue with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    Password,
    PublicKey,
}

/// Result of one authentication attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthDecision {
    /// Credentials accepted; the session is bound to `bucket`.
    Accept { bucket: String },
    Reject { proceed_with: Vec<AuthMethod> },
}

impl AuthDecision {
    fn reject(proceed_with: &[AuthMethod]) -> Self {
        AuthDecision::Reject {
            proceed_with: proceed_with.to_vec(),
        }
    }

    pub fn is_accept(&self) -> bool {
        matches!(self, AuthDecision::Accept { .. })
    }
}

/// Stateless decision maker over the configured credentials.
#[derive(Debug, Clone)]
pub struct Authenticator {
    options: Arc<ConnectionOptions>,
}

impl Authenticator {
    pub fn new(options: Arc<ConnectionOptions>) -> Self {
        Self { options }
    }

    /// The none method is only good for fully open servers.
    pub fn none(&self) -> AuthDecision {
        let options = &self.options;
        if options.allow_none_auth
            && options.allowed_users.is_empty()
            && options.allowed_keys.is_empty()
        {
            AuthDecision::Accept {
                bucket: options.default_bucket.clone(),
            }
        } else {
            AuthDecision::reject(&[AuthMethod::Password, AuthMethod::PublicKey])
        }
    }

    pub fn password(&self, username: &str, password: &str) -> AuthDecision {
        if username.is_empty() || password.is_empty() {
            return AuthDecision::reject(&[AuthMethod::PublicKey]);
        }

        // TODO: store password hashes and compare in constant time
        match self.options.allowed_users.get(username) {
            Some(user) if user.password == password => AuthDecision::Accept {
                bucket: user.bucket.clone(),
            },
            _ => AuthDecision::reject(&[]),
        }
    }

    /// First configured key equal to `key`.
    ///
    /// Algorithm and length are compared first; the blob comparison itself
    /// is constant time.
    pub fn match_key(&self, key: &PublicKey) -> Option<&AllowedKey> {
        let algorithm = key.algorithm();
        let blob = key.to_bytes().ok()?;

        self.options.allowed_keys.iter().find(|allowed| {
            allowed.algorithm == algorithm.as_str()
                && allowed.blob.len() == blob.len()
                && bool::from(allowed.blob.ct_eq(&blob))
        })
    }

    /// Whether the client should go on to sign with `key`. Binds nothing.
    pub fn public_key_offered(&self, key: &PublicKey) -> AuthDecision {
        if self.options.allowed_keys.is_empty() {
            return AuthDecision::reject(&[AuthMethod::Password]);
        }
        match self.match_key(key) {
            Some(allowed) => AuthDecision::Accept {
                bucket: allowed.bucket.clone(),
            },
            None => AuthDecision::reject(&[]),
        }
    }

    /// Decide on a key whose signature the transport has checked.
    pub fn public_key(&self, key: &PublicKey, signature_verified: bool) -> AuthDecision {
        if self.options.allowed_keys.is_empty() {
            return AuthDecision::reject(&[AuthMethod::Password]);
        }
        if !signature_verified {
            return AuthDecision::reject(&[]);
        }
        match self.match_key(key) {
            Some(allowed) => AuthDecision::Accept {
                bucket: allowed.bucket.clone(),
            },
            None => AuthDecision::reject(&[]),
        }
    }
}

//! SSH front end.
//!
//! Accepts SSH connections, runs authentication through the
//! [`Authenticator`], and starts one SFTP session per `sftp` subsystem
//! request on the bucket the connection authenticated for.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use russh::keys::ssh_key;
use russh::keys::PrivateKey;
use russh::server::{self, Auth, Msg, Server as _, Session};
use russh::{Channel, ChannelId, MethodKind, MethodSet};
use tokio::net::TcpListener;
use tracing::{Instrument, debug, error, info, info_span, warn};

use bucket_sftp_store::StoreProvider;

use crate::auth::{AuthDecision, AuthMethod, Authenticator};
use crate::config::ConnectionOptions;
use crate::constants::SSH_AUTH_REJECTION_DELAY;
use crate::session::SessionDispatcher;

/// SSH server configuration
#[derive(Clone)]
pub struct SshServerConfig {
    pub bind_addr: SocketAddr,
    pub host_key: PrivateKey,
}

/// SSH server
pub struct SshServer {
    config: SshServerConfig,
    options: Arc<ConnectionOptions>,
    stores: Arc<dyn StoreProvider>,
}

impl SshServer {
    pub fn new(
        config: SshServerConfig,
        options: Arc<ConnectionOptions>,
        stores: Arc<dyn StoreProvider>,
    ) -> Self {
        Self {
            config,
            options,
            stores,
        }
    }

    /// Bind and serve until the listener fails.
    pub async fn run(&self) -> Result<(), std::io::Error> {
        let config = russh::server::Config {
            auth_rejection_time: SSH_AUTH_REJECTION_DELAY,
            auth_rejection_time_initial: Some(std::time::Duration::from_secs(0)),
            keys: vec![self.config.host_key.clone()],
            ..Default::default()
        };

        let socket = TcpListener::bind(self.config.bind_addr)
            .await
            .inspect_err(|e| log_bind_error(self.config.bind_addr, e))?;
        info!(addr = %self.config.bind_addr, "listening for SSH connections");

        let mut server = Server {
            auth: Authenticator::new(self.options.clone()),
            stores: self.stores.clone(),
        };
        server
            .run_on_socket(Arc::new(config), &socket)
            .await
            .map_err(std::io::Error::other)
    }
}

fn log_bind_error(addr: SocketAddr, e: &std::io::Error) {
    match e.kind() {
        std::io::ErrorKind::AddrInUse => {
            error!(%addr, "address already in use; is another SSH server running on this port?");
        }
        std::io::ErrorKind::PermissionDenied => {
            error!(%addr, "permission denied binding the port; ports below 1024 need elevated privileges");
        }
        _ => error!(%addr, error = %e, "failed to bind"),
    }
}

/// Server factory - creates a gateway for each connection
struct Server {
    auth: Authenticator,
    stores: Arc<dyn StoreProvider>,
}

impl server::Server for Server {
    type Handler = ConnectionGateway;

    fn new_client(&mut self, peer_addr: Option<SocketAddr>) -> Self::Handler {
        debug!(peer = ?peer_addr, "new connection");
        ConnectionGateway::new(peer_addr, self.auth.clone(), self.stores.clone())
    }

    fn handle_session_error(&mut self, error: <Self::Handler as server::Handler>::Error) {
        warn!(error = ?error, "SSH session error");
    }
}

/// Where a connection is in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayState {
    Unauthenticated,
    Authenticated { bucket: String },
    SubsystemActive { bucket: String },
    Closed,
}

/// Handler for a single SSH connection
pub struct ConnectionGateway {
    peer: Option<SocketAddr>,
    auth: Authenticator,
    stores: Arc<dyn StoreProvider>,
    state: GatewayState,
    channels: HashMap<ChannelId, Channel<Msg>>,
}

fn method_set(methods: &[AuthMethod]) -> Option<MethodSet> {
    // An empty list lets the client retry with whatever the server offers
    if methods.is_empty() {
        return None;
    }
    let kinds: Vec<MethodKind> = methods
        .iter()
        .map(|method| match method {
            AuthMethod::Password => MethodKind::Password,
            AuthMethod::PublicKey => MethodKind::PublicKey,
        })
        .collect();
    Some(MethodSet::from(&kinds[..]))
}

impl ConnectionGateway {
    fn new(peer: Option<SocketAddr>, auth: Authenticator, stores: Arc<dyn StoreProvider>) -> Self {
        Self {
            peer,
            auth,
            stores,
            state: GatewayState::Unauthenticated,
            channels: HashMap::new(),
        }
    }

    pub fn state(&self) -> &GatewayState {
        &self.state
    }

    /// Apply an authentication decision, binding the bucket on success.
    fn conclude(&mut self, method: &'static str, user: &str, decision: AuthDecision) -> Auth {
        match decision {
            AuthDecision::Accept { bucket } => {
                info!(peer = ?self.peer, user, method, bucket, "authenticated");
                self.state = GatewayState::Authenticated { bucket };
                Auth::Accept
            }
            AuthDecision::Reject { proceed_with } => {
                info!(peer = ?self.peer, user, method, "authentication rejected");
                Auth::Reject {
                    proceed_with_methods: method_set(&proceed_with),
                    partial_success: false,
                }
            }
        }
    }

    /// Refuse a subsystem request without ending the connection.
    fn refuse(&self, channel_id: ChannelId, session: &mut Session) -> Result<(), russh::Error> {
        session.channel_failure(channel_id)
    }
}

impl server::Handler for ConnectionGateway {
    type Error = russh::Error;

    async fn auth_none(&mut self, user: &str) -> Result<Auth, Self::Error> {
        Ok(info_span!("auth.none", user).in_scope(|| {
            let decision = self.auth.none();
            self.conclude("none", user, decision)
        }))
    }

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        Ok(info_span!("auth.password", user).in_scope(|| {
            let decision = self.auth.password(user, password);
            self.conclude("password", user, decision)
        }))
    }

    async fn auth_publickey_offered(
        &mut self,
        user: &str,
        public_key: &ssh_key::PublicKey,
    ) -> Result<Auth, Self::Error> {
        // Only tells the client whether signing is worthwhile; binds nothing
        Ok(match self.auth.public_key_offered(public_key) {
            AuthDecision::Accept { .. } => Auth::Accept,
            AuthDecision::Reject { proceed_with } => {
                debug!(peer = ?self.peer, user, "offered key not accepted");
                Auth::Reject {
                    proceed_with_methods: method_set(&proceed_with),
                    partial_success: false,
                }
            }
        })
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &ssh_key::PublicKey,
    ) -> Result<Auth, Self::Error> {
        // russh checks the signature before calling this
        Ok(info_span!("auth.publickey", user).in_scope(|| {
            let decision = self.auth.public_key(public_key, true);
            self.conclude("publickey", user, decision)
        }))
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        debug!(channel = %channel.id(), "session channel opened");
        self.channels.insert(channel.id(), channel);
        Ok(true)
    }

    async fn subsystem_request(
        &mut self,
        channel_id: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let bucket = match &self.state {
            GatewayState::Authenticated { bucket } => bucket.clone(),
            state => {
                warn!(peer = ?self.peer, ?state, name, "subsystem request in wrong state");
                return self.refuse(channel_id, session);
            }
        };

        if name != "sftp" {
            warn!(peer = ?self.peer, name, "unsupported subsystem");
            return self.refuse(channel_id, session);
        }

        let Some(channel) = self.channels.remove(&channel_id) else {
            warn!(channel = %channel_id, "subsystem request on unknown channel");
            return self.refuse(channel_id, session);
        };

        let store = match self.stores.open_bucket(&bucket).await {
            Ok(store) => store,
            Err(e) => {
                error!(bucket, error = %e, "cannot open bucket");
                return self.refuse(channel_id, session);
            }
        };

        session.channel_success(channel_id)?;
        self.state = GatewayState::SubsystemActive {
            bucket: bucket.clone(),
        };

        let span = info_span!("session.sftp", bucket, peer = ?self.peer);
        let dispatcher = SessionDispatcher::new(bucket, store);
        tokio::spawn(dispatcher.run(channel.into_stream()).instrument(span));
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(%channel, "channel eof");
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(%channel, "channel closed");
        self.channels.remove(&channel);
        if matches!(self.state, GatewayState::SubsystemActive { .. }) {
            self.state = GatewayState::Closed;
        }
        Ok(())
    }
}

impl Drop for ConnectionGateway {
    fn drop(&mut self) {
        info!(peer = ?self.peer, state = ?self.state, "connection closed");
    }
}

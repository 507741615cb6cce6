//! bucket-sftp server binary
//!
//! ## Usage
//!
//! ```bash
//! # Serve ./data/<bucket> on port 2222, password users from users.json
//! bucket-sftp --port 2222 --user-file users.json
//!
//! # Throwaway in-memory server anyone can log into
//! bucket-sftp --port 2222 --store memory --allow-none-auth
//! ```
//!
//! Every flag also reads an environment variable (`PORT`, `USER_FILE`, ...);
//! see `bucket-sftp --help`.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use bucket_sftp_server::config::{load_host_key, HostKeySource};
use bucket_sftp_server::{ConnectionOptions, ServerArgs, SshServer, SshServerConfig, StoreKind};
use bucket_sftp_store::{LocalBackend, MemoryBackend, StoreProvider};
use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> ExitCode {
    let args = ServerArgs::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr));

    #[cfg(feature = "telemetry")]
    let _otel_guard = if bucket_sftp_telemetry::otel_enabled() {
        match bucket_sftp_telemetry::otel_layer("bucket-sftp") {
            Ok((otel_layer, guard)) => {
                registry.with(otel_layer).init();
                Some(guard)
            }
            Err(e) => {
                registry.init();
                tracing::warn!(error = %e, "OpenTelemetry export disabled");
                None
            }
        }
    } else {
        registry.init();
        None
    };

    #[cfg(not(feature = "telemetry"))]
    registry.init();

    match run_server(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("Server error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_server(args: ServerArgs) -> anyhow::Result<()> {
    let options = ConnectionOptions::from_args(&args).context("loading credentials")?;

    tracing::info!(
        port = options.port,
        users = options.allowed_users.len(),
        keys = options.allowed_keys.len(),
        credentials = ?options.credentials,
        none_auth = options.allow_none_auth,
        "starting bucket-sftp"
    );
    if options.allowed_users.is_empty() && options.allowed_keys.is_empty() && !options.allow_none_auth {
        tracing::warn!("no users, keys or none auth configured; nobody can log in");
    }

    let (host_key, source) = load_host_key(&args.host_key_file)?;
    if let HostKeySource::File(path) = &source {
        tracing::info!(path = %path.display(), "loaded host key");
    }

    let stores: Arc<dyn StoreProvider> = match args.store {
        StoreKind::Memory => {
            tracing::warn!("using the in-memory store; uploads are lost on exit");
            Arc::new(MemoryBackend::new())
        }
        StoreKind::Local => {
            tracing::info!(root = %args.data_dir.display(), "using the local store");
            Arc::new(LocalBackend::new(args.data_dir.clone()))
        }
    };

    let config = SshServerConfig {
        bind_addr: options.bind_addr(),
        host_key,
    };
    let server = SshServer::new(config, Arc::new(options), stores);
    server.run().await.context("SSH server stopped")?;
    Ok(())
}

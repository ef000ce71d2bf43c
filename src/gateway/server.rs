//! Gateway process shell: wires long-lived resources, binds the listener,
//! and drives graceful shutdown.

use std::net::SocketAddr;
use std::sync::Arc;

use sha2::Digest;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use super::auth::AppState;
use super::router::create_router;
use crate::config::Config;
use crate::config_reload::{build_app_state, ConfigWatcher, SharedResources};
use crate::{Error, Result};

/// Upper bound on concurrently in-flight requests the shutdown drain will
/// wait for. Mirrors the permit count used elsewhere for a full-drain wait;
/// ordinary traffic never gets close to it.
const MAX_INFLIGHT: usize = 10_000;

/// The authenticating reverse proxy server.
pub struct Gateway {
    config: Config,
    config_path: Option<std::path::PathBuf>,
    shutdown_tx: Option<tokio::sync::broadcast::Sender<()>>,
}

impl Gateway {
    /// Validate `config` and prepare a gateway. Shared long-lived resources
    /// (KV stores, HTTP client) are constructed lazily in [`Self::run`], not
    /// here, since they may need to outlive several config reloads.
    ///
    /// # Errors
    ///
    /// Returns an error if `config` fails validation.
    pub async fn new(config: Config) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            config_path: None,
            shutdown_tx: None,
        })
    }

    /// Remember the on-disk config path so the watcher can re-read it on
    /// change. A gateway built without a path (e.g. env-only config) never
    /// starts the watcher.
    #[must_use]
    pub fn with_config_path(mut self, path: Option<std::path::PathBuf>) -> Self {
        self.config_path = path;
        self
    }

    /// Run the gateway until shutdown. Binds the listener, starts the
    /// config watcher (if a config path was given), and blocks until a
    /// termination signal is received, then drains in-flight requests and
    /// closes the KV stores.
    ///
    /// # Errors
    ///
    /// Returns an error if the server cannot bind to the configured address.
    pub async fn run(mut self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::ConfigInvalid(format!("invalid host: {e}")))?,
            self.config.server.port,
        );

        let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
        self.shutdown_tx = Some(shutdown_tx.clone());

        let kvs = &self.config.kvs;
        let base_kv = crate::kv::open(kvs.backend, kvs.disk_path.as_deref(), kvs.redis_url.as_deref()).await?;
        let inflight = Arc::new(Semaphore::new(MAX_INFLIGHT));

        let shared = Arc::new(SharedResources {
            sessions_kv: crate::kv::Namespace::wrap(Arc::clone(&base_kv), "sessions:"),
            tokens_kv: crate::kv::Namespace::wrap(Arc::clone(&base_kv), "tokens:"),
            ratelimit_kv: crate::kv::Namespace::wrap(Arc::clone(&base_kv), "ratelimit:"),
            oauth_kv: crate::kv::Namespace::wrap(Arc::clone(&base_kv), "oauth2state:"),
            http: reqwest::Client::new(),
            inflight: Arc::clone(&inflight),
        });

        let inner = build_app_state(&self.config, &shared)?;
        let state = AppState::new(inner);

        let _watcher = if let Some(path) = self.config_path.clone() {
            let hash: [u8; 32] = sha2::Sha256::digest(self.config.canonical_json()?).into();
            match ConfigWatcher::start(path.clone(), state.clone(), Arc::clone(&shared), hash, shutdown_tx.subscribe()) {
                Ok(watcher) => {
                    info!(path = %path.display(), "config watcher started");
                    Some(watcher)
                }
                Err(e) => {
                    warn!(error = %e, "failed to start config watcher, continuing without hot-reload");
                    None
                }
            }
        } else {
            None
        };

        let app = create_router(state, self.config.assets.dir.clone());
        let listener = TcpListener::bind(addr).await?;

        info!(host = %self.config.server.host, port = self.config.server.port, service = %self.config.service.name, "chatbotgate listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal(shutdown_tx))
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;

        let drain_timeout = self.config.server.shutdown_timeout;
        info!(timeout = ?drain_timeout, "draining in-flight requests");
        match tokio::time::timeout(drain_timeout, inflight.acquire_many(MAX_INFLIGHT as u32)).await {
            Ok(Ok(_permit)) => info!("all in-flight requests drained"),
            Ok(Err(_)) => warn!("in-flight semaphore closed before drain completed"),
            Err(_) => warn!(timeout = ?drain_timeout, "drain timed out with requests still in flight"),
        }

        if let Err(e) = base_kv.close().await {
            warn!(error = %e, "error closing kv store during shutdown");
        }

        Ok(())
    }
}

/// Waits for Ctrl+C or, on Unix, SIGTERM, then broadcasts the shutdown
/// signal once.
async fn shutdown_signal(shutdown_tx: tokio::sync::broadcast::Sender<()>) {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }

    info!("shutdown signal received");
    let _ = shutdown_tx.send(());
}

//! Config hot-reload: filesystem watch with debounce and content-hash
//! dedup, driving validate-then-swap of the live [`AppStateInner`].
//!
//! Mirrors [`crate::gateway::AppState`]'s own swap discipline: a reload
//! never mutates the active instance in place, it builds a full replacement
//! and atomically installs it. A failed build (bad config, unreachable KV)
//! leaves the previous instance serving traffic.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::config::Config;
use crate::gateway::{AppState, AppStateInner};
use crate::Result;

const DEBOUNCE: Duration = Duration::from_millis(100);

/// Long-lived handles shared across every config generation: KV stores and
/// the outbound HTTP client. These are constructed once at startup and
/// injected into every rebuilt [`AppStateInner`]; a reload never recreates
/// them, only the config-derived objects layered on top.
pub struct SharedResources {
    pub sessions_kv: Arc<dyn crate::kv::KvStore>,
    pub tokens_kv: Arc<dyn crate::kv::KvStore>,
    pub ratelimit_kv: Arc<dyn crate::kv::KvStore>,
    pub oauth_kv: Arc<dyn crate::kv::KvStore>,
    pub http: reqwest::Client,
    /// Counts in-flight requests across every config generation, so a
    /// shutdown drain can wait for them regardless of how many reloads
    /// happened while they were running.
    pub inflight: Arc<tokio::sync::Semaphore>,
}

/// Build a fresh [`AppStateInner`] for `config`, wiring in the shared
/// long-lived resources. Pure except for the OAuth2 provider construction,
/// which can fail on a malformed provider config.
pub fn build_app_state(config: &Config, shared: &SharedResources) -> Result<AppStateInner> {
    config.validate()?;

    let classifier = Arc::new(config.route_classifier()?);
    let authz = Arc::new(config.authorization_checker());
    let forwarding = Arc::new(config.forwarding_fields()?);
    let cookie_policy = Arc::new(config.cookie_policy());

    let sessions = Arc::new(crate::session::SessionStore::new(Arc::clone(&shared.sessions_kv)));

    let token_secret = config.session.cookie_secret.clone().into_bytes();
    let tokens = Arc::new(crate::token::TokenStore::new(
        Arc::clone(&shared.tokens_kv),
        token_secret,
        config.email_auth.token_ttl,
    ));

    let rate_limiter = crate::ratelimit::RateLimiter::new(
        Arc::clone(&shared.ratelimit_kv),
        config.email_auth.rate_limit.capacity,
        config.email_auth.rate_limit.period,
    );

    let dispatch_config = config
        .email_auth
        .dispatch
        .clone()
        .unwrap_or_else(|| crate::email::dispatch::DispatchConfig::File(crate::email::dispatch::FileSinkConfig {
            path: std::env::temp_dir().join("chatbotgate-otp.jsonl"),
        }));

    let email = Arc::new(crate::email::EmailAuthHandler::new(
        (*authz).clone(),
        rate_limiter,
        tokens,
        dispatch_config,
        config.service.name.clone(),
        config.service.logo_url.clone(),
        config.email_auth.token_ttl.as_secs() / 60,
    ));

    let oauth = Arc::new(crate::oauth::Manager::new(
        config.oauth2.clone(),
        Arc::clone(&shared.oauth_kv),
        shared.http.clone(),
    )?);

    let proxy = crate::proxy::ReverseProxy::new(
        crate::proxy::UpstreamTable::new(config.proxy.upstream.clone(), config.proxy.upstream_by_host.clone()),
        config.proxy.shared_secret_header.clone(),
    )?;

    Ok(AppStateInner {
        classifier,
        sessions,
        authz,
        oauth,
        email,
        forwarding,
        cookie_policy,
        proxy,
        prefix: config.proxy.auth_path_prefix.clone(),
        service_name: config.service.name.clone(),
        session_ttl: config.session.cookie.expire,
        development: config.proxy.development,
        inflight: Arc::clone(&shared.inflight),
    })
}

/// Canonical-JSON SHA-256 hash of `config`, used to skip no-op reloads.
fn config_hash(config: &Config) -> Result<[u8; 32]> {
    let bytes = config.canonical_json()?;
    Ok(Sha256::digest(&bytes).into())
}

/// Validate, build, and atomically swap a new [`AppStateInner`] into
/// `state`. Returns `Err` (and leaves `state` untouched) on any failure —
/// bad config, unreachable OAuth2 endpoint construction, anything.
pub fn reload(state: &AppState, config: &Config, shared: &SharedResources) -> Result<()> {
    let inner = build_app_state(config, shared)?;
    state.swap(inner);
    Ok(())
}

/// Filesystem watcher driving debounced reloads of `config_path`. Holds the
/// underlying `notify` watcher alive for the struct's lifetime.
pub struct ConfigWatcher {
    _watcher: Mutex<RecommendedWatcher>,
}

impl ConfigWatcher {
    /// Start watching `config_path`'s parent directory for create/modify
    /// events. On a debounced change, reparses the file, skips it if the
    /// canonical-JSON hash is unchanged, and otherwise calls [`reload`].
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying `notify` watcher cannot be
    /// created or the directory cannot be watched.
    pub fn start(
        config_path: PathBuf,
        state: AppState,
        shared: Arc<SharedResources>,
        initial_hash: [u8; 32],
        mut shutdown_rx: tokio::sync::broadcast::Receiver<()>,
    ) -> Result<Self> {
        let (event_tx, mut event_rx) = tokio::sync::mpsc::channel::<()>(32);

        let watch_path = config_path.clone();
        let mut watcher = RecommendedWatcher::new(
            move |result: std::result::Result<Event, notify::Error>| {
                let Ok(event) = result else { return };
                if matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_))
                    && event.paths.iter().any(|p| p == &watch_path)
                {
                    let _ = event_tx.try_send(());
                }
            },
            NotifyConfig::default().with_poll_interval(Duration::from_secs(2)),
        )
        .map_err(|e| crate::Error::Internal(format!("failed to create config watcher: {e}")))?;

        let watch_dir = config_path.parent().unwrap_or_else(|| std::path::Path::new(".")).to_path_buf();
        watcher
            .watch(&watch_dir, RecursiveMode::NonRecursive)
            .map_err(|e| crate::Error::Internal(format!("failed to watch {}: {e}", watch_dir.display())))?;

        tokio::spawn(async move {
            let mut last_hash = initial_hash;
            let mut last_event: Option<Instant> = None;
            let mut ticker = tokio::time::interval(Duration::from_millis(25));

            loop {
                tokio::select! {
                    Some(()) = event_rx.recv() => {
                        last_event = Some(Instant::now());
                    }
                    _ = ticker.tick() => {
                        if last_event.is_some_and(|t| t.elapsed() >= DEBOUNCE) {
                            last_event = None;
                            match Config::load(Some(&config_path)) {
                                Ok(new_config) => match config_hash(&new_config) {
                                    Ok(hash) if hash == last_hash => {
                                        tracing::debug!("config reload: content unchanged, skipping");
                                    }
                                    Ok(hash) => {
                                        match reload(&state, &new_config, &shared) {
                                            Ok(()) => {
                                                last_hash = hash;
                                                info!("config reload: swapped in new configuration");
                                            }
                                            Err(e) => warn!(error = %e, "config reload: validation/build failed, keeping current config"),
                                        }
                                    }
                                    Err(e) => warn!(error = %e, "config reload: failed to hash new config"),
                                },
                                Err(e) => warn!(error = %e, "config reload: failed to parse config file, keeping current config"),
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("config watcher shutting down");
                        break;
                    }
                }
            }
        });

        Ok(Self {
            _watcher: Mutex::new(watcher),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        let mut config = Config::default();
        config.service.name = "Acme".to_string();
        config.proxy.upstream = "http://app:8080".to_string();
        config.session.cookie_secret = "a".repeat(32);
        config.email_auth.enabled = true;
        config.email_auth.dispatch = Some(crate::email::dispatch::DispatchConfig::File(
            crate::email::dispatch::FileSinkConfig { path: "/tmp/chatbotgate-test-otp.jsonl".into() },
        ));
        config
    }

    fn shared() -> SharedResources {
        let kv: Arc<dyn crate::kv::KvStore> = crate::kv::memory::MemoryKv::new(Duration::from_secs(60));
        SharedResources {
            sessions_kv: Arc::clone(&kv),
            tokens_kv: Arc::clone(&kv),
            ratelimit_kv: Arc::clone(&kv),
            oauth_kv: kv,
            http: reqwest::Client::new(),
            inflight: Arc::new(tokio::sync::Semaphore::new(10_000)),
        }
    }

    #[test]
    fn identical_config_hashes_are_equal() {
        let config = base_config();
        assert_eq!(config_hash(&config).unwrap(), config_hash(&config).unwrap());
    }

    #[test]
    fn changed_service_name_changes_hash() {
        let a = base_config();
        let mut b = base_config();
        b.service.name = "Other".to_string();
        assert_ne!(config_hash(&a).unwrap(), config_hash(&b).unwrap());
    }

    #[test]
    fn build_app_state_rejects_invalid_config() {
        let mut config = base_config();
        config.session.cookie_secret = "short".to_string();
        let shared = shared();
        assert!(build_app_state(&config, &shared).is_err());
    }

    #[test]
    fn build_app_state_succeeds_for_valid_config() {
        let config = base_config();
        let shared = shared();
        assert!(build_app_state(&config, &shared).is_ok());
    }

    #[tokio::test]
    async fn reload_with_bad_config_leaves_state_untouched() {
        let config = base_config();
        let shared = shared();
        let inner = build_app_state(&config, &shared).unwrap();
        let original_prefix = inner.prefix.clone();
        let state = AppState::new(inner);

        let mut bad = base_config();
        bad.session.cookie_secret = "short".to_string();
        assert!(reload(&state, &bad, &shared).is_err());
        assert_eq!(state.current().prefix, original_prefix);
    }

    #[tokio::test]
    async fn reload_with_good_config_swaps_state() {
        let config = base_config();
        let shared = shared();
        let state = AppState::new(build_app_state(&config, &shared).unwrap());

        let mut updated = base_config();
        updated.proxy.auth_path_prefix = "/different-prefix".to_string();
        reload(&state, &updated, &shared).unwrap();
        assert_eq!(state.current().prefix, "/different-prefix");
    }
}

//! An authenticating reverse proxy: OAuth2/OIDC and passwordless email
//! magic-link sign-in in front of an upstream HTTP application.
//!
//! # Features
//!
//! - **OAuth2/OIDC providers**: any number of configured providers, each
//!   driving the standard authorization-code flow server-side.
//! - **Passwordless email auth**: single-use, rate-limited magic links.
//! - **Route classification**: exact/prefix/regex/glob rules decide which
//!   paths are open, denied, or require a session.
//! - **Hot config reload**: a filesystem watcher validates and atomically
//!   swaps in a new configuration without dropping in-flight requests.
//! - **Pluggable KV storage**: in-memory, on-disk, or Redis-backed session,
//!   token, and rate-limit state behind one trait.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod authz;
pub mod classifier;
pub mod cli;
pub mod config;
pub mod config_reload;
pub mod email;
pub mod error;
pub mod forwarding;
pub mod gateway;
pub mod kv;
pub mod oauth;
pub mod proxy;
pub mod ratelimit;
pub mod session;
pub mod token;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the global tracing subscriber. `level` is used only when
/// `RUST_LOG` is unset; `format` of `Some("json")` selects structured JSON
/// output, anything else the default human-readable formatter.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber.with(fmt::layer().json()).init();
        }
        _ => {
            subscriber.with(fmt::layer()).init();
        }
    }

    Ok(())
}

//! OAuth2/OIDC login: provider adapters and the registry that drives the
//! authorization-code redirect flow for the gateway's own `oauth2/start` and
//! `oauth2/callback` routes.

pub mod manager;
pub mod provider;

pub use manager::Manager;
pub use provider::{build_provider, Provider, ProviderConfig, UserInfo};

//! Configuration: YAML/JSON file (extension-dispatched) layered with
//! `CHATBOTGATE_`-prefixed environment variables via `figment`, mirroring
//! the existing `Config::load`/`expand_env_vars` pattern.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Env, Format, Json, Yaml};
use figment::Figment;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::authz::AuthorizationChecker;
use crate::classifier::{self, Action, Matcher, Rule, RouteClassifier};
use crate::email::dispatch::DispatchConfig;
use crate::forwarding::filters::FilterSpec;
use crate::forwarding::{Destination, FieldMapping};
use crate::gateway::cookies::{CookiePolicy, SameSite};
use crate::kv::Backend as KvBackend;
use crate::oauth::ProviderConfig;
use crate::{Error, Result};

/// Top-level configuration, loaded from `service`/`server`/`proxy`/`session`/
/// `oauth2`/`email_auth`/`authorization`/`kvs`/`forwarding`/`rules`/`assets`/
/// `logging`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before processing config. `~` expanded;
    /// missing files are silently skipped.
    pub env_files: Vec<String>,
    pub service: ServiceConfig,
    pub server: ServerConfig,
    pub proxy: ProxyConfig,
    pub session: SessionConfig,
    pub oauth2: Vec<ProviderConfig>,
    pub email_auth: EmailAuthConfig,
    /// Allow-list entries: full emails or `@domain` suffixes. Empty means
    /// "no whitelist" (anyone who authenticates is allowed).
    #[serde(alias = "access_control")]
    pub authorization: Vec<String>,
    pub kvs: KvsConfig,
    pub forwarding: Vec<ForwardingFieldConfig>,
    pub rules: Vec<RuleConfig>,
    pub assets: AssetsConfig,
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            env_files: Vec::new(),
            service: ServiceConfig::default(),
            server: ServerConfig::default(),
            proxy: ProxyConfig::default(),
            session: SessionConfig::default(),
            oauth2: Vec::new(),
            email_auth: EmailAuthConfig::default(),
            authorization: Vec::new(),
            kvs: KvsConfig::default(),
            forwarding: Vec::new(),
            rules: Vec::new(),
            assets: AssetsConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub name: String,
    pub logo_url: Option<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            logo_url: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
    pub max_body_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 4180,
            request_timeout: Duration::from_secs(15),
            shutdown_timeout: Duration::from_secs(30),
            max_body_size: 10 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub auth_path_prefix: String,
    pub upstream: String,
    pub upstream_by_host: HashMap<String, String>,
    pub shared_secret_header: Option<String>,
    pub development: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            auth_path_prefix: "/_auth".to_string(),
            upstream: String::new(),
            upstream_by_host: HashMap::new(),
            shared_secret_header: None,
            development: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CookieConfig {
    pub name: String,
    pub secure: bool,
    pub samesite: SameSite,
    #[serde(with = "humantime_serde")]
    pub expire: Duration,
}

impl Default for CookieConfig {
    fn default() -> Self {
        Self {
            name: crate::gateway::cookies::DEFAULT_SESSION_COOKIE_NAME.to_string(),
            secure: true,
            samesite: SameSite::Lax,
            expire: Duration::from_secs(168 * 3600),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Secret used to sign/bind email tokens (HMAC key). Must be >= 32 bytes.
    pub cookie_secret: String,
    pub cookie: CookieConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cookie_secret: String::new(),
            cookie: CookieConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub capacity: u32,
    #[serde(with = "humantime_serde")]
    pub period: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: crate::ratelimit::DEFAULT_CAPACITY,
            period: crate::ratelimit::DEFAULT_PERIOD,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmailAuthConfig {
    pub enabled: bool,
    pub dispatch: Option<DispatchConfig>,
    pub rate_limit: RateLimitConfig,
    #[serde(with = "humantime_serde")]
    pub token_ttl: Duration,
}

impl Default for EmailAuthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dispatch: None,
            rate_limit: RateLimitConfig::default(),
            token_ttl: crate::token::DEFAULT_TOKEN_TTL,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KvsConfig {
    #[serde(rename = "type")]
    pub backend: KvBackend,
    pub disk_path: Option<PathBuf>,
    pub redis_url: Option<String>,
}

impl Default for KvsConfig {
    fn default() -> Self {
        Self {
            backend: KvBackend::Memory,
            disk_path: None,
            redis_url: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardingFieldConfig {
    pub path: String,
    #[serde(default)]
    pub filters: Vec<String>,
    /// Required for the `encrypt` filter; base64-decoded if `key_base64` is
    /// set, else used as raw UTF-8 bytes.
    #[serde(default)]
    pub encrypt_key: Option<String>,
    #[serde(default)]
    pub encrypt_key_base64: bool,
    pub header: Option<String>,
    pub query: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub pattern: Option<String>,
    #[serde(default)]
    pub all: bool,
    pub action: Action,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AssetsConfig {
    pub dir: Option<PathBuf>,
}

impl Default for AssetsConfig {
    fn default() -> Self {
        Self { dir: None }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: None,
        }
    }
}

impl Config {
    /// Load configuration from a file (YAML or JSON, chosen by extension)
    /// and `CHATBOTGATE_`-prefixed environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be
    /// parsed, or if `${VAR}` substitution fails to produce valid YAML/JSON.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::ConfigInvalid(format!("config file not found: {}", p.display())));
            }
            let raw = std::fs::read_to_string(p)?;
            let expanded = expand_env_vars(&raw);
            figment = if p.extension().and_then(|e| e.to_str()) == Some("json") {
                figment.merge(Json::string(&expanded))
            } else {
                figment.merge(Yaml::string(&expanded))
            };
        }

        figment = figment.merge(Env::prefixed("CHATBOTGATE_").split("__"));

        let config: Self = figment.extract().map_err(|e| Error::ConfigInvalid(e.to_string()))?;
        config.load_env_files();
        config.validate()?;
        Ok(config)
    }

    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = if let Some(rest) = path_str.strip_prefix('~') {
                dirs::home_dir().map_or_else(|| path_str.clone(), |home| format!("{}{rest}", home.display()))
            } else {
                path_str.clone()
            };
            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => tracing::info!(path = %expanded, "loaded env file"),
                    Err(e) => tracing::warn!(path = %expanded, error = %e, "failed to load env file"),
                }
            } else {
                tracing::debug!(path = %expanded, "env file not found, skipped");
            }
        }
    }

    /// Validate cross-field invariants not expressible through `serde`
    /// defaults alone. On reload, a failure here must leave the prior
    /// config active — callers are responsible for that, this only reports.
    pub fn validate(&self) -> Result<()> {
        if self.service.name.trim().is_empty() {
            return Err(Error::ConfigInvalid("service.name is required".into()));
        }
        if self.session.cookie_secret.len() < 32 {
            return Err(Error::ConfigInvalid("session.cookie_secret must be at least 32 bytes".into()));
        }
        if self.proxy.upstream.trim().is_empty() {
            return Err(Error::ConfigInvalid("proxy.upstream is required".into()));
        }
        let oauth2_enabled = self.oauth2.iter().any(|p| !p.disabled);
        if !oauth2_enabled && !self.email_auth.enabled {
            return Err(Error::ConfigInvalid(
                "at least one enabled authentication method is required (oauth2 provider or email_auth)".into(),
            ));
        }
        if self.email_auth.enabled && self.email_auth.dispatch.is_none() {
            return Err(Error::ConfigInvalid("email_auth.enabled requires email_auth.dispatch".into()));
        }
        Ok(())
    }

    /// Build the [`AuthorizationChecker`] for `self.authorization`.
    #[must_use]
    pub fn authorization_checker(&self) -> AuthorizationChecker {
        AuthorizationChecker::new(self.authorization.clone())
    }

    /// Build the [`RouteClassifier`] from `self.rules`.
    pub fn route_classifier(&self) -> Result<RouteClassifier> {
        let mut rules = Vec::with_capacity(self.rules.len());
        for rule in &self.rules {
            let matcher = match rule.kind.as_str() {
                "exact" => Matcher::Exact(rule.pattern.clone().unwrap_or_default()),
                "prefix" => Matcher::Prefix(rule.pattern.clone().unwrap_or_default()),
                "regex" => {
                    let pattern = rule.pattern.clone().unwrap_or_default();
                    Matcher::Regex(regex::Regex::new(&pattern).map_err(|e| Error::ConfigInvalid(e.to_string()))?)
                }
                "minimatch" => {
                    let pattern = rule.pattern.clone().unwrap_or_default();
                    classifier::minimatch(&pattern).map_err(|e| Error::ConfigInvalid(e.to_string()))?
                }
                "all" => Matcher::All,
                other => return Err(Error::ConfigInvalid(format!("unknown rule type: {other}"))),
            };
            rules.push(Rule { matcher, action: rule.action });
        }
        Ok(RouteClassifier::new(rules))
    }

    /// Build the identity-forwarder field mappings from `self.forwarding`.
    pub fn forwarding_fields(&self) -> Result<Vec<FieldMapping>> {
        self.forwarding
            .iter()
            .map(|field| {
                let destination = match (&field.header, &field.query) {
                    (Some(header), _) => Destination::Header(header.clone()),
                    (None, Some(query)) => Destination::Query(query.clone()),
                    (None, None) => {
                        return Err(Error::ConfigInvalid(format!(
                            "forwarding field '{}' needs a header or query destination",
                            field.path
                        )))
                    }
                };
                let filters = field
                    .filters
                    .iter()
                    .map(|name| match name.as_str() {
                        "encrypt" => {
                            let raw = field.encrypt_key.clone().ok_or_else(|| {
                                Error::ConfigInvalid(format!("forwarding field '{}': encrypt filter needs encrypt_key", field.path))
                            })?;
                            let key = if field.encrypt_key_base64 {
                                use base64::Engine;
                                base64::engine::general_purpose::STANDARD
                                    .decode(raw)
                                    .map_err(|e| Error::ConfigInvalid(e.to_string()))?
                            } else {
                                raw.into_bytes()
                            };
                            Ok(FilterSpec::Encrypt { key })
                        }
                        "zip" => Ok(FilterSpec::Zip),
                        "base64" => Ok(FilterSpec::Base64),
                        other => Err(Error::ConfigInvalid(format!("unknown filter: {other}"))),
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(FieldMapping {
                    path: field.path.clone(),
                    filters,
                    destination,
                })
            })
            .collect()
    }

    /// Build the session cookie policy from `self.session.cookie`.
    #[must_use]
    pub fn cookie_policy(&self) -> CookiePolicy {
        CookiePolicy {
            name: self.session.cookie.name.clone(),
            secure: self.session.cookie.secure,
            same_site: self.session.cookie.samesite,
            expire: self.session.cookie.expire,
        }
    }

    /// Canonical JSON bytes for the watcher's change-detection hash.
    pub fn canonical_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Expand `${VAR}` and `${VAR:-default}` against the process environment,
/// as a pre-parse regex pass over raw file bytes.
fn expand_env_vars(raw: &str) -> String {
    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}").unwrap();
    re.replace_all(raw, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map_or("", |m| m.as_str());
        std::env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        let mut config = Config::default();
        config.service.name = "Acme".to_string();
        config.proxy.upstream = "http://app:8080".to_string();
        config.session.cookie_secret = "a".repeat(32);
        config.email_auth.enabled = true;
        config.email_auth.dispatch = Some(DispatchConfig::File(crate::email::dispatch::FileSinkConfig {
            path: "/tmp/otp.jsonl".into(),
        }));
        config
    }

    #[test]
    fn default_config_fails_validation_on_every_required_field() {
        assert!(Config::default().validate().is_err());
    }

    #[test]
    fn fully_populated_config_validates() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn short_cookie_secret_is_rejected() {
        let mut config = valid_config();
        config.session.cookie_secret = "short".to_string();
        assert!(matches!(config.validate(), Err(Error::ConfigInvalid(_))));
    }

    #[test]
    fn no_enabled_auth_method_is_rejected() {
        let mut config = valid_config();
        config.email_auth.enabled = false;
        assert!(matches!(config.validate(), Err(Error::ConfigInvalid(_))));
    }

    #[test]
    fn env_var_substitution_supports_default_fallback() {
        std::env::remove_var("CHATBOTGATE_TEST_VAR_ABSENT");
        let out = expand_env_vars("value: ${CHATBOTGATE_TEST_VAR_ABSENT:-fallback}");
        assert_eq!(out, "value: fallback");
    }

    #[test]
    fn env_var_substitution_prefers_actual_value() {
        std::env::set_var("CHATBOTGATE_TEST_VAR_PRESENT", "real");
        let out = expand_env_vars("value: ${CHATBOTGATE_TEST_VAR_PRESENT:-fallback}");
        assert_eq!(out, "value: real");
        std::env::remove_var("CHATBOTGATE_TEST_VAR_PRESENT");
    }

    #[test]
    fn route_classifier_builds_from_minimatch_rule() {
        let mut config = Config::default();
        config.rules.push(RuleConfig {
            kind: "minimatch".into(),
            pattern: Some("/assets/**".into()),
            all: false,
            action: Action::Allow,
        });
        let classifier = config.route_classifier().unwrap();
        assert_eq!(classifier.classify("/assets/app.js"), Action::Allow);
    }
}

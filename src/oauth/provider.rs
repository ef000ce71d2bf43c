//! OAuth2/OIDC provider adapters: Google, GitHub, Microsoft, and a generic
//! "custom" OIDC adapter.
//!
//! Grounded on `oauth::client::OAuthClient`'s PKCE/token-exchange plumbing
//! (reqwest form posts, `TokenResponse` deserialization) adapted from a
//! client-side, local-callback-server flow to a server-side flow: this
//! process is itself the OAuth2 client and redirects the end user's browser,
//! receiving the callback on its own HTTP route rather than a local listener.

use std::collections::HashMap;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Endpoints for one OAuth2/OIDC provider.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Endpoints {
    /// Authorization endpoint (browser redirect target).
    pub auth_url: String,
    /// Token endpoint (server-to-server code exchange).
    pub token_url: String,
    /// Userinfo endpoint.
    pub userinfo_url: String,
    /// JWKS endpoint, for providers that need ID-token verification.
    #[serde(default)]
    pub jwks_url: Option<String>,
}

/// Declarative provider configuration, as loaded from `oauth2.providers[]`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProviderConfig {
    /// Stable id used in `{prefix}/oauth2/start/{id}` and the login chooser.
    pub id: String,
    /// `google` | `github` | `microsoft` | `custom`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Human-readable name for the login chooser page.
    pub display_name: String,
    /// OAuth2 client id.
    pub client_id: String,
    /// OAuth2 client secret.
    pub client_secret: String,
    /// When true, the provider is loaded but never offered.
    #[serde(default)]
    pub disabled: bool,
    /// User-configured scopes. When non-empty, used **exactly** — adapter
    /// defaults are not merged in regardless of `reset_scopes`.
    #[serde(default)]
    pub scopes: Vec<String>,
    /// Inert; accepted for config compatibility only (see DESIGN.md).
    #[serde(default)]
    pub reset_scopes: bool,
    /// Provider endpoints. Built-in adapters (google/github/microsoft) fill
    /// these with well-known defaults when absent; `custom` requires them.
    #[serde(default)]
    pub endpoints: Option<Endpoints>,
    /// Skip TLS verification on outbound calls to this provider (testing only).
    #[serde(default)]
    pub insecure_skip_verify: bool,
}

/// Standardized user info, regardless of provider.
#[derive(Debug, Clone, Default)]
pub struct UserInfo {
    /// Verified email address.
    pub email: String,
    /// Best-effort display name.
    pub username: String,
    /// Avatar URL, when the provider exposes one.
    pub avatar_url: String,
    /// Raw extra fields the provider returned, namespaced under `_email`,
    /// `_username`, `_avatar_url` plus any provider-specific extras.
    pub extra: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    #[allow(dead_code)]
    token_type: Option<String>,
}

/// One concrete provider: config plus the auth-URL/exchange/userinfo triad.
#[async_trait]
pub trait Provider: Send + Sync {
    /// The provider id, matching `ProviderConfig::id`.
    fn name(&self) -> &str;

    /// The effective config (scopes already resolved per the discipline above).
    fn config(&self) -> &ProviderConfig;

    /// Scopes to request: `config().scopes` if non-empty, else the
    /// adapter's defaults.
    fn effective_scopes(&self) -> Vec<String> {
        let cfg = self.config();
        if cfg.scopes.is_empty() {
            self.default_scopes()
        } else {
            cfg.scopes.clone()
        }
    }

    /// This adapter's default scope set.
    fn default_scopes(&self) -> Vec<String>;

    /// The endpoints this adapter uses (built-ins fill in well-known values).
    fn endpoints(&self) -> Endpoints;

    /// Exchange an authorization `code` for an access token, using the same
    /// `redirect_url` that was sent to the authorization endpoint.
    async fn exchange_code(&self, http: &Client, code: &str, redirect_url: &str) -> Result<String> {
        let cfg = self.config();
        let endpoints = self.endpoints();
        let params = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_url),
            ("client_id", &cfg.client_id),
            ("client_secret", &cfg.client_secret),
        ];
        let response = http
            .post(&endpoints.token_url)
            .header("Accept", "application/json")
            .form(&params)
            .send()
            .await
            .map_err(|e| Error::OAuth2Exchange(e.to_string()))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::OAuth2Exchange(format!("{status}: {body}")));
        }
        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| Error::OAuth2Exchange(e.to_string()))?;
        Ok(token.access_token)
    }

    /// Fetch and standardize user info for `access_token`.
    async fn get_user_info(&self, http: &Client, access_token: &str) -> Result<UserInfo>;
}

/// Build the authorization URL for `provider`, with CSRF `state` and the
/// given `redirect_url`.
#[must_use]
pub fn build_auth_url(provider: &dyn Provider, state: &str, redirect_url: &str) -> String {
    let cfg = provider.config();
    let endpoints = provider.endpoints();
    let scopes = provider.effective_scopes().join(" ");
    let mut url = url::Url::parse(&endpoints.auth_url).expect("configured auth_url must be a valid URL");
    url.query_pairs_mut()
        .append_pair("response_type", "code")
        .append_pair("client_id", &cfg.client_id)
        .append_pair("redirect_uri", redirect_url)
        .append_pair("state", state)
        .append_pair("scope", &scopes);
    url.to_string()
}

// ---------------------------------------------------------------------------
// Google
// ---------------------------------------------------------------------------

/// Google OAuth2/OIDC adapter.
pub struct Google {
    config: ProviderConfig,
}

impl Google {
    /// Wrap `config`, filling in Google's well-known endpoints when absent.
    #[must_use]
    pub fn new(mut config: ProviderConfig) -> Self {
        config.endpoints.get_or_insert_with(|| Endpoints {
            auth_url: "https://accounts.google.com/o/oauth2/v2/auth".into(),
            token_url: "https://oauth2.googleapis.com/token".into(),
            userinfo_url: "https://www.googleapis.com/oauth2/v3/userinfo".into(),
            jwks_url: Some("https://www.googleapis.com/oauth2/v3/certs".into()),
        });
        Self { config }
    }
}

#[async_trait]
impl Provider for Google {
    fn name(&self) -> &str {
        &self.config.id
    }

    fn config(&self) -> &ProviderConfig {
        &self.config
    }

    fn default_scopes(&self) -> Vec<String> {
        vec!["openid".into(), "userinfo.email".into(), "userinfo.profile".into()]
    }

    fn endpoints(&self) -> Endpoints {
        self.config.endpoints.clone().expect("filled at construction")
    }

    async fn get_user_info(&self, http: &Client, access_token: &str) -> Result<UserInfo> {
        let endpoints = self.endpoints();
        let body: serde_json::Value = http
            .get(&endpoints.userinfo_url)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| Error::OAuth2Userinfo(e.to_string()))?
            .json()
            .await
            .map_err(|e| Error::OAuth2Userinfo(e.to_string()))?;

        let email = body
            .get("email")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::OAuth2Userinfo("google userinfo missing email".into()))?
            .to_string();
        let name = body.get("name").and_then(|v| v.as_str()).unwrap_or(&email).to_string();
        let avatar = body.get("picture").and_then(|v| v.as_str()).unwrap_or_default().to_string();

        let mut extra = as_map(&body);
        extra.insert("_email".into(), serde_json::Value::String(email.clone()));
        extra.insert("_username".into(), serde_json::Value::String(name.clone()));
        extra.insert("_avatar_url".into(), serde_json::Value::String(avatar.clone()));

        Ok(UserInfo {
            email,
            username: name,
            avatar_url: avatar,
            extra,
        })
    }
}

// ---------------------------------------------------------------------------
// GitHub
// ---------------------------------------------------------------------------

/// GitHub OAuth2 adapter.
pub struct GitHub {
    config: ProviderConfig,
}

impl GitHub {
    /// Wrap `config`, filling in GitHub's well-known endpoints when absent.
    #[must_use]
    pub fn new(mut config: ProviderConfig) -> Self {
        config.endpoints.get_or_insert_with(|| Endpoints {
            auth_url: "https://github.com/login/oauth/authorize".into(),
            token_url: "https://github.com/login/oauth/access_token".into(),
            userinfo_url: "https://api.github.com/user".into(),
            jwks_url: None,
        });
        Self { config }
    }
}

#[async_trait]
impl Provider for GitHub {
    fn name(&self) -> &str {
        &self.config.id
    }

    fn config(&self) -> &ProviderConfig {
        &self.config
    }

    fn default_scopes(&self) -> Vec<String> {
        vec!["user:email".into(), "read:user".into()]
    }

    fn endpoints(&self) -> Endpoints {
        self.config.endpoints.clone().expect("filled at construction")
    }

    async fn get_user_info(&self, http: &Client, access_token: &str) -> Result<UserInfo> {
        let endpoints = self.endpoints();
        let user: serde_json::Value = http
            .get(&endpoints.userinfo_url)
            .bearer_auth(access_token)
            .header("User-Agent", "chatbotgate")
            .send()
            .await
            .map_err(|e| Error::OAuth2Userinfo(e.to_string()))?
            .json()
            .await
            .map_err(|e| Error::OAuth2Userinfo(e.to_string()))?;

        let emails: Vec<serde_json::Value> = http
            .get("https://api.github.com/user/emails")
            .bearer_auth(access_token)
            .header("User-Agent", "chatbotgate")
            .send()
            .await
            .map_err(|e| Error::OAuth2Userinfo(e.to_string()))?
            .json()
            .await
            .unwrap_or_default();

        let email = emails
            .iter()
            .find(|e| e["primary"] == true && e["verified"] == true)
            .or_else(|| emails.iter().find(|e| e["verified"] == true))
            .and_then(|e| e["email"].as_str())
            .ok_or_else(|| Error::OAuth2Userinfo("github: no verified email available".into()))?
            .to_string();

        let username = user
            .get("name")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .or_else(|| user.get("login").and_then(|v| v.as_str()))
            .unwrap_or(&email)
            .to_string();
        let avatar = user
            .get("avatar_url")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        let mut extra = as_map(&user);
        extra.insert("_email".into(), serde_json::Value::String(email.clone()));
        extra.insert("_username".into(), serde_json::Value::String(username.clone()));
        extra.insert("_avatar_url".into(), serde_json::Value::String(avatar.clone()));

        Ok(UserInfo {
            email,
            username,
            avatar_url: avatar,
            extra,
        })
    }
}

// ---------------------------------------------------------------------------
// Microsoft
// ---------------------------------------------------------------------------

/// Microsoft (Entra ID / Azure AD) OAuth2/OIDC adapter.
pub struct Microsoft {
    config: ProviderConfig,
}

impl Microsoft {
    /// Wrap `config`, filling in Microsoft's multi-tenant `common` endpoints
    /// when absent.
    #[must_use]
    pub fn new(mut config: ProviderConfig) -> Self {
        config.endpoints.get_or_insert_with(|| Endpoints {
            auth_url: "https://login.microsoftonline.com/common/oauth2/v2.0/authorize".into(),
            token_url: "https://login.microsoftonline.com/common/oauth2/v2.0/token".into(),
            userinfo_url: "https://graph.microsoft.com/v1.0/me".into(),
            jwks_url: Some("https://login.microsoftonline.com/common/discovery/v2.0/keys".into()),
        });
        Self { config }
    }
}

#[async_trait]
impl Provider for Microsoft {
    fn name(&self) -> &str {
        &self.config.id
    }

    fn config(&self) -> &ProviderConfig {
        &self.config
    }

    fn default_scopes(&self) -> Vec<String> {
        vec!["openid".into(), "profile".into(), "email".into(), "User.Read".into()]
    }

    fn endpoints(&self) -> Endpoints {
        self.config.endpoints.clone().expect("filled at construction")
    }

    async fn get_user_info(&self, http: &Client, access_token: &str) -> Result<UserInfo> {
        let endpoints = self.endpoints();
        let body: serde_json::Value = http
            .get(&endpoints.userinfo_url)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| Error::OAuth2Userinfo(e.to_string()))?
            .json()
            .await
            .map_err(|e| Error::OAuth2Userinfo(e.to_string()))?;

        let email = body
            .get("mail")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .or_else(|| body.get("userPrincipalName").and_then(|v| v.as_str()))
            .or_else(|| body.get("preferredUsername").and_then(|v| v.as_str()))
            .ok_or_else(|| Error::OAuth2Userinfo("microsoft: no email-like field available".into()))?
            .to_string();
        let username = body
            .get("displayName")
            .and_then(|v| v.as_str())
            .unwrap_or(&email)
            .to_string();

        let mut extra = as_map(&body);
        extra.insert("_email".into(), serde_json::Value::String(email.clone()));
        extra.insert("_username".into(), serde_json::Value::String(username.clone()));
        extra.insert("_avatar_url".into(), serde_json::Value::String(String::new()));

        Ok(UserInfo {
            email,
            username,
            avatar_url: String::new(),
            extra,
        })
    }
}

// ---------------------------------------------------------------------------
// Custom (generic OIDC)
// ---------------------------------------------------------------------------

/// Generic OIDC adapter for any spec-compliant provider not covered above.
pub struct Custom {
    config: ProviderConfig,
}

impl Custom {
    /// `config.endpoints` must be fully specified — there is no well-known
    /// default to fall back to for an arbitrary OIDC provider.
    #[must_use]
    pub fn new(config: ProviderConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Provider for Custom {
    fn name(&self) -> &str {
        &self.config.id
    }

    fn config(&self) -> &ProviderConfig {
        &self.config
    }

    fn default_scopes(&self) -> Vec<String> {
        vec!["openid".into(), "email".into(), "profile".into()]
    }

    fn endpoints(&self) -> Endpoints {
        self.config
            .endpoints
            .clone()
            .expect("custom provider requires explicit endpoints")
    }

    async fn get_user_info(&self, http: &Client, access_token: &str) -> Result<UserInfo> {
        let endpoints = self.endpoints();
        let body: serde_json::Value = http
            .get(&endpoints.userinfo_url)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| Error::OAuth2Userinfo(e.to_string()))?
            .json()
            .await
            .map_err(|e| Error::OAuth2Userinfo(e.to_string()))?;

        let email = body
            .get("email")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::OAuth2Userinfo("custom provider: userinfo missing email".into()))?
            .to_string();
        let username = body
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or(&email)
            .to_string();
        let avatar = body.get("picture").and_then(|v| v.as_str()).unwrap_or_default().to_string();

        let mut extra = as_map(&body);
        extra.insert("_email".into(), serde_json::Value::String(email.clone()));
        extra.insert("_username".into(), serde_json::Value::String(username.clone()));
        extra.insert("_avatar_url".into(), serde_json::Value::String(avatar.clone()));

        Ok(UserInfo {
            email,
            username,
            avatar_url: avatar,
            extra,
        })
    }
}

fn as_map(value: &serde_json::Value) -> HashMap<String, serde_json::Value> {
    value
        .as_object()
        .map(|m| m.clone().into_iter().collect())
        .unwrap_or_default()
}

/// Construct the adapter matching `config.kind`.
pub fn build_provider(config: ProviderConfig) -> Result<Box<dyn Provider>> {
    match config.kind.as_str() {
        "google" => Ok(Box::new(Google::new(config))),
        "github" => Ok(Box::new(GitHub::new(config))),
        "microsoft" => Ok(Box::new(Microsoft::new(config))),
        "custom" => {
            if config.endpoints.is_none() {
                return Err(Error::ConfigInvalid(format!(
                    "provider '{}': type = custom requires explicit endpoints",
                    config.id
                )));
            }
            Ok(Box::new(Custom::new(config)))
        }
        other => Err(Error::ConfigInvalid(format!("unknown oauth2 provider type: {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(kind: &str, scopes: Vec<&str>) -> ProviderConfig {
        ProviderConfig {
            id: "p".into(),
            kind: kind.into(),
            display_name: "P".into(),
            client_id: "id".into(),
            client_secret: "secret".into(),
            disabled: false,
            scopes: scopes.into_iter().map(String::from).collect(),
            reset_scopes: false,
            endpoints: None,
            insecure_skip_verify: false,
        }
    }

    #[test]
    fn empty_scopes_uses_adapter_defaults() {
        let google = Google::new(cfg("google", vec![]));
        assert_eq!(
            google.effective_scopes(),
            vec!["openid", "userinfo.email", "userinfo.profile"]
        );
    }

    #[test]
    fn configured_scopes_replace_defaults_entirely() {
        let google = Google::new(cfg("google", vec!["openid"]));
        assert_eq!(google.effective_scopes(), vec!["openid"]);
    }

    #[test]
    fn reset_scopes_flag_has_no_effect() {
        let mut c = cfg("google", vec!["openid"]);
        c.reset_scopes = true;
        let google = Google::new(c);
        assert_eq!(google.effective_scopes(), vec!["openid"]);
    }

    #[test]
    fn github_defaults_match_spec() {
        let gh = GitHub::new(cfg("github", vec![]));
        assert_eq!(gh.default_scopes(), vec!["user:email", "read:user"]);
    }

    #[test]
    fn microsoft_defaults_match_spec() {
        let ms = Microsoft::new(cfg("microsoft", vec![]));
        assert_eq!(ms.default_scopes(), vec!["openid", "profile", "email", "User.Read"]);
    }

    #[test]
    fn custom_defaults_match_spec() {
        let mut c = cfg("custom", vec![]);
        c.endpoints = Some(Endpoints {
            auth_url: "https://example.com/auth".into(),
            token_url: "https://example.com/token".into(),
            userinfo_url: "https://example.com/userinfo".into(),
            jwks_url: None,
        });
        let custom = Custom::new(c);
        assert_eq!(custom.default_scopes(), vec!["openid", "email", "profile"]);
    }

    #[test]
    fn build_auth_url_includes_state_and_redirect() {
        let google = Google::new(cfg("google", vec![]));
        let url = build_auth_url(&google, "state123", "https://gw.example.com/_auth/oauth2/callback");
        assert!(url.contains("state=state123"));
        assert!(url.contains("redirect_uri=https%3A%2F%2Fgw.example.com"));
        assert!(url.contains("client_id=id"));
    }

    #[test]
    fn custom_provider_requires_endpoints() {
        let c = cfg("custom", vec![]);
        assert!(build_provider(c).is_err());
    }

    #[test]
    fn unknown_provider_kind_is_config_invalid() {
        let c = cfg("bogus", vec![]);
        assert!(matches!(build_provider(c), Err(Error::ConfigInvalid(_))));
    }
}

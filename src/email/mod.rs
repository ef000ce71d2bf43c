//! Passwordless email login: the `SendLoginLink`/`VerifyToken` pipeline.
//!
//! Grounded on the ordering of checks in `gateway::auth`'s request gate
//! (authorize, then rate-limit, then act), adapted here to a single
//! identity-by-email flow instead of per-tool MCP authorization.

pub mod dispatch;
pub mod template;

use std::sync::Arc;

use crate::authz::AuthorizationChecker;
use crate::ratelimit::RateLimiter;
use crate::token::TokenStore;
use crate::{Error, Result};

use dispatch::{DispatchConfig, OtpRecord};

/// Everything needed to send and verify magic links.
pub struct EmailAuthHandler {
    authz: AuthorizationChecker,
    rate_limiter: RateLimiter,
    tokens: Arc<TokenStore>,
    dispatch_config: DispatchConfig,
    service_name: String,
    logo_url: Option<String>,
    ttl_minutes: u64,
}

impl EmailAuthHandler {
    /// Assemble a handler from its already-constructed collaborators.
    #[must_use]
    pub fn new(
        authz: AuthorizationChecker,
        rate_limiter: RateLimiter,
        tokens: Arc<TokenStore>,
        dispatch_config: DispatchConfig,
        service_name: String,
        logo_url: Option<String>,
        ttl_minutes: u64,
    ) -> Self {
        Self {
            authz,
            rate_limiter,
            tokens,
            dispatch_config,
            service_name,
            logo_url,
            ttl_minutes,
        }
    }

    /// Run the full send pipeline: authorize, rate-limit, issue, render,
    /// dispatch. `login_url_for` builds the link the user clicks, given the
    /// issued token.
    pub async fn send_login_link(
        &self,
        email: &str,
        lang: &str,
        login_url_for: impl FnOnce(&str) -> String,
    ) -> Result<()> {
        if !self.authz.is_allowed(email) {
            return Err(Error::EmailNotAuthorized(email.to_string()));
        }
        self.rate_limiter.allow(email).await?;

        let token = self.tokens.issue(email).await?;
        let login_url = login_url_for(&token);
        let rendered = template::render(
            lang,
            &self.service_name,
            self.logo_url.as_deref(),
            &login_url,
            self.ttl_minutes,
        );
        let expires_at = chrono::Utc::now().timestamp() + (self.ttl_minutes as i64) * 60;
        let otp = OtpRecord {
            token: &token,
            expires_at,
            login_url: &login_url,
        };

        if let Err(e) = dispatch::dispatch(&self.dispatch_config, email, &otp, &rendered).await {
            // Dispatch failed: let the user request a fresh link rather than
            // holding one they never received.
            let _ = self.tokens.revoke(&token).await;
            return Err(e);
        }
        Ok(())
    }

    /// Verify and consume a magic-link token, returning the bound email.
    pub async fn verify_login_link(&self, token: &str) -> Result<String> {
        self.tokens.verify(token).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::memory::MemoryKv;
    use dispatch::FileSinkConfig;
    use std::time::Duration;

    fn handler(dir: &tempfile::TempDir) -> EmailAuthHandler {
        let kv = MemoryKv::new(Duration::from_secs(60));
        let authz = AuthorizationChecker::new(vec!["@allowed.com".to_string()]);
        let rate_limiter = RateLimiter::new(kv.clone(), 3, Duration::from_secs(60));
        let tokens = Arc::new(TokenStore::new(kv, b"secret-key-value".to_vec(), Duration::from_secs(900)));
        let dispatch_config = DispatchConfig::File(FileSinkConfig {
            path: dir.path().join("otp.jsonl"),
        });
        EmailAuthHandler::new(authz, rate_limiter, tokens, dispatch_config, "Acme".into(), None, 15)
    }

    #[tokio::test]
    async fn disallowed_email_is_rejected_before_any_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        let handler = handler(&dir);
        let result = handler
            .send_login_link("nope@evil.com", "en", |t| format!("https://gw/_auth/verify?t={t}"))
            .await;
        assert!(matches!(result, Err(Error::EmailNotAuthorized(_))));
        assert!(!dir.path().join("otp.jsonl").exists());
    }

    #[tokio::test]
    async fn allowed_email_dispatches_and_verifies() {
        let dir = tempfile::tempdir().unwrap();
        let handler = handler(&dir);
        let mut captured = None;
        handler
            .send_login_link("user@allowed.com", "en", |t| {
                captured = Some(t.to_string());
                format!("https://gw/_auth/verify?t={t}")
            })
            .await
            .unwrap();

        let token = captured.unwrap();
        let email = handler.verify_login_link(&token).await.unwrap();
        assert_eq!(email, "user@allowed.com");
    }

    #[tokio::test]
    async fn rate_limit_kicks_in_after_three_sends() {
        let dir = tempfile::tempdir().unwrap();
        let handler = handler(&dir);
        for _ in 0..3 {
            handler
                .send_login_link("user@allowed.com", "en", |t| format!("https://gw/_auth/verify?t={t}"))
                .await
                .unwrap();
        }
        let result = handler
            .send_login_link("user@allowed.com", "en", |t| format!("https://gw/_auth/verify?t={t}"))
            .await;
        assert!(matches!(result, Err(Error::RateLimitExceeded)));
    }
}

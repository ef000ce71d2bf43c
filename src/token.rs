//! Email magic-link tokens: single-use, time-bound, HMAC-bound to an email.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::kv::KvStore;
use crate::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

/// Default validity window for a freshly-issued magic link.
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(15 * 60);

/// 128+ bits of randomness, URL-safe base64 encoded without padding.
fn generate_token() -> String {
    let mut bytes = [0u8; 18]; // 144 bits
    rand::rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

fn sign(secret: &[u8], token: &str, email: &str) -> Result<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|e| Error::Internal(format!("hmac key error: {e}")))?;
    mac.update(token.as_bytes());
    mac.update(b"|");
    mac.update(email.as_bytes());
    Ok(mac.finalize().into_bytes().to_vec())
}

#[derive(serde::Serialize, serde::Deserialize)]
struct Record {
    email: String,
    signature: Vec<u8>,
}

/// Issues and verifies single-use email login tokens, persisted in a
/// dedicated KV namespace.
pub struct TokenStore {
    kv: Arc<dyn KvStore>,
    secret: Vec<u8>,
    ttl: Duration,
}

impl TokenStore {
    /// `secret` is the HMAC binding key — typically the session cookie
    /// secret or a dedicated `email_auth.token_secret`.
    #[must_use]
    pub fn new(kv: Arc<dyn KvStore>, secret: Vec<u8>, ttl: Duration) -> Self {
        Self { kv, secret, ttl }
    }

    /// Generate a token bound to `email` and persist it with `self.ttl`.
    /// Returns the token to embed in the magic link.
    pub async fn issue(&self, email: &str) -> Result<String> {
        let token = generate_token();
        let signature = sign(&self.secret, &token, email)?;
        let record = Record {
            email: email.to_string(),
            signature,
        };
        let bytes = serde_json::to_vec(&record)?;
        self.kv.set(&token, bytes.into(), Some(self.ttl)).await?;
        Ok(token)
    }

    /// Remove a token without verifying it — used when dispatch fails so the
    /// user may retry.
    pub async fn revoke(&self, token: &str) -> Result<()> {
        self.kv.delete(token).await
    }

    /// Verify and atomically consume `token`, returning the bound email.
    /// Any failure (missing, expired, signature mismatch) is collapsed to
    /// [`Error::InvalidOrExpiredToken`].
    pub async fn verify(&self, token: &str) -> Result<String> {
        let raw = self
            .kv
            .get(token)
            .await
            .map_err(|_| Error::InvalidOrExpiredToken)?;
        let record: Record =
            serde_json::from_slice(&raw).map_err(|_| Error::InvalidOrExpiredToken)?;
        let expected = sign(&self.secret, token, &record.email)?;
        if expected.ct_eq(&record.signature).unwrap_u8() != 1 {
            return Err(Error::InvalidOrExpiredToken);
        }
        // Single-use: delete before returning success.
        self.kv
            .delete(token)
            .await
            .map_err(|_| Error::InvalidOrExpiredToken)?;
        Ok(record.email)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::memory::MemoryKv;

    fn store() -> TokenStore {
        let kv = MemoryKv::new(Duration::from_secs(60));
        TokenStore::new(kv, b"a very long secret used for hmac".to_vec(), DEFAULT_TOKEN_TTL)
    }

    #[tokio::test]
    async fn issue_then_verify_returns_bound_email() {
        let store = store();
        let token = store.issue("u@x.com").await.unwrap();
        let email = store.verify(&token).await.unwrap();
        assert_eq!(email, "u@x.com");
    }

    #[tokio::test]
    async fn verification_is_single_use() {
        let store = store();
        let token = store.issue("u@x.com").await.unwrap();
        store.verify(&token).await.unwrap();
        assert!(matches!(
            store.verify(&token).await,
            Err(Error::InvalidOrExpiredToken)
        ));
    }

    #[tokio::test]
    async fn unknown_token_is_invalid() {
        let store = store();
        assert!(matches!(
            store.verify("not-a-real-token").await,
            Err(Error::InvalidOrExpiredToken)
        ));
    }

    #[tokio::test]
    async fn revoke_lets_user_retry() {
        let store = store();
        let token = store.issue("u@x.com").await.unwrap();
        store.revoke(&token).await.unwrap();
        assert!(matches!(
            store.verify(&token).await,
            Err(Error::InvalidOrExpiredToken)
        ));
    }

    #[tokio::test]
    async fn tokens_are_unique() {
        let store = store();
        let a = store.issue("u@x.com").await.unwrap();
        let b = store.issue("u@x.com").await.unwrap();
        assert_ne!(a, b);
    }
}

//! Session record and store.
//!
//! Sessions are JSON-encoded at key = session id, TTL = `expires_at - now`.
//! `SessionStore::get` collapses both a KV miss and a stored-but-invalid
//! record to [`Error::SessionNotFound`], scheduling deletion of the latter.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::kv::KvStore;
use crate::{Error, Result};

/// A signed-in user, as captured from an OAuth2 userinfo response or an
/// email-verification event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Opaque random 256-bit id, URL-safe encoded.
    pub id: String,
    /// Verified email address.
    pub email: String,
    /// Display name, when the provider supplied one.
    pub username: String,
    /// `google` | `github` | `microsoft` | `<custom provider id>` | `email`.
    pub provider: String,
    /// Free-form data captured from userinfo, e.g. `secrets.access_token`.
    pub extra: HashMap<String, serde_json::Value>,
    /// Unix timestamp of session creation.
    pub created_at: i64,
    /// Unix timestamp after which the session is no longer valid.
    pub expires_at: i64,
    /// Always `true` once stored; kept explicit to mirror the external spec's
    /// field rather than conflating "exists" with "authenticated".
    pub authenticated: bool,
}

impl Session {
    /// Construct a new session valid for `ttl` from now.
    #[must_use]
    pub fn new(email: impl Into<String>, username: impl Into<String>, provider: impl Into<String>, ttl: Duration) -> Self {
        let now = now_unix();
        Self {
            id: generate_id(),
            email: email.into(),
            username: username.into(),
            provider: provider.into(),
            extra: HashMap::new(),
            created_at: now,
            expires_at: now + ttl.as_secs() as i64,
            authenticated: true,
        }
    }

    /// A session is valid iff `authenticated && now < expires_at`.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.authenticated && now_unix() < self.expires_at
    }
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// 256 bits of randomness, URL-safe base64 encoded without padding.
fn generate_id() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Persists [`Session`] records in a dedicated KV namespace.
pub struct SessionStore {
    kv: Arc<dyn KvStore>,
}

impl SessionStore {
    /// Wrap a `sessions`-namespaced KV handle.
    #[must_use]
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// Persist `session`. Refuses an already-expired input.
    pub async fn put(&self, session: &Session) -> Result<()> {
        let remaining = session.expires_at - now_unix();
        if remaining <= 0 {
            return Err(Error::ConfigInvalid(
                "refusing to store an already-expired session".into(),
            ));
        }
        let bytes = serde_json::to_vec(session)?;
        self.kv
            .set(&session.id, bytes.into(), Some(Duration::from_secs(remaining as u64)))
            .await
    }

    /// Look up a session by id. A KV miss or a stored-but-invalid record both
    /// surface as [`Error::SessionNotFound`]; the latter is deleted.
    pub async fn get(&self, id: &str) -> Result<Session> {
        let raw = match self.kv.get(id).await {
            Ok(raw) => raw,
            Err(Error::KvNotFound) => return Err(Error::SessionNotFound),
            Err(e) => return Err(e),
        };
        let session: Session = serde_json::from_slice(&raw).map_err(|_| Error::SessionNotFound)?;
        if session.is_valid() {
            Ok(session)
        } else {
            let _ = self.kv.delete(id).await;
            Err(Error::SessionNotFound)
        }
    }

    /// Delete a session (logout).
    pub async fn delete(&self, id: &str) -> Result<()> {
        self.kv.delete(id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::memory::MemoryKv;

    #[test]
    fn session_is_valid_iff_authenticated_and_unexpired() {
        let mut s = Session::new("a@x.com", "a", "email", Duration::from_secs(60));
        assert!(s.is_valid());
        s.authenticated = false;
        assert!(!s.is_valid());
        s.authenticated = true;
        s.expires_at = now_unix() - 1;
        assert!(!s.is_valid());
    }

    #[tokio::test]
    async fn put_then_get_roundtrips() {
        let kv = MemoryKv::new(Duration::from_secs(60));
        let store = SessionStore::new(kv);
        let session = Session::new("a@x.com", "alice", "google", Duration::from_secs(120));
        store.put(&session).await.unwrap();
        let fetched = store.get(&session.id).await.unwrap();
        assert_eq!(fetched.email, "a@x.com");
    }

    #[tokio::test]
    async fn get_of_unknown_id_is_session_not_found() {
        let kv = MemoryKv::new(Duration::from_secs(60));
        let store = SessionStore::new(kv);
        assert!(matches!(store.get("nope").await, Err(Error::SessionNotFound)));
    }

    #[tokio::test]
    async fn put_refuses_already_expired_session() {
        let kv = MemoryKv::new(Duration::from_secs(60));
        let store = SessionStore::new(kv);
        let mut session = Session::new("a@x.com", "alice", "google", Duration::from_secs(120));
        session.expires_at = now_unix() - 5;
        assert!(store.put(&session).await.is_err());
    }

    #[tokio::test]
    async fn logout_removes_session_from_kv() {
        let kv = MemoryKv::new(Duration::from_secs(60));
        let store = SessionStore::new(kv);
        let session = Session::new("a@x.com", "alice", "google", Duration::from_secs(120));
        store.put(&session).await.unwrap();
        store.delete(&session.id).await.unwrap();
        assert!(matches!(store.get(&session.id).await, Err(Error::SessionNotFound)));
    }

    #[tokio::test]
    async fn ids_are_unique_and_url_safe() {
        let a = generate_id();
        let b = generate_id();
        assert_ne!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }
}

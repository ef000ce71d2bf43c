//! Error types for the proxy.

use std::io;

use thiserror::Error;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type. Each component returns one of these variants;
/// the middleware is the only layer that translates them into HTTP responses.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration failed validation, at startup or on reload.
    #[error("configuration error: {0}")]
    ConfigInvalid(String),

    /// Requested key is absent or expired in a KV store.
    #[error("key not found")]
    KvNotFound,

    /// The KV store (or a namespaced view of it) has been closed.
    #[error("kv store closed")]
    KvClosed,

    /// Backend-level KV failure (I/O, network, codec).
    #[error("kv backend error: {0}")]
    KvBackend(String),

    /// No valid session for the request; treated as "unauthenticated".
    #[error("session not found")]
    SessionNotFound,

    /// A single-use token (email magic link or OAuth2 state) was invalid,
    /// already consumed, or expired.
    #[error("invalid or expired token")]
    InvalidOrExpiredToken,

    /// The authenticated email is not on the configured allow-list.
    #[error("email not authorized: {0}")]
    EmailNotAuthorized(String),

    /// Per-identity rate limit exceeded.
    #[error("rate limit exceeded")]
    RateLimitExceeded,

    /// Dispatching the login-link email failed.
    #[error("failed to send email: {0}")]
    EmailSendFailed(String),

    /// OAuth2 code-for-token exchange failed.
    #[error("oauth2 token exchange failed: {0}")]
    OAuth2Exchange(String),

    /// OAuth2 userinfo fetch failed.
    #[error("oauth2 userinfo fetch failed: {0}")]
    OAuth2Userinfo(String),

    /// OAuth2 `state` parameter missing, unknown, or mismatched.
    #[error("oauth2 state invalid")]
    OAuth2StateInvalid,

    /// Unknown OAuth2 provider id.
    #[error("unknown oauth2 provider: {0}")]
    OAuth2UnknownProvider(String),

    /// The reverse proxy could not reach the upstream.
    #[error("upstream unreachable: {0}")]
    UpstreamUnreachable(String),

    /// A non-GET/HEAD request hit a health endpoint.
    #[error("method not allowed")]
    MethodNotAllowed,

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// JSON (de)serialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML (de)serialization error.
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Outbound HTTP request error (OAuth2 provider, mail API).
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Anything else, wrapped with context.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Maps an error to the HTTP status code the middleware should use,
    /// for errors that are surfaced directly rather than rendered as a page.
    #[must_use]
    pub fn status_code(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Self::SessionNotFound => StatusCode::UNAUTHORIZED,
            Self::EmailNotAuthorized(_) => StatusCode::FORBIDDEN,
            Self::RateLimitExceeded => StatusCode::TOO_MANY_REQUESTS,
            Self::InvalidOrExpiredToken
            | Self::OAuth2StateInvalid
            | Self::OAuth2UnknownProvider(_) => StatusCode::BAD_REQUEST,
            Self::OAuth2Exchange(_) | Self::OAuth2Userinfo(_) | Self::EmailSendFailed(_) => {
                StatusCode::BAD_GATEWAY
            }
            Self::UpstreamUnreachable(_) => StatusCode::BAD_GATEWAY,
            Self::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            Self::ConfigInvalid(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::KvNotFound => StatusCode::NOT_FOUND,
            Self::KvClosed | Self::KvBackend(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::Io(_) | Self::Json(_) | Self::Yaml(_) | Self::Http(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

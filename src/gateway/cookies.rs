//! Cookie construction and the post-auth redirect-URL validation rule
//! shared by the session cookie and the `_oauth2_redirect` cookie.

use axum::http::header::{HeaderValue, SET_COOKIE};
use chrono::{Duration as ChronoDuration, Utc};

/// Default session cookie name.
pub const DEFAULT_SESSION_COOKIE_NAME: &str = "_oauth2_proxy";
/// Name of the short-lived pre-auth redirect cookie.
pub const REDIRECT_COOKIE_NAME: &str = "_oauth2_redirect";

/// `SameSite` attribute values accepted in config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SameSite {
    Lax,
    Strict,
    None,
}

impl SameSite {
    fn as_str(self) -> &'static str {
        match self {
            SameSite::Lax => "Lax",
            SameSite::Strict => "Strict",
            SameSite::None => "None",
        }
    }
}

/// Cookie-attribute policy read from `session.cookie`.
#[derive(Debug, Clone)]
pub struct CookiePolicy {
    pub name: String,
    pub secure: bool,
    pub same_site: SameSite,
    pub expire: std::time::Duration,
}

impl Default for CookiePolicy {
    fn default() -> Self {
        Self {
            name: DEFAULT_SESSION_COOKIE_NAME.to_string(),
            secure: true,
            same_site: SameSite::Lax,
            expire: std::time::Duration::from_secs(168 * 3600),
        }
    }
}

fn format_cookie(name: &str, value: &str, policy_secure: bool, same_site: &str, max_age_secs: Option<i64>) -> String {
    let mut cookie = format!("{name}={value}; Path=/; HttpOnly; SameSite={same_site}");
    if policy_secure {
        cookie.push_str("; Secure");
    }
    if let Some(max_age) = max_age_secs {
        cookie.push_str(&format!("; Max-Age={max_age}"));
        let expires_at = Utc::now() + ChronoDuration::seconds(max_age.max(0));
        cookie.push_str(&format!("; Expires={}", expires_at.to_rfc2822()));
    }
    cookie
}

/// Build the `Set-Cookie` header value for a freshly created session.
/// `Expires`/`Max-Age` are fixed at creation time per `policy.expire` and
/// are never recomputed on subsequent requests.
#[must_use]
pub fn session_cookie(policy: &CookiePolicy, session_id: &str) -> HeaderValue {
    let value = format_cookie(
        &policy.name,
        session_id,
        policy.secure,
        policy.same_site.as_str(),
        Some(policy.expire.as_secs() as i64),
    );
    HeaderValue::from_str(&value).unwrap_or_else(|_| HeaderValue::from_static(""))
}

/// Build the `Set-Cookie` header value that clears the session cookie
/// (negative `Max-Age`).
#[must_use]
pub fn clear_session_cookie(policy: &CookiePolicy) -> HeaderValue {
    let value = format_cookie(&policy.name, "", policy.secure, policy.same_site.as_str(), Some(-1));
    HeaderValue::from_str(&value).unwrap_or_else(|_| HeaderValue::from_static(""))
}

/// Build the `Set-Cookie` header for the short-lived redirect cookie.
#[must_use]
pub fn redirect_cookie(secure: bool, path: &str) -> HeaderValue {
    let sanitized = sanitize_redirect_target(path);
    let value = format_cookie(REDIRECT_COOKIE_NAME, &sanitized, secure, "Lax", Some(600));
    HeaderValue::from_str(&value).unwrap_or_else(|_| HeaderValue::from_static(""))
}

/// Build the `Set-Cookie` header that clears the redirect cookie.
#[must_use]
pub fn clear_redirect_cookie(secure: bool) -> HeaderValue {
    let value = format_cookie(REDIRECT_COOKIE_NAME, "", secure, "Lax", Some(-1));
    HeaderValue::from_str(&value).unwrap_or_else(|_| HeaderValue::from_static(""))
}

/// Only relative paths starting with a single `/`, with no `//` prefix and
/// no `://` anywhere, are safe post-auth redirect targets. Anything else
/// collapses to `/`.
#[must_use]
pub fn sanitize_redirect_target(candidate: &str) -> String {
    let is_safe = candidate.starts_with('/') && !candidate.starts_with("//") && !candidate.contains("://");
    if is_safe { candidate.to_string() } else { "/".to_string() }
}

/// Parse the raw `Cookie` header value for `name`, returning its value.
#[must_use]
pub fn get_cookie<'a>(cookie_header: &'a str, name: &str) -> Option<&'a str> {
    cookie_header.split(';').find_map(|pair| {
        let pair = pair.trim();
        let (k, v) = pair.split_once('=')?;
        (k == name).then_some(v)
    })
}

/// Append a `Set-Cookie` header value onto `headers`.
pub fn push_set_cookie(headers: &mut axum::http::HeaderMap, value: HeaderValue) {
    headers.append(SET_COOKIE, value);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redirect_target_must_be_relative_single_slash() {
        assert_eq!(sanitize_redirect_target("/app"), "/app");
        assert_eq!(sanitize_redirect_target("//evil.com"), "/");
        assert_eq!(sanitize_redirect_target("https://evil.com"), "/");
        assert_eq!(sanitize_redirect_target("/ok://not-a-scheme-here"), "/");
        assert_eq!(sanitize_redirect_target("relative"), "/");
    }

    #[test]
    fn get_cookie_finds_named_value_among_several() {
        let header = "_oauth2_proxy=abc123; _oauth2_redirect=/app; other=1";
        assert_eq!(get_cookie(header, "_oauth2_redirect"), Some("/app"));
        assert_eq!(get_cookie(header, "missing"), None);
    }

    #[test]
    fn session_cookie_carries_expected_attributes() {
        let policy = CookiePolicy::default();
        let header = session_cookie(&policy, "sid123");
        let text = header.to_str().unwrap();
        assert!(text.contains("_oauth2_proxy=sid123"));
        assert!(text.contains("HttpOnly"));
        assert!(text.contains("Secure"));
        assert!(text.contains("SameSite=Lax"));
        assert!(text.contains("Max-Age=604800"));
    }

    #[test]
    fn clear_session_cookie_has_negative_max_age() {
        let policy = CookiePolicy::default();
        let header = clear_session_cookie(&policy);
        assert!(header.to_str().unwrap().contains("Max-Age=-1"));
    }
}

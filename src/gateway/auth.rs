//! The middleware state machine: session gating, OAuth2/email auth routes,
//! and the classify-then-forward fallback.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{FromRequestParts, Path, Query, State};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{Html, IntoResponse, Redirect, Response};
use serde::Deserialize;
use tracing::{info, warn};

use crate::authz::AuthorizationChecker;
use crate::classifier::{Action, RouteClassifier, is_builtin_static_asset};
use crate::email::EmailAuthHandler;
use crate::forwarding::{self, FieldMapping};
use crate::oauth::Manager as OAuthManager;
use crate::proxy::ReverseProxy;
use crate::session::{Session, SessionStore};
use crate::Error;

use super::cookies::{self, CookiePolicy};

/// Everything a request handler needs for one configuration generation.
/// Immutable once built; a reload constructs a fresh instance and swaps it
/// into the enclosing [`AppState`] rather than mutating this one in place.
pub struct AppStateInner {
    pub classifier: Arc<RouteClassifier>,
    pub sessions: Arc<SessionStore>,
    pub authz: Arc<AuthorizationChecker>,
    pub oauth: Arc<OAuthManager>,
    pub email: Arc<EmailAuthHandler>,
    pub forwarding: Arc<Vec<FieldMapping>>,
    pub cookie_policy: Arc<CookiePolicy>,
    pub proxy: ReverseProxy,
    pub prefix: String,
    pub service_name: String,
    pub session_ttl: Duration,
    pub development: bool,
    /// Shared in-flight-request tracker, used for the shutdown drain. Same
    /// `Arc` across every config generation — never rebuilt on reload.
    pub inflight: Arc<tokio::sync::Semaphore>,
}

/// Axum state handle: a cheap `Arc`-clone wrapping an atomically swappable
/// [`AppStateInner`]. Handlers call [`AppState::current`] once at the top
/// and operate on the returned snapshot, so in-flight requests always see a
/// consistent old-or-new view even while a reload is swapping instances.
#[derive(Clone)]
pub struct AppState(Arc<arc_swap::ArcSwap<AppStateInner>>);

impl AppState {
    #[must_use]
    pub fn new(inner: AppStateInner) -> Self {
        Self(Arc::new(arc_swap::ArcSwap::from_pointee(inner)))
    }

    /// Snapshot the currently active instance.
    #[must_use]
    pub fn current(&self) -> Arc<AppStateInner> {
        self.0.load_full()
    }

    /// Atomically replace the active instance. In-flight requests that
    /// already captured a snapshot via [`Self::current`] keep running
    /// against the old one.
    pub fn swap(&self, inner: AppStateInner) {
        self.0.store(Arc::new(inner));
    }
}

fn scheme_and_host(headers: &HeaderMap, uri: &Uri) -> (String, String) {
    let scheme = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .or_else(|| uri.scheme_str())
        .unwrap_or("https")
        .to_string();
    let host = headers
        .get(axum::http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost")
        .to_string();
    (scheme, host)
}

fn security_headers(development: bool) -> HeaderMap {
    let mut headers = HeaderMap::new();
    let script_src = if development { "'self' 'unsafe-inline'" } else { "'self'" };
    headers.insert(
        axum::http::header::CONTENT_SECURITY_POLICY,
        format!("default-src 'self'; script-src {script_src}").parse().unwrap(),
    );
    headers.insert(axum::http::header::X_CONTENT_TYPE_OPTIONS, "nosniff".parse().unwrap());
    headers.insert(axum::http::header::X_FRAME_OPTIONS, "DENY".parse().unwrap());
    headers.insert("x-xss-protection", "1; mode=block".parse().unwrap());
    headers.insert(axum::http::header::REFERRER_POLICY, "same-origin".parse().unwrap());
    headers
}

fn page(title: &str, body: &str, development: bool) -> Response {
    let html = format!("<html><head><title>{title}</title></head><body><h1>{title}</h1>{body}</body></html>");
    let mut response = Html(html).into_response();
    response.headers_mut().extend(security_headers(development));
    response
}

/// GET `/health`, `/ready`, `{prefix}/health`: authless liveness, GET/HEAD
/// only. Any other method is 405.
pub async fn health_handler(method: Method) -> Response {
    match method {
        Method::GET | Method::HEAD => (
            StatusCode::OK,
            [(axum::http::header::CONTENT_TYPE, "application/json")],
            "{\"status\":\"ok\"}",
        )
            .into_response(),
        _ => StatusCode::METHOD_NOT_ALLOWED.into_response(),
    }
}

/// GET `{prefix}/login`: chooser page listing providers plus an email form.
pub async fn login_page_handler(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let state = state.current();
    let return_to = headers
        .get(axum::http::header::COOKIE)
        .and_then(|v| v.to_str().ok())
        .and_then(|raw| cookies::get_cookie(raw, cookies::REDIRECT_COOKIE_NAME))
        .map(cookies::sanitize_redirect_target)
        .unwrap_or_else(|| "/".to_string());

    let mut providers_html = String::new();
    for (id, display_name) in state.oauth.list() {
        providers_html.push_str(&format!(
            "<a href=\"{}/oauth2/start/{id}?redirect={return_to}\">Sign in with {display_name}</a><br>",
            state.prefix
        ));
    }

    let email_form = format!(
        "<form method=\"post\" action=\"{}/email/send\">\
         <input type=\"hidden\" name=\"redirect\" value=\"{return_to}\">\
         <input type=\"email\" name=\"email\" placeholder=\"you@example.com\" required>\
         <button type=\"submit\">Email me a sign-in link</button></form>",
        state.prefix
    );

    page(&format!("Sign in to {}", state.service_name), &format!("{providers_html}{email_form}"), state.development)
}

/// GET `{prefix}/logout`: clear the session and confirm.
pub async fn logout_handler(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let state = state.current();
    if let Some(session_id) = headers
        .get(axum::http::header::COOKIE)
        .and_then(|v| v.to_str().ok())
        .and_then(|raw| cookies::get_cookie(raw, &state.cookie_policy.name))
    {
        let _ = state.sessions.delete(session_id).await;
    }
    let mut response = page("Signed out", "<p>You have been signed out.</p>", state.development);
    cookies::push_set_cookie(response.headers_mut(), cookies::clear_session_cookie(&state.cookie_policy));
    response
}

#[derive(Deserialize)]
pub struct OAuth2StartQuery {
    #[serde(default)]
    redirect: String,
}

/// GET `{prefix}/oauth2/start/{provider_id}`.
pub async fn oauth2_start_handler(
    State(state): State<AppState>,
    Path(provider_id): Path<String>,
    Query(query): Query<OAuth2StartQuery>,
    headers: HeaderMap,
    uri: Uri,
) -> Response {
    let state = state.current();
    let (scheme, host) = scheme_and_host(&headers, &uri);
    let redirect_url = format!("{scheme}://{host}{}/oauth2/callback", state.prefix);
    let return_to = cookies::sanitize_redirect_target(&query.redirect);

    match state.oauth.start(&provider_id, &redirect_url, &return_to).await {
        Ok(auth_url) => {
            let mut response = Redirect::to(&auth_url).into_response();
            cookies::push_set_cookie(
                response.headers_mut(),
                cookies::redirect_cookie(state.cookie_policy.secure, &return_to),
            );
            response
        }
        Err(e) => {
            warn!(error = %e, provider = provider_id, "oauth2 start failed");
            page("Authentication failed", "<p>Unknown or disabled provider.</p>", state.development)
        }
    }
}

#[derive(Deserialize)]
pub struct OAuth2CallbackQuery {
    code: String,
    state: String,
}

/// GET `{prefix}/oauth2/callback`.
pub async fn oauth2_callback_handler(State(state): State<AppState>, Query(query): Query<OAuth2CallbackQuery>) -> Response {
    let state = state.current();
    let (user_info, return_to) = match state.oauth.complete(&query.state, &query.code).await {
        Ok(result) => result,
        Err(e) => {
            warn!(error = %e, "oauth2 callback failed");
            return page(
                "Authentication failed",
                "<p>We couldn't complete sign-in. Please try again.</p>",
                state.development,
            );
        }
    };

    finish_login(&state, &user_info.email, &user_info.username, "oauth2", user_info.extra, &return_to).await
}

#[derive(Deserialize)]
pub struct EmailSendForm {
    email: String,
    #[serde(default)]
    redirect: String,
    #[serde(default)]
    lang: Option<String>,
}

/// POST `{prefix}/email/send`.
pub async fn email_send_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    uri: Uri,
    axum::Form(form): axum::Form<EmailSendForm>,
) -> Response {
    let state = state.current();
    let (scheme, host) = scheme_and_host(&headers, &uri);
    let prefix = state.prefix.clone();
    let return_to = cookies::sanitize_redirect_target(&form.redirect);
    let lang = form.lang.unwrap_or_else(|| "en".to_string());

    let result = state
        .email
        .send_login_link(&form.email, &lang, |token| {
            format!("{scheme}://{host}{prefix}/email/verify?token={token}&redirect={return_to}")
        })
        .await;

    match result {
        Ok(()) | Err(Error::EmailNotAuthorized(_)) => {
            // Idempotent user feedback: never reveal whether the address is
            // authorized or whether delivery actually happened.
            page("Check your email", "<p>If that address can sign in, a link is on its way.</p>", state.development)
        }
        Err(Error::RateLimitExceeded) => {
            page("Slow down", "<p>Too many requests. Please try again in a minute.</p>", state.development)
        }
        Err(e) => {
            warn!(error = %e, "email send failed");
            page("Something went wrong", "<p>We couldn't send that email. Please try again.</p>", state.development)
        }
    }
}

#[derive(Deserialize)]
pub struct EmailVerifyQuery {
    token: String,
    #[serde(default)]
    redirect: String,
}

/// GET `{prefix}/email/verify?token=...`.
pub async fn email_verify_handler(State(state): State<AppState>, Query(query): Query<EmailVerifyQuery>) -> Response {
    let state = state.current();
    match state.email.verify_login_link(&query.token).await {
        Ok(email) => {
            let return_to = cookies::sanitize_redirect_target(&query.redirect);
            finish_login(&state, &email, &email, "email", std::collections::HashMap::new(), &return_to).await
        }
        Err(_) => page("Invalid or expired link", "<p>This sign-in link is no longer valid.</p>", state.development),
    }
}

async fn finish_login(
    state: &AppStateInner,
    email: &str,
    username: &str,
    provider: &str,
    extra: std::collections::HashMap<String, serde_json::Value>,
    return_to: &str,
) -> Response {
    if state.authz.requires_email() && !state.authz.is_allowed(email) {
        return page("Access denied", "<p>Your account is not authorized to use this service.</p>", state.development);
    }

    let mut session = Session::new(email, username, provider, state.session_ttl);
    session.extra = extra;

    if let Err(e) = state.sessions.put(&session).await {
        warn!(error = %e, "failed to persist session");
        return page("Something went wrong", "<p>Please try again.</p>", state.development);
    }

    info!(email, provider, "session created");
    let mut response = Redirect::to(return_to).into_response();
    cookies::push_set_cookie(response.headers_mut(), cookies::session_cookie(&state.cookie_policy, &session.id));
    cookies::push_set_cookie(response.headers_mut(), cookies::clear_redirect_cookie(state.cookie_policy.secure));
    response
}

/// Fallback handler: classify the path and either forward, deny, or gate on
/// a session, redirecting to the login page when absent/invalid. A
/// WebSocket upgrade request is detected up front and bridged instead of
/// forwarded as buffered HTTP, but still passes through the same
/// allow/deny/auth gate as any other path.
pub async fn classify_and_forward(State(state): State<AppState>, request: axum::extract::Request) -> Response {
    let state = state.current();
    let method = request.method().clone();
    let uri = request.uri().clone();
    let headers = request.headers().clone();
    let path = uri.path().to_string();

    if is_builtin_static_asset(&path) {
        return forward_or_bridge(&state, method, uri, headers, request).await;
    }

    match state.classifier.classify(&path) {
        Action::Allow => forward_or_bridge(&state, method, uri, headers, request).await,
        Action::Deny => StatusCode::FORBIDDEN.into_response(),
        Action::Auth => {
            let session_id = headers
                .get(axum::http::header::COOKIE)
                .and_then(|v| v.to_str().ok())
                .and_then(|raw| cookies::get_cookie(raw, &state.cookie_policy.name))
                .map(str::to_string);

            let session = match session_id {
                Some(id) => state.sessions.get(&id).await.ok(),
                None => None,
            };

            match session {
                Some(session) if !state.authz.requires_email() || state.authz.is_allowed(&session.email) => {
                    forward_authenticated(&state, &session, method, uri, headers, request).await
                }
                Some(_) => StatusCode::FORBIDDEN.into_response(),
                None => {
                    let mut response = Redirect::to(&format!("{}/login", state.prefix)).into_response();
                    cookies::push_set_cookie(
                        response.headers_mut(),
                        cookies::redirect_cookie(state.cookie_policy.secure, &path),
                    );
                    response
                }
            }
        }
    }
}

/// Dispatch to the WebSocket bridge when `headers` carries an upgrade
/// request, otherwise to the buffered HTTP forward.
async fn forward_or_bridge(
    state: &AppStateInner,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    request: axum::extract::Request,
) -> Response {
    if crate::proxy::is_websocket_upgrade(&headers) {
        let (mut parts, _body) = request.into_parts();
        return match WebSocketUpgrade::from_request_parts(&mut parts, &()).await {
            Ok(ws) => {
                let client_ip = headers
                    .get("x-real-ip")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("0.0.0.0")
                    .to_string();
                let (scheme, _) = scheme_and_host(&headers, &uri);
                crate::proxy::forward_websocket(&state.proxy, ws, &uri, &headers, client_ip, &scheme).await
            }
            Err(rejection) => rejection.into_response(),
        };
    }
    forward(state, method, uri, headers, request.into_body()).await
}

async fn forward(state: &AppStateInner, method: Method, uri: Uri, headers: HeaderMap, body: axum::body::Body) -> Response {
    let client_ip = headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("0.0.0.0")
        .to_string();
    let (scheme, _) = scheme_and_host(&headers, &uri);
    crate::proxy::forward_http(State(state.proxy.clone()), method, uri, headers, client_ip, &scheme, body).await
}

async fn forward_authenticated(
    state: &AppStateInner,
    session: &Session,
    method: Method,
    uri: Uri,
    mut headers: HeaderMap,
    request: axum::extract::Request,
) -> Response {
    let (forwarded_headers, forwarded_query) = forwarding::resolve(session, &state.forwarding);
    for (name, value) in forwarded_headers {
        if let (Ok(name), Ok(value)) = (
            axum::http::HeaderName::try_from(name),
            axum::http::HeaderValue::from_str(&value),
        ) {
            headers.insert(name, value);
        }
    }

    let uri = if forwarded_query.is_empty() {
        uri
    } else {
        let extra: String = forwarded_query
            .iter()
            .map(|(k, v)| format!("{k}={}", percent_encode_query_value(v)))
            .collect::<Vec<_>>()
            .join("&");
        let joined = match uri.path_and_query() {
            Some(pq) if pq.query().is_some() => format!("{pq}&{extra}"),
            Some(pq) => format!("{}?{extra}", pq.path()),
            None => format!("/?{extra}"),
        };
        joined.parse().unwrap_or(uri)
    };

    forward_or_bridge(state, method, uri, headers, request).await
}

/// Holds one in-flight permit for the duration of a request, so a shutdown
/// drain can wait for all outstanding requests by acquiring every permit.
pub async fn track_inflight(
    State(state): State<AppState>,
    request: axum::extract::Request,
    next: axum::middleware::Next,
) -> Response {
    let inflight = Arc::clone(&state.current().inflight);
    let Ok(_permit) = inflight.acquire().await else {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    };
    next.run(request).await
}

/// Percent-encode a value for use in a forwarded query string, the same way
/// `oauth::provider`'s `build_auth_url` encodes its redirect parameters.
fn percent_encode_query_value(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_value_encoding_escapes_reserved_characters() {
        assert_eq!(percent_encode_query_value("a b"), "a+b");
        assert_eq!(percent_encode_query_value("a@b.com"), "a%40b.com");
        assert_eq!(percent_encode_query_value("safe-chars_1.2~3"), "safe-chars_1.2~3");
    }

    #[test]
    fn query_value_encoding_handles_non_ascii_as_utf8_bytes() {
        assert_eq!(percent_encode_query_value("caf\u{e9}"), "caf%C3%A9");
    }
}

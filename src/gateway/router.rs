//! Router assembly: explicit auth-flow routes plus the classify/forward
//! fallback, wrapped with the same middleware stack layering the existing
//! codebase uses (panic catching, compression, tracing).

use std::path::PathBuf;

use axum::Router;
use axum::routing::{any, get, post};
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::compression::CompressionLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use super::auth::{
    AppState, classify_and_forward, email_send_handler, email_verify_handler, health_handler, login_page_handler,
    logout_handler, oauth2_callback_handler, oauth2_start_handler, track_inflight,
};

/// Build the full router for `state`. Health endpoints are always
/// registered both bare and prefixed, unconditionally. `assets_dir`, when
/// set, mounts `{prefix}/assets/*` as a built-in unconditional allow ahead
/// of the classify/forward fallback (explicit routes always win over
/// `fallback`, so no classifier change is needed for this to act as one).
#[must_use]
pub fn create_router(state: AppState, assets_dir: Option<PathBuf>) -> Router {
    // The route table itself (prefix, path shapes) is fixed at startup, the
    // same way a listener restart is required for `server.host`/`port`
    // changes — only the handlers' behavior behind these paths hot-reloads.
    let prefix = state.current().prefix.clone();

    let mut router = Router::new()
        .route("/health", get(health_handler).post(health_handler))
        .route("/ready", get(health_handler).post(health_handler))
        .route(&format!("{prefix}/health"), get(health_handler).post(health_handler))
        .route(&format!("{prefix}/login"), get(login_page_handler))
        .route(&format!("{prefix}/logout"), get(logout_handler))
        .route(&format!("{prefix}/oauth2/start/{{provider_id}}"), get(oauth2_start_handler))
        .route(&format!("{prefix}/oauth2/callback"), get(oauth2_callback_handler))
        .route(&format!("{prefix}/email/send"), post(email_send_handler))
        .route(&format!("{prefix}/email/verify"), get(email_verify_handler));

    if let Some(dir) = assets_dir {
        router = router.nest_service(&format!("{prefix}/assets"), ServeDir::new(dir));
    }

    router
        .fallback(any(classify_and_forward))
        .layer(CatchPanicLayer::new())
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn_with_state(state.clone(), track_inflight))
        .with_state(state)
}

//! Reverse proxy: forwards allowed requests to the configured upstream,
//! including WebSocket upgrades and SSE-friendly streaming.
//!
//! The outbound [`reqwest::Client`] is built the same way
//! `transport::http::HttpTransport` builds its client (pooled idle
//! connections, TCP keepalive, Nagle disabled) since both exist to hold a
//! long-lived connection to one or more backend hosts.

use std::collections::HashMap;
use std::time::Duration;

use axum::body::Body;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use reqwest::Client;
use tokio_tungstenite::tungstenite::Message as TungsteniteMessage;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tracing::{debug, warn};

use crate::{Error, Result};

/// How often buffered upstream bytes are flushed to the client, chosen to
/// keep Server-Sent Events responsive.
const STREAM_FLUSH_INTERVAL: Duration = Duration::from_millis(100);

/// Upstream routing table: a default target plus optional per-host
/// overrides, keyed by the inbound `Host` header.
#[derive(Debug, Clone)]
pub struct UpstreamTable {
    default: String,
    by_host: HashMap<String, String>,
}

impl UpstreamTable {
    /// Build a table from a default upstream URL and per-host overrides.
    #[must_use]
    pub fn new(default: String, by_host: HashMap<String, String>) -> Self {
        Self { default, by_host }
    }

    /// Resolve the upstream base URL for an inbound `Host` header value.
    #[must_use]
    pub fn resolve(&self, host: Option<&str>) -> &str {
        host.and_then(|h| self.by_host.get(h)).unwrap_or(&self.default)
    }
}

/// Shared proxy configuration and client, cloned into the router's app state.
#[derive(Clone)]
pub struct ReverseProxy {
    client: Client,
    upstreams: std::sync::Arc<UpstreamTable>,
    shared_secret_header: Option<(HeaderName, HeaderValue)>,
}

impl ReverseProxy {
    /// Build the proxy. `shared_secret` is injected as `X-Chatbotgate-Secret`
    /// on every upstream request when configured.
    pub fn new(upstreams: UpstreamTable, shared_secret: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .pool_max_idle_per_host(32)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(30))
            .tcp_nodelay(true)
            .build()
            .map_err(|e| Error::Internal(format!("building upstream client: {e}")))?;

        let shared_secret_header = shared_secret
            .map(|value| {
                let header_value = HeaderValue::from_str(&value)
                    .map_err(|e| Error::ConfigInvalid(format!("invalid shared secret header value: {e}")))?;
                Ok::<_, Error>((HeaderName::from_static("x-chatbotgate-secret"), header_value))
            })
            .transpose()?;

        Ok(Self {
            client,
            upstreams: std::sync::Arc::new(upstreams),
            shared_secret_header,
        })
    }

    fn upstream_url(&self, host: Option<&str>, path_and_query: &str) -> String {
        let base = self.upstreams.resolve(host).trim_end_matches('/');
        format!("{base}{path_and_query}")
    }

    /// Same target as [`Self::upstream_url`], with the `http(s)` scheme
    /// swapped for `ws(s)` for the WebSocket connect.
    fn upstream_ws_url(&self, host: Option<&str>, path_and_query: &str) -> String {
        let http_url = self.upstream_url(host, path_and_query);
        if let Some(rest) = http_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = http_url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            http_url
        }
    }
}

/// True when the request carries the `Connection: Upgrade` / `Upgrade:
/// websocket` header pair that asks for a WebSocket bridge instead of a
/// buffered HTTP forward.
pub(crate) fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    let has_upgrade_token = headers
        .get(axum::http::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.to_ascii_lowercase().contains("upgrade"));
    let is_websocket = headers
        .get(axum::http::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
    has_upgrade_token && is_websocket
}

fn forwarded_headers(headers: &HeaderMap, client_ip: &str, scheme: &str, host: Option<&str>) -> HeaderMap {
    let mut out = headers.clone();
    out.insert(
        HeaderName::from_static("x-real-ip"),
        HeaderValue::from_str(client_ip).unwrap_or_else(|_| HeaderValue::from_static("")),
    );

    let forwarded_for = HeaderName::from_static("x-forwarded-for");
    let appended = match headers.get(&forwarded_for).and_then(|v| v.to_str().ok()) {
        Some(existing) => format!("{existing}, {client_ip}"),
        None => client_ip.to_string(),
    };
    if let Ok(value) = HeaderValue::from_str(&appended) {
        out.insert(forwarded_for, value);
    }

    out.insert(
        HeaderName::from_static("x-forwarded-proto"),
        HeaderValue::from_str(scheme).unwrap_or_else(|_| HeaderValue::from_static("http")),
    );
    if let Some(host) = host {
        if let Ok(value) = HeaderValue::from_str(host) {
            out.insert(HeaderName::from_static("x-forwarded-host"), value);
        }
    }
    out
}

/// Proxy a plain HTTP request to the resolved upstream, streaming the
/// response body back with periodic flushing for SSE.
pub async fn forward_http(
    State(proxy): State<ReverseProxy>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    client_ip: String,
    scheme: &str,
    body: Body,
) -> Response {
    let host = headers
        .get(axum::http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let target = proxy.upstream_url(host.as_deref(), path_and_query);

    let mut forward_headers = forwarded_headers(&headers, &client_ip, scheme, host.as_deref());
    if let Some((name, value)) = &proxy.shared_secret_header {
        forward_headers.insert(name.clone(), value.clone());
    }

    let body_bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(error = %e, "failed to buffer request body for proxying");
            return StatusCode::BAD_GATEWAY.into_response();
        }
    };

    let mut request = proxy.client.request(method, &target).body(body_bytes);
    for (name, value) in forward_headers.iter() {
        request = request.header(name, value);
    }

    let upstream_response = match request.send().await {
        Ok(resp) => resp,
        Err(e) => {
            warn!(error = %e, target, "upstream unreachable");
            return (StatusCode::BAD_GATEWAY, format!("upstream unreachable: {e}")).into_response();
        }
    };

    let status = upstream_response.status();
    let response_headers = upstream_response.headers().clone();
    let stream = flush_periodically(upstream_response.bytes_stream());

    let mut response = Response::builder().status(status);
    if let Some(builder_headers) = response.headers_mut() {
        for (name, value) in &response_headers {
            builder_headers.insert(name, value.clone());
        }
    }
    response.body(Body::from_stream(stream)).unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response())
}

/// Wrap a byte stream so chunks are coalesced and flushed at
/// [`STREAM_FLUSH_INTERVAL`] at most, rather than per network read — keeps
/// SSE responsive without forwarding every single TCP segment separately.
fn flush_periodically(
    stream: impl futures::Stream<Item = reqwest::Result<bytes::Bytes>> + Send + 'static,
) -> impl futures::Stream<Item = std::result::Result<bytes::Bytes, std::io::Error>> + Send + 'static {
    async_stream::stream! {
        futures::pin_mut!(stream);
        let mut ticker = tokio::time::interval(STREAM_FLUSH_INTERVAL);
        let mut buffer = bytes::BytesMut::new();
        loop {
            tokio::select! {
                chunk = stream.next() => {
                    match chunk {
                        Some(Ok(bytes)) => buffer.extend_from_slice(&bytes),
                        Some(Err(e)) => {
                            yield Err(std::io::Error::other(e));
                            return;
                        }
                        None => {
                            if !buffer.is_empty() {
                                yield Ok(buffer.split().freeze());
                            }
                            return;
                        }
                    }
                }
                _ = ticker.tick() => {
                    if !buffer.is_empty() {
                        yield Ok(buffer.split().freeze());
                    }
                }
            }
        }
    }
}

fn to_tungstenite(msg: WsMessage) -> Option<TungsteniteMessage> {
    match msg {
        WsMessage::Text(text) => Some(TungsteniteMessage::Text(text.to_string().into())),
        WsMessage::Binary(data) => Some(TungsteniteMessage::Binary(data.to_vec().into())),
        WsMessage::Ping(data) => Some(TungsteniteMessage::Ping(data.to_vec().into())),
        WsMessage::Pong(data) => Some(TungsteniteMessage::Pong(data.to_vec().into())),
        WsMessage::Close(_) => None,
    }
}

fn from_tungstenite(msg: TungsteniteMessage) -> Option<WsMessage> {
    match msg {
        TungsteniteMessage::Text(text) => Some(WsMessage::Text(text.to_string().into())),
        TungsteniteMessage::Binary(data) => Some(WsMessage::Binary(data.to_vec().into())),
        TungsteniteMessage::Ping(data) => Some(WsMessage::Ping(data.to_vec().into())),
        TungsteniteMessage::Pong(data) => Some(WsMessage::Pong(data.to_vec().into())),
        TungsteniteMessage::Close(_) | TungsteniteMessage::Frame(_) => None,
    }
}

/// Bridge an already-upgraded client socket to an upstream WebSocket,
/// relaying frames bidirectionally until either side closes.
/// `connect_headers` are sent with the upstream connect request (forwarded
/// identity headers and the shared secret, same as [`forward_http`]).
pub async fn bridge_websocket(client_ws: WebSocket, upstream_url: &str, connect_headers: &HeaderMap) -> Result<()> {
    let mut request = upstream_url
        .into_client_request()
        .map_err(|e| Error::UpstreamUnreachable(e.to_string()))?;
    for (name, value) in connect_headers {
        request.headers_mut().insert(name.clone(), value.clone());
    }

    let (upstream_ws, _response) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(|e| Error::UpstreamUnreachable(e.to_string()))?;

    let (mut client_write, mut client_read) = client_ws.split();
    let (mut upstream_write, mut upstream_read) = upstream_ws.split();

    let client_to_upstream = async {
        while let Some(Ok(msg)) = client_read.next().await {
            let Some(msg) = to_tungstenite(msg) else { continue };
            if upstream_write.send(msg).await.is_err() {
                break;
            }
        }
    };
    let upstream_to_client = async {
        while let Some(Ok(msg)) = upstream_read.next().await {
            let Some(msg) = from_tungstenite(msg) else { continue };
            if client_write.send(msg).await.is_err() {
                break;
            }
        }
    };

    tokio::select! {
        () = client_to_upstream => {},
        () = upstream_to_client => {},
    }
    debug!("websocket bridge closed");
    Ok(())
}

/// Complete a WebSocket upgrade and hand the bridged connection off to
/// [`bridge_websocket`] against the resolved upstream target.
pub async fn forward_websocket(
    proxy: &ReverseProxy,
    ws: WebSocketUpgrade,
    uri: &Uri,
    headers: &HeaderMap,
    client_ip: String,
    scheme: &str,
) -> Response {
    let host = headers
        .get(axum::http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let target = proxy.upstream_ws_url(host.as_deref(), path_and_query);

    let mut connect_headers = forwarded_headers(headers, &client_ip, scheme, host.as_deref());
    if let Some((name, value)) = &proxy.shared_secret_header {
        connect_headers.insert(name.clone(), value.clone());
    }

    ws.on_upgrade(move |socket| async move {
        if let Err(e) = bridge_websocket(socket, &target, &connect_headers).await {
            warn!(error = %e, target, "websocket bridge failed");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn default_upstream_used_when_no_host_override() {
        let table = UpstreamTable::new("http://app:8080".into(), HashMap::new());
        assert_eq!(table.resolve(Some("anything.example.com")), "http://app:8080");
    }

    #[test]
    fn host_specific_override_takes_priority() {
        let mut overrides = HashMap::new();
        overrides.insert("admin.example.com".to_string(), "http://admin-app:9090".to_string());
        let table = UpstreamTable::new("http://app:8080".into(), overrides);
        assert_eq!(table.resolve(Some("admin.example.com")), "http://admin-app:9090");
        assert_eq!(table.resolve(Some("other.example.com")), "http://app:8080");
    }

    #[test]
    fn websocket_upgrade_requires_both_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(axum::http::header::CONNECTION, HeaderValue::from_static("upgrade"));
        headers.insert(axum::http::header::UPGRADE, HeaderValue::from_static("websocket"));
        assert!(is_websocket_upgrade(&headers));

        let mut missing_upgrade_header = HeaderMap::new();
        missing_upgrade_header.insert(axum::http::header::CONNECTION, HeaderValue::from_static("upgrade"));
        assert!(!is_websocket_upgrade(&missing_upgrade_header));
    }

    #[test]
    fn forwarded_for_is_appended_not_replaced() {
        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_static("x-forwarded-for"),
            HeaderValue::from_static("10.0.0.1"),
        );
        let out = forwarded_headers(&headers, "203.0.113.5", "https", Some("gw.example.com"));
        assert_eq!(out.get("x-forwarded-for").unwrap(), "10.0.0.1, 203.0.113.5");
        assert_eq!(out.get("x-forwarded-proto").unwrap(), "https");
        assert_eq!(out.get("x-forwarded-host").unwrap(), "gw.example.com");
    }

    #[test]
    fn shared_secret_header_is_rejected_when_unparsable() {
        let table = UpstreamTable::new("http://app".into(), HashMap::new());
        let result = ReverseProxy::new(table, Some("bad\nvalue".into()));
        assert!(result.is_err());
    }
}

//! Local forward proxy.
//!
//! Point an HTTP client's proxy setting at this listener and every request
//! it makes is performed through the tunnel. Requests arrive in absolute
//! form (`GET http://host/path`); origin-form requests fall back to the
//! `Host` header.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::{Request, State},
    http::{
        header::{HeaderName, HeaderValue, HOST},
        Method, StatusCode,
    },
    response::{IntoResponse, Response},
    Router,
};
use mcptunnel_shared::protocol::Headers;
use mcptunnel_shared::Error;
use tracing::{debug, info, warn};

use crate::tunnel::{CallIntent, FetchResponse, TunnelClient};

/// Headers that describe the local hop and must not be forwarded.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authorization",
    "proxy-authenticate",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
];

#[derive(Clone)]
struct ProxyState {
    client: Arc<TunnelClient>,
    max_body: usize,
}

pub fn router(client: Arc<TunnelClient>, max_body: usize) -> Router {
    Router::new()
        .fallback(proxy_handler)
        .with_state(ProxyState { client, max_body })
}

/// Serve the proxy until `shutdown` resolves.
pub async fn serve(
    client: Arc<TunnelClient>,
    addr: SocketAddr,
    max_body: usize,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind proxy on {}", addr))?;
    info!("Forward proxy listening on http://{}", addr);
    axum::serve(listener, router(client, max_body))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn proxy_handler(State(state): State<ProxyState>, req: Request) -> Response {
    if req.method() == Method::CONNECT {
        return (StatusCode::METHOD_NOT_ALLOWED, "CONNECT tunneling is not supported").into_response();
    }

    let Some(url) = target_url(&req) else {
        return (StatusCode::BAD_REQUEST, "Missing target host").into_response();
    };
    let method = req.method().to_string();
    let headers = forwardable_headers(req.headers());

    let body = match axum::body::to_bytes(req.into_body(), state.max_body).await {
        Ok(b) => b.to_vec(),
        Err(_) => {
            return (StatusCode::PAYLOAD_TOO_LARGE, "Request body too large").into_response();
        }
    };

    debug!(%method, %url, in_flight = state.client.pending_count(), "Proxying request");
    let mut intent = CallIntent::new(method, url.clone()).body(body);
    intent.headers = headers;

    match state.client.fetch(intent).await {
        Ok(response) => build_response(response),
        Err(e) => {
            warn!(%url, "Tunneled call failed: {}", e);
            error_response(e)
        }
    }
}

/// Absolute-form URI as-is, otherwise `http://<Host><path>`.
fn target_url(req: &Request) -> Option<String> {
    let uri = req.uri();
    if uri.scheme().is_some() && uri.authority().is_some() {
        return Some(uri.to_string());
    }
    let host = req.headers().get(HOST)?.to_str().ok()?;
    if host.is_empty() {
        return None;
    }
    let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
    Some(format!("http://{}{}", host, path))
}

fn forwardable_headers(headers: &axum::http::HeaderMap) -> Headers {
    let mut out = Headers::new();
    for (name, value) in headers {
        let name = name.as_str();
        if HOP_BY_HOP.contains(&name) {
            continue;
        }
        let Ok(value) = value.to_str() else {
            continue;
        };
        out.entry(name.to_string())
            .and_modify(|v: &mut String| {
                v.push_str(", ");
                v.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }
    out
}

fn build_response(response: FetchResponse) -> Response {
    let mut builder = Response::builder()
        .status(StatusCode::from_u16(response.status).unwrap_or(StatusCode::BAD_GATEWAY));
    if let Some(headers_mut) = builder.headers_mut() {
        for (k, v) in response.headers {
            if HOP_BY_HOP.contains(&k.to_ascii_lowercase().as_str()) {
                continue;
            }
            if let (Ok(hn), Ok(hv)) = (HeaderName::from_bytes(k.as_bytes()), HeaderValue::from_str(&v)) {
                headers_mut.append(hn, hv);
            }
        }
    }
    match builder.body(Body::from(response.body)) {
        Ok(r) => r,
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Response build error").into_response(),
    }
}

fn error_response(error: Error) -> Response {
    match error {
        Error::Remote { status, message } => (
            StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY),
            message,
        )
            .into_response(),
        Error::Timeout => (StatusCode::GATEWAY_TIMEOUT, "Tunnel request timed out").into_response(),
        other => (StatusCode::BAD_GATEWAY, other.to_string()).into_response(),
    }
}

//! Request execution for the relay.
//!
//! Every tunneled request passes the admission checks (body size, then
//! destination host) before the real outbound call is made. Whatever
//! happens, the caller gets a `TunnelResponse` back.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use mcptunnel_shared::protocol::{encode_body, now_millis, Headers, TunnelRequest, TunnelResponse};
use mcptunnel_shared::{Error, Rejection, Result};
use tracing::{info, warn};

use crate::allowlist::AllowList;
use crate::metrics::Metrics;

/// A decoded call ready to go on the wire
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundRequest {
    pub method: String,
    pub url: String,
    pub headers: Headers,
    pub body: Vec<u8>,
}

/// What the destination answered
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundResponse {
    pub status: u16,
    pub status_text: Option<String>,
    pub headers: Headers,
    pub body: Vec<u8>,
}

/// Performs the real HTTP call.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: OutboundRequest) -> Result<OutboundResponse>;
}

/// `HttpTransport` backed by reqwest
#[derive(Clone, Default)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: OutboundRequest) -> Result<OutboundResponse> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes()).map_err(|_| {
            Error::validation(
                Rejection::Malformed,
                format!("Invalid HTTP method: {}", request.method),
            )
        })?;

        let mut headers = reqwest::header::HeaderMap::new();
        for (k, v) in &request.headers {
            // reqwest advertises only the encodings it can decode.
            if k.eq_ignore_ascii_case("accept-encoding") {
                continue;
            }
            let name = reqwest::header::HeaderName::from_bytes(k.as_bytes()).map_err(|_| {
                Error::validation(Rejection::Malformed, format!("Invalid header name: {}", k))
            })?;
            let value = reqwest::header::HeaderValue::from_str(v).map_err(|_| {
                Error::validation(Rejection::Malformed, format!("Invalid value for header {}", k))
            })?;
            headers.insert(name, value);
        }

        let mut builder = self.client.request(method, &request.url).headers(headers);
        if !request.body.is_empty() {
            builder = builder.body(request.body);
        }

        let response = builder.send().await.map_err(|e| Error::Execution(describe(&e)))?;

        let status = response.status();
        let headers: Headers = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|val| (k.as_str().to_string(), val.to_string())))
            .collect();
        let body = response
            .bytes()
            .await
            .map_err(|e| Error::Execution(describe(&e)))?;

        Ok(OutboundResponse {
            status: status.as_u16(),
            status_text: status.canonical_reason().map(String::from),
            headers,
            body: body.to_vec(),
        })
    }
}

/// Flatten an error and its sources into one line.
fn describe(err: &dyn std::error::Error) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        out.push_str(": ");
        out.push_str(&cause.to_string());
        source = cause.source();
    }
    out
}

pub struct RequestExecutor {
    transport: Arc<dyn HttpTransport>,
    allow_list: AllowList,
    max_request_size: usize,
    metrics: Metrics,
}

impl RequestExecutor {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        allow_list: AllowList,
        max_request_size: usize,
        metrics: Metrics,
    ) -> Self {
        Self {
            transport,
            allow_list,
            max_request_size,
            metrics,
        }
    }

    /// Run admission and the outbound call. Never fails.
    pub async fn execute(&self, request: &TunnelRequest) -> TunnelResponse {
        let start = Instant::now();

        let outbound = match self.admit(request) {
            Ok(o) => o,
            Err(e) => return self.reject(request, e),
        };
        let bytes_sent = outbound.body.len() as u64;

        info!(
            request_id = %request.request_id,
            method = %request.method,
            url = %request.url,
            "Executing request"
        );

        match self.transport.send(outbound).await {
            Ok(resp) => {
                let elapsed = start.elapsed();
                info!(
                    request_id = %request.request_id,
                    status = resp.status,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Completed request"
                );
                self.metrics
                    .record_request(resp.status, micros(elapsed), bytes_sent, resp.body.len() as u64)
                    .await;

                TunnelResponse {
                    request_id: request.request_id.clone(),
                    tenant_id: request.tenant_id.clone(),
                    status: resp.status,
                    status_text: resp.status_text,
                    headers: resp.headers,
                    body: encode_body(&resp.body),
                    error: None,
                    timestamp: now_millis(),
                }
            }
            Err(e @ Error::Validation { .. }) => self.reject(request, e),
            Err(e) => {
                let elapsed = start.elapsed();
                let message = match e {
                    Error::Execution(msg) => msg,
                    other => other.to_string(),
                };
                warn!(
                    request_id = %request.request_id,
                    elapsed_ms = elapsed.as_millis() as u64,
                    error = %message,
                    "Outbound request failed"
                );
                self.metrics.record_upstream_failure();
                self.metrics.record_request(502, micros(elapsed), bytes_sent, 0).await;
                TunnelResponse::failure(request, 502, message)
            }
        }
    }

    /// Size check, then host check. Returns the decoded call on success.
    pub fn admit(&self, request: &TunnelRequest) -> Result<OutboundRequest> {
        let body = request.body_bytes().map_err(|_| {
            Error::validation(Rejection::Malformed, "Invalid request body encoding")
        })?;

        if body.len() > self.max_request_size {
            return Err(Error::validation(
                Rejection::TooLarge,
                "Request size exceeds maximum allowed",
            ));
        }

        if !self.allow_list.is_url_allowed(&request.url) {
            return Err(Error::validation(
                Rejection::HostNotAllowed,
                format!("Request to {} is not allowed", request.url),
            ));
        }

        Ok(OutboundRequest {
            method: request.method.clone(),
            url: request.url.clone(),
            headers: request.headers.clone(),
            body,
        })
    }

    fn reject(&self, request: &TunnelRequest, err: Error) -> TunnelResponse {
        let (rejection, message) = match err {
            Error::Validation { rejection, message } => (rejection, message),
            other => (Rejection::Malformed, other.to_string()),
        };
        warn!(
            request_id = %request.request_id,
            tenant_id = %request.tenant_id,
            reason = rejection.as_str(),
            "Request rejected: {}",
            message
        );
        self.metrics.record_rejection(rejection);
        TunnelResponse::failure(request, rejection.status(), message)
    }
}

fn micros(d: Duration) -> u64 {
    d.as_micros().min(u64::MAX as u128) as u64
}

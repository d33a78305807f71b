//! Wire protocol types for MCP Tunnel communication.
//!
//! Requests and responses travel over the bus as JSON. Bodies are binary
//! and are carried as standard base64 because the bus is text-oriented.

use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Default topic namespace
pub const DEFAULT_NAMESPACE: &str = "mcp-tunnel";

/// Default maximum request body size (10 MB)
pub const DEFAULT_MAX_REQUEST_SIZE: usize = 10 * 1024 * 1024;

/// Default per-call timeout in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Bus message name for requests
pub const REQUEST_MESSAGE: &str = "request";

/// Bus message name for responses
pub const RESPONSE_MESSAGE: &str = "response";

/// Header map. Keys are unique; ordering is stable for logging and tests.
pub type Headers = BTreeMap<String, String>;

/// HTTP request sent through the tunnel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelRequest {
    pub request_id: String,
    pub tenant_id: String,
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: Headers,
    /// Base64-encoded body
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    /// Unix timestamp (ms)
    pub timestamp: i64,
}

impl TunnelRequest {
    /// Decoded body bytes (empty when absent).
    pub fn body_bytes(&self) -> Result<Vec<u8>> {
        decode_body(self.body.as_deref())
    }
}

/// HTTP response sent back through the tunnel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelResponse {
    pub request_id: String,
    pub tenant_id: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_text: Option<String>,
    #[serde(default)]
    pub headers: Headers,
    /// Base64-encoded body
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    /// Set when the remote side refused or failed to perform the call
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Unix timestamp (ms)
    pub timestamp: i64,
}

impl TunnelResponse {
    /// Error response for `request` carrying `status` and an error string.
    pub fn failure(request: &TunnelRequest, status: u16, error: impl Into<String>) -> Self {
        Self {
            request_id: request.request_id.clone(),
            tenant_id: request.tenant_id.clone(),
            status,
            status_text: None,
            headers: Headers::new(),
            body: None,
            error: Some(error.into()),
            timestamp: now_millis(),
        }
    }

    pub fn body_bytes(&self) -> Result<Vec<u8>> {
        decode_body(self.body.as_deref())
    }
}

/// Envelope published on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusMessage {
    pub name: String,
    pub data: serde_json::Value,
}

impl BusMessage {
    pub fn request(request: &TunnelRequest) -> Result<Self> {
        Ok(Self {
            name: REQUEST_MESSAGE.to_string(),
            data: serde_json::to_value(request)?,
        })
    }

    pub fn response(response: &TunnelResponse) -> Result<Self> {
        Ok(Self {
            name: RESPONSE_MESSAGE.to_string(),
            data: serde_json::to_value(response)?,
        })
    }

    /// Parse the payload as a request. Fails if the name does not match.
    pub fn into_request(self) -> Result<TunnelRequest> {
        if self.name != REQUEST_MESSAGE {
            return Err(Error::Protocol(format!("expected request, got '{}'", self.name)));
        }
        Ok(serde_json::from_value(self.data)?)
    }

    pub fn into_response(self) -> Result<TunnelResponse> {
        if self.name != RESPONSE_MESSAGE {
            return Err(Error::Protocol(format!("expected response, got '{}'", self.name)));
        }
        Ok(serde_json::from_value(self.data)?)
    }
}

/// Per-tenant topic pair: `<namespace>:<tenant>:requests` / `:responses`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    pub requests: String,
    pub responses: String,
}

impl Topics {
    pub fn new(namespace: &str, tenant_id: &str) -> Self {
        let prefix = format!("{}:{}", namespace, tenant_id);
        Self {
            requests: format!("{}:requests", prefix),
            responses: format!("{}:responses", prefix),
        }
    }

    /// Whether `topic` is a tunnel topic inside `namespace`.
    pub fn in_namespace(namespace: &str, topic: &str) -> bool {
        let Some(rest) = topic
            .strip_prefix(namespace)
            .and_then(|r| r.strip_prefix(':'))
        else {
            return false;
        };
        match rest.rsplit_once(':') {
            Some((tenant, kind)) => {
                !tenant.is_empty() && (kind == "requests" || kind == "responses")
            }
            None => false,
        }
    }
}

/// Encode raw bytes for transport. Empty input encodes to `None`.
pub fn encode_body(bytes: &[u8]) -> Option<String> {
    if bytes.is_empty() {
        None
    } else {
        Some(STANDARD.encode(bytes))
    }
}

/// Decode a transported body. `None` decodes to an empty buffer.
pub fn decode_body(body: Option<&str>) -> Result<Vec<u8>> {
    match body {
        Some(b) => STANDARD
            .decode(b)
            .map_err(|e| Error::Protocol(format!("invalid body encoding: {}", e))),
        None => Ok(Vec::new()),
    }
}

/// Current Unix time in milliseconds
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

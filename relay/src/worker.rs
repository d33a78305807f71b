//! Tenant worker: reads request messages off the bus, applies the tenant
//! rate limit, hands admitted requests to the executor and publishes the
//! response.

use std::sync::Arc;
use std::time::Duration;

use mcptunnel_shared::bus::MessageBus;
use mcptunnel_shared::protocol::{BusMessage, Headers, TunnelRequest, TunnelResponse, Topics};
use mcptunnel_shared::{Rejection, Result};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::executor::RequestExecutor;
use crate::metrics::Metrics;
use crate::rate_limiter::RateLimiter;

pub struct Worker {
    bus: Arc<dyn MessageBus>,
    topics: Topics,
    executor: RequestExecutor,
    limiter: Arc<RateLimiter>,
    metrics: Metrics,
}

impl Worker {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        topics: Topics,
        executor: RequestExecutor,
        limiter: Arc<RateLimiter>,
        metrics: Metrics,
    ) -> Self {
        Self {
            bus,
            topics,
            executor,
            limiter,
            metrics,
        }
    }

    /// Consume the request topic until shutdown. Each message is handled on
    /// its own task so a slow destination never blocks the others.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut requests = self.bus.subscribe(&self.topics.requests).await?;
        info!(topic = %self.topics.requests, "Worker is listening for requests");

        loop {
            tokio::select! {
                msg = requests.recv() => {
                    match msg {
                        Some(message) => {
                            let worker = self.clone();
                            tokio::spawn(async move { worker.handle_message(message).await });
                        }
                        None => {
                            warn!("Request subscription ended");
                            break;
                        }
                    }
                }
                _ = shutdown.changed() => {
                    info!("Worker stopping");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Handle one bus message and publish its response.
    pub async fn handle_message(&self, message: BusMessage) {
        self.metrics.record_received();

        let response = match parse_request(message) {
            Ok(request) => {
                debug!(request_id = %request.request_id, url = %request.url, "Received request");
                self.handle(request).await
            }
            Err(Some(response)) => response,
            Err(None) => return,
        };

        let message = match BusMessage::response(&response) {
            Ok(m) => m,
            Err(e) => {
                warn!(request_id = %response.request_id, "Failed to encode response: {}", e);
                return;
            }
        };
        match self.bus.publish(&self.topics.responses, message).await {
            Ok(()) => debug!(request_id = %response.request_id, status = response.status, "Published response"),
            Err(e) => warn!(request_id = %response.request_id, "Failed to publish response: {}", e),
        }
    }

    /// Rate limit, then execute. Rate-limited calls never reach the executor.
    pub async fn handle(&self, request: TunnelRequest) -> TunnelResponse {
        if !self.limiter.is_allowed(&request.tenant_id) {
            warn!(
                request_id = %request.request_id,
                tenant_id = %request.tenant_id,
                current_count = self.limiter.count(&request.tenant_id),
                limit = self.limiter.limit(),
                "Request rejected: rate limit exceeded"
            );
            self.metrics.record_rejection(Rejection::RateLimited);
            return TunnelResponse::failure(&request, Rejection::RateLimited.status(), "Rate limit exceeded");
        }

        self.executor.execute(&request).await
    }
}

/// Decode a request message. When the payload is unusable but still names a
/// request id, the error side carries a 400 response for it.
fn parse_request(message: BusMessage) -> std::result::Result<TunnelRequest, Option<TunnelResponse>> {
    let data = message.data.clone();
    match message.into_request() {
        Ok(request) => Ok(request),
        Err(e) => {
            let request_id = data.get("requestId").and_then(|v| v.as_str());
            let tenant_id = data.get("tenantId").and_then(|v| v.as_str()).unwrap_or_default();
            match request_id {
                Some(id) => {
                    warn!(request_id = id, "Malformed request message: {}", e);
                    Err(Some(TunnelResponse {
                        request_id: id.to_string(),
                        tenant_id: tenant_id.to_string(),
                        status: Rejection::Malformed.status(),
                        status_text: None,
                        headers: Headers::new(),
                        body: None,
                        error: Some(format!("Malformed request message: {}", e)),
                        timestamp: mcptunnel_shared::protocol::now_millis(),
                    }))
                }
                None => {
                    warn!("Dropping unidentifiable message: {}", e);
                    Err(None)
                }
            }
        }
    }
}

/// Periodically purge expired rate-limit windows.
pub fn spawn_sweeper(
    limiter: Arc<RateLimiter>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    limiter.cleanup();
                    debug!(tenants = limiter.tracked_keys(), "Rate limiter sweep");
                }
                _ = shutdown.changed() => break,
            }
        }
    })
}

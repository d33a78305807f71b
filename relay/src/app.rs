//! HTTP surface of the relay.

use std::sync::Arc;

use axum::{routing::get, Router};
use mcptunnel_shared::bus::MessageBus;

use crate::health;
use crate::hub::{self, BusHub};
use crate::metrics::Metrics;

#[derive(Clone)]
pub struct AppState {
    pub bus: Arc<dyn MessageBus>,
    pub metrics: Metrics,
    /// Present when this relay hosts the bus for remote clients
    pub hub: Option<BusHub>,
}

impl AppState {
    pub fn new(bus: Arc<dyn MessageBus>, metrics: Metrics, hub: Option<BusHub>) -> Self {
        Self { bus, metrics, hub }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .route("/ready", get(health::ready))
        .route("/metrics", get(health::metrics))
        .route("/bus", get(hub::bus_handler))
        .fallback(health::not_found)
        .with_state(state)
}

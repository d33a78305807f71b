//! Bus hub: lets remote `WsBus` clients use this relay's bus.
//!
//! Each WebSocket connection may subscribe to and publish on tunnel topics
//! inside the configured namespace. Nothing is stored; a message reaches
//! whoever is subscribed at publish time.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use futures_util::{SinkExt, StreamExt};
use mcptunnel_shared::bus::frame::{ClientFrame, HubFrame};
use mcptunnel_shared::bus::MessageBus;
use mcptunnel_shared::protocol::Topics;
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::app::AppState;

#[derive(Clone)]
pub struct BusHub {
    bus: Arc<dyn MessageBus>,
    namespace: String,
    api_key: Option<String>,
    shutdown: watch::Receiver<bool>,
}

impl BusHub {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        namespace: String,
        api_key: Option<String>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bus,
            namespace,
            api_key,
            shutdown,
        }
    }

    fn authorized(&self, headers: &HeaderMap) -> bool {
        let Some(key) = &self.api_key else {
            return true;
        };
        headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(|token| token == key)
            .unwrap_or(false)
    }

    fn check_topic(&self, topic: &str) -> Result<(), String> {
        if Topics::in_namespace(&self.namespace, topic) {
            Ok(())
        } else {
            Err(format!("topic not allowed: {}", topic))
        }
    }
}

pub async fn bus_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    let Some(hub) = state.hub.clone() else {
        return (StatusCode::NOT_FOUND, Json(json!({ "error": "Not found" }))).into_response();
    };
    if !hub.authorized(&headers) {
        warn!("Rejected bus connection: bad credentials");
        return (StatusCode::UNAUTHORIZED, Json(json!({ "error": "Unauthorized" }))).into_response();
    }
    let Some(ws) = ws else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "WebSocket upgrade required" })),
        )
            .into_response();
    };
    ws.on_upgrade(move |socket| serve_connection(socket, hub))
}

async fn serve_connection(socket: WebSocket, mut hub: BusHub) {
    let (mut sender, mut receiver) = socket.split();
    if *hub.shutdown.borrow_and_update() {
        let _ = sender.send(Message::Close(None)).await;
        return;
    }
    info!("Bus client connected");
    let (tx, mut rx) = mpsc::unbounded_channel::<HubFrame>();
    let mut forwarders: HashMap<String, JoinHandle<()>> = HashMap::new();

    loop {
        tokio::select! {
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientFrame>(&text) {
                            Ok(frame) => apply(&hub, frame, &tx, &mut forwarders).await,
                            Err(e) => {
                                let _ = tx.send(HubFrame::Error { error: format!("invalid frame: {}", e) });
                            }
                        }
                    }
                    Some(Ok(Message::Ping(d))) => {
                        if sender.send(Message::Pong(d)).await.is_err() { break; }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!("Bus client socket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
            Some(frame) = rx.recv() => {
                let text = match serde_json::to_string(&frame) {
                    Ok(t) => t,
                    Err(e) => {
                        warn!("Failed to encode hub frame: {}", e);
                        continue;
                    }
                };
                if sender.send(Message::Text(text)).await.is_err() { break; }
            }
            changed = hub.shutdown.changed() => {
                if changed.is_err() || *hub.shutdown.borrow() {
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    }

    for (_, task) in forwarders {
        task.abort();
    }
    info!("Bus client disconnected");
}

async fn apply(
    hub: &BusHub,
    frame: ClientFrame,
    tx: &mpsc::UnboundedSender<HubFrame>,
    forwarders: &mut HashMap<String, JoinHandle<()>>,
) {
    match frame {
        ClientFrame::Subscribe { topic } => {
            if let Err(error) = hub.check_topic(&topic) {
                let _ = tx.send(HubFrame::Error { error });
                return;
            }
            if forwarders.contains_key(&topic) {
                return;
            }
            match hub.bus.subscribe(&topic).await {
                Ok(mut sub) => {
                    debug!(%topic, "Bus client subscribed");
                    let tx = tx.clone();
                    let forward_topic = topic.clone();
                    let task = tokio::spawn(async move {
                        while let Some(message) = sub.recv().await {
                            let frame = HubFrame::Message {
                                topic: forward_topic.clone(),
                                message,
                            };
                            if tx.send(frame).is_err() {
                                break;
                            }
                        }
                    });
                    forwarders.insert(topic, task);
                }
                Err(e) => {
                    let _ = tx.send(HubFrame::Error { error: e.to_string() });
                }
            }
        }
        ClientFrame::Unsubscribe { topic } => {
            if let Some(task) = forwarders.remove(&topic) {
                task.abort();
                debug!(%topic, "Bus client unsubscribed");
            }
        }
        ClientFrame::Publish { topic, message } => {
            if let Err(error) = hub.check_topic(&topic) {
                let _ = tx.send(HubFrame::Error { error });
                return;
            }
            if let Err(e) = hub.bus.publish(&topic, message).await {
                let _ = tx.send(HubFrame::Error { error: e.to_string() });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::build_router;
    use crate::metrics::Metrics;
    use mcptunnel_shared::bus::{MemoryBus, WsBus, WsBusConfig};
    use mcptunnel_shared::protocol::{BusMessage, DEFAULT_NAMESPACE};
    use std::net::SocketAddr;
    use std::time::Duration;

    async fn serve_hub(key: Option<&str>) -> (SocketAddr, Arc<MemoryBus>, watch::Sender<bool>) {
        let bus = Arc::new(MemoryBus::new());
        bus.connect().await.unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let hub = BusHub::new(
            bus.clone(),
            DEFAULT_NAMESPACE.to_string(),
            key.map(String::from),
            shutdown_rx,
        );
        let state = AppState::new(bus.clone(), Metrics::new(), Some(hub));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, build_router(state)).await.unwrap();
        });
        (addr, bus, shutdown_tx)
    }

    fn msg(n: u64) -> BusMessage {
        BusMessage {
            name: "response".into(),
            data: json!({ "n": n }),
        }
    }

    #[tokio::test]
    async fn test_ws_bus_round_trip_through_hub() {
        let (addr, local, _shutdown) = serve_hub(Some("secret")).await;
        let remote = WsBus::new(
            WsBusConfig::new(format!("ws://{}/bus", addr)).with_api_key(Some("secret".into())),
        );
        remote.connect().await.unwrap();
        assert!(remote.is_connected());

        // Remote subscriber receives what the relay publishes locally.
        let topic = "mcp-tunnel:t1:responses";
        let mut sub = remote.subscribe(topic).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        local.publish(topic, msg(1)).await.unwrap();
        let got = tokio::time::timeout(Duration::from_secs(2), sub.recv()).await.unwrap();
        assert_eq!(got, Some(msg(1)));

        // Local subscriber receives what the remote publishes.
        let requests = "mcp-tunnel:t1:requests";
        let mut local_sub = local.subscribe(requests).await.unwrap();
        remote.publish(requests, msg(2)).await.unwrap();
        let got = tokio::time::timeout(Duration::from_secs(2), local_sub.recv()).await.unwrap();
        assert_eq!(got, Some(msg(2)));

        remote.close().await.unwrap();
        assert!(!remote.is_connected());
    }

    #[tokio::test]
    async fn test_hub_rejects_bad_key() {
        let (addr, _local, _shutdown) = serve_hub(Some("secret")).await;
        let remote = WsBus::new(
            WsBusConfig::new(format!("ws://{}/bus", addr)).with_api_key(Some("wrong".into())),
        );
        let err = remote.connect().await.unwrap_err();
        assert!(matches!(err, mcptunnel_shared::Error::Connection(_)));
    }

    #[tokio::test]
    async fn test_hub_ignores_foreign_topics() {
        let (addr, local, _shutdown) = serve_hub(None).await;
        let remote = WsBus::new(WsBusConfig::new(format!("ws://{}/bus", addr)));
        remote.connect().await.unwrap();

        let mut local_sub = local.subscribe("other:t1:requests").await.unwrap();
        remote.publish("other:t1:requests", msg(3)).await.unwrap();
        let got = tokio::time::timeout(Duration::from_millis(200), local_sub.recv()).await;
        assert!(got.is_err(), "foreign topic must not be bridged");
        remote.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_ws_bus_resubscribes_after_hub_restart() {
        // Hub whose connections can be cut by the test.
        let (addr, local, shutdown) = serve_hub(None).await;
        let remote = WsBus::new(WsBusConfig::new(format!("ws://{}/bus", addr)));
        remote.connect().await.unwrap();
        let topic = "mcp-tunnel:t1:responses";
        let mut sub = remote.subscribe(topic).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Closes every hub connection; the listener stays up.
        shutdown.send(true).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.send(false).unwrap();

        // Wait for the client to come back (first backoff is 250ms).
        let mut delivered = None;
        for _ in 0..40 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if !remote.is_connected() {
                continue;
            }
            local.publish(topic, msg(4)).await.unwrap();
            if let Ok(got) = tokio::time::timeout(Duration::from_millis(100), sub.recv()).await {
                delivered = got;
                break;
            }
        }
        assert_eq!(delivered, Some(msg(4)));
        remote.close().await.unwrap();
    }
}

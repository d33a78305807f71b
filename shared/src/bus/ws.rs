//! WebSocket bus client.
//!
//! Connects to a relay's `/bus` hub and multiplexes every topic over one
//! socket. After the first successful connect, disconnects are retried in the
//! background with exponential backoff; live topics are re-subscribed and
//! publishes issued while offline are flushed once the socket is back.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::frame::{ClientFrame, HubFrame};
use super::{Fanout, MessageBus, Subscription, DEFAULT_CONNECT_TIMEOUT_MS};
use crate::protocol::BusMessage;
use crate::{Error, Result};

const INITIAL_BACKOFF: Duration = Duration::from_millis(250);
const MAX_BACKOFF: Duration = Duration::from_secs(10);

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone)]
pub struct WsBusConfig {
    /// Hub URL, e.g. `ws://relay:8080/bus`
    pub url: String,
    /// Sent as a bearer token on the upgrade request
    pub api_key: Option<String>,
    pub connect_timeout: Duration,
}

impl WsBusConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            api_key: None,
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
        }
    }

    pub fn with_api_key(mut self, key: Option<String>) -> Self {
        self.api_key = key;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

struct Shared {
    fanout: Fanout,
    connected: AtomicBool,
}

pub struct WsBus {
    config: WsBusConfig,
    shared: Arc<Shared>,
    outbound: mpsc::UnboundedSender<ClientFrame>,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<ClientFrame>>>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl WsBus {
    pub fn new(config: WsBusConfig) -> Self {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            shared: Arc::new(Shared {
                fanout: Fanout::new(),
                connected: AtomicBool::new(false),
            }),
            outbound,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            shutdown,
            task: Mutex::new(None),
        }
    }

    fn send_frame(&self, frame: ClientFrame) -> Result<()> {
        self.outbound
            .send(frame)
            .map_err(|_| Error::Bus("bus session closed".into()))
    }

    fn ensure_started(&self) -> Result<()> {
        if self.outbound.is_closed() || *self.shutdown.borrow() {
            return Err(Error::Bus("bus session closed".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl MessageBus for WsBus {
    async fn connect(&self) -> Result<()> {
        let mut rx_slot = self.outbound_rx.lock().await;
        let Some(outbound_rx) = rx_slot.take() else {
            return Err(Error::Connection("bus already connected".into()));
        };

        let socket = match open(&self.config).await {
            Ok(s) => s,
            Err(e) => {
                *rx_slot = Some(outbound_rx);
                return Err(e);
            }
        };
        info!(url = %self.config.url, "Connected to bus hub");
        self.shared.connected.store(true, Ordering::SeqCst);

        let task = tokio::spawn(supervise(
            self.config.clone(),
            self.shared.clone(),
            socket,
            outbound_rx,
            self.shutdown.subscribe(),
        ));
        *self.task.lock().await = Some(task);
        Ok(())
    }

    async fn publish(&self, topic: &str, message: BusMessage) -> Result<()> {
        self.ensure_started()?;
        if self.task.lock().await.is_none() {
            return Err(Error::Bus("not connected".into()));
        }
        self.send_frame(ClientFrame::Publish {
            topic: topic.to_string(),
            message,
        })
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription> {
        self.ensure_started()?;
        if self.task.lock().await.is_none() {
            return Err(Error::Bus("not connected".into()));
        }
        let (sub, first) = self.shared.fanout.add(topic);
        if first {
            self.send_frame(ClientFrame::Subscribe {
                topic: topic.to_string(),
            })?;
        }
        Ok(sub)
    }

    async fn close(&self) -> Result<()> {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.lock().await.take() {
            if let Err(e) = task.await {
                warn!("Bus task ended abnormally: {}", e);
            }
        }
        self.shared.connected.store(false, Ordering::SeqCst);
        self.shared.fanout.clear();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }
}

/// Open one socket within the configured timeout.
async fn open(config: &WsBusConfig) -> Result<Socket> {
    let mut request = config
        .url
        .as_str()
        .into_client_request()
        .map_err(|e| Error::Connection(format!("invalid bus url: {}", e)))?;
    if let Some(key) = &config.api_key {
        let value = HeaderValue::from_str(&format!("Bearer {}", key))
            .map_err(|e| Error::Connection(format!("invalid bus key: {}", e)))?;
        request.headers_mut().insert(AUTHORIZATION, value);
    }

    match tokio::time::timeout(config.connect_timeout, connect_async(request)).await {
        Ok(Ok((socket, _))) => Ok(socket),
        Ok(Err(e)) => Err(Error::Connection(e.to_string())),
        Err(_) => Err(Error::Connection(format!(
            "bus connection timeout after {}ms",
            config.connect_timeout.as_millis()
        ))),
    }
}

enum Exit {
    Disconnected,
    Shutdown,
}

/// Owns the socket for the lifetime of the bus, reconnecting as needed.
async fn supervise(
    config: WsBusConfig,
    shared: Arc<Shared>,
    mut socket: Socket,
    mut outbound: mpsc::UnboundedReceiver<ClientFrame>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut resubscribe = Vec::new();
    loop {
        match drive(&shared, socket, &resubscribe, &mut outbound, &mut shutdown).await {
            Exit::Shutdown => break,
            Exit::Disconnected => {
                shared.connected.store(false, Ordering::SeqCst);
                warn!(url = %config.url, "Bus connection lost, reconnecting");
            }
        }

        match reconnect(&config, &mut shutdown).await {
            Some(s) => {
                socket = s;
                shared.connected.store(true, Ordering::SeqCst);
                resubscribe = shared
                    .fanout
                    .topics()
                    .into_iter()
                    .map(|topic| ClientFrame::Subscribe { topic })
                    .collect();
                info!(topics = resubscribe.len(), "Reconnected to bus hub");
            }
            None => break,
        }
    }
    shared.connected.store(false, Ordering::SeqCst);
    debug!("Bus task stopped");
}

async fn reconnect(config: &WsBusConfig, shutdown: &mut watch::Receiver<bool>) -> Option<Socket> {
    let mut backoff = INITIAL_BACKOFF;
    loop {
        if *shutdown.borrow() {
            return None;
        }
        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = shutdown.changed() => return None,
        }
        match open(config).await {
            Ok(socket) => return Some(socket),
            Err(e) => {
                debug!("Bus reconnect failed: {}", e);
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }
    }
}

async fn drive(
    shared: &Shared,
    socket: Socket,
    resubscribe: &[ClientFrame],
    outbound: &mut mpsc::UnboundedReceiver<ClientFrame>,
    shutdown: &mut watch::Receiver<bool>,
) -> Exit {
    let (mut write, mut read) = socket.split();

    for frame in resubscribe {
        if send(&mut write, frame).await.is_err() {
            return Exit::Disconnected;
        }
    }

    loop {
        tokio::select! {
            frame = outbound.recv() => {
                let Some(frame) = frame else {
                    return Exit::Shutdown;
                };
                if let Err(e) = send(&mut write, &frame).await {
                    warn!("Bus send failed: {}", e);
                    return Exit::Disconnected;
                }
            }
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<HubFrame>(&text) {
                            Ok(HubFrame::Message { topic, message }) => {
                                if shared.fanout.deliver(&topic, &message) == 0 {
                                    let frame = ClientFrame::Unsubscribe { topic };
                                    if send(&mut write, &frame).await.is_err() {
                                        return Exit::Disconnected;
                                    }
                                }
                            }
                            Ok(HubFrame::Error { error }) => {
                                warn!("Bus hub error: {}", error);
                            }
                            Err(e) => {
                                warn!("Invalid frame from bus hub: {}", e);
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if write.send(Message::Pong(data)).await.is_err() {
                            return Exit::Disconnected;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return Exit::Disconnected,
                    Some(Err(e)) => {
                        warn!("Bus socket error: {}", e);
                        return Exit::Disconnected;
                    }
                    _ => {}
                }
            }
            _ = shutdown.changed() => {
                let _ = write.send(Message::Close(None)).await;
                return Exit::Shutdown;
            }
        }
    }
}

async fn send<S>(write: &mut S, frame: &ClientFrame) -> Result<()>
where
    S: futures_util::Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let text = serde_json::to_string(frame)?;
    write
        .send(Message::Text(text))
        .await
        .map_err(|e| Error::Bus(e.to_string()))
}

//! Message bus abstraction.
//!
//! The tunnel only needs four operations from a pub/sub transport: connect,
//! publish, subscribe and close. `MemoryBus` implements them in-process,
//! `WsBus` talks to a relay's bus hub over WebSocket.

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::protocol::BusMessage;
use crate::Result;

pub mod frame;
pub mod memory;
pub mod ws;

pub use memory::MemoryBus;
pub use ws::{WsBus, WsBusConfig};

/// Default bound on the initial bus connection
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;

#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Establish the session. Fails with `Error::Connection` if the bus is
    /// unreachable within the configured timeout.
    async fn connect(&self) -> Result<()>;

    /// Fire-and-forget publish to every current subscriber of `topic`.
    async fn publish(&self, topic: &str, message: BusMessage) -> Result<()>;

    /// Start receiving messages published on `topic`. Dropping the returned
    /// subscription unsubscribes.
    async fn subscribe(&self, topic: &str) -> Result<Subscription>;

    /// Release the session. Open subscriptions end.
    async fn close(&self) -> Result<()>;

    fn is_connected(&self) -> bool;
}

/// Stream of messages for one topic.
#[derive(Debug)]
pub struct Subscription {
    topic: String,
    rx: mpsc::UnboundedReceiver<BusMessage>,
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Next message, or `None` once the bus is closed.
    pub async fn recv(&mut self) -> Option<BusMessage> {
        self.rx.recv().await
    }
}

/// Topic → subscriber senders. Closed subscribers are pruned on delivery.
#[derive(Debug, Default)]
pub struct Fanout {
    topics: DashMap<String, Vec<mpsc::UnboundedSender<BusMessage>>>,
}

impl Fanout {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber. The flag is true when this is the first live
    /// subscriber for the topic.
    pub fn add(&self, topic: &str) -> (Subscription, bool) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subs = self.topics.entry(topic.to_string()).or_default();
        subs.retain(|s| !s.is_closed());
        let first = subs.is_empty();
        subs.push(tx);
        (
            Subscription {
                topic: topic.to_string(),
                rx,
            },
            first,
        )
    }

    /// Deliver to every live subscriber of `topic`; returns how many remain.
    /// A topic left without subscribers is forgotten.
    pub fn deliver(&self, topic: &str, message: &BusMessage) -> usize {
        let remaining = match self.topics.get_mut(topic) {
            Some(mut subs) => {
                subs.retain(|tx| tx.send(message.clone()).is_ok());
                subs.len()
            }
            None => return 0,
        };
        if remaining == 0 {
            self.topics.remove_if(topic, |_, subs| subs.is_empty());
        }
        remaining
    }

    /// Topics that still have at least one live subscriber.
    pub fn topics(&self) -> Vec<String> {
        self.topics
            .iter()
            .filter(|e| e.value().iter().any(|tx| !tx.is_closed()))
            .map(|e| e.key().clone())
            .collect()
    }

    /// Drop every subscriber, ending their streams.
    pub fn clear(&self) {
        self.topics.clear();
    }
}

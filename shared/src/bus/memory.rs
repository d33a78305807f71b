//! In-process bus.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tracing::debug;

use super::{Fanout, MessageBus, Subscription};
use crate::protocol::BusMessage;
use crate::{Error, Result};

/// Bus whose subscribers all live in this process.
#[derive(Debug, Default)]
pub struct MemoryBus {
    fanout: Fanout,
    connected: AtomicBool,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::Bus("not connected".into()))
        }
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn connect(&self) -> Result<()> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn publish(&self, topic: &str, message: BusMessage) -> Result<()> {
        self.ensure_connected()?;
        let delivered = self.fanout.deliver(topic, &message);
        debug!(topic, delivered, "memory bus publish");
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription> {
        self.ensure_connected()?;
        let (sub, _) = self.fanout.add(topic);
        Ok(sub)
    }

    async fn close(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        self.fanout.clear();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

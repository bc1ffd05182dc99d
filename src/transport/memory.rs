//! In-process pub/sub transport.
//!
//! A shared `MemoryBus` owns one `tokio::sync::broadcast` channel per topic.
//! Every `MemoryTransport` created from the same bus sees the same topics, so
//! several engines in one process can gossip without a broker. Publishers
//! receive their own messages, as they would from a Redis channel.
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::{MessageHandler, Subscription, Transport, TransportError, TransportStats};
use crate::error::BoxError;

const DEFAULT_CAPACITY: usize = 256;

/// Shared broker routing payloads between `MemoryTransport` clients
#[derive(Clone, Debug)]
pub struct MemoryBus {
    capacity: usize,
    topics: Arc<Mutex<HashMap<String, broadcast::Sender<Vec<u8>>>>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Messages a slow subscriber may fall behind by before it starts skipping
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            topics: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Create a new client attached to this bus
    pub fn client(&self) -> MemoryTransport {
        MemoryTransport {
            bus: self.clone(),
            connected: AtomicBool::new(false),
            stats: Arc::new(TransportStats::default()),
        }
    }

    /// Get or create the channel for a topic
    fn channel(&self, topic: &str) -> broadcast::Sender<Vec<u8>> {
        let mut topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
        topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    /// Number of live subscriptions on a topic
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(topic)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

/// One client of a `MemoryBus`
#[derive(Debug)]
pub struct MemoryTransport {
    bus: MemoryBus,
    connected: AtomicBool,
    stats: Arc<TransportStats>,
}

impl MemoryTransport {
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> Arc<TransportStats> {
        self.stats.clone()
    }

    fn ensure_connected(&self) -> Result<(), BoxError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(Box::new(TransportError::NotConnected))
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self) -> Result<(), BoxError> {
        self.connected.store(true, Ordering::Release);
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BoxError> {
        self.ensure_connected()?;
        // No subscribers yet is not a failure; the next broadcast will try again
        if self.bus.channel(topic).send(payload).is_ok() {
            self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        handler: MessageHandler,
    ) -> Result<Subscription, BoxError> {
        self.ensure_connected()?;
        let mut receiver = self.bus.channel(topic).subscribe();
        let stats = self.stats.clone();
        let topic_name = topic.to_string();

        let task = tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(payload) => {
                        stats.messages_received.fetch_add(1, Ordering::Relaxed);
                        handler(payload);
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        stats.messages_dropped.fetch_add(n, Ordering::Relaxed);
                        warn!(topic = %topic_name, lagged = n, "Memory transport subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!(topic = %topic_name, "Memory transport topic closed");
                        break;
                    }
                }
            }
        });

        Ok(Subscription::new(topic, task))
    }
}

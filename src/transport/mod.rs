//! Publish/subscribe transport used to exchange quota tables.
//!
//! The engine only needs three capabilities: connect, publish a payload to a
//! topic, and register a handler that is called for every payload arriving on
//! a topic. Handlers run on the transport's task and must return quickly.

pub mod memory;

use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::error::BoxError;
pub use memory::{MemoryBus, MemoryTransport};

/// Callback invoked once per inbound payload
pub type MessageHandler = Arc<dyn Fn(Vec<u8>) + Send + Sync>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport is not connected")]
    NotConnected,

    #[error("connection refused: {0}")]
    Refused(String),

    #[error("topic '{0}' is closed")]
    Closed(String),
}

/// Statistics for a transport client
#[derive(Debug, Default)]
pub struct TransportStats {
    pub messages_sent: AtomicU64,
    pub messages_received: AtomicU64,
    pub messages_dropped: AtomicU64,
}

/// Trait for the pub/sub client an engine broadcasts through
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish the connection; must succeed before publish or subscribe
    async fn connect(&self) -> Result<(), BoxError>;

    /// Publish `payload` to every subscriber of `topic`
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BoxError>;

    /// Call `handler` for every payload published to `topic` from now on
    async fn subscribe(&self, topic: &str, handler: MessageHandler)
        -> Result<Subscription, BoxError>;
}

/// Handle for an active subscription. Dropping it stops delivery.
#[derive(Debug)]
pub struct Subscription {
    topic: String,
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    pub fn new(topic: impl Into<String>, task: JoinHandle<()>) -> Self {
        Self {
            topic: topic.into(),
            task: Some(task),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn is_active(&self) -> bool {
        self.task
            .as_ref()
            .map(|task| !task.is_finished())
            .unwrap_or(false)
    }

    pub fn unsubscribe(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.stop();
    }
}

//! Publish/subscribe transport between message ingest and fan-out.

pub mod memory;
pub mod nsq;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

pub use memory::MemoryBroker;
pub use nsq::NsqBroker;

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("broker io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("broker returned error: {0}")]
    Remote(String),
    #[error("broker protocol violation: {0}")]
    Protocol(String),
    #[error("topic {0} is already subscribed by this process")]
    AlreadySubscribed(String),
}

/// Stream of payloads delivered for one topic.
/// Delivery is at-least-once; ordering holds only per publisher.
pub struct Subscription {
    rx: mpsc::Receiver<Bytes>,
}

impl Subscription {
    pub(crate) fn new(rx: mpsc::Receiver<Bytes>) -> Self {
        Self { rx }
    }

    /// Next payload, or `None` once the broker side has shut down.
    pub async fn next(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }
}

#[async_trait]
pub trait Broker: Send + Sync {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), BrokerError>;

    async fn subscribe(&self, topic: &str) -> Result<Subscription, BrokerError>;
}

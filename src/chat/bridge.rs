//! Broker round-trip: ingest publishes every forwarded event to one topic and
//! a single per-process subscription broadcasts whatever the broker delivers.
//! Senders see their own messages only through this path.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use serde_json::{Map, Value};
use tokio::task::JoinHandle;

use crate::broker::{Broker, BrokerError};
use crate::ws::ConnectionRegistry;

#[derive(Clone)]
pub struct BrokerBridge {
    broker: Arc<dyn Broker>,
    topic: Arc<str>,
    subscribed: Arc<AtomicBool>,
}

impl BrokerBridge {
    pub fn new(broker: Arc<dyn Broker>, topic: &str) -> Self {
        Self {
            broker,
            topic: Arc::from(topic),
            subscribed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Serialize and publish one event to the chat topic.
    pub async fn publish(&self, event: &Map<String, Value>) -> Result<(), BrokerError> {
        let payload = serde_json::to_vec(event)
            .map_err(|e| BrokerError::Protocol(format!("unserializable event: {}", e)))?;
        self.broker.publish(&self.topic, Bytes::from(payload)).await
    }

    /// Subscribe to the topic and spawn the fan-out task.
    /// Allowed once per bridge; a second call fails with `AlreadySubscribed`.
    pub async fn start_fanout(
        &self,
        registry: ConnectionRegistry,
    ) -> Result<JoinHandle<()>, BrokerError> {
        if self.subscribed.swap(true, Ordering::SeqCst) {
            return Err(BrokerError::AlreadySubscribed(self.topic.to_string()));
        }

        let mut subscription = match self.broker.subscribe(&self.topic).await {
            Ok(subscription) => subscription,
            Err(e) => {
                self.subscribed.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        let topic = self.topic.clone();
        tracing::info!(topic = %topic, "Broker fan-out subscribed");

        Ok(tokio::spawn(async move {
            while let Some(payload) = subscription.next().await {
                match serde_json::from_slice::<Value>(&payload) {
                    Ok(event) => {
                        let report = registry.broadcast(&event);
                        tracing::debug!(
                            topic = %topic,
                            attempted = report.attempted,
                            delivered = report.delivered,
                            "Broadcast broker message"
                        );
                    }
                    Err(e) => {
                        tracing::warn!(topic = %topic, error = %e, "Dropping undecodable broker payload");
                    }
                }
            }
            tracing::warn!(topic = %topic, "Broker subscription ended");
        }))
    }
}

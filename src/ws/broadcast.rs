use axum::extract::ws::Message;
use serde_json::Value;
use tokio::sync::mpsc::error::TrySendError;

use super::ConnectionRegistry;

/// Outcome of one broadcast: every member present when the lock was taken
/// got exactly one delivery attempt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub attempted: usize,
    pub delivered: usize,
}

impl BroadcastReport {
    pub fn dropped(&self) -> usize {
        self.attempted - self.delivered
    }
}

impl ConnectionRegistry {
    /// Serialize `event` once and broadcast it as a text frame.
    pub fn broadcast(&self, event: &Value) -> BroadcastReport {
        self.broadcast_message(Message::Text(event.to_string().into()))
    }

    /// Best-effort delivery of `msg` to every registered connection.
    ///
    /// The lock is held for the whole pass, but each attempt is a non-blocking
    /// `try_send` into the member's outbound queue, so a slow client costs one
    /// failed enqueue rather than a stalled broadcast. Full or closed queues are
    /// logged and skipped; the member stays registered.
    pub fn broadcast_message(&self, msg: Message) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        let members = self.lock();

        for (id, sender) in members.iter() {
            report.attempted += 1;
            match sender.try_send(msg.clone()) {
                Ok(()) => report.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    tracing::debug!(connection_id = %id, "Outbound queue full, dropping broadcast");
                }
                Err(TrySendError::Closed(_)) => {
                    tracing::debug!(connection_id = %id, "Connection closing, dropping broadcast");
                }
            }
        }

        report
    }
}

//! Per-connection handling of inbound frames: handshake, authorization gate,
//! enrichment and forwarding to the broker.

use serde_json::{Map, Value};

use crate::auth::Identity;
use crate::chat::messages;
use crate::state::AppState;
use crate::ws::handshake::Handshake;
use crate::ws::protocol::{self, ChatMessage, InboundEvent, ServerEvent, REASON_UNAUTHENTICATED};
use crate::ws::{ConnectionId, ConnectionSender};

pub struct MessageIngest {
    connection_id: ConnectionId,
    tx: ConnectionSender,
    handshake: Handshake,
    state: AppState,
}

impl MessageIngest {
    pub fn new(connection_id: ConnectionId, tx: ConnectionSender, state: AppState) -> Self {
        Self {
            connection_id,
            tx,
            handshake: Handshake::new(),
            state,
        }
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.handshake.identity()
    }

    /// Process one inbound frame.
    /// A decode error is a protocol error; the caller ends the connection.
    pub async fn handle_frame(&mut self, data: &[u8]) -> Result<(), serde_json::Error> {
        match protocol::decode_frame(data)? {
            InboundEvent::Auth { token } => self.authenticate(token.as_deref()).await,
            InboundEvent::Message(message) => self.accept_message(message).await,
            InboundEvent::Other(fields) => self.forward(fields).await,
        }
        Ok(())
    }

    async fn authenticate(&mut self, token: Option<&str>) {
        match self
            .handshake
            .authenticate(&self.state.identity, token)
            .await
        {
            Ok(identity) => {
                tracing::info!(
                    connection_id = %self.connection_id,
                    user_id = identity.id,
                    email = %identity.email,
                    "Connection authenticated"
                );
                protocol::send_event(&self.tx, &ServerEvent::AuthOk { user: &identity }).await;
            }
            Err(e) => {
                tracing::info!(connection_id = %self.connection_id, error = %e, "Handshake failed");
                protocol::send_event(&self.tx, &ServerEvent::AuthFail).await;
            }
        }
    }

    async fn accept_message(&mut self, mut message: ChatMessage) {
        let Some(identity) = self.handshake.identity() else {
            tracing::debug!(connection_id = %self.connection_id, "Rejected message before handshake");
            protocol::send_event(
                &self.tx,
                &ServerEvent::Error {
                    reason: REASON_UNAUTHENTICATED,
                },
            )
            .await;
            return;
        };

        // Persistence failure still forwards the event, unstamped.
        if let Err(e) =
            messages::persist_and_stamp(self.state.gateway.as_ref(), identity, &mut message).await
        {
            tracing::warn!(
                connection_id = %self.connection_id,
                user_id = identity.id,
                error = %e,
                "Failed to persist message, forwarding without id/ts/author"
            );
        }

        self.forward(message.into_fields()).await;
    }

    async fn forward(&self, fields: Map<String, Value>) {
        if let Err(e) = self.state.bridge.publish(&fields).await {
            tracing::warn!(
                connection_id = %self.connection_id,
                topic = %self.state.bridge.topic(),
                error = %e,
                "Failed to publish to broker"
            );
        }
    }
}

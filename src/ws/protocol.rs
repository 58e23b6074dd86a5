//! JSON wire format of the chat socket.
//!
//! Inbound frames are kept as free-form JSON objects so fields this server
//! does not interpret are forwarded to other clients untouched.

use axum::extract::ws::Message;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::auth::Identity;
use crate::db::models::{Attachment, Author};
use crate::ws::ConnectionSender;

/// A decoded inbound frame, classified by its `type` tag.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    /// `{"type":"auth","token":"..."}`; a missing or non-string token is `None`.
    Auth { token: Option<String> },
    /// `{"type":"message", ...}`
    Message(ChatMessage),
    /// Any other or missing `type`; forwarded as-is.
    Other(Map<String, Value>),
}

/// Decode one frame. Anything that is not a JSON object is a protocol error.
pub fn decode_frame(data: &[u8]) -> Result<InboundEvent, serde_json::Error> {
    let fields: Map<String, Value> = serde_json::from_slice(data)?;

    let event = match fields.get("type").and_then(Value::as_str) {
        Some("auth") => InboundEvent::Auth {
            token: fields
                .get("token")
                .and_then(Value::as_str)
                .map(str::to_string),
        },
        Some("message") => InboundEvent::Message(ChatMessage { fields }),
        _ => InboundEvent::Other(fields),
    };
    Ok(event)
}

/// An inbound `message` event plus whatever stamping it has received.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    fields: Map<String, Value>,
}

impl ChatMessage {
    pub fn text(&self) -> &str {
        self.fields
            .get("text")
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    /// Direct-message target; `to` takes precedence over `recipient`.
    /// `None` means the message is public.
    pub fn recipient(&self) -> Option<&str> {
        ["to", "recipient"]
            .iter()
            .find_map(|key| self.fields.get(*key).and_then(Value::as_str))
    }

    /// Attachment descriptors under `images`. Entries that are not objects are
    /// skipped; missing fields default to empty / zero.
    pub fn attachments(&self) -> Vec<Attachment> {
        let Some(images) = self.fields.get("images").and_then(Value::as_array) else {
            return Vec::new();
        };

        images
            .iter()
            .filter_map(Value::as_object)
            .map(|image| Attachment {
                url: string_field(image, "url"),
                filename: string_field(image, "filename"),
                filesize: image
                    .get("filesize")
                    .and_then(|v| v.as_i64().or_else(|| v.as_f64().map(|f| f as i64)))
                    .unwrap_or(0),
            })
            .collect()
    }

    /// Add the persisted `id`, store timestamp `ts` (epoch ms) and `author` snapshot.
    pub fn stamp(&mut self, id: i64, ts: i64, author: &Author) {
        self.fields.insert("id".to_string(), Value::from(id));
        self.fields.insert("ts".to_string(), Value::from(ts));
        self.fields.insert(
            "author".to_string(),
            serde_json::to_value(author).unwrap_or(Value::Null),
        );
    }

    pub fn is_stamped(&self) -> bool {
        self.fields.contains_key("id") && self.fields.contains_key("ts")
    }

    pub fn into_fields(self) -> Map<String, Value> {
        self.fields
    }
}

fn string_field(object: &Map<String, Value>, key: &str) -> String {
    object
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// Replies sent to the originating connection only.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent<'a> {
    AuthOk { user: &'a Identity },
    AuthFail,
    Error { reason: &'a str },
}

/// Reason sent when a `message` arrives before the handshake completed.
pub const REASON_UNAUTHENTICATED: &str = "unauthenticated";

impl ServerEvent<'_> {
    pub fn to_message(&self) -> Option<Message> {
        serde_json::to_string(self)
            .ok()
            .map(|json| Message::Text(json.into()))
    }
}

/// Queue a reply for the connection's writer task.
/// Waits for queue space; an error means the connection is already gone.
pub async fn send_event(tx: &ConnectionSender, event: &ServerEvent<'_>) {
    if let Some(msg) = event.to_message() {
        let _ = tx.send(msg).await;
    }
}

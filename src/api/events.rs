use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::api::models::Message;
use crate::error::SyncError;

pub const NEW_MESSAGE: &str = "new_message";
pub const MESSAGE_DELETED: &str = "message_deleted";
pub const USER_TYPING: &str = "user_typing";
pub const PRESENCE_UPDATED: &str = "presence_updated";

pub const SEND_MESSAGE: &str = "send_message";
pub const TYPING_START: &str = "typing_start";
pub const TYPING_STOP: &str = "typing_stop";

/// Inbound event names the engine listens for.
pub const INBOUND_EVENTS: [&str; 4] = [NEW_MESSAGE, MESSAGE_DELETED, USER_TYPING, PRESENCE_UPDATED];

/// One push frame, in either direction: `{"event": ..., "data": ...}`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct EventFrame {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct SendMessagePayload {
    pub conversation_id: String,
    pub text_content: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct TypingPayload {
    pub conversation_id: String,
    pub is_typing: bool,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct MessageDeleted {
    pub conversation_id: String,
    pub message_id: String,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct TypingUpdate {
    pub user_id: String,
    pub is_typing: bool,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct PresenceUpdate {
    pub user_id: String,
    pub is_online: bool,
}

/// Typed inbound push event.
#[derive(Debug, Clone, PartialEq)]
pub enum PushEvent {
    NewMessage(Message),
    MessageDeleted(MessageDeleted),
    Typing(TypingUpdate),
    Presence(PresenceUpdate),
}

impl PushEvent {
    /// Decode the payload of a named event. Unknown names and payloads missing
    /// required fields are reported as [`SyncError::MalformedEvent`].
    pub fn parse(event: &str, data: Value) -> Result<Self, SyncError> {
        let malformed = |e: serde_json::Error| SyncError::MalformedEvent {
            event: event.to_string(),
            reason: e.to_string(),
        };
        match event {
            NEW_MESSAGE => {
                // The server either nests the message under data.message or sends it bare.
                let nested = data
                    .get("data")
                    .and_then(|d| d.get("message"))
                    .cloned();
                let body = nested.unwrap_or(data);
                serde_json::from_value(body).map(PushEvent::NewMessage).map_err(malformed)
            }
            MESSAGE_DELETED => serde_json::from_value(data)
                .map(PushEvent::MessageDeleted)
                .map_err(malformed),
            USER_TYPING => serde_json::from_value(data).map(PushEvent::Typing).map_err(malformed),
            PRESENCE_UPDATED => serde_json::from_value(data)
                .map(PushEvent::Presence)
                .map_err(malformed),
            other => Err(SyncError::MalformedEvent {
                event: other.to_string(),
                reason: "unknown event".into(),
            }),
        }
    }
}

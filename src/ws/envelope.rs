//! The wire envelope exchanged with clients and relayed between instances,
//! plus the typed view of inbound events produced by validation.
//!
//! Clients send `{"event": "...", "data": {...}}` text frames. The router never
//! inspects the raw map after [`Envelope::into_event`]: handlers receive an
//! [`InboundEvent`] whose required fields are already present and typed.

use crate::ws::types::{GroupId, UserId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Open key/value payload carried by an envelope.
pub type Payload = Map<String, Value>;

/// Event names understood or produced by the router.
pub mod events {
    pub const SEND_PRIVATE_MESSAGE: &str = "send_private_message";
    pub const SEND_GROUP_MESSAGE: &str = "send_group_message";
    pub const USER_TYPING: &str = "user_typing";
    pub const MESSAGE_READ: &str = "message_read";
    pub const PING: &str = "ping";
    pub const PONG: &str = "pong";

    pub const PRIVATE_MESSAGE: &str = "private_message";
    pub const GROUP_MESSAGE: &str = "group_message";
    pub const MESSAGE_SENT: &str = "message_sent";
    pub const TYPING: &str = "typing";
    pub const USER_ONLINE_STATUS: &str = "user_online_status";
}

/// Reasons an inbound envelope is rejected before it reaches a handler.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("message event cannot be empty")]
    EmptyEvent,
    #[error("{event} must have {field}")]
    MissingField {
        event: &'static str,
        field: &'static str,
    },
    #[error("{event} has an invalid {field}")]
    InvalidField {
        event: &'static str,
        field: &'static str,
    },
    #[error("invalid conversation id {0:?}")]
    InvalidConversation(String),
    #[error("unknown event {0:?}")]
    UnknownEvent(String),
}

/// A single event as it travels over the socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub event: String,
    #[serde(default)]
    pub data: Payload,
}

impl Envelope {
    pub fn new(event: impl Into<String>, data: Payload) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    /// Parses a text frame. Only the JSON shape is checked here.
    pub fn decode(text: &str) -> Result<Self, EnvelopeError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Validates the per-event contract and converts into the typed event.
    pub fn into_event(self) -> Result<InboundEvent, EnvelopeError> {
        let Envelope { event, data } = self;
        match event.as_str() {
            "" => Err(EnvelopeError::EmptyEvent),
            events::SEND_PRIVATE_MESSAGE => {
                let ev = events::SEND_PRIVATE_MESSAGE;
                let receiver_id = required_id(&data, ev, "receiver_id")?;
                let message = OutgoingMessage::from_payload(ev, data)?;
                Ok(InboundEvent::PrivateMessage {
                    receiver_id,
                    message,
                })
            }
            events::SEND_GROUP_MESSAGE => {
                let ev = events::SEND_GROUP_MESSAGE;
                let group_id = required_id(&data, ev, "group_id")?;
                let message = OutgoingMessage::from_payload(ev, data)?;
                Ok(InboundEvent::GroupMessage { group_id, message })
            }
            events::USER_TYPING => {
                let ev = events::USER_TYPING;
                let raw = match data.get("conversation_id") {
                    None => {
                        return Err(EnvelopeError::MissingField {
                            event: ev,
                            field: "conversation_id",
                        });
                    }
                    Some(Value::String(s)) => s.clone(),
                    Some(_) => {
                        return Err(EnvelopeError::InvalidField {
                            event: ev,
                            field: "conversation_id",
                        });
                    }
                };
                let conversation = raw.parse()?;
                let is_typing = data
                    .get("is_typing")
                    .and_then(Value::as_bool)
                    .unwrap_or(true);
                Ok(InboundEvent::Typing(TypingSignal {
                    conversation_id: raw,
                    conversation,
                    is_typing,
                }))
            }
            events::MESSAGE_READ => Ok(InboundEvent::MessageRead {
                message_id: required_id(&data, events::MESSAGE_READ, "message_id")?,
            }),
            events::PING => Ok(InboundEvent::Ping),
            events::PONG => Ok(InboundEvent::Pong),
            _ => Err(EnvelopeError::UnknownEvent(event)),
        }
    }
}

/// An envelope as published on the broker. `origin` names the router
/// instance that already delivered it locally; publishers outside any router
/// leave it empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<Uuid>,
    pub event: String,
    #[serde(default)]
    pub data: Payload,
    #[serde(default)]
    pub timestamp: i64,
}

impl RelayEnvelope {
    pub fn new(origin: Option<Uuid>, envelope: Envelope) -> Self {
        Self {
            origin,
            event: envelope.event,
            data: envelope.data,
            timestamp: chrono::Utc::now().timestamp(),
        }
    }

    pub fn decode(text: &str) -> Result<Self, EnvelopeError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn into_envelope(self) -> Envelope {
        Envelope::new(self.event, self.data)
    }
}

/// Type tag of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    Text,
    File,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::File => "file",
        }
    }
}

/// The content half of a private or group send, with the original payload
/// kept so the router can echo it back enriched with storage ids.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMessage {
    pub content: String,
    pub kind: MessageKind,
    pub file_id: Option<u64>,
    pub payload: Payload,
}

impl OutgoingMessage {
    fn from_payload(event: &'static str, payload: Payload) -> Result<Self, EnvelopeError> {
        let content = match payload.get("content") {
            None => {
                return Err(EnvelopeError::MissingField {
                    event,
                    field: "content",
                });
            }
            Some(Value::String(s)) => s.clone(),
            Some(_) => {
                return Err(EnvelopeError::InvalidField {
                    event,
                    field: "content",
                });
            }
        };

        let kind = match payload.get("type") {
            None | Some(Value::Null) => MessageKind::Text,
            Some(Value::String(s)) if s.is_empty() => MessageKind::Text,
            Some(Value::String(s)) if s == "text" => MessageKind::Text,
            Some(Value::String(s)) if s == "file" => MessageKind::File,
            Some(_) => return Err(EnvelopeError::InvalidField { event, field: "type" }),
        };

        let file_id = payload.get("file_id").and_then(numeric_id).filter(|id| *id > 0);

        Ok(Self {
            content,
            kind,
            file_id,
            payload,
        })
    }
}

/// Scope of a typing signal, parsed from `private:<id>` or `group:<id>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationKey {
    /// The other participant of a one-to-one chat.
    Private(UserId),
    Group(GroupId),
}

impl ConversationKey {
    pub fn chat_type(&self) -> &'static str {
        match self {
            ConversationKey::Private(_) => "private",
            ConversationKey::Group(_) => "group",
        }
    }
}

impl FromStr for ConversationKey {
    type Err = EnvelopeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || EnvelopeError::InvalidConversation(s.to_string());
        let (scope, id) = s.split_once(':').ok_or_else(invalid)?;
        let id: u64 = id.parse().map_err(|_| invalid())?;
        match scope {
            "private" => Ok(ConversationKey::Private(id)),
            "group" => Ok(ConversationKey::Group(id)),
            _ => Err(invalid()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TypingSignal {
    /// The key as the client sent it; typing markers are stored under it.
    pub conversation_id: String,
    pub conversation: ConversationKey,
    pub is_typing: bool,
}

/// A validated inbound event.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    PrivateMessage {
        receiver_id: UserId,
        message: OutgoingMessage,
    },
    GroupMessage {
        group_id: GroupId,
        message: OutgoingMessage,
    },
    Typing(TypingSignal),
    MessageRead {
        message_id: u64,
    },
    Ping,
    Pong,
}

impl InboundEvent {
    pub fn name(&self) -> &'static str {
        match self {
            InboundEvent::PrivateMessage { .. } => events::SEND_PRIVATE_MESSAGE,
            InboundEvent::GroupMessage { .. } => events::SEND_GROUP_MESSAGE,
            InboundEvent::Typing(_) => events::USER_TYPING,
            InboundEvent::MessageRead { .. } => events::MESSAGE_READ,
            InboundEvent::Ping => events::PING,
            InboundEvent::Pong => events::PONG,
        }
    }
}

// JSON clients send numbers as doubles, so `2.0` is as good as `2`.
fn numeric_id(value: &Value) -> Option<u64> {
    value.as_u64().or_else(|| {
        value
            .as_f64()
            .filter(|f| *f >= 0.0 && f.fract() == 0.0 && *f <= u64::MAX as f64)
            .map(|f| f as u64)
    })
}

fn required_id(
    data: &Payload,
    event: &'static str,
    field: &'static str,
) -> Result<u64, EnvelopeError> {
    match data.get(field) {
        None => Err(EnvelopeError::MissingField { event, field }),
        Some(value) => numeric_id(value).ok_or(EnvelopeError::InvalidField { event, field }),
    }
}

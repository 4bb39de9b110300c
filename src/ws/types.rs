// chat-fanout/src/ws/types.rs

//! Identifiers and topic naming shared by the router, connections and the
//! presence store.

use std::fmt;
use uuid::Uuid;

/// A unique identifier for a single WebSocket connection.
pub type ConnectionId = Uuid;

/// Opaque identifier of a chat user.
pub type UserId = u64;

/// Opaque identifier of a chat group.
pub type GroupId = u64;

/// A pub/sub channel name.
pub type Topic = String;

/// Topic on which routers announce presence changes to each other.
pub const PRESENCE_TOPIC: &str = "ws:presence";

/// Per-user relay topic. Every connection of `user_id`, on any instance,
/// listens here.
pub fn user_topic(user_id: UserId) -> Topic {
    format!("ws:user:{user_id}")
}

/// The authenticated identity behind a connection, as produced by the token
/// validator before the socket is upgraded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: UserId,
    pub username: String,
}

impl Identity {
    pub fn new(user_id: UserId, username: impl Into<String>) -> Self {
        Self {
            user_id,
            username: username.into(),
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.user_id, self.username)
    }
}

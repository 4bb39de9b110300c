//! # Chat Fan-out
//!
//! The real-time core of a chat backend built on Axum WebSockets and Redis
//! Pub/Sub. One [`Router`](ws::router::Router) per instance owns the live
//! connections, validates and persists inbound chat events, and fans the
//! results out to local sockets and, through the presence relay, to sockets
//! held by other instances.
//!
//! ## Core Features
//!
//! - **Serialized routing**: registration and every inbound event run on one task per instance.
//! - **Bounded connections**: per-connection outbound queues that drop instead of blocking.
//! - **Presence and typing**: Redis keys with TTLs, or an in-memory store for tests.
//! - **Cross-instance relay**: per-user and presence topics over Redis Pub/Sub.
//! - **Authentication seam**: a `WsAuth` extractor backed by your own `TokenValidator`.
//!
//! ---

pub mod config;
pub mod ws;

// It will only be part of the crate if the "auth" feature is enabled.
#[cfg(feature = "auth")]
pub mod auth;

/// Public prelude for convenience.
///
/// `use chat_fanout::prelude::*;`
pub mod prelude {
    pub use crate::config::HubConfig;
    pub use crate::ws::{
        envelope::{Envelope, Payload, events},
        presence::{MemoryPresenceStore, PresenceStore, RedisPresenceStore},
        router::{Router, SendOutcome},
        store::{MemoryMessageStore, MessageStore},
        types::{Identity, UserId},
    };

    #[cfg(feature = "auth")]
    pub use crate::auth::{TokenValidator, WsAuth};

    #[cfg(feature = "auth")]
    pub use crate::ws::upgrade::upgrade_handler;
}

//! WebSocket chat core: envelopes, connections, the router and the presence
//! relay.
//!
//! A typical server builds one [`Router`](router::Router) per process,
//! sharing a [`PresenceStore`](presence::PresenceStore) with its peers, and
//! mounts [`upgrade_handler`](upgrade::upgrade_handler) behind
//! [`WsAuth`](crate::auth::WsAuth).

pub mod connection;
pub mod envelope;
pub mod presence;
pub mod router;
pub mod store;
pub mod types;

#[cfg(feature = "auth")]
pub mod upgrade;

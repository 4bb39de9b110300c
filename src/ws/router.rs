//! The [`Router`]: registry of live connections and the single serialized
//! task that handles every inbound event for this instance.
//!
//! Registration, unregistration and inbound dispatch all travel through one
//! FIFO command channel and are processed one at a time. Handlers await the
//! message store directly, so a slow database slows the whole instance's chat
//! traffic evenly instead of letting work pile up.
//!
//! Delivery to a user is local first (the connection's outbound queue, never
//! blocking) and then relayed on the user's topic so connections held by other
//! instances see it too. Relays carry this instance's id and are ignored by
//! its own connections.

use crate::config::HubConfig;
use crate::ws::connection::{ConnectionHandle, Enqueue};
use crate::ws::envelope::{
    ConversationKey, Envelope, InboundEvent, OutgoingMessage, Payload, RelayEnvelope,
    TypingSignal, events,
};
use crate::ws::presence::PresenceStore;
use crate::ws::store::{MessageStore, MessageTarget, NewMessage, SavedMessage};
use crate::ws::types::{GroupId, Identity, PRESENCE_TOPIC, UserId, user_topic};
use axum::extract::ws::Utf8Bytes;
use chrono::Utc;
use futures::FutureExt;
use futures_util::StreamExt;
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{RwLock, mpsc, watch};
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Returned when a command is sent to a router whose task has stopped.
#[derive(Debug, Error)]
#[error("router has shut down")]
pub struct RouterClosed;

/// What happened to a local send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Queued,
    /// The user has a local connection but its queue was full or closing.
    Dropped,
    /// No local connection for the user.
    Offline,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientInfo {
    pub user_id: UserId,
    pub username: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStats {
    pub total_connections: usize,
    pub clients: Vec<ClientInfo>,
}

pub(crate) enum RouterCommand {
    Register(ConnectionHandle),
    Unregister(ConnectionHandle),
    Inbound { sender: Identity, envelope: Envelope },
    #[cfg(test)]
    Flush(tokio::sync::oneshot::Sender<()>),
}

impl RouterCommand {
    fn label(&self) -> &'static str {
        match self {
            RouterCommand::Register(_) => "register",
            RouterCommand::Unregister(_) => "unregister",
            RouterCommand::Inbound { .. } => "inbound",
            #[cfg(test)]
            RouterCommand::Flush(_) => "flush",
        }
    }
}

pub struct Router {
    instance_id: Uuid,
    config: HubConfig,
    registry: RwLock<HashMap<UserId, ConnectionHandle>>,
    store: Arc<dyn MessageStore>,
    presence: Arc<dyn PresenceStore>,
    commands: mpsc::Sender<RouterCommand>,
    shutdown: watch::Sender<bool>,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("instance_id", &self.instance_id)
            .field("config", &self.config)
            .finish()
    }
}

impl Router {
    /// Creates a router and spawns its command task, the presence relay
    /// listener and the typing marker sweep.
    ///
    /// # Arguments
    /// * `config` - Queue sizes and timings.
    /// * `store` - Where chat messages are persisted and group members looked up.
    /// * `presence` - Shared presence state and the cross-instance relay.
    pub fn new(
        config: HubConfig,
        store: Arc<dyn MessageStore>,
        presence: Arc<dyn PresenceStore>,
    ) -> Arc<Self> {
        let (commands, command_rx) = mpsc::channel(config.inbound_capacity.max(1));
        let (shutdown, _) = watch::channel(false);

        let router = Arc::new(Self {
            instance_id: Uuid::new_v4(),
            config,
            registry: RwLock::new(HashMap::new()),
            store,
            presence,
            commands,
            shutdown,
        });

        info!(instance_id = %router.instance_id, "Spawning router tasks...");
        tokio::spawn(Arc::clone(&router).run(command_rx));
        tokio::spawn(Arc::clone(&router).run_presence_listener());
        tokio::spawn(Arc::clone(&router).run_typing_sweep());

        router
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn presence(&self) -> &Arc<dyn PresenceStore> {
        &self.presence
    }

    /// Stops the command task and the background listeners. Connections are
    /// not closed; their next dispatch fails and they tear down.
    pub fn shutdown(&self) {
        info!(instance_id = %self.instance_id, "Router shutting down.");
        self.shutdown.send_replace(true);
    }

    /// Queues `conn` for registration. Any connection already registered for
    /// the same user is replaced and told to stop.
    pub async fn register(&self, conn: ConnectionHandle) -> Result<(), RouterClosed> {
        self.send_command(RouterCommand::Register(conn)).await
    }

    /// Queues `conn` for removal. A no-op unless `conn` is the connection
    /// currently registered for its user.
    pub async fn unregister(&self, conn: ConnectionHandle) -> Result<(), RouterClosed> {
        self.send_command(RouterCommand::Unregister(conn)).await
    }

    /// Queues an inbound envelope from `sender`. Waits for room in the
    /// command channel, which keeps each connection's events in order.
    pub async fn dispatch(&self, sender: Identity, envelope: Envelope) -> Result<(), RouterClosed> {
        self.send_command(RouterCommand::Inbound { sender, envelope }).await
    }

    /// Waits until every command queued so far has been processed.
    #[cfg(test)]
    pub(crate) async fn flush(&self) {
        let (done, wait) = tokio::sync::oneshot::channel();
        if self.send_command(RouterCommand::Flush(done)).await.is_ok() {
            let _ = wait.await;
        }
    }

    async fn send_command(&self, command: RouterCommand) -> Result<(), RouterClosed> {
        if *self.shutdown.borrow() {
            return Err(RouterClosed);
        }
        self.commands.send(command).await.map_err(|_| RouterClosed)
    }

    /// Best-effort delivery to the user's connection on this instance. Never
    /// waits: a full queue drops the message.
    pub async fn send_to_user(&self, user_id: UserId, event: &str, data: Payload) -> SendOutcome {
        self.send_envelope(user_id, &Envelope::new(event, data)).await
    }

    /// Local delivery plus a relay on the user's topic for other instances.
    pub async fn deliver(&self, user_id: UserId, event: &str, data: Payload) -> SendOutcome {
        let envelope = Envelope::new(event, data);
        let outcome = self.send_envelope(user_id, &envelope).await;
        self.publish(&user_topic(user_id), envelope).await;
        outcome
    }

    /// Users with a connection on this instance, in ascending order.
    pub async fn online_users(&self) -> Vec<UserId> {
        let mut users: Vec<UserId> = self.registry.read().await.keys().copied().collect();
        users.sort_unstable();
        users
    }

    pub async fn connection_stats(&self) -> ConnectionStats {
        let registry = self.registry.read().await;
        let mut clients: Vec<ClientInfo> = registry
            .values()
            .map(|conn| ClientInfo {
                user_id: conn.user_id(),
                username: conn.identity().username.clone(),
            })
            .collect();
        clients.sort_by_key(|c| c.user_id);
        ConnectionStats {
            total_connections: registry.len(),
            clients,
        }
    }

    // --- Router task ---

    async fn run(self: Arc<Self>, mut commands: mpsc::Receiver<RouterCommand>) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            let command = tokio::select! {
                biased;
                _ = shutdown.wait_for(|stopped| *stopped) => break,
                command = commands.recv() => match command {
                    Some(command) => command,
                    None => break,
                },
            };

            let label = command.label();
            if AssertUnwindSafe(self.process(command))
                .catch_unwind()
                .await
                .is_err()
            {
                error!(command = label, "Router handler panicked, event dropped.");
            }
        }
        info!(instance_id = %self.instance_id, "Router task stopped.");
    }

    async fn process(&self, command: RouterCommand) {
        match command {
            RouterCommand::Register(conn) => self.handle_register(conn).await,
            RouterCommand::Unregister(conn) => self.handle_unregister(conn).await,
            RouterCommand::Inbound { sender, envelope } => {
                self.handle_inbound(sender, envelope).await
            }
            #[cfg(test)]
            RouterCommand::Flush(done) => {
                let _ = done.send(());
            }
        }
    }

    async fn handle_register(&self, conn: ConnectionHandle) {
        let identity = conn.identity().clone();
        let (replaced, total) = {
            let mut registry = self.registry.write().await;
            let replaced = registry.insert(identity.user_id, Arc::clone(&conn));
            (replaced, registry.len())
        };

        if let Some(old) = replaced.filter(|old| old.id() != conn.id()) {
            info!(user_id = identity.user_id, old_conn = %old.id(), "Evicting previous connection.");
            old.stop();
        }

        if let Err(e) = self.presence.set_present(identity.user_id).await {
            error!(user_id = identity.user_id, "Failed to set user online: {}", e);
        }

        info!(
            user_id = identity.user_id,
            username = %identity.username,
            total,
            "User connected."
        );
        self.announce_status(identity.user_id, true).await;
    }

    async fn handle_unregister(&self, conn: ConnectionHandle) {
        let user_id = conn.user_id();
        let remaining = {
            let mut registry = self.registry.write().await;
            let is_current = registry
                .get(&user_id)
                .is_some_and(|current| current.id() == conn.id());
            if is_current {
                registry.remove(&user_id);
                Some(registry.len())
            } else {
                None
            }
        };

        let Some(total) = remaining else {
            debug!(user_id, conn_id = %conn.id(), "Unregister ignored, not the registered connection.");
            return;
        };

        conn.close_outbound().await;
        conn.stop();

        if let Err(e) = self.presence.clear_present(user_id).await {
            error!(user_id, "Failed to set user offline: {}", e);
        }

        info!(
            user_id,
            username = %conn.identity().username,
            total,
            "User disconnected."
        );
        self.announce_status(user_id, false).await;
    }

    async fn handle_inbound(&self, sender: Identity, envelope: Envelope) {
        let event = match envelope.into_event() {
            Ok(event) => event,
            Err(e) => {
                error!(user_id = sender.user_id, "Invalid message from user: {}", e);
                return;
            }
        };
        debug!(user_id = sender.user_id, event = event.name(), "Dispatching inbound event.");

        match event {
            InboundEvent::PrivateMessage {
                receiver_id,
                message,
            } => self.handle_private_message(&sender, receiver_id, message).await,
            InboundEvent::GroupMessage { group_id, message } => {
                self.handle_group_message(&sender, group_id, message).await
            }
            InboundEvent::Typing(signal) => self.handle_typing(&sender, signal).await,
            InboundEvent::MessageRead { message_id } => {
                // Read state and the notification to the original sender
                // belong to the HTTP layer for now.
                info!(message_id, user_id = sender.user_id, "Message marked as read.");
            }
            InboundEvent::Ping => {
                debug!(user_id = sender.user_id, "Received ping, sending pong.");
                let mut data = Payload::new();
                data.insert("timestamp".into(), json!(Utc::now().to_rfc3339()));
                self.send_to_user(sender.user_id, events::PONG, data).await;
            }
            InboundEvent::Pong => debug!(user_id = sender.user_id, "Received pong."),
        }
    }

    async fn handle_private_message(
        &self,
        sender: &Identity,
        receiver_id: UserId,
        message: OutgoingMessage,
    ) {
        let new_message = NewMessage {
            sender_id: sender.user_id,
            target: MessageTarget::User(receiver_id),
            content: message.content,
            kind: message.kind,
            file_id: message.file_id,
        };
        let saved = match self.store.save_message(new_message).await {
            Ok(saved) => saved,
            Err(e) => {
                error!(
                    user_id = sender.user_id,
                    receiver_id, "Failed to save private message: {}", e
                );
                return;
            }
        };

        let payload = stamp_saved(message.payload, sender, &saved);
        self.deliver(receiver_id, events::PRIVATE_MESSAGE, payload.clone())
            .await;
        self.deliver(sender.user_id, events::MESSAGE_SENT, payload)
            .await;
        info!(
            message_id = saved.id,
            user_id = sender.user_id,
            receiver_id,
            "Private message saved and delivered."
        );
    }

    async fn handle_group_message(
        &self,
        sender: &Identity,
        group_id: GroupId,
        message: OutgoingMessage,
    ) {
        let new_message = NewMessage {
            sender_id: sender.user_id,
            target: MessageTarget::Group(group_id),
            content: message.content,
            kind: message.kind,
            file_id: message.file_id,
        };
        let saved = match self.store.save_message(new_message).await {
            Ok(saved) => saved,
            Err(e) => {
                error!(
                    user_id = sender.user_id,
                    group_id, "Failed to save group message: {}", e
                );
                return;
            }
        };

        let members = match self.store.group_members(group_id).await {
            Ok(members) => members,
            Err(e) => {
                error!(group_id, "Failed to get group members: {}", e);
                return;
            }
        };

        // The sender is a member and gets the broadcast like everyone else.
        let payload = stamp_saved(message.payload, sender, &saved);
        for member in &members {
            self.deliver(*member, events::GROUP_MESSAGE, payload.clone())
                .await;
        }
        info!(
            message_id = saved.id,
            group_id,
            recipients = members.len(),
            "Group message saved and broadcast."
        );
    }

    async fn handle_typing(&self, sender: &Identity, signal: TypingSignal) {
        let (chat_id, recipients) = match signal.conversation {
            // The recipient sees the chat keyed by who is typing.
            ConversationKey::Private(other) => (sender.user_id, vec![other]),
            ConversationKey::Group(group_id) => {
                let members = match self.store.group_members(group_id).await {
                    Ok(members) => members,
                    Err(e) => {
                        error!(group_id, "Failed to get group members for typing: {}", e);
                        return;
                    }
                };
                if !members.contains(&sender.user_id) {
                    warn!(user_id = sender.user_id, group_id, "Typing in a group the user is not in.");
                    return;
                }
                let others = members
                    .into_iter()
                    .filter(|member| *member != sender.user_id)
                    .collect();
                (group_id, others)
            }
        };

        if let Err(e) = self
            .presence
            .set_typing(sender.user_id, &signal.conversation_id)
            .await
        {
            warn!(user_id = sender.user_id, "Failed to set typing marker: {}", e);
        }

        let mut data = Payload::new();
        data.insert("user_id".into(), json!(sender.user_id));
        data.insert("username".into(), json!(sender.username));
        data.insert("is_typing".into(), json!(signal.is_typing));
        data.insert("chat_type".into(), json!(signal.conversation.chat_type()));
        data.insert("chat_id".into(), json!(chat_id));

        for recipient in recipients {
            self.deliver(recipient, events::TYPING, data.clone()).await;
        }
    }

    // --- Delivery helpers ---

    async fn send_envelope(&self, user_id: UserId, envelope: &Envelope) -> SendOutcome {
        let conn = self.registry.read().await.get(&user_id).cloned();
        let Some(conn) = conn else {
            debug!(user_id, event = %envelope.event, "No local connection for user.");
            return SendOutcome::Offline;
        };

        let frame = match envelope.encode() {
            Ok(frame) => Utf8Bytes::from(frame),
            Err(e) => {
                error!(user_id, "Failed to serialize envelope: {}", e);
                return SendOutcome::Dropped;
            }
        };

        match conn.try_enqueue(frame).await {
            Enqueue::Queued => SendOutcome::Queued,
            Enqueue::Full => {
                warn!(user_id, event = %envelope.event, "Client send queue full, dropping message.");
                SendOutcome::Dropped
            }
            Enqueue::Closed => {
                debug!(user_id, event = %envelope.event, "Client is closing, dropping message.");
                SendOutcome::Dropped
            }
        }
    }

    /// Pushes `envelope` to every local connection except `except`'s.
    async fn broadcast_local(&self, envelope: &Envelope, except: Option<UserId>) {
        let frame = match envelope.encode() {
            Ok(frame) => Utf8Bytes::from(frame),
            Err(e) => {
                error!("Failed to serialize broadcast: {}", e);
                return;
            }
        };
        let registry = self.registry.read().await;
        for (user_id, conn) in registry.iter() {
            if Some(*user_id) == except {
                continue;
            }
            if conn.try_enqueue(frame.clone()).await == Enqueue::Full {
                debug!(user_id, event = %envelope.event, "Client send queue full, skipping broadcast.");
            }
        }
    }

    async fn publish(&self, topic: &str, envelope: Envelope) {
        let relay = RelayEnvelope::new(Some(self.instance_id), envelope);
        let payload = match serde_json::to_string(&relay) {
            Ok(payload) => payload,
            Err(e) => {
                error!(%topic, "Failed to serialize relay message: {}", e);
                return;
            }
        };
        if let Err(e) = self.presence.publish(topic, payload).await {
            error!(%topic, event = %relay.event, "Failed to publish relay message: {}", e);
        }
    }

    async fn announce_status(&self, user_id: UserId, is_online: bool) {
        let mut data = Payload::new();
        data.insert("user_id".into(), json!(user_id));
        data.insert("is_online".into(), json!(is_online));
        if !is_online {
            data.insert("last_seen".into(), json!(Utc::now().to_rfc3339()));
        }
        let envelope = Envelope::new(events::USER_ONLINE_STATUS, data);
        self.broadcast_local(&envelope, Some(user_id)).await;
        self.publish(PRESENCE_TOPIC, envelope).await;
    }

    // --- Background listeners ---

    /// Forwards presence changes announced by other instances to local
    /// connections.
    async fn run_presence_listener(self: Arc<Self>) {
        let mut subscription = match self.presence.subscribe(PRESENCE_TOPIC).await {
            Ok(subscription) => subscription,
            Err(e) => {
                error!("Failed to subscribe to presence topic: {}", e);
                return;
            }
        };
        let mut shutdown = self.shutdown.subscribe();

        loop {
            let payload = tokio::select! {
                biased;
                _ = shutdown.wait_for(|stopped| *stopped) => break,
                payload = subscription.next() => match payload {
                    Some(payload) => payload,
                    None => {
                        warn!("Presence subscription ended.");
                        break;
                    }
                },
            };

            let relay = match RelayEnvelope::decode(&payload) {
                Ok(relay) => relay,
                Err(e) => {
                    warn!("Failed to decode presence message: {}", e);
                    continue;
                }
            };
            if relay.origin == Some(self.instance_id) {
                continue;
            }
            let subject = relay.data.get("user_id").and_then(Value::as_u64);
            self.broadcast_local(&relay.into_envelope(), subject).await;
        }
    }

    async fn run_typing_sweep(self: Arc<Self>) {
        let mut ticker = interval(self.config.typing_sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        let mut shutdown = self.shutdown.subscribe();

        loop {
            let stopped = tokio::select! {
                biased;
                _ = shutdown.wait_for(|stopped| *stopped) => true,
                _ = ticker.tick() => false,
            };
            if stopped {
                break;
            }

            match self.presence.sweep_expired_typing().await {
                Ok(0) => {}
                Ok(swept) => debug!(swept, "Swept expired typing markers."),
                Err(e) => error!("Failed to cleanup expired typing indicators: {}", e),
            }
        }
        debug!(instance_id = %self.instance_id, "Typing sweep stopped.");
    }
}

/// Merges the store's id and timestamps into an outbound payload.
fn stamp_saved(mut payload: Payload, sender: &Identity, saved: &SavedMessage) -> Payload {
    payload.insert("sender_id".into(), json!(sender.user_id));
    payload.insert("sender_username".into(), json!(sender.username));
    payload.insert("message_id".into(), json!(saved.id));
    payload.insert("created_at".into(), json!(saved.created_at));
    payload.insert("updated_at".into(), json!(saved.updated_at));
    payload
}

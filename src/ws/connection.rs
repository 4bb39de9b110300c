//! One live WebSocket and the three tasks that serve it.
//!
//! A connection is created after a successful authenticated upgrade and goes
//! through `Connecting → Registered → Active → Unregistering → Closed`:
//!
//! - the **reader** decodes client frames, stamps them with the connection's
//!   own identity and forwards them to the [`Router`];
//! - the **writer** drains the bounded outbound queue onto the socket and
//!   keeps the peer alive with pings;
//! - the **relay** forwards messages published on the user's topic by other
//!   instances into the outbound queue.
//!
//! Two independent signals shut things down. Closing the outbound queue tells
//! the writer there is no more data. The stop signal tears down the reader and
//! the relay. Both are idempotent and safe to raise from the reader's own
//! cleanup or from the router.

use crate::ws::envelope::{Envelope, RelayEnvelope};
use crate::ws::presence::Subscription;
use crate::ws::router::Router;
use crate::ws::types::{ConnectionId, Identity, UserId, user_topic};
use axum::body::Bytes;
use axum::extract::ws::{Message, Utf8Bytes, WebSocket};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde_json::json;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior, interval_at, timeout, timeout_at};
use tracing::{Instrument, debug, info, instrument, warn};
use uuid::Uuid;

/// Shared handle to a connection. The router's registry holds one, and so do
/// the connection's own tasks.
pub type ConnectionHandle = Arc<Connection>;

/// Result of pushing a frame onto a connection's outbound queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueue {
    Queued,
    /// The queue was full; the frame was dropped.
    Full,
    /// The queue has been closed; the connection is going away.
    Closed,
}

pub struct Connection {
    id: ConnectionId,
    identity: Identity,
    // `None` once closed. Dropping the only sender ends the writer.
    outbound: Mutex<Option<mpsc::Sender<Utf8Bytes>>>,
    stop: watch::Sender<bool>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("identity", &self.identity)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl Connection {
    /// Creates a connection with a bounded outbound queue and returns the
    /// receiving end for its writer.
    pub fn new(identity: Identity, capacity: usize) -> (ConnectionHandle, mpsc::Receiver<Utf8Bytes>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (stop, _) = watch::channel(false);
        let conn = Arc::new(Self {
            id: ConnectionId::new_v4(),
            identity,
            outbound: Mutex::new(Some(tx)),
            stop,
        });
        (conn, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn user_id(&self) -> UserId {
        self.identity.user_id
    }

    /// Pushes a frame without waiting. A full queue drops the frame.
    pub async fn try_enqueue(&self, frame: Utf8Bytes) -> Enqueue {
        let guard = self.outbound.lock().await;
        let Some(tx) = guard.as_ref() else {
            return Enqueue::Closed;
        };
        match tx.try_send(frame) {
            Ok(()) => Enqueue::Queued,
            Err(TrySendError::Full(_)) => Enqueue::Full,
            Err(TrySendError::Closed(_)) => Enqueue::Closed,
        }
    }

    /// Pushes a frame, waiting at most `wait` for room.
    pub async fn enqueue_timeout(&self, frame: Utf8Bytes, wait: Duration) -> Enqueue {
        let tx = match self.outbound.lock().await.as_ref() {
            Some(tx) => tx.clone(),
            None => return Enqueue::Closed,
        };
        match tx.send_timeout(frame, wait).await {
            Ok(()) => Enqueue::Queued,
            Err(SendTimeoutError::Timeout(_)) => Enqueue::Full,
            Err(SendTimeoutError::Closed(_)) => Enqueue::Closed,
        }
    }

    /// Closes the outbound queue. Frames already queued are still written.
    /// Returns `false` if it was already closed.
    pub async fn close_outbound(&self) -> bool {
        self.outbound.lock().await.take().is_some()
    }

    /// Raises the stop signal for the reader and the relay.
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop.borrow()
    }

    pub fn stop_signal(&self) -> watch::Receiver<bool> {
        self.stop.subscribe()
    }
}

/// Runs a freshly upgraded socket until it closes.
///
/// Subscribes the relay topic first so nothing published after registration
/// is missed, registers with the router, then reads in the calling task.
#[instrument(skip_all, fields(conn_id, user_id = identity.user_id))]
pub async fn serve(socket: WebSocket, identity: Identity, router: Arc<Router>) {
    let config = router.config();
    let (conn, outbound) = Connection::new(identity, config.send_queue_capacity);
    tracing::Span::current().record("conn_id", tracing::field::display(conn.id()));

    let (sink, stream) = socket.split();

    let topic = user_topic(conn.user_id());
    let relay = match router.presence().subscribe(&topic).await {
        Ok(subscription) => Some(tokio::spawn(
            relay_loop(
                Arc::clone(&conn),
                subscription,
                router.instance_id(),
                config.relay_enqueue_wait,
            )
            .in_current_span(),
        )),
        Err(e) => {
            warn!(%topic, "Failed to subscribe relay topic, continuing without it: {}", e);
            None
        }
    };

    if router.register(Arc::clone(&conn)).await.is_err() {
        warn!("Router has shut down, refusing connection.");
        conn.stop();
        return;
    }

    let writer = tokio::spawn(
        write_loop(
            Arc::clone(&conn),
            sink,
            outbound,
            config.write_wait,
            config.ping_period(),
        )
        .in_current_span(),
    );

    info!(username = %conn.identity().username, "Client connected.");
    read_loop(&conn, stream, &router, config.pong_wait).await;
    teardown(&conn, &router).await;

    let _ = writer.await;
    if let Some(relay) = relay {
        let _ = relay.await;
    }
    info!("Client connection closed.");
}

/// Leaves the router and releases the connection's resources. Every step is
/// idempotent, so racing with the router's own cleanup is harmless.
pub(crate) async fn teardown(conn: &ConnectionHandle, router: &Router) {
    if router.unregister(Arc::clone(conn)).await.is_err() {
        debug!("Router already gone during teardown.");
    }
    conn.close_outbound().await;
    conn.stop();
}

/// Reads client frames until error, close, keepalive expiry or stop.
///
/// The read deadline only moves forward when the peer answers a ping.
pub(crate) async fn read_loop<S, E>(
    conn: &Connection,
    mut stream: S,
    router: &Router,
    pong_wait: Duration,
) where
    S: Stream<Item = Result<Message, E>> + Unpin,
    E: fmt::Display,
{
    let mut stop = conn.stop_signal();
    let mut deadline = Instant::now() + pong_wait;

    loop {
        let next = tokio::select! {
            biased;
            _ = stop.wait_for(|stopped| *stopped) => {
                debug!("Stop signal received, leaving read loop.");
                break;
            }
            next = timeout_at(deadline, stream.next()) => next,
        };

        let msg = match next {
            Err(_) => {
                warn!("No pong within {:?}, closing connection.", pong_wait);
                break;
            }
            Ok(None) => {
                debug!("Client stream ended.");
                break;
            }
            Ok(Some(Err(e))) => {
                warn!("WebSocket read error: {}", e);
                break;
            }
            Ok(Some(Ok(msg))) => msg,
        };

        let decoded = match &msg {
            Message::Text(text) => Envelope::decode(text.as_str()),
            Message::Binary(bytes) => match std::str::from_utf8(bytes) {
                Ok(text) => Envelope::decode(text),
                Err(_) => {
                    debug!("Ignoring non UTF-8 binary frame.");
                    continue;
                }
            },
            Message::Pong(_) => {
                deadline = Instant::now() + pong_wait;
                continue;
            }
            Message::Ping(_) => continue,
            Message::Close(frame) => {
                debug!(?frame, "Received close frame from client.");
                break;
            }
        };

        let mut envelope = match decoded {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Failed to parse message from client: {}", e);
                continue;
            }
        };

        // The payload cannot claim to be someone else.
        envelope
            .data
            .insert("sender_id".to_string(), json!(conn.user_id()));
        envelope.data.insert(
            "sender_username".to_string(),
            json!(conn.identity().username),
        );

        debug!(event = %envelope.event, "Received message from client");
        if router.dispatch(conn.identity().clone(), envelope).await.is_err() {
            warn!("Router has shut down, closing connection.");
            break;
        }
    }
}

/// Drains the outbound queue onto the socket and pings an idle peer.
///
/// Ends when the queue is closed (after sending a close frame) or when a
/// write fails; either way it raises the stop signal on the way out.
pub(crate) async fn write_loop<S>(
    conn: ConnectionHandle,
    mut sink: S,
    mut outbound: mpsc::Receiver<Utf8Bytes>,
    write_wait: Duration,
    ping_period: Duration,
) where
    S: Sink<Message> + Unpin,
    S::Error: fmt::Display,
{
    let mut ticker = interval_at(Instant::now() + ping_period, ping_period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            frame = outbound.recv() => {
                let Some(first) = frame else {
                    debug!("Outbound queue closed, sending close frame.");
                    let _ = write_frame(&mut sink, Message::Close(None), write_wait).await;
                    break;
                };
                let batch = coalesce(first, &mut outbound);
                if let Err(reason) = write_frame(&mut sink, Message::Text(batch), write_wait).await {
                    warn!("Failed to write to client: {}", reason);
                    break;
                }
                ticker.reset();
            }
            _ = ticker.tick() => {
                if let Err(reason) = write_frame(&mut sink, Message::Ping(Bytes::new()), write_wait).await {
                    warn!("Failed to ping client: {}", reason);
                    break;
                }
            }
        }
    }

    conn.stop();
}

async fn write_frame<S>(sink: &mut S, msg: Message, wait: Duration) -> Result<(), String>
where
    S: Sink<Message> + Unpin,
    S::Error: fmt::Display,
{
    match timeout(wait, sink.send(msg)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err(format!("write deadline of {wait:?} elapsed")),
    }
}

/// Joins `first` with whatever was already queued behind it, one message per
/// line, so a burst goes out as a single frame.
fn coalesce(first: Utf8Bytes, outbound: &mut mpsc::Receiver<Utf8Bytes>) -> Utf8Bytes {
    let pending = outbound.len();
    if pending == 0 {
        return first;
    }
    let mut batch = String::from(first.as_str());
    for _ in 0..pending {
        match outbound.try_recv() {
            Ok(next) => {
                batch.push('\n');
                batch.push_str(next.as_str());
            }
            Err(_) => break,
        }
    }
    Utf8Bytes::from(batch)
}

/// Forwards messages published on the user's topic into the outbound queue.
///
/// Messages this instance published itself were already delivered locally and
/// are skipped. Ends on stop or when the subscription is lost; it never
/// resubscribes, a reconnecting client gets a fresh connection instead.
pub(crate) async fn relay_loop(
    conn: ConnectionHandle,
    mut subscription: Subscription,
    instance_id: Uuid,
    enqueue_wait: Duration,
) {
    let topic = user_topic(conn.user_id());
    let mut stop = conn.stop_signal();
    debug!(%topic, "Relay subscriber started.");

    loop {
        let payload = tokio::select! {
            biased;
            _ = stop.wait_for(|stopped| *stopped) => break,
            payload = subscription.next() => match payload {
                Some(payload) => payload,
                None => {
                    warn!(%topic, "Relay subscription ended.");
                    break;
                }
            },
        };

        let relay = match RelayEnvelope::decode(&payload) {
            Ok(relay) => relay,
            Err(e) => {
                warn!(%topic, "Failed to decode relayed message: {}", e);
                continue;
            }
        };
        if relay.origin == Some(instance_id) {
            continue;
        }

        let envelope = relay.into_envelope();
        let frame = match envelope.encode() {
            Ok(frame) => Utf8Bytes::from(frame),
            Err(e) => {
                warn!("Failed to encode relayed message: {}", e);
                continue;
            }
        };

        match conn.enqueue_timeout(frame, enqueue_wait).await {
            Enqueue::Queued => debug!(event = %envelope.event, "Relayed message to client."),
            Enqueue::Full => warn!(
                event = %envelope.event,
                "Client send queue timeout, dropping relayed message."
            ),
            Enqueue::Closed => break,
        }
    }

    debug!(%topic, "Relay subscriber stopped.");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HubConfig;
    use crate::ws::envelope::Payload;
    use crate::ws::presence::{MemoryPresenceStore, PresenceStore};
    use crate::ws::store::MemoryMessageStore;
    use futures::channel::mpsc as fmpsc;
    use once_cell::sync::Lazy;
    use serde_json::Value;

    static TRACING: Lazy<()> = Lazy::new(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .try_init();
    });

    fn frame(text: &str) -> Utf8Bytes {
        Utf8Bytes::from(text.to_string())
    }

    async fn next_frame(rx: &mut mpsc::Receiver<Utf8Bytes>) -> Envelope {
        let frame = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for a frame")
            .expect("queue closed");
        Envelope::decode(frame.as_str()).unwrap()
    }

    #[tokio::test]
    async fn queue_drops_when_full_and_refuses_once_closed() {
        let (conn, mut rx) = Connection::new(Identity::new(1, "ada"), 1);
        assert_eq!(conn.try_enqueue(frame("a")).await, Enqueue::Queued);
        assert_eq!(conn.try_enqueue(frame("b")).await, Enqueue::Full);
        assert_eq!(
            conn.enqueue_timeout(frame("c"), Duration::from_millis(20)).await,
            Enqueue::Full
        );

        assert!(conn.close_outbound().await);
        assert!(!conn.close_outbound().await);
        assert_eq!(conn.try_enqueue(frame("d")).await, Enqueue::Closed);

        assert_eq!(rx.recv().await.unwrap().as_str(), "a");
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn writer_coalesces_queued_frames_then_closes() {
        Lazy::force(&TRACING);
        let (conn, rx) = Connection::new(Identity::new(1, "ada"), 8);
        for text in ["a", "b", "c"] {
            conn.try_enqueue(frame(text)).await;
        }
        let (sink, mut socket) = fmpsc::unbounded::<Message>();
        let writer = tokio::spawn(write_loop(
            Arc::clone(&conn),
            sink,
            rx,
            Duration::from_secs(1),
            Duration::from_secs(60),
        ));

        match socket.next().await {
            Some(Message::Text(text)) => assert_eq!(text.as_str(), "a\nb\nc"),
            other => panic!("expected one coalesced text frame, got {other:?}"),
        }

        conn.close_outbound().await;
        assert!(matches!(socket.next().await, Some(Message::Close(None))));
        writer.await.unwrap();
        assert!(conn.is_stopped());
    }

    #[tokio::test(start_paused = true)]
    async fn writer_pings_an_idle_peer() {
        let (conn, rx) = Connection::new(Identity::new(1, "ada"), 8);
        let (sink, mut socket) = fmpsc::unbounded::<Message>();
        let _writer = tokio::spawn(write_loop(
            Arc::clone(&conn),
            sink,
            rx,
            Duration::from_secs(1),
            Duration::from_secs(5),
        ));

        assert!(matches!(socket.next().await, Some(Message::Ping(_))));
        assert!(!conn.is_stopped());
    }

    #[tokio::test]
    async fn failed_write_stops_the_connection() {
        let (conn, rx) = Connection::new(Identity::new(1, "ada"), 8);
        let (sink, socket) = fmpsc::unbounded::<Message>();
        drop(socket);
        let writer = tokio::spawn(write_loop(
            Arc::clone(&conn),
            sink,
            rx,
            Duration::from_secs(1),
            Duration::from_secs(60),
        ));

        conn.try_enqueue(frame("lost")).await;
        writer.await.unwrap();
        assert!(conn.is_stopped());
    }

    fn test_router() -> Arc<Router> {
        let presence = Arc::new(MemoryPresenceStore::new(Duration::from_secs(10)));
        let store = Arc::new(MemoryMessageStore::new());
        Router::new(HubConfig::default(), store, presence)
    }

    #[tokio::test]
    async fn reader_stamps_sender_identity() {
        Lazy::force(&TRACING);
        let store = Arc::new(MemoryMessageStore::new());
        store.add_user(8).await;
        let presence = Arc::new(MemoryPresenceStore::new(Duration::from_secs(10)));
        let router = Router::new(HubConfig::default(), store, presence);
        let (conn, mut rx) = Connection::new(Identity::new(7, "grace"), 8);
        router.register(Arc::clone(&conn)).await.unwrap();

        let (client, stream) = fmpsc::unbounded::<Result<Message, String>>();
        let spoofed = r#"{"event":"send_private_message","data":{"receiver_id":8,"content":"hi","sender_id":99,"sender_username":"mallory"}}"#;
        client.unbounded_send(Ok(Message::Text(frame("not json")))).unwrap();
        client.unbounded_send(Ok(Message::Text(frame(spoofed)))).unwrap();
        drop(client);

        read_loop(&conn, stream, &router, Duration::from_secs(60)).await;

        let sent = next_frame(&mut rx).await;
        assert_eq!(sent.event, "message_sent");
        assert_eq!(sent.data.get("sender_id"), Some(&Value::from(7)));
        assert_eq!(sent.data.get("sender_username"), Some(&Value::from("grace")));
    }

    #[tokio::test]
    async fn reader_exit_unregisters_and_releases_the_connection() {
        Lazy::force(&TRACING);
        let presence = Arc::new(MemoryPresenceStore::new(Duration::from_secs(10)));
        let router = Router::new(
            HubConfig::default(),
            Arc::new(MemoryMessageStore::new()),
            Arc::clone(&presence) as Arc<dyn PresenceStore>,
        );
        let (conn, mut rx) = Connection::new(Identity::new(7, "grace"), 8);
        router.register(Arc::clone(&conn)).await.unwrap();
        router.flush().await;
        assert_eq!(router.online_users().await, vec![7]);
        assert!(presence.is_present(7).await.unwrap());

        let (client, stream) = fmpsc::unbounded::<Result<Message, String>>();
        drop(client);
        read_loop(&conn, stream, &router, Duration::from_secs(60)).await;
        teardown(&conn, &router).await;
        router.flush().await;

        assert!(router.online_users().await.is_empty());
        assert!(!presence.is_present(7).await.unwrap());
        assert!(conn.is_stopped());
        assert_eq!(conn.try_enqueue(frame("late")).await, Enqueue::Closed);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn reader_exits_on_stop_signal() {
        let router = test_router();
        let (conn, _rx) = Connection::new(Identity::new(7, "grace"), 8);
        let (_client, stream) = fmpsc::unbounded::<Result<Message, String>>();

        conn.stop();
        tokio::time::timeout(
            Duration::from_secs(1),
            read_loop(&conn, stream, &router, Duration::from_secs(60)),
        )
        .await
        .expect("reader should leave promptly once stopped");
    }

    #[tokio::test(start_paused = true)]
    async fn reader_gives_up_on_a_silent_peer() {
        let router = test_router();
        let (conn, _rx) = Connection::new(Identity::new(7, "grace"), 8);
        let (_client, stream) = fmpsc::unbounded::<Result<Message, String>>();

        let started = Instant::now();
        read_loop(&conn, stream, &router, Duration::from_secs(60)).await;
        assert!(started.elapsed() >= Duration::from_secs(60));
    }

    #[tokio::test]
    async fn relay_skips_own_origin_and_forwards_others() {
        Lazy::force(&TRACING);
        let presence = MemoryPresenceStore::new(Duration::from_secs(10));
        let own = Uuid::new_v4();
        let (conn, mut rx) = Connection::new(Identity::new(2, "bob"), 8);
        let subscription = presence.subscribe(&user_topic(2)).await.unwrap();
        let relay = tokio::spawn(relay_loop(
            Arc::clone(&conn),
            subscription,
            own,
            Duration::from_millis(100),
        ));

        let mut data = Payload::new();
        data.insert("content".into(), Value::from("mine"));
        let mine = RelayEnvelope::new(Some(own), Envelope::new("private_message", data.clone()));
        data.insert("content".into(), Value::from("theirs"));
        let theirs =
            RelayEnvelope::new(Some(Uuid::new_v4()), Envelope::new("private_message", data));

        for relay in [mine, theirs] {
            presence
                .publish(&user_topic(2), serde_json::to_string(&relay).unwrap())
                .await
                .unwrap();
        }
        presence
            .publish(&user_topic(2), "garbage".to_string())
            .await
            .unwrap();

        let delivered = next_frame(&mut rx).await;
        assert_eq!(delivered.data.get("content"), Some(&Value::from("theirs")));

        conn.stop();
        relay.await.unwrap();
        assert!(rx.try_recv().is_err());
    }
}

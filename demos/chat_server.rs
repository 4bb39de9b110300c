use axum::{
    Json, Router as AxumRouter,
    extract::{State, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
};
use chat_fanout::prelude::*;
use chat_fanout::ws::router::ConnectionStats;
use std::{fmt, net::SocketAddr, sync::Arc};
use tracing::{info, warn};

// Tokens are "<user id>:<username>". A real deployment verifies a JWT here.

#[derive(Debug)]
struct AuthError(String);

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for AuthError {}

#[derive(Clone)]
struct ServerState {
    router: Arc<Router>,
}

#[async_trait::async_trait]
impl TokenValidator for ServerState {
    type Error = AuthError;

    async fn validate_token(&self, token: &str) -> Result<Identity, Self::Error> {
        let (id, username) = token
            .split_once(':')
            .ok_or_else(|| AuthError("expected <id>:<username>".to_string()))?;
        let user_id: UserId = id
            .parse()
            .map_err(|_| AuthError(format!("bad user id {id:?}")))?;
        if username.is_empty() {
            return Err(AuthError("empty username".to_string()));
        }
        Ok(Identity::new(user_id, username))
    }
}

async fn stats(State(state): State<ServerState>) -> Json<ConnectionStats> {
    Json(state.router.connection_stats().await)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("chat_server=info".parse()?)
                .add_directive("chat_fanout=info".parse()?),
        )
        .init();

    let config = HubConfig::from_env()?;

    let presence: Arc<dyn PresenceStore> =
        match RedisPresenceStore::connect(&config.redis_url, config.typing_ttl).await {
            Ok(store) => {
                info!(redis_url = %config.redis_url, "Connected to Redis presence store.");
                Arc::new(store)
            }
            Err(e) => {
                warn!("Redis unavailable ({}), running single-instance in memory.", e);
                Arc::new(MemoryPresenceStore::new(config.typing_ttl))
            }
        };

    let store = Arc::new(MemoryMessageStore::new());
    store.add_group(1, &[1, 2, 3]).await;

    let router = Router::new(config, store, presence);
    let state = ServerState {
        router: Arc::clone(&router),
    };

    let app = AxumRouter::new()
        .route(
            "/ws",
            get(
                |ws: WebSocketUpgrade,
                 State(state): State<ServerState>,
                 WsAuth(identity): WsAuth| async move {
                    upgrade_handler(ws, state.router, identity)
                },
            ),
        )
        .route("/stats", get(stats))
        .route("/health", get(|| async { "OK".into_response() }))
        .with_state(state);

    let addr = SocketAddr::from(([127, 0, 0, 1], 3000));
    info!("Listening on {}", addr);
    info!("Connect with: websocat 'ws://127.0.0.1:3000/ws?token=1:ada'");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    router.shutdown();
    Ok(())
}

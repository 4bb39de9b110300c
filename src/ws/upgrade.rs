//! The Axum handler that turns an authenticated HTTP request into a chat
//! connection.

use crate::ws::connection;
use crate::ws::router::Router;
use crate::ws::types::Identity;
use axum::{extract::ws::WebSocketUpgrade, response::Response};
use std::sync::Arc;
use tracing::{info, instrument};

/// Upgrades the request and hands the socket to [`connection::serve`].
///
/// Authentication has already happened by the time this runs; pair it with
/// [`WsAuth`](crate::auth::WsAuth) in the route.
///
/// ## Example Usage
///
/// ```rust,no_run
/// # use axum::{extract::{State, WebSocketUpgrade}, routing::get, Router as AxumRouter};
/// # use async_trait::async_trait;
/// # use chat_fanout::auth::{TokenValidator, WsAuth};
/// # use chat_fanout::ws::{router::Router, types::Identity, upgrade::upgrade_handler};
/// # use std::sync::Arc;
/// #[derive(Clone)]
/// struct AppState {
///     router: Arc<Router>,
/// }
///
/// # #[async_trait]
/// # impl TokenValidator for AppState {
/// #     type Error = std::io::Error;
/// #     async fn validate_token(&self, _t: &str) -> Result<Identity, Self::Error> {
/// #         Ok(Identity::new(1, "ada"))
/// #     }
/// # }
/// fn routes(state: AppState) -> AxumRouter {
///     AxumRouter::new()
///         .route(
///             "/ws",
///             get(
///                 |ws: WebSocketUpgrade,
///                  State(state): State<AppState>,
///                  WsAuth(identity): WsAuth| async move {
///                     upgrade_handler(ws, state.router, identity)
///                 },
///             ),
///         )
///         .with_state(state)
/// }
/// ```
#[instrument(skip_all, fields(user_id = identity.user_id))]
pub fn upgrade_handler(ws: WebSocketUpgrade, router: Arc<Router>, identity: Identity) -> Response {
    info!(username = %identity.username, "Upgrading chat connection.");
    ws.max_message_size(router.config().max_message_bytes)
        .on_upgrade(move |socket| connection::serve(socket, identity, router))
}

//! Authentication for the WebSocket entry point.
//!
//! Token issuance and verification live elsewhere. This module only finds the
//! token on the upgrade request and hands it to a [`TokenValidator`], which
//! turns it into the [`Identity`] the connection will carry.
//!
//! ## Example
//!
//! ```rust,no_run
//! # use async_trait::async_trait;
//! # use axum::{response::{IntoResponse, Response}, routing::get, Router};
//! # use chat_fanout::auth::{TokenValidator, WsAuth};
//! # use chat_fanout::ws::types::Identity;
//! #[derive(Clone)]
//! struct AppState;
//!
//! #[async_trait]
//! impl TokenValidator for AppState {
//!     type Error = std::io::Error;
//!
//!     async fn validate_token(&self, token: &str) -> Result<Identity, Self::Error> {
//! #       let _ = token;
//!         Ok(Identity::new(1, "ada"))
//!     }
//! }
//!
//! async fn whoami(WsAuth(identity): WsAuth) -> Response {
//!     identity.to_string().into_response()
//! }
//!
//! let app: Router<AppState> = Router::new().route("/whoami", get(whoami));
//! # let _: Router = app.with_state(AppState);
//! ```

use crate::ws::types::Identity;
use async_trait::async_trait;
use axum::{
    Json,
    extract::{FromRequestParts, Query},
    http::{HeaderMap, StatusCode, header::AUTHORIZATION, request::Parts},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

/// The seam between the chat core and whatever issues tokens.
///
/// Implemented on the Axum state so [`WsAuth`] can reach it.
#[async_trait]
pub trait TokenValidator {
    /// The error type returned on validation failure.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Validates a token string and returns the identity it was issued to.
    ///
    /// # Arguments
    /// * `token` - The token string extracted from the request.
    async fn validate_token(&self, token: &str) -> Result<Identity, Self::Error>;
}

/// Extractor for an authenticated [`Identity`].
///
/// Reads the token from the `token` query parameter, falling back to an
/// `Authorization: Bearer` header. Missing or invalid tokens are rejected with
/// `401 Unauthorized` and a JSON `{"error": ...}` body.
#[derive(Debug, Clone)]
pub struct WsAuth(pub Identity);

#[derive(Deserialize)]
struct WebSocketAuthQuery {
    token: Option<String>,
}

impl<S> FromRequestParts<S> for WsAuth
where
    S: TokenValidator + Send + Sync + 'static,
{
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let from_query = match Query::<WebSocketAuthQuery>::from_request_parts(parts, state).await {
            Ok(Query(q)) => q.token.filter(|t| !t.is_empty()),
            Err(_) => None,
        };

        let Some(token) = from_query.or_else(|| get_token_from_headers(&parts.headers)) else {
            return Err(unauthorized("Token required"));
        };

        match state.validate_token(&token).await {
            Ok(identity) => Ok(WsAuth(identity)),
            Err(e) => {
                warn!("Rejected WebSocket token: {}", e);
                Err(unauthorized("Invalid token"))
            }
        }
    }
}

fn unauthorized(reason: &str) -> Response {
    (StatusCode::UNAUTHORIZED, Json(json!({ "error": reason }))).into_response()
}

fn get_token_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get(AUTHORIZATION)
        .and_then(|header| header.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .filter(|token| !token.is_empty())
        .map(|token| token.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use axum::http::Request;
    use serde_json::Value;

    #[derive(Debug, thiserror::Error)]
    #[error("bad token")]
    struct BadToken;

    struct Tokens;

    #[async_trait]
    impl TokenValidator for Tokens {
        type Error = BadToken;

        async fn validate_token(&self, token: &str) -> Result<Identity, Self::Error> {
            match token {
                "good" => Ok(Identity::new(5, "eve")),
                "other" => Ok(Identity::new(6, "fay")),
                _ => Err(BadToken),
            }
        }
    }

    async fn extract(request: Request<()>) -> Result<WsAuth, Response> {
        let (mut parts, _) = request.into_parts();
        WsAuth::from_request_parts(&mut parts, &Tokens).await
    }

    async fn error_of(response: Response) -> Value {
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = to_bytes(response.into_body(), 1024).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn query_token_wins_over_header() {
        let request = Request::builder()
            .uri("/ws?token=good")
            .header(AUTHORIZATION, "Bearer other")
            .body(())
            .unwrap();
        let WsAuth(identity) = extract(request).await.unwrap();
        assert_eq!(identity, Identity::new(5, "eve"));
    }

    #[tokio::test]
    async fn bearer_header_is_the_fallback() {
        let request = Request::builder()
            .uri("/ws")
            .header(AUTHORIZATION, "Bearer other")
            .body(())
            .unwrap();
        let WsAuth(identity) = extract(request).await.unwrap();
        assert_eq!(identity.user_id, 6);
    }

    #[tokio::test]
    async fn missing_token_is_rejected() {
        let request = Request::builder().uri("/ws?token=").body(()).unwrap();
        let body = error_of(extract(request).await.unwrap_err()).await;
        assert_eq!(body, json!({ "error": "Token required" }));
    }

    #[tokio::test]
    async fn invalid_token_is_rejected() {
        let request = Request::builder()
            .uri("/ws")
            .header(AUTHORIZATION, "Bearer forged")
            .body(())
            .unwrap();
        let body = error_of(extract(request).await.unwrap_err()).await;
        assert_eq!(body, json!({ "error": "Invalid token" }));
    }
}

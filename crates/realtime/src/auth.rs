//! Authentication against the external auth service
//!
//! Tokens are never decoded locally: every WebSocket connect and REST call asks
//! the auth service (`GET /auth/validate`) who the bearer is, bounded by a timeout
//! so a dead auth service cannot wedge a connection task.

use async_trait::async_trait;
use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};
use serde::Deserialize;
use std::time::Duration;
use teamhub_shared::{ChatError, ChatResult, UserId};
use uuid::Uuid;

use crate::error::ApiError;
use crate::state::AppState;

/// Identity resolved from a bearer token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser {
    pub user_id: UserId,
    pub user_name: Option<String>,
}

/// Resolves bearer tokens to users
#[async_trait]
pub trait TokenValidator: Send + Sync {
    async fn validate(&self, token: &str) -> ChatResult<AuthUser>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ValidateResponse {
    user_id: Uuid,
    #[serde(default)]
    user_name: Option<String>,
}

/// [`TokenValidator`] calling the platform auth service over HTTP
#[derive(Clone)]
pub struct HttpTokenValidator {
    client: reqwest::Client,
    validate_url: String,
    timeout: Duration,
}

impl HttpTokenValidator {
    pub fn new(auth_service_url: &str, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            validate_url: format!("{}/auth/validate", auth_service_url.trim_end_matches('/')),
            timeout,
        })
    }
}

#[async_trait]
impl TokenValidator for HttpTokenValidator {
    async fn validate(&self, token: &str) -> ChatResult<AuthUser> {
        if token.is_empty() {
            return Err(ChatError::Auth("empty token".to_string()));
        }

        let request = self.client.get(&self.validate_url).bearer_auth(token).send();
        let response = match tokio::time::timeout(self.timeout, request).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) if e.is_timeout() => {
                return Err(ChatError::Auth("auth service timed out".to_string()))
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Auth service request failed");
                return Err(ChatError::Auth("auth service unreachable".to_string()));
            }
            Err(_) => return Err(ChatError::Auth("auth service timed out".to_string())),
        };

        match response.status() {
            StatusCode::OK => {
                let body: ValidateResponse = response.json().await.map_err(|e| {
                    tracing::warn!(error = %e, "Auth service returned an unreadable body");
                    ChatError::Auth("invalid auth service response".to_string())
                })?;
                Ok(AuthUser {
                    user_id: UserId(body.user_id),
                    user_name: body.user_name,
                })
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(ChatError::Auth("invalid or expired token".to_string()))
            }
            status => {
                tracing::warn!(status = %status, "Unexpected auth service status");
                Err(ChatError::Auth(format!("auth service returned {status}")))
            }
        }
    }
}

/// Extract a bearer token from the Authorization header
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Middleware resolving the bearer token into an [`AuthUser`] request extension
pub async fn require_auth(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = bearer_token(req.headers()).ok_or(ApiError::Unauthorized)?;
    let user = state.validator.validate(token).await?;

    req.extensions_mut().insert(user);
    Ok(next.run(req).await)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[tokio::test]
    async fn test_valid_token_resolves_user() {
        let mut server = mockito::Server::new_async().await;
        let user_id = Uuid::new_v4();
        let mock = server
            .mock("GET", "/auth/validate")
            .match_header("authorization", "Bearer good-token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(format!(r#"{{"userId":"{user_id}","userName":"Ada"}}"#))
            .create_async()
            .await;

        let validator = HttpTokenValidator::new(&server.url(), Duration::from_secs(2)).unwrap();
        let user = validator.validate("good-token").await.unwrap();

        assert_eq!(user.user_id, UserId(user_id));
        assert_eq!(user.user_name.as_deref(), Some("Ada"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_rejected_token_is_auth_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/auth/validate")
            .with_status(401)
            .create_async()
            .await;

        let validator = HttpTokenValidator::new(&server.url(), Duration::from_secs(2)).unwrap();
        let result = validator.validate("expired").await;

        assert!(matches!(result, Err(ChatError::Auth(_))));
    }

    #[tokio::test]
    async fn test_auth_service_error_is_auth_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/auth/validate")
            .with_status(503)
            .create_async()
            .await;

        let validator = HttpTokenValidator::new(&server.url(), Duration::from_secs(2)).unwrap();
        assert!(matches!(
            validator.validate("token").await,
            Err(ChatError::Auth(_))
        ));
    }

    #[tokio::test]
    async fn test_silent_auth_service_times_out() {
        // Accepts connections but never answers
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let validator =
            HttpTokenValidator::new(&format!("http://{addr}"), Duration::from_millis(100)).unwrap();
        let started = std::time::Instant::now();
        let result = validator.validate("token").await;

        assert!(matches!(result, Err(ChatError::Auth(_))));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_bearer_token_extraction() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        assert_eq!(bearer_token(&headers), Some("abc"));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(bearer_token(&headers), None);
    }
}

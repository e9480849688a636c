use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::Deserialize;

use super::token::AuthToken;
use crate::config::Config;
use crate::error::AuthError;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    token_type: Option<String>,
}

/// Exchanges the current token for a fresh one.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, token: &AuthToken) -> Result<AuthToken, AuthError>;
}

/// HTTP client for the backend's auth endpoints.
#[derive(Clone)]
pub struct AuthClient {
    http: Client,
    login_url: String,
    refresh_url: String,
}

impl AuthClient {
    pub fn new(login_url: impl Into<String>, refresh_url: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            login_url: login_url.into(),
            refresh_url: refresh_url.into(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.endpoint(config.login_path), config.endpoint(config.refresh_path))
    }

    /// OAuth2 password form login.
    pub async fn login(&self, login_id: &str, password: &str) -> Result<AuthToken, AuthError> {
        log::info!("Logging in as {} via {}", login_id, self.login_url);
        let response = self
            .http
            .post(&self.login_url)
            .form(&[("username", login_id), ("password", password)])
            .send()
            .await?;
        read_token(response).await
    }
}

#[async_trait]
impl TokenRefresher for AuthClient {
    async fn refresh(&self, token: &AuthToken) -> Result<AuthToken, AuthError> {
        log::debug!("Refreshing access token via {}", self.refresh_url);
        let response = self
            .http
            .post(&self.refresh_url)
            .bearer_auth(&token.value)
            .send()
            .await?;
        read_token(response).await
    }
}

async fn read_token(response: Response) -> Result<AuthToken, AuthError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(AuthError::Rejected {
            status: status.as_u16(),
            message: error_detail(&body),
        });
    }

    let body: TokenResponse = response.json().await?;
    if let Some(kind) = body.token_type.as_deref() {
        if !kind.eq_ignore_ascii_case("bearer") {
            log::warn!("Unexpected token_type: {}", kind);
        }
    }
    AuthToken::from_jwt(&body.access_token)
}

// FastAPI-style {"detail": "..."} bodies, otherwise the raw text.
fn error_detail(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("detail").and_then(|d| d.as_str()).map(str::to_string))
        .unwrap_or_else(|| body.trim().to_string())
}

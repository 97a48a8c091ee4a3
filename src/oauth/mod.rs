//! OAuth 2.0 client for the platform's identity endpoints.
//!
//! Implements the two grants the bridge needs:
//! 1. Authorization code → first token pair for a user
//! 2. Refresh token → rotated token pair (used by [`StoreTokenProvider`])
//!
//! [`StoreTokenProvider`]: crate::credentials::StoreTokenProvider

use crate::config::TwitchConfig;
use crate::credentials::{TokenPair, TokenRefresher};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use tracing::debug;

/// OAuth token response (standard OAuth 2.0)
#[derive(Deserialize, Debug)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

/// HTTP client for the token endpoint
pub struct OAuthClient {
    config: TwitchConfig,
    http_client: reqwest::Client,
}

impl OAuthClient {
    pub fn new(config: TwitchConfig) -> Self {
        Self {
            config,
            http_client: reqwest::Client::new(),
        }
    }

    /// Build the consent URL the user visits to authorize this application
    pub fn authorize_url(&self, state: &str) -> String {
        let scopes = self.config.scopes.join(" ");
        format!(
            "{}?client_id={}&redirect_uri={}&scope={}&state={}&response_type=code",
            self.config.authorize_url,
            urlencoding::encode(&self.config.client_id),
            urlencoding::encode(&self.config.redirect_uri),
            urlencoding::encode(&scopes),
            urlencoding::encode(state)
        )
    }

    /// Exchange an authorization code for the user's first token pair
    pub async fn exchange_code(&self, code: &str) -> Result<TokenPair> {
        let mut form = HashMap::new();
        form.insert("grant_type", "authorization_code");
        form.insert("code", code);
        form.insert("redirect_uri", self.config.redirect_uri.as_str());

        let response = self.request_token(form).await?;
        let refresh_token = response
            .refresh_token
            .ok_or_else(|| anyhow!("Token endpoint returned no refresh_token"))?;

        Ok(TokenPair {
            access_token: response.access_token,
            refresh_token,
        })
    }

    async fn request_token(&self, mut form: HashMap<&str, &str>) -> Result<TokenResponse> {
        form.insert("client_id", self.config.client_id.as_str());
        form.insert("client_secret", self.config.client_secret.as_str());

        debug!(
            grant_type = form.get("grant_type").copied().unwrap_or_default(),
            token_url = %self.config.token_url,
            "Requesting OAuth token"
        );

        let response = self
            .http_client
            .post(&self.config.token_url)
            .header("Accept", "application/json")
            .form(&form)
            .send()
            .await
            .context("Failed to send token request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<failed to read body>".to_string());
            return Err(anyhow!("Token request failed with status {}: {}", status, body));
        }

        let token_response: TokenResponse = response
            .json()
            .await
            .context("Failed to parse token response")?;

        debug!(
            has_refresh_token = token_response.refresh_token.is_some(),
            expires_in = ?token_response.expires_in,
            "Token request successful"
        );

        Ok(token_response)
    }
}

#[async_trait]
impl TokenRefresher for OAuthClient {
    async fn refresh(&self, refresh_token: &str) -> Result<TokenPair> {
        let mut form = HashMap::new();
        form.insert("grant_type", "refresh_token");
        form.insert("refresh_token", refresh_token);

        let response = self.request_token(form).await?;

        // Keep the existing refresh token if the provider did not rotate it
        Ok(TokenPair {
            access_token: response.access_token,
            refresh_token: response
                .refresh_token
                .unwrap_or_else(|| refresh_token.to_string()),
        })
    }
}

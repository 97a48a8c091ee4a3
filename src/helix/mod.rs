//! Authenticated client for the platform's REST API.

use crate::config::TwitchConfig;
use crate::credentials::TokenProvider;
use crate::eventsub::SubscriptionRequest;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use std::sync::Arc;
use tracing::{debug, info};

/// Creates EventSub subscriptions on behalf of the connection manager.
#[async_trait]
pub trait SubscriptionApi: Send + Sync {
    async fn create_subscription(&self, request: &SubscriptionRequest) -> Result<()>;
}

/// HTTP client for the Helix API.
///
/// Authenticates with the provider's bearer token and the application's
/// `Client-Id`. A `401` triggers one token refresh and one retry.
pub struct HelixClient {
    client_id: String,
    base_url: String,
    tokens: Arc<dyn TokenProvider>,
    http_client: Client,
}

impl HelixClient {
    pub fn new(config: &TwitchConfig, tokens: Arc<dyn TokenProvider>) -> Self {
        Self {
            client_id: config.client_id.clone(),
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            tokens,
            http_client: Client::new(),
        }
    }

    async fn post_subscription(&self, request: &SubscriptionRequest, token: &str) -> Result<Response> {
        let url = format!("{}/eventsub/subscriptions", self.base_url);
        self.http_client
            .post(&url)
            .header("Client-Id", &self.client_id)
            .bearer_auth(token)
            .json(request)
            .send()
            .await
            .context("Failed to send create subscription request")
    }
}

#[async_trait]
impl SubscriptionApi for HelixClient {
    async fn create_subscription(&self, request: &SubscriptionRequest) -> Result<()> {
        let token = self.tokens.get_access_token().await?;
        let mut response = self.post_subscription(request, &token).await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            info!(
                user_id = %self.tokens.user_id(),
                "Helix rejected access token, refreshing"
            );
            let token = self.tokens.refresh_access_token().await?;
            response = self.post_subscription(request, &token).await?;
        }

        check_response_status(response).await?;

        debug!(
            subscription_type = %request.kind,
            session_id = %request.transport.session_id,
            "Created EventSub subscription"
        );
        Ok(())
    }
}

async fn check_response_status(response: Response) -> Result<()> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "<failed to read body>".to_string());
    Err(anyhow!(
        "Create subscription failed with status {}: {}",
        status,
        body
    ))
}

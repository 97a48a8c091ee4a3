//! Access tokens for a single user, refreshed through OAuth on demand.

use super::{CredentialStore, Token, TokenPair};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

/// Source of bearer tokens for one user.
///
/// Implementations do not judge staleness themselves: a caller that gets an
/// authentication failure from an API calls [`refresh_access_token`] and
/// retries.
///
/// [`refresh_access_token`]: TokenProvider::refresh_access_token
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// The user these tokens belong to.
    fn user_id(&self) -> &str;

    /// The current access token.
    async fn get_access_token(&self) -> Result<Token>;

    /// Mints a new access token and returns it.
    async fn refresh_access_token(&self) -> Result<Token>;
}

/// OAuth refresh-token grant.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    /// Exchanges `refresh_token` for a new token pair.
    async fn refresh(&self, refresh_token: &str) -> Result<TokenPair>;
}

/// [`TokenProvider`] backed by a [`CredentialStore`] row.
///
/// A successful refresh is persisted before the new token is returned; a
/// failed refresh leaves the row untouched and returns the refresher's error
/// as is.
pub struct StoreTokenProvider {
    store: Arc<CredentialStore>,
    refresher: Arc<dyn TokenRefresher>,
    user_id: String,
    /// Serializes refreshes so a rotated refresh token is never presented twice.
    refresh_lock: Mutex<()>,
}

impl StoreTokenProvider {
    pub fn new(
        store: Arc<CredentialStore>,
        refresher: Arc<dyn TokenRefresher>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            refresher,
            user_id: user_id.into(),
            refresh_lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl TokenProvider for StoreTokenProvider {
    fn user_id(&self) -> &str {
        &self.user_id
    }

    async fn get_access_token(&self) -> Result<Token> {
        self.store.get_access_token(&self.user_id)
    }

    async fn refresh_access_token(&self) -> Result<Token> {
        let _guard = self.refresh_lock.lock().await;

        let refresh_token = self.store.get_refresh_token(&self.user_id)?;

        info!(user_id = %self.user_id, "Refreshing OAuth token");
        let pair = self.refresher.refresh(&refresh_token).await?;

        self.store
            .upsert(&self.user_id, &pair.access_token, &pair.refresh_token)
            .context("Failed to persist refreshed tokens")?;

        info!(user_id = %self.user_id, "OAuth token refreshed");
        Ok(pair.access_token)
    }
}

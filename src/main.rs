use anyhow::{Context, Result};
use eventsub_bridge::config::{load_config, BridgeConfig};
use eventsub_bridge::credentials::{CredentialStore, StoreTokenProvider};
use eventsub_bridge::eventsub::EventSubConnection;
use eventsub_bridge::helix::HelixClient;
use eventsub_bridge::oauth::OAuthClient;
use eventsub_bridge::Error;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use uuid::Uuid;

const DEFAULT_CONFIG_PATH: &str = "config.toml";

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "eventsub_bridge=info".into()),
        )
        .init();

    info!("EventSub bridge starting...");

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let config = if config_path.exists() {
        info!(path = %config_path.display(), "Loading configuration");
        load_config(&config_path)?.with_env()
    } else {
        info!(path = %config_path.display(), "No config file, using defaults and environment");
        BridgeConfig::from_env()
    };

    let user_id = config
        .twitch
        .user_id
        .clone()
        .context("twitch.user_id (or TWITCH_USER_ID) must be set")?;

    let store = Arc::new(CredentialStore::new(&config.authdb)?);
    let oauth = Arc::new(OAuthClient::new(config.twitch.clone()));

    if let Ok(code) = std::env::var("EVENTSUB_AUTH_CODE") {
        let pair = oauth.exchange_code(&code).await?;
        store.upsert(&user_id, &pair.access_token, &pair.refresh_token)?;
        info!(user_id = %user_id, "Stored credentials from authorization code");
    }

    match store.get_updated_at(&user_id) {
        Ok(updated_at) => {
            info!(user_id = %user_id, updated_at = %updated_at, "Using stored credentials")
        }
        Err(e) if Error::is_user_not_found(&e) => {
            let url = oauth.authorize_url(&Uuid::new_v4().to_string());
            warn!(
                user_id = %user_id,
                "No stored credentials; authorize at {} and rerun with EVENTSUB_AUTH_CODE set",
                url
            );
            return Ok(());
        }
        Err(e) => return Err(e),
    }

    let users = store.list_all_user_ids()?;
    info!(users = users.len(), db = %config.authdb.db.display(), "Credential store ready");

    let tokens = Arc::new(StoreTokenProvider::new(
        Arc::clone(&store),
        oauth,
        user_id,
    ));
    let helix = Arc::new(HelixClient::new(&config.twitch, tokens));

    let connection = EventSubConnection::new(config.eventsub.clone(), helix)
        .with_reconnect_policy(config.eventsub.reconnect.build());

    for subscription in &config.subscriptions {
        let condition = match &subscription.condition {
            Value::Null => json!({}),
            condition => condition.clone(),
        };
        connection.add_subscription(
            subscription.kind.as_str(),
            subscription.version.as_str(),
            condition,
        )?;
    }

    if connection.subscriptions().is_empty() {
        warn!("No subscriptions configured, nothing to do");
        return Ok(());
    }

    connection.start();

    let mut notifications = connection.subscribe_notifications();
    let forward = tokio::spawn(async move {
        loop {
            match notifications.recv().await {
                Ok(notification) => info!(
                    subscription_type = %notification.subscription_type,
                    message_id = %notification.message_id,
                    event = %notification.event,
                    "EventSub notification"
                ),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Notification log fell behind")
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;
    info!("Shutdown signal received");

    connection.stop().await;
    drop(connection);
    forward.abort();

    Ok(())
}

// Integration tests for the credential path: SQLite store → token provider →
// OAuth refresh → Helix retry, against mockito endpoints.

use eventsub_bridge::config::{AuthDbConfig, TwitchConfig};
use eventsub_bridge::credentials::{CredentialStore, StoreTokenProvider, TokenProvider};
use eventsub_bridge::eventsub::{Subscription, SubscriptionRequest};
use eventsub_bridge::helix::{HelixClient, SubscriptionApi};
use eventsub_bridge::oauth::OAuthClient;
use eventsub_bridge::Error;
use mockito::Matcher;
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;

fn twitch_config(server_url: &str) -> TwitchConfig {
    TwitchConfig {
        client_id: "client-id".to_string(),
        client_secret: "client-secret".to_string(),
        user_id: Some("1234".to_string()),
        token_url: format!("{}/oauth2/token", server_url),
        api_base_url: format!("{}/helix", server_url),
        ..TwitchConfig::default()
    }
}

fn open_store(dir: &TempDir) -> Arc<CredentialStore> {
    let config = AuthDbConfig {
        db: dir.path().join("authdb.sqlite3"),
    };
    Arc::new(CredentialStore::new(&config).unwrap())
}

fn request() -> SubscriptionRequest {
    let subscription = Subscription::new(
        "channel.channel_points_custom_reward_redemption.add",
        "1",
        json!({ "broadcaster_user_id": "1234" }),
    );
    SubscriptionRequest::new(&subscription, "S1")
}

#[tokio::test]
async fn test_expired_token_is_refreshed_persisted_and_retried() {
    let mut server = mockito::Server::new_async().await;
    let rejected = server
        .mock("POST", "/helix/eventsub/subscriptions")
        .match_header("authorization", "Bearer expired-access")
        .with_status(401)
        .with_body(r#"{"error":"Unauthorized","status":401,"message":"Invalid OAuth token"}"#)
        .expect(1)
        .create_async()
        .await;
    let refresh = server
        .mock("POST", "/oauth2/token")
        .match_body(Matcher::AllOf(vec![
            Matcher::UrlEncoded("grant_type".into(), "refresh_token".into()),
            Matcher::UrlEncoded("refresh_token".into(), "refresh-0".into()),
        ]))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"access_token":"access-1","refresh_token":"refresh-1","expires_in":14400}"#)
        .expect(1)
        .create_async()
        .await;
    let accepted = server
        .mock("POST", "/helix/eventsub/subscriptions")
        .match_header("authorization", "Bearer access-1")
        .match_header("client-id", "client-id")
        .with_status(202)
        .expect(1)
        .create_async()
        .await;

    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    store.upsert("1234", "expired-access", "refresh-0").unwrap();
    let created_at = store.get_created_at("1234").unwrap();
    let updated_at = store.get_updated_at("1234").unwrap();

    let config = twitch_config(&server.url());
    let oauth = Arc::new(OAuthClient::new(config.clone()));
    let tokens = Arc::new(StoreTokenProvider::new(Arc::clone(&store), oauth, "1234"));
    let helix = HelixClient::new(&config, tokens.clone());

    helix.create_subscription(&request()).await.unwrap();

    rejected.assert_async().await;
    refresh.assert_async().await;
    accepted.assert_async().await;

    // Rotated pair is durable
    drop(helix);
    drop(tokens);
    drop(store);
    let store = open_store(&dir);
    let pair = store.get_token_pair("1234").unwrap();
    assert_eq!(pair.access_token, "access-1");
    assert_eq!(pair.refresh_token, "refresh-1");
    assert_eq!(store.get_created_at("1234").unwrap(), created_at);
    assert!(store.get_updated_at("1234").unwrap() > updated_at);
}

#[tokio::test]
async fn test_failed_refresh_leaves_credentials_untouched() {
    let mut server = mockito::Server::new_async().await;
    let _rejected = server
        .mock("POST", "/helix/eventsub/subscriptions")
        .with_status(401)
        .create_async()
        .await;
    let _refresh = server
        .mock("POST", "/oauth2/token")
        .with_status(400)
        .with_body(r#"{"status":400,"message":"Invalid refresh token"}"#)
        .create_async()
        .await;

    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    store.upsert("1234", "expired-access", "revoked-refresh").unwrap();
    let updated_at = store.get_updated_at("1234").unwrap();

    let config = twitch_config(&server.url());
    let oauth = Arc::new(OAuthClient::new(config.clone()));
    let tokens = Arc::new(StoreTokenProvider::new(Arc::clone(&store), oauth, "1234"));
    let helix = HelixClient::new(&config, tokens);

    let err = helix.create_subscription(&request()).await.unwrap_err();
    assert!(err.to_string().contains("Invalid refresh token"));

    let pair = store.get_token_pair("1234").unwrap();
    assert_eq!(pair.access_token, "expired-access");
    assert_eq!(pair.refresh_token, "revoked-refresh");
    assert_eq!(store.get_updated_at("1234").unwrap(), updated_at);
}

#[tokio::test]
async fn test_provider_for_unknown_user() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let oauth = Arc::new(OAuthClient::new(TwitchConfig::default()));
    let tokens = StoreTokenProvider::new(store, oauth, "nobody");

    let err = tokens.get_access_token().await.unwrap_err();
    assert!(Error::is_user_not_found(&err));

    // Refresh fails before any HTTP call is made
    let err = tokens.refresh_access_token().await.unwrap_err();
    assert!(Error::is_user_not_found(&err));
}

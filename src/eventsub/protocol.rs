use crate::error::Error;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_tungstenite::tungstenite::Message;

pub const SESSION_WELCOME: &str = "session_welcome";
pub const SESSION_KEEPALIVE: &str = "session_keepalive";
pub const SESSION_RECONNECT: &str = "session_reconnect";
pub const NOTIFICATION: &str = "notification";
pub const REVOCATION: &str = "revocation";

/// Which events to receive: `(type, version, condition)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    #[serde(rename = "type")]
    pub kind: String,
    pub version: String,
    pub condition: Value,
}

impl Subscription {
    pub fn new(kind: impl Into<String>, version: impl Into<String>, condition: Value) -> Self {
        Self {
            kind: kind.into(),
            version: version.into(),
            condition,
        }
    }
}

/// Body of a "create EventSub subscription" API call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubscriptionRequest {
    #[serde(rename = "type")]
    pub kind: String,
    pub version: String,
    pub condition: Value,
    pub transport: Transport,
}

impl SubscriptionRequest {
    /// Request delivery of `subscription` over the websocket session `session_id`.
    pub fn new(subscription: &Subscription, session_id: &str) -> Self {
        Self {
            kind: subscription.kind.clone(),
            version: subscription.version.clone(),
            condition: subscription.condition.clone(),
            transport: Transport::websocket(session_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Transport {
    pub method: String,
    pub session_id: String,
}

impl Transport {
    pub fn websocket(session_id: &str) -> Self {
        Self {
            method: "websocket".to_string(),
            session_id: session_id.to_string(),
        }
    }
}

/// Inbound EventSub frame
#[derive(Debug, Clone, Deserialize)]
pub struct EventSubMessage {
    pub metadata: Metadata,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Metadata {
    #[serde(default)]
    pub message_id: String,
    pub message_type: String,
    #[serde(default)]
    pub message_timestamp: String,
}

/// Event delivered for one of the registered subscriptions
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub message_id: String,
    pub subscription_type: String,
    pub event: Value,
}

impl EventSubMessage {
    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text).context("Failed to decode EventSub message")
    }

    pub fn message_type(&self) -> &str {
        &self.metadata.message_type
    }

    /// `payload.session.id`, present on welcome and reconnect messages
    pub fn session_id(&self) -> Option<&str> {
        self.payload.pointer("/session/id").and_then(Value::as_str)
    }

    /// `payload.subscription.type`, present on notifications and revocations
    pub fn subscription_type(&self) -> Option<&str> {
        self.payload
            .pointer("/subscription/type")
            .and_then(Value::as_str)
    }

    pub fn notification(&self) -> Option<Notification> {
        if self.message_type() != NOTIFICATION {
            return None;
        }
        Some(Notification {
            message_id: self.metadata.message_id.clone(),
            subscription_type: self.subscription_type()?.to_string(),
            event: self.payload.get("event").cloned().unwrap_or(Value::Null),
        })
    }
}

/// Decode one websocket frame.
///
/// Text frames must hold an EventSub JSON object. Binary frames are a
/// protocol violation. Control frames carry no message and yield `None`.
pub fn decode(message: Message) -> Result<Option<EventSubMessage>> {
    match message {
        Message::Text(text) => EventSubMessage::parse(&text).map(Some),
        Message::Binary(data) => {
            Err(Error::UnsupportedMessageType(format!("binary frame ({} bytes)", data.len())).into())
        }
        Message::Ping(_) | Message::Pong(_) | Message::Close(_) | Message::Frame(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn welcome_text() -> String {
        json!({
            "metadata": {
                "message_id": "96a3f3b5-5dec-4eed-908e-e11ee657416c",
                "message_type": "session_welcome",
                "message_timestamp": "2023-07-19T14:56:51.634234626Z"
            },
            "payload": {
                "session": {
                    "id": "AQoQILE98gtqShGmLD7AM6yJThAB",
                    "status": "connected",
                    "connected_at": "2023-07-19T14:56:51.616329898Z",
                    "keepalive_timeout_seconds": 10,
                    "reconnect_url": null
                }
            }
        })
        .to_string()
    }

    #[test]
    fn test_decode_welcome() {
        let message = decode(Message::Text(welcome_text())).unwrap().unwrap();

        assert_eq!(message.message_type(), SESSION_WELCOME);
        assert_eq!(message.session_id(), Some("AQoQILE98gtqShGmLD7AM6yJThAB"));
        assert!(message.notification().is_none());
    }

    #[test]
    fn test_decode_notification() {
        let text = json!({
            "metadata": {
                "message_id": "befa7b53-d79d-478f-86b9-120f112b044e",
                "message_type": "notification",
                "message_timestamp": "2022-11-16T10:11:12.464757833Z",
                "subscription_type": "channel.follow",
                "subscription_version": "1"
            },
            "payload": {
                "subscription": {
                    "id": "f1c2a387-161a-49f9-a165-0f21d7a4e1c4",
                    "type": "channel.follow",
                    "version": "1",
                    "condition": { "broadcaster_user_id": "12826" }
                },
                "event": { "user_id": "1337", "user_login": "awesome_user" }
            }
        })
        .to_string();

        let message = decode(Message::Text(text)).unwrap().unwrap();
        let notification = message.notification().unwrap();

        assert_eq!(notification.subscription_type, "channel.follow");
        assert_eq!(notification.message_id, "befa7b53-d79d-478f-86b9-120f112b044e");
        assert_eq!(notification.event["user_login"], "awesome_user");
        assert!(message.session_id().is_none());
    }

    #[test]
    fn test_decode_binary_is_unsupported() {
        let err = decode(Message::Binary(vec![1, 2, 3])).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::UnsupportedMessageType(_))
        ));
    }

    #[test]
    fn test_decode_control_frames() {
        assert!(decode(Message::Ping(vec![])).unwrap().is_none());
        assert!(decode(Message::Pong(vec![])).unwrap().is_none());
        assert!(decode(Message::Close(None)).unwrap().is_none());
    }

    #[test]
    fn test_decode_malformed() {
        assert!(decode(Message::Text("not json".to_string())).is_err());
        // Valid JSON, but not an EventSub message
        assert!(decode(Message::Text(r#"{"payload":{}}"#.to_string())).is_err());
        assert!(decode(Message::Text("[1,2,3]".to_string())).is_err());
    }

    #[test]
    fn test_subscription_request_body() {
        let subscription = Subscription::new(
            "channel.channel_points_custom_reward_redemption.add",
            "1",
            json!({ "broadcaster_user_id": "1234" }),
        );

        let body = serde_json::to_value(SubscriptionRequest::new(&subscription, "S1")).unwrap();

        assert_eq!(
            body,
            json!({
                "type": "channel.channel_points_custom_reward_redemption.add",
                "version": "1",
                "condition": { "broadcaster_user_id": "1234" },
                "transport": { "method": "websocket", "session_id": "S1" }
            })
        );
    }
}

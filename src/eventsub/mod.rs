// EventSub websocket connection management

mod connection;
pub mod protocol;
mod reconnect;

pub use connection::{ConnectionState, EventSubConnection};
pub use protocol::{decode, EventSubMessage, Notification, Subscription, SubscriptionRequest, Transport};
pub use reconnect::{Exponential, Immediate, ReconnectPolicy};

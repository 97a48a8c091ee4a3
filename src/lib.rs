// Configuration loading
pub mod config;

// Per-user OAuth credential storage and token providers
pub mod credentials;

// Error signals shared across modules
pub mod error;

// EventSub websocket connection management
pub mod eventsub;

// Helix REST API client
pub mod helix;

// OAuth token endpoint client
pub mod oauth;

pub use error::Error;

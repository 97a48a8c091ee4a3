//! Durable per-user OAuth credentials.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │       TokenProvider                      │
//! │  - access token for one user             │
//! │  - refresh via OAuth, then persist       │
//! └─────────────────────────────────────────┘
//!          ↓                    ↑
//!      (upsert)             (lookup)
//!          ↓                    ↑
//! ┌─────────────────────────────────────────┐
//! │       CredentialStore                    │
//! │  - one row per user                      │
//! │  - created_at / updated_at audit times   │
//! │  - SQLite, one lock per instance         │
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use eventsub_bridge::credentials::CredentialStore;
//!
//! # fn main() -> anyhow::Result<()> {
//! let store = CredentialStore::open("authdb.sqlite3")?;
//!
//! store.upsert("1234", "access", "refresh")?;
//! assert_eq!(store.get_access_token("1234")?, "access");
//!
//! for user_id in store.list_all_user_ids()? {
//!     println!("{} last refreshed at {}", user_id, store.get_updated_at(&user_id)?);
//! }
//! # Ok(())
//! # }
//! ```

use serde::{Deserialize, Serialize};

mod provider;
mod storage;

pub use provider::{StoreTokenProvider, TokenProvider, TokenRefresher};
pub use storage::CredentialStore;

/// Opaque platform user identifier.
pub type UserId = String;

/// Opaque bearer credential.
pub type Token = String;

/// Access/refresh token pair as issued by the OAuth endpoint.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: Token,
    pub refresh_token: Token,
}

impl std::fmt::Debug for TokenPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenPair")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .finish()
    }
}

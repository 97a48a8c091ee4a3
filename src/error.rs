//! Error signals callers are expected to match on.
//!
//! Everything else in the crate is reported through `anyhow::Error` with
//! context; these variants travel inside it and are recovered with
//! `err.downcast_ref::<Error>()`.

use thiserror::Error;

use crate::credentials::UserId;

#[derive(Debug, Error)]
pub enum Error {
    /// No credential record exists for the user.
    #[error("user not found: {0}")]
    UserNotFound(UserId),

    /// A precondition of the call was violated (programmer error).
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(&'static str),

    /// An inbound socket frame was not a text frame.
    #[error("unsupported message type: {0}")]
    UnsupportedMessageType(String),
}

impl Error {
    /// Returns true if `err` carries [`Error::UserNotFound`].
    pub fn is_user_not_found(err: &anyhow::Error) -> bool {
        matches!(err.downcast_ref::<Error>(), Some(Error::UserNotFound(_)))
    }
}

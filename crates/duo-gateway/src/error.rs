use axum::extract::ws::close_code;
use thiserror::Error;

use duo_types::api::error_code;
use duo_types::protocol::CodecError;

use crate::config::AUTH_FAILED_CLOSE_CODE;

/// Failures of a relay request. All of them are answered with an error
/// response; none of them ends the session.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Cannot send message to self.")]
    SelfMessage,

    #[error("Message body must not be empty.")]
    EmptyBody,

    #[error("Recipient user does not exist.")]
    RecipientNotFound(String),

    /// Rendered generically; the cause is only logged.
    #[error("Internal server error.")]
    Store(#[source] anyhow::Error),
}

impl RelayError {
    pub fn code(&self) -> i32 {
        match self {
            Self::SelfMessage => error_code::SELF_MESSAGE,
            Self::EmptyBody => error_code::EMPTY_BODY,
            Self::RecipientNotFound(_) => error_code::RECIPIENT_NOT_FOUND,
            Self::Store(_) => error_code::INTERNAL,
        }
    }
}

/// Connection-level failures. Always fatal for the session.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("read failed: {0}")]
    Read(String),

    #[error("write failed: {0}")]
    Write(String),

    #[error(transparent)]
    Decode(#[from] CodecError),

    #[error("heartbeat timed out")]
    HeartbeatTimeout,
}

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("no authenticate request within the handshake window")]
    Timeout,

    #[error("connection closed before authenticating")]
    Closed,

    #[error("transport failure during handshake: {0}")]
    Transport(String),

    #[error("malformed handshake: {0}")]
    Malformed(String),

    #[error("unknown auth key")]
    Unauthorized,

    #[error("identity lookup failed: {0}")]
    Store(#[source] anyhow::Error),
}

impl HandshakeError {
    pub fn close_code(&self) -> u16 {
        match self {
            Self::Closed => close_code::NORMAL,
            Self::Store(_) => close_code::ERROR,
            _ => AUTH_FAILED_CLOSE_CODE,
        }
    }
}

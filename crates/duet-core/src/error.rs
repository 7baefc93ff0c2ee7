//! Error types for the duet signaling protocol

use thiserror::Error;

/// Protocol violations. Every variant is fatal to the one connection it
/// happened on and is reported to the peer as `{"error": "<message>"}`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("failed to parse JSON. {0}")]
    Malformed(String),

    #[error("'token' missed")]
    MissingToken,

    #[error("wrong 'token' format")]
    BadToken,

    #[error("'token' is already online")]
    TokenInUse,

    #[error("'to' missed")]
    MissingTarget,

    #[error("wrong 'to' format")]
    BadTarget,

    #[error("unexpected message")]
    Unexpected,

    #[error("too many unparsed data received")]
    Oversized { size: usize, max: usize },

    #[error("internal error")]
    Internal,
}

impl ProtocolError {
    /// Close status sent along with the error payload
    pub fn close_status(&self) -> CloseStatus {
        CloseStatus::from(self)
    }
}

/// Connection close statuses (WebSocket close codes)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum CloseStatus {
    Normal = 1000,
    GoingAway = 1001,
    InvalidPayload = 1007,
    PolicyViolation = 1008,
    UnexpectedCondition = 1011,
}

impl From<&ProtocolError> for CloseStatus {
    fn from(e: &ProtocolError) -> Self {
        match e {
            ProtocolError::Malformed(_) => CloseStatus::InvalidPayload,
            ProtocolError::MissingToken => CloseStatus::InvalidPayload,
            ProtocolError::BadToken => CloseStatus::InvalidPayload,
            ProtocolError::TokenInUse => CloseStatus::InvalidPayload,
            ProtocolError::MissingTarget => CloseStatus::InvalidPayload,
            ProtocolError::BadTarget => CloseStatus::InvalidPayload,
            ProtocolError::Oversized { .. } => CloseStatus::InvalidPayload,
            ProtocolError::Unexpected => CloseStatus::UnexpectedCondition,
            ProtocolError::Internal => CloseStatus::UnexpectedCondition,
        }
    }
}

impl From<CloseStatus> for u16 {
    fn from(status: CloseStatus) -> Self {
        status as u16
    }
}

impl TryFrom<u16> for CloseStatus {
    type Error = u16;

    fn try_from(code: u16) -> Result<Self, Self::Error> {
        match code {
            1000 => Ok(CloseStatus::Normal),
            1001 => Ok(CloseStatus::GoingAway),
            1007 => Ok(CloseStatus::InvalidPayload),
            1008 => Ok(CloseStatus::PolicyViolation),
            1011 => Ok(CloseStatus::UnexpectedCondition),
            other => Err(other),
        }
    }
}

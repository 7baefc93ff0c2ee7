//! Client error types

use std::time::Duration;

use thiserror::Error;

use duet_core::{CloseStatus, DecodeError, ProtocolError};

use crate::state::{CallEvent, CallState};

/// Why a call session ended or an operation failed
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("failed to connect after {attempts} attempts: {reason}")]
    Connect { attempts: u32, reason: String },

    #[error("invalid relay URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("no call established within {0:?}")]
    Timeout(Duration),

    #[error("call target unreachable after {attempts} retries")]
    TargetUnreachable { attempts: u32 },

    #[error("partner disconnected")]
    PartnerLeft,

    #[error("relay error: {0}")]
    Server(String),

    #[error("logon refused by relay")]
    LogonRefused,

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("unexpected {tag} in state {state:?}")]
    Unexpected { state: CallState, tag: &'static str },

    #[error("invalid transition from {from:?} on {event:?}")]
    Transition { from: CallState, event: CallEvent },

    #[error("{0} handler rejected the message")]
    Handler(&'static str),

    #[error("encoding failed: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("connection closed by relay ({code}): {reason}")]
    Closed { code: u16, reason: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("session is not running")]
    NotRunning,

    #[error("session already started")]
    AlreadyStarted,

    #[error("call hung up")]
    Hangup,

    #[error("session stopped")]
    Stopped,
}

impl From<DecodeError> for ClientError {
    fn from(e: DecodeError) -> Self {
        ClientError::Protocol(e.into())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ClientError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        ClientError::Transport(e.to_string())
    }
}

impl ClientError {
    /// Status to close the connection with when this error ends the session
    pub fn close_status(&self) -> CloseStatus {
        match self {
            ClientError::Protocol(e) => e.close_status(),
            ClientError::Unexpected { .. } | ClientError::Transition { .. } => {
                CloseStatus::UnexpectedCondition
            }
            ClientError::Timeout(_) | ClientError::TargetUnreachable { .. } => {
                CloseStatus::GoingAway
            }
            ClientError::Handler(_) => CloseStatus::PolicyViolation,
            ClientError::Encode(_) => CloseStatus::UnexpectedCondition,
            _ => CloseStatus::Normal,
        }
    }

    /// Whether the transport is already gone, so no close frame can be sent
    pub fn is_transport_gone(&self) -> bool {
        matches!(
            self,
            ClientError::Closed { .. } | ClientError::Transport(_) | ClientError::Connect { .. }
        )
    }
}

//! Signal protocol messages
//!
//! Text-encoded JSON records exchanged between clients and the relay.
//! Session descriptions and candidates are carried as opaque strings.

use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::error::ProtocolError;

/// Minimum length of registration and call tokens
pub const MIN_TOKEN_LEN: usize = 10;

/// `subscriber` value announcing that the partner left
pub const SUBSCRIBER_DISCONNECTED: &str = "disconnected";

/// Messages sent over the signaling connection
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SignalMessage {
    /// Client registers its identity: `{"type":"logon","token":…}`
    Logon { token: String },

    /// Registration result: `{"type":"logon","status":…}`
    LogonAck { status: bool },

    /// Client asks to be paired with `to`: `{"type":"call","to":…}`
    CallRequest { to: String },

    /// Relay announces an incoming call: `{"type":"call","from":…}`
    CallAnnounce { from: String },

    /// Outcome of a call request, or the callee's acceptance
    CallAck { status: bool },

    /// Session description, opaque to the relay
    Sdp { kind: SdpKind, sdp: String },

    /// Connectivity candidate, opaque to the relay
    Ice(IceCandidate),

    /// Partner state notification
    Info { subscriber: String },

    /// Fatal protocol violation; the connection is about to close
    Error { error: String },
}

/// Session description type
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SdpKind {
    Offer,
    Answer,
}

impl SdpKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SdpKind::Offer => "offer",
            SdpKind::Answer => "answer",
        }
    }

    pub fn is_offer(self) -> bool {
        matches!(self, SdpKind::Offer)
    }
}

/// How a candidate was laid out on the wire
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CandidateShape {
    /// `{"sdpMid":…,"sdpMLineIndex":…,"candidate":"…"}`
    #[default]
    Flat,
    /// `{"candidate":{"sdpMid":…,"sdpMLineIndex":…,"candidate":"…"}}`
    Nested,
}

/// Connectivity candidate with its routing fields
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IceCandidate {
    pub sdp_mid: String,
    pub sdp_mline_index: i32,
    pub candidate: String,
    pub shape: CandidateShape,
}

/// Decoding failures
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("{0}")]
    Json(#[from] serde_json::Error),

    #[error("'{0}' missed")]
    MissingField(&'static str),

    #[error("unexpected message")]
    Unexpected,
}

impl From<DecodeError> for ProtocolError {
    fn from(e: DecodeError) -> Self {
        match e {
            DecodeError::Json(e) => ProtocolError::Malformed(e.to_string()),
            DecodeError::MissingField("token") => ProtocolError::MissingToken,
            DecodeError::MissingField("to") => ProtocolError::MissingTarget,
            DecodeError::MissingField(_) | DecodeError::Unexpected => ProtocolError::Unexpected,
        }
    }
}

/// Check the token format accepted by the relay
pub fn validate_token(token: &str) -> bool {
    token.chars().count() >= MIN_TOKEN_LEN
}

impl SignalMessage {
    /// Error payload for a protocol violation
    pub fn error(e: &ProtocolError) -> Self {
        Self::Error {
            error: e.to_string(),
        }
    }

    /// Notification sent to a peer whose partner went away
    pub fn partner_disconnected() -> Self {
        Self::Info {
            subscriber: SUBSCRIBER_DISCONNECTED.into(),
        }
    }

    /// Short tag for logging
    pub fn tag(&self) -> &'static str {
        match self {
            SignalMessage::Logon { .. } => "logon-request",
            SignalMessage::LogonAck { .. } => "logon-ack",
            SignalMessage::CallRequest { .. } => "call-request",
            SignalMessage::CallAnnounce { .. } => "call-announce",
            SignalMessage::CallAck { .. } => "call-ack",
            SignalMessage::Sdp { .. } => "sdp-message",
            SignalMessage::Ice(_) => "ice-candidate",
            SignalMessage::Info { .. } => "info",
            SignalMessage::Error { .. } => "error",
        }
    }

    /// Parse a complete message
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let value: Value = serde_json::from_slice(bytes)?;
        let obj = value.as_object().ok_or(DecodeError::Unexpected)?;

        if let Some(error) = str_field(obj, "error") {
            return Ok(Self::Error {
                error: error.into(),
            });
        }

        match str_field(obj, "type") {
            Some("logon") => {
                if let Some(token) = str_field(obj, "token") {
                    Ok(Self::Logon {
                        token: token.into(),
                    })
                } else if let Some(status) = bool_field(obj, "status") {
                    Ok(Self::LogonAck { status })
                } else {
                    Err(DecodeError::MissingField("token"))
                }
            }
            Some("call") => {
                if let Some(to) = str_field(obj, "to") {
                    Ok(Self::CallRequest { to: to.into() })
                } else if let Some(from) = str_field(obj, "from") {
                    Ok(Self::CallAnnounce { from: from.into() })
                } else if let Some(status) = bool_field(obj, "status") {
                    Ok(Self::CallAck { status })
                } else {
                    Err(DecodeError::MissingField("to"))
                }
            }
            Some(kind @ ("offer" | "answer")) => {
                let sdp = str_field(obj, "sdp").ok_or(DecodeError::MissingField("sdp"))?;
                let kind = if kind == "offer" {
                    SdpKind::Offer
                } else {
                    SdpKind::Answer
                };
                Ok(Self::Sdp {
                    kind,
                    sdp: sdp.into(),
                })
            }
            Some("info") => {
                let subscriber = str_field(obj, "subscriber")
                    .ok_or(DecodeError::MissingField("subscriber"))?;
                Ok(Self::Info {
                    subscriber: subscriber.into(),
                })
            }
            Some(_) => Err(DecodeError::Unexpected),
            None => match obj.get("candidate") {
                Some(Value::String(candidate)) => {
                    let (sdp_mid, sdp_mline_index) = routing_fields(obj)?;
                    Ok(Self::Ice(IceCandidate {
                        sdp_mid,
                        sdp_mline_index,
                        candidate: candidate.clone(),
                        shape: CandidateShape::Flat,
                    }))
                }
                Some(Value::Object(nested)) => {
                    let (sdp_mid, sdp_mline_index) = routing_fields(nested)?;
                    let candidate = str_field(nested, "candidate")
                        .ok_or(DecodeError::MissingField("candidate"))?;
                    Ok(Self::Ice(IceCandidate {
                        sdp_mid,
                        sdp_mline_index,
                        candidate: candidate.into(),
                        shape: CandidateShape::Nested,
                    }))
                }
                Some(_) => Err(DecodeError::MissingField("candidate")),
                None => Err(DecodeError::Unexpected),
            },
        }
    }

    /// Serialize to JSON bytes
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&self.record())
    }

    fn record(&self) -> WireRecord<'_> {
        match self {
            SignalMessage::Logon { token } => WireRecord {
                kind: Some("logon"),
                token: Some(token),
                ..Default::default()
            },
            SignalMessage::LogonAck { status } => WireRecord {
                kind: Some("logon"),
                status: Some(*status),
                ..Default::default()
            },
            SignalMessage::CallRequest { to } => WireRecord {
                kind: Some("call"),
                to: Some(to),
                ..Default::default()
            },
            SignalMessage::CallAnnounce { from } => WireRecord {
                kind: Some("call"),
                from: Some(from),
                ..Default::default()
            },
            SignalMessage::CallAck { status } => WireRecord {
                kind: Some("call"),
                status: Some(*status),
                ..Default::default()
            },
            SignalMessage::Sdp { kind, sdp } => WireRecord {
                kind: Some(kind.as_str()),
                sdp: Some(sdp),
                ..Default::default()
            },
            SignalMessage::Ice(ice) => match ice.shape {
                CandidateShape::Flat => WireRecord {
                    sdp_mid: Some(&ice.sdp_mid),
                    sdp_mline_index: Some(ice.sdp_mline_index),
                    candidate: Some(WireCandidate::Flat(&ice.candidate)),
                    ..Default::default()
                },
                CandidateShape::Nested => WireRecord {
                    candidate: Some(WireCandidate::Nested {
                        sdp_mid: &ice.sdp_mid,
                        sdp_mline_index: ice.sdp_mline_index,
                        candidate: &ice.candidate,
                    }),
                    ..Default::default()
                },
            },
            SignalMessage::Info { subscriber } => WireRecord {
                kind: Some("info"),
                subscriber: Some(subscriber),
                ..Default::default()
            },
            SignalMessage::Error { error } => WireRecord {
                error: Some(error),
                ..Default::default()
            },
        }
    }
}

#[derive(Serialize, Default)]
struct WireRecord<'a> {
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    kind: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    token: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    to: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    from: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sdp: Option<&'a str>,
    #[serde(rename = "sdpMid", skip_serializing_if = "Option::is_none")]
    sdp_mid: Option<&'a str>,
    #[serde(rename = "sdpMLineIndex", skip_serializing_if = "Option::is_none")]
    sdp_mline_index: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    candidate: Option<WireCandidate<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    subscriber: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum WireCandidate<'a> {
    Flat(&'a str),
    Nested {
        #[serde(rename = "sdpMid")]
        sdp_mid: &'a str,
        #[serde(rename = "sdpMLineIndex")]
        sdp_mline_index: i32,
        candidate: &'a str,
    },
}

fn str_field<'a>(obj: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    obj.get(key).and_then(Value::as_str)
}

fn bool_field(obj: &Map<String, Value>, key: &str) -> Option<bool> {
    obj.get(key).and_then(Value::as_bool)
}

fn routing_fields(obj: &Map<String, Value>) -> Result<(String, i32), DecodeError> {
    let sdp_mid = str_field(obj, "sdpMid").ok_or(DecodeError::MissingField("sdpMid"))?;
    let index = obj
        .get("sdpMLineIndex")
        .and_then(Value::as_i64)
        .and_then(|i| i32::try_from(i).ok())
        .ok_or(DecodeError::MissingField("sdpMLineIndex"))?;
    Ok((sdp_mid.into(), index))
}

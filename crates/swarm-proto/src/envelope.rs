//! Typed envelope and the wire codec.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::DecodeError;
use crate::payload::{Heartbeat, StateSync, StateUpdate, SyncRequestBody};
use crate::UNKNOWN_SENDER;

/// Wire-level message type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MsgType {
    Heartbeat = 1,
    StateSet = 2,
    StateSync = 3,
    StateSyncRequest = 4,
    Command = 5,
    Telemetry = 6,
    CommandResponse = 7,
}

impl MsgType {
    /// Numeric code carried in the `t` field.
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// Map a wire code back to a type. Unknown codes return `None`.
    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            1 => Some(Self::Heartbeat),
            2 => Some(Self::StateSet),
            3 => Some(Self::StateSync),
            4 => Some(Self::StateSyncRequest),
            5 => Some(Self::Command),
            6 => Some(Self::Telemetry),
            7 => Some(Self::CommandResponse),
            _ => None,
        }
    }
}

impl std::fmt::Display for MsgType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Heartbeat => write!(f, "Heartbeat"),
            Self::StateSet => write!(f, "StateSet"),
            Self::StateSync => write!(f, "StateSync"),
            Self::StateSyncRequest => write!(f, "StateSyncRequest"),
            Self::Command => write!(f, "Command"),
            Self::Telemetry => write!(f, "Telemetry"),
            Self::CommandResponse => write!(f, "CommandResponse"),
        }
    }
}

/// Decoded envelope body.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Heartbeat(Heartbeat),
    StateSet(StateUpdate),
    StateSync(StateSync),
    StateSyncRequest,
    /// Types 5–7: owned by external collaborators, passed through untouched.
    Collaborator(MsgType, Value),
    /// A well-formed envelope with a type code nobody handles.
    Unknown(u64),
}

impl Payload {
    /// Message type of this payload, `None` for unknown codes.
    pub fn msg_type(&self) -> Option<MsgType> {
        match self {
            Self::Heartbeat(_) => Some(MsgType::Heartbeat),
            Self::StateSet(_) => Some(MsgType::StateSet),
            Self::StateSync(_) => Some(MsgType::StateSync),
            Self::StateSyncRequest => Some(MsgType::StateSyncRequest),
            Self::Collaborator(ty, _) => Some(*ty),
            Self::Unknown(_) => None,
        }
    }

    fn code(&self) -> u64 {
        match self {
            Self::Unknown(code) => *code,
            other => other.msg_type().map_or(0, |ty| u64::from(ty.code())),
        }
    }

    fn to_value(&self) -> serde_json::Result<Value> {
        match self {
            Self::Heartbeat(hb) => serde_json::to_value(hb),
            Self::StateSet(update) => serde_json::to_value(update),
            Self::StateSync(sync) => serde_json::to_value(sync),
            Self::StateSyncRequest => serde_json::to_value(SyncRequestBody::default()),
            Self::Collaborator(_, data) => Ok(data.clone()),
            Self::Unknown(_) => Ok(Value::Object(Map::new())),
        }
    }

    fn from_value(code: u64, data: Value) -> Result<Self, DecodeError> {
        let payload = match MsgType::from_code(code) {
            Some(MsgType::Heartbeat) => Self::Heartbeat(serde_json::from_value(data)?),
            Some(MsgType::StateSet) => Self::StateSet(serde_json::from_value(data)?),
            Some(MsgType::StateSync) => Self::StateSync(serde_json::from_value(data)?),
            Some(MsgType::StateSyncRequest) => Self::StateSyncRequest,
            Some(ty) => Self::Collaborator(ty, data),
            None => Self::Unknown(code),
        };
        Ok(payload)
    }
}

/// On-the-wire layout: `{"t": code, "n": sender, "d": payload}`.
#[derive(Serialize, Deserialize)]
struct RawEnvelope {
    #[serde(default)]
    t: Value,
    #[serde(default)]
    n: Option<String>,
    #[serde(default)]
    d: Value,
}

/// A typed message exchanged between nodes.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Display name of the sending node.
    pub sender_name: String,
    pub payload: Payload,
}

impl Envelope {
    pub fn new(sender_name: impl Into<String>, payload: Payload) -> Self {
        Self {
            sender_name: sender_name.into(),
            payload,
        }
    }

    pub fn msg_type(&self) -> Option<MsgType> {
        self.payload.msg_type()
    }

    /// Serialize to wire bytes.
    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        let raw = RawEnvelope {
            t: Value::from(self.payload.code()),
            n: Some(self.sender_name.clone()),
            d: self.payload.to_value()?,
        };
        serde_json::to_vec(&raw)
    }

    /// Parse wire bytes.
    ///
    /// A missing or non-object `d` is treated as an empty payload so that
    /// every field falls back to its default.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let value: Value = serde_json::from_slice(bytes)?;
        if !value.is_object() {
            return Err(DecodeError::NotAnObject);
        }
        let raw: RawEnvelope = serde_json::from_value(value)?;

        let code = raw.t.as_u64().ok_or(DecodeError::MissingType)?;
        let data = if raw.d.is_object() {
            raw.d
        } else {
            Value::Object(Map::new())
        };

        Ok(Self {
            sender_name: raw.n.unwrap_or_else(|| UNKNOWN_SENDER.to_string()),
            payload: Payload::from_value(code, data)?,
        })
    }
}

//! Wire protocol: the JSON envelope exchanged with clients.

use serde_json::{json, Value};

/// A decoded client envelope.
///
/// Every frame on the wire is a JSON object `{"type": ..., "data": ...}`.
/// Both keys must be present; `data` may be JSON null.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub kind: String,
    pub data: Value,
}

/// Why an inbound frame could not be decoded. Reported back to the sender;
/// never fatal to the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// Not a JSON object.
    Malformed,
    /// The `type` key is absent or not a string.
    MissingType,
    /// The `data` key is absent.
    MissingData,
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::Malformed => write!(f, "malformed envelope"),
            DecodeError::MissingType => write!(f, "envelope missing 'type'"),
            DecodeError::MissingData => write!(f, "envelope missing 'data'"),
        }
    }
}

impl std::error::Error for DecodeError {}

impl Envelope {
    pub fn decode(raw: &str) -> Result<Self, DecodeError> {
        let value: Value = serde_json::from_str(raw).map_err(|_| DecodeError::Malformed)?;
        let obj = value.as_object().ok_or(DecodeError::Malformed)?;
        let kind = obj
            .get("type")
            .and_then(Value::as_str)
            .ok_or(DecodeError::MissingType)?
            .to_string();
        let data = obj.get("data").cloned().ok_or(DecodeError::MissingData)?;
        Ok(Self { kind, data })
    }
}

/// Encode an outbound event as a wire frame.
pub fn make_event(kind: &str, data: Value) -> String {
    json!({ "type": kind, "data": data }).to_string()
}

/// User-visible presence status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceStatus {
    Online,
    Offline,
    Busy,
}

impl PresenceStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "online" => Some(PresenceStatus::Online),
            "offline" => Some(PresenceStatus::Offline),
            "busy" => Some(PresenceStatus::Busy),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PresenceStatus::Online => "online",
            PresenceStatus::Offline => "offline",
            PresenceStatus::Busy => "busy",
        }
    }
}

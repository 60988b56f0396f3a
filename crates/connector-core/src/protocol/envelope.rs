//! The JSON envelope every message travels in.
//!
//! Wire format: `{"event":"<name>","data":{...}}`, over UDP (one datagram per
//! envelope) and over links (one frame per envelope).

use super::Payload;
use crate::error::{ErrorCode, ProtocolError};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    /// Wrap a typed protocol payload.
    pub fn of<P: Payload>(payload: &P) -> Self {
        let data = serde_json::to_value(payload).expect("protocol payload serialization should not fail");
        Self::new(P::EVENT.as_str(), data)
    }

    /// The `error` reply for a rejected message.
    pub fn error(err: &ProtocolError) -> Self {
        Self::new(
            "error",
            json!({"code": err.code, "message": err.message}),
        )
    }

    /// Serialize to JSON bytes.
    pub fn to_json(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("Envelope serialization should not fail")
    }

    /// Parse JSON bytes. Anything that is not an envelope is `BADMSG`.
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(data).map_err(|e| {
            ProtocolError::new(ErrorCode::BadMsg, format!("Malformed message: {}", e))
        })
    }
}

//! Error types of the connector.
//!
//! [`ProtocolError`] is what a peer did wrong: it is sent back to that peer
//! as an `error` message. [`ConnectorError`] is what the application did
//! wrong when calling the connector API.

use crate::NodeId;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use thiserror::Error;

/// Wire error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ErrorCode {
    /// Unparseable message or unknown event
    BadMsg,
    /// A field failed validation
    BadAttr,
    /// Link usage not accepted by the current state
    BadUsage,
    /// Peer id collides with the master or is unknown
    BadId,
    /// Duplicate incoming communicate link
    Exist,
    /// The current state accepts no connections
    NoSvc,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::BadMsg => "BADMSG",
            ErrorCode::BadAttr => "BADATTR",
            ErrorCode::BadUsage => "BADUSAGE",
            ErrorCode::BadId => "BADID",
            ErrorCode::Exist => "EXIST",
            ErrorCode::NoSvc => "NOSVC",
        }
    }
}

impl Display for ErrorCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{code}: {message}")]
pub struct ProtocolError {
    pub code: ErrorCode,
    pub message: String,
}

impl ProtocolError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn bad_msg(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BadMsg, message)
    }

    pub fn bad_attr(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BadAttr, message)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConnectorError {
    #[error("Unknown node: {0}")]
    UnknownNode(NodeId),
    #[error("No link to master {0}; master links are only created by the election")]
    MasterLinkUnavailable(NodeId),
    #[error("No master elected")]
    NoMaster,
    #[error("Operation requires the master role")]
    NotMaster,
    #[error("Connector is not configured")]
    NotConfigured,
}

pub type Result<T> = std::result::Result<T, ConnectorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_serialize_uppercase() {
        for code in [
            ErrorCode::BadMsg,
            ErrorCode::BadAttr,
            ErrorCode::BadUsage,
            ErrorCode::BadId,
            ErrorCode::Exist,
            ErrorCode::NoSvc,
        ] {
            let json = serde_json::to_string(&code).unwrap();
            assert_eq!(json, format!("\"{}\"", code.as_str()));
        }
    }

    #[test]
    fn test_protocol_error_display() {
        let err = ProtocolError::bad_attr("port: invalid type");
        assert_eq!(err.to_string(), "BADATTR: port: invalid type");
    }
}

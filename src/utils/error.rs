//! The `error` module defines the error-code table shared by the broker and
//! its clients.
//!
//! Routing and handling failures travel on the wire as a short code in
//! `info.error`. Clients turn that code back into a human readable message
//! with [`describe_code`]; anything unrecognised reads as "not delivered".

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// TTL elapsed before or during routing.
    Expired,
    /// No local route and no proxy advertised the receiver.
    NotDelivered,
    /// The receiver's handler raised.
    NotHandled,
    /// The caller stopped waiting.
    Timeout,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::Expired => "expired",
            ErrorCode::NotDelivered => "not_delivered",
            ErrorCode::NotHandled => "not_handled",
            ErrorCode::Timeout => "timeout",
        }
    }

    pub fn parse(code: &str) -> Option<Self> {
        match code {
            "expired" => Some(ErrorCode::Expired),
            "not_delivered" => Some(ErrorCode::NotDelivered),
            "not_handled" => Some(ErrorCode::NotHandled),
            "timeout" => Some(ErrorCode::Timeout),
            _ => None,
        }
    }

    pub fn describe(self) -> &'static str {
        match self {
            ErrorCode::Expired => "Message expired before it could be delivered",
            ErrorCode::NotDelivered => "Message was not delivered: no receiver is available",
            ErrorCode::NotHandled => "Receiver failed to handle the message",
            ErrorCode::Timeout => "Request timed out waiting for a reply",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Human readable text for a wire error code, falling back to the
/// not-delivered text for missing or unknown codes.
pub fn describe_code(code: Option<&str>) -> &'static str {
    code.and_then(ErrorCode::parse)
        .unwrap_or(ErrorCode::NotDelivered)
        .describe()
}

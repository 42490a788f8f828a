//! Message definitions for the broker
//!
//! `Message` is the unit of routing inside the broker and the record kept in
//! the pending-response buffer and the persisted snapshot.
//!
//! Notes on fields:
//! - `outgoing_id`: assigned when the message enters the broker; key of the
//!   pending-response buffer
//! - `incoming_id`: correlation id chosen by the caller, echoed back untouched
//! - `socket_id`: connection the message arrived on
//! - `sender`/`receiver`: logical service names
//! - `data`: opaque payload; routing never looks inside it
//! - `info`: timestamps and diagnostics, filled in as the message moves on

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::utils::error::ErrorCode;
use crate::utils::now_millis;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    #[default]
    Enqueued,
    Received,
    Delivered,
    NotDelivered,
    Handled,
    NotHandled,
    Expired,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageOptions {
    /// Time to live in milliseconds, measured from `info.received_at`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
    /// Deliver to every socket registered under the receiver.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broadcast: Option<bool>,
}

impl MessageOptions {
    pub fn with_ttl(ttl: u64) -> Self {
        Self {
            ttl: Some(ttl),
            ..Self::default()
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.broadcast.unwrap_or(false)
    }
}

/// Timestamps are only ever set once; the `stamp_*` helpers leave an existing
/// value alone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub received_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handled_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl MessageInfo {
    pub fn stamp_received(&mut self) {
        self.received_at.get_or_insert_with(now_millis);
    }

    pub fn stamp_delivered(&mut self) {
        self.delivered_at.get_or_insert_with(now_millis);
    }

    pub fn stamp_handled(&mut self) {
        self.handled_at.get_or_insert_with(now_millis);
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        self.error.as_deref().and_then(ErrorCode::parse)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub outgoing_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub incoming_id: Option<String>,
    pub socket_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    pub receiver: String,
    #[serde(default)]
    pub status: MessageStatus,
    #[serde(default)]
    pub options: MessageOptions,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub info: MessageInfo,
}

impl Message {
    /// True when both a TTL and a receive time are known and the TTL has
    /// run out at `now` (milliseconds).
    pub fn is_expired_at(&self, now: i64) -> bool {
        match (self.options.ttl, self.info.received_at) {
            (Some(ttl), Some(received_at)) => {
                received_at.saturating_add(i64::try_from(ttl).unwrap_or(i64::MAX)) <= now
            }
            _ => false,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(now_millis())
    }

    /// Marks the message failed with `code`, keeping any earlier diagnostic.
    pub fn fail(&mut self, status: MessageStatus, code: ErrorCode) {
        self.status = status;
        self.info.error.get_or_insert_with(|| code.as_str().to_string());
    }

    /// Milliseconds of TTL left, if the message carries one.
    pub fn remaining_ttl(&self) -> Option<u64> {
        let ttl = self.options.ttl?;
        let Some(received_at) = self.info.received_at else {
            return Some(ttl);
        };
        let elapsed = now_millis().saturating_sub(received_at).max(0) as u64;
        Some(ttl.saturating_sub(elapsed))
    }
}

//! Wire frames
//!
//! Every WebSocket message carries exactly one frame:
//!
//! ```json
//! { "action": "request", "message": { "receiver": "svc-a", "incomingId": "…", "data": {} } }
//! ```
//!
//! `message` is an [`Envelope`] for `request`/`response`/`error`, and a small
//! action-specific payload otherwise.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::broker::message::{Message, MessageInfo, MessageOptions, MessageStatus};

/// Action names a logical service may not register under.
pub const RESERVED_ACTIONS: [&str; 6] = [
    "init",
    "request",
    "response",
    "error",
    "acknowledge",
    "receivers",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", content = "message", rename_all = "snake_case")]
pub enum Frame {
    /// client → server: register this socket under a logical name.
    Init(InitPayload),
    /// Either direction: a message to route (client → server) or to handle
    /// (server → client).
    Request(Envelope),
    Response(Envelope),
    Error(Envelope),
    /// server → client: forget the pending request with this correlation id.
    Acknowledge(AcknowledgePayload),
    /// server → client: the logical names currently registered.
    Receivers(ReceiversPayload),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitPayload {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcknowledgePayload {
    pub incoming_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReceiversPayload {
    pub data: Vec<String>,
}

/// The message body carried by request, response and error frames.
///
/// Every field is optional on the wire; which ones matter depends on the
/// direction (see the conversions below).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outgoing_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub incoming_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<MessageStatus>,
    #[serde(default)]
    pub options: MessageOptions,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub info: MessageInfo,
}

impl Envelope {
    /// Client → server request body.
    pub fn request(
        receiver: &str,
        incoming_id: String,
        data: Value,
        options: MessageOptions,
    ) -> Self {
        Self {
            incoming_id: Some(incoming_id),
            receiver: Some(receiver.to_string()),
            status: Some(MessageStatus::Enqueued),
            options,
            data,
            ..Self::default()
        }
    }

    /// Outbound view of a broker message; the socket id stays inside the
    /// broker.
    pub fn from_message(message: &Message) -> Self {
        Self {
            outgoing_id: Some(message.outgoing_id.clone()),
            incoming_id: message.incoming_id.clone(),
            sender: message.sender.clone(),
            receiver: Some(message.receiver.clone()),
            status: Some(message.status),
            options: message.options.clone(),
            data: message.data.clone(),
            info: message.info.clone(),
        }
    }
}

impl Frame {
    pub fn action(&self) -> &'static str {
        match self {
            Frame::Init(_) => "init",
            Frame::Request(_) => "request",
            Frame::Response(_) => "response",
            Frame::Error(_) => "error",
            Frame::Acknowledge(_) => "acknowledge",
            Frame::Receivers(_) => "receivers",
        }
    }

    /// RESPONSE for a handled message, ERROR for anything else.
    pub fn reply_for(message: &Message) -> Self {
        let envelope = Envelope::from_message(message);
        if message.status == MessageStatus::Handled {
            Frame::Response(envelope)
        } else {
            Frame::Error(envelope)
        }
    }
}

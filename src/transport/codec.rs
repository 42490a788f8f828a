//! Frame ⇄ WebSocket message conversion, with optional encryption.

use tungstenite::protocol::Message as WsMessage;

use crate::transport::crypto::{CryptoError, FrameCipher};
use crate::transport::message::Frame;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("failed to serialize frame: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("failed to deserialize frame: {0}")]
    Deserialize(#[source] serde_json::Error),
    #[error("frame is not UTF-8")]
    NotUtf8,
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

pub fn encode(frame: &Frame, cipher: Option<&FrameCipher>) -> Result<WsMessage, CodecError> {
    let json = serde_json::to_string(frame).map_err(CodecError::Serialize)?;
    let text = match cipher {
        Some(cipher) => cipher.encrypt(json.as_bytes())?,
        None => json,
    };
    Ok(WsMessage::text(text))
}

/// Decodes one data message. Control messages (ping, pong, close) yield
/// `Ok(None)`.
pub fn decode(msg: &WsMessage, cipher: Option<&FrameCipher>) -> Result<Option<Frame>, CodecError> {
    let text = match msg {
        WsMessage::Text(text) => text.as_str(),
        WsMessage::Binary(bytes) => std::str::from_utf8(bytes).map_err(|_| CodecError::NotUtf8)?,
        _ => return Ok(None),
    };
    let frame = match cipher {
        Some(cipher) => {
            let plain = cipher.decrypt(text)?;
            serde_json::from_slice(&plain).map_err(CodecError::Deserialize)?
        }
        None => serde_json::from_str(text).map_err(CodecError::Deserialize)?,
    };
    Ok(Some(frame))
}

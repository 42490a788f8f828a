//! Live socket table of a broker server.
//!
//! Each accepted WebSocket gets a socket id and an outbound channel drained by
//! its own writer task. The broker engine writes through [`FrameSink`]; frames
//! are encoded (and encrypted when a key is set) here.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};
use tungstenite::protocol::Message as WsMessage;

use crate::broker::FrameSink;
use crate::broker::registry::SocketId;
use crate::transport::codec;
use crate::transport::crypto::FrameCipher;
use crate::transport::message::{Frame, ReceiversPayload};

#[derive(Debug)]
struct Peer {
    name: Option<String>,
    sender: UnboundedSender<WsMessage>,
}

#[derive(Debug, Clone, Default)]
pub struct Connections {
    peers: Arc<Mutex<HashMap<SocketId, Peer>>>,
    cipher: Option<FrameCipher>,
}

impl Connections {
    pub fn new(cipher: Option<FrameCipher>) -> Self {
        Self {
            peers: Arc::default(),
            cipher,
        }
    }

    pub fn cipher(&self) -> Option<&FrameCipher> {
        self.cipher.as_ref()
    }

    pub fn register(&self, socket_id: &str, sender: UnboundedSender<WsMessage>) {
        self.peers
            .lock()
            .insert(socket_id.to_string(), Peer { name: None, sender });
    }

    pub fn set_name(&self, socket_id: &str, name: &str) {
        if let Some(peer) = self.peers.lock().get_mut(socket_id) {
            peer.name = Some(name.to_string());
        }
    }

    pub fn name_of(&self, socket_id: &str) -> Option<String> {
        self.peers.lock().get(socket_id).and_then(|p| p.name.clone())
    }

    /// Forgets the socket; dropping its sender ends the writer task. Returns
    /// the name it was registered under, if any.
    pub fn remove(&self, socket_id: &str) -> Option<String> {
        self.peers.lock().remove(socket_id).and_then(|p| p.name)
    }

    /// Announces `names` to every connected socket.
    pub fn broadcast_receivers(&self, names: Vec<String>) {
        let frame = Frame::Receivers(ReceiversPayload { data: names });
        let msg = match codec::encode(&frame, self.cipher()) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("Failed to encode receivers frame: {e}");
                return;
            }
        };
        for (socket_id, peer) in self.peers.lock().iter() {
            if peer.sender.send(msg.clone()).is_err() {
                debug!("Receivers update to {socket_id} dropped");
            }
        }
    }
}

impl FrameSink for Connections {
    fn send_frame(&self, socket_id: &str, frame: &Frame) -> bool {
        let msg = match codec::encode(frame, self.cipher()) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("Failed to encode {} frame: {e}", frame.action());
                return false;
            }
        };
        match self.peers.lock().get(socket_id) {
            Some(peer) => peer.sender.send(msg).is_ok(),
            None => false,
        }
    }
}

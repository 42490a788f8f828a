//! Crash-recovery snapshot
//!
//! The broker periodically writes its pending-response buffer and both
//! queues under its own id, and reads them back once on construction.
//! Re-enqueued tasks may already have been partly processed before the crash,
//! so recovery is at-least-once.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::broker::message::Message;
use crate::persistence::{Storage, StorageError};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Snapshot {
    pub pending_response_buffer: HashMap<String, Message>,
    pub incoming_queue_snapshot: Vec<Message>,
    pub outgoing_queue_snapshot: Vec<Message>,
}

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("snapshot is not valid JSON: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("buffer entry '{key}' holds message '{outgoing_id}'")]
    KeyMismatch { key: String, outgoing_id: String },
    #[error("message '{0}' has no receiver")]
    MissingReceiver(String),
}

impl Snapshot {
    pub fn is_empty(&self) -> bool {
        self.pending_response_buffer.is_empty()
            && self.incoming_queue_snapshot.is_empty()
            && self.outgoing_queue_snapshot.is_empty()
    }

    pub fn validate(&self) -> Result<(), SnapshotError> {
        for (key, message) in &self.pending_response_buffer {
            if *key != message.outgoing_id {
                return Err(SnapshotError::KeyMismatch {
                    key: key.clone(),
                    outgoing_id: message.outgoing_id.clone(),
                });
            }
        }
        let all = self
            .pending_response_buffer
            .values()
            .chain(&self.incoming_queue_snapshot)
            .chain(&self.outgoing_queue_snapshot);
        for message in all {
            if message.receiver.is_empty() {
                return Err(SnapshotError::MissingReceiver(message.outgoing_id.clone()));
            }
        }
        Ok(())
    }

    /// Reads and validates the snapshot stored under `key`.
    pub fn read(storage: &dyn Storage, key: &str) -> Result<Option<Self>, SnapshotError> {
        let Some(bytes) = storage.get(key)? else {
            return Ok(None);
        };
        let snapshot: Snapshot = serde_json::from_slice(&bytes)?;
        snapshot.validate()?;
        Ok(Some(snapshot))
    }

    /// Like [`Snapshot::read`], but anything missing or invalid becomes an
    /// empty snapshot.
    pub fn load_or_default(storage: &dyn Storage, key: &str) -> Self {
        match Self::read(storage, key) {
            Ok(Some(snapshot)) => {
                info!(
                    "Restored snapshot '{key}': {} buffered, {} incoming, {} outgoing",
                    snapshot.pending_response_buffer.len(),
                    snapshot.incoming_queue_snapshot.len(),
                    snapshot.outgoing_queue_snapshot.len()
                );
                snapshot
            }
            Ok(None) => Self::default(),
            Err(e) => {
                warn!("Ignoring snapshot '{key}': {e}");
                Self::default()
            }
        }
    }

    pub fn write(&self, storage: &dyn Storage, key: &str) -> Result<(), SnapshotError> {
        let bytes = serde_json::to_vec(self)?;
        storage.set(key, &bytes)?;
        Ok(())
    }
}

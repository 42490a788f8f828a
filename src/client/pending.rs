//! Correlation of in-flight requests
//!
//! Each request waiting for a reply owns one entry: correlation id → a
//! single-use channel. Whoever removes the entry first (reply, acknowledge
//! or the caller's timeout) decides the outcome; the others find nothing.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::transport::message::Envelope;

#[derive(Debug)]
pub enum Completion {
    Response(Envelope),
    Error(Envelope),
}

#[derive(Debug, Default)]
pub struct PendingRequests {
    waiters: Mutex<HashMap<String, oneshot::Sender<Completion>>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: &str) -> oneshot::Receiver<Completion> {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().insert(id.to_string(), tx);
        rx
    }

    /// Resolves the waiter for `id`. `false` if nobody waits any more (late
    /// or duplicate reply).
    pub fn complete(&self, id: &str, completion: Completion) -> bool {
        let Some(tx) = self.waiters.lock().remove(id) else {
            return false;
        };
        tx.send(completion).is_ok()
    }

    /// Forgets the waiter; its receiver observes a closed channel.
    pub fn cancel(&self, id: &str) -> bool {
        self.waiters.lock().remove(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.waiters.lock().len()
    }
}

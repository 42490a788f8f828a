//! Service registry
//!
//! Maps a logical service name to the ordered list of sockets that registered
//! under it. Requests are spread over those sockets round robin; responses
//! fan out to all of them in registration order.
//!
//! A name whose last socket disconnects keeps its (empty) entry and cursor.
//!
//! Concurrency note: callers must synchronize access (the broker keeps the
//! registry behind its own lock).

use std::collections::HashMap;

pub type SocketId = String;

#[derive(Debug, Default)]
pub struct ServiceEntry {
    sockets: Vec<SocketId>,
    cursor: usize,
}

impl ServiceEntry {
    pub fn sockets(&self) -> &[SocketId] {
        &self.sockets
    }

    pub fn is_empty(&self) -> bool {
        self.sockets.is_empty()
    }

    /// Add a socket at the tail. Re-adding a known socket is a no-op.
    pub fn add(&mut self, socket_id: SocketId) {
        if !self.sockets.contains(&socket_id) {
            self.sockets.push(socket_id);
        }
    }

    pub fn remove(&mut self, socket_id: &str) -> bool {
        let Some(pos) = self.sockets.iter().position(|s| s == socket_id) else {
            return false;
        };
        self.sockets.remove(pos);
        if pos < self.cursor {
            self.cursor -= 1;
        }
        if self.cursor >= self.sockets.len() {
            self.cursor = 0;
        }
        true
    }

    /// Next socket in round-robin order.
    pub fn next_socket(&mut self) -> Option<SocketId> {
        if self.sockets.is_empty() {
            return None;
        }
        let idx = self.cursor % self.sockets.len();
        self.cursor = (idx + 1) % self.sockets.len();
        Some(self.sockets[idx].clone())
    }
}

#[derive(Debug, Default)]
pub struct ServiceRegistry {
    services: HashMap<String, ServiceEntry>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_service(&mut self, name: &str, socket_id: SocketId) {
        self.services
            .entry(name.to_string())
            .or_default()
            .add(socket_id);
    }

    /// Removes `socket_id` from every name it registered under.
    pub fn remove_service(&mut self, socket_id: &str) -> usize {
        self.services
            .values_mut()
            .filter_map(|entry| entry.remove(socket_id).then_some(()))
            .count()
    }

    pub fn next_socket(&mut self, name: &str) -> Option<SocketId> {
        self.services.get_mut(name)?.next_socket()
    }

    /// All sockets under `name`, in registration order.
    pub fn sockets(&self, name: &str) -> Vec<SocketId> {
        self.services
            .get(name)
            .map(|entry| entry.sockets().to_vec())
            .unwrap_or_default()
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.services.get(name).is_some_and(|entry| !entry.is_empty())
    }

    pub fn entry(&self, name: &str) -> Option<&ServiceEntry> {
        self.services.get(name)
    }

    /// Names with at least one live socket, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .services
            .iter()
            .filter(|(_, entry)| !entry.is_empty())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }
}

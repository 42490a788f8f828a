//! The `transport` module is responsible for network communication between
//! brokers and their clients, via WebSockets.
//!
//! It defines the frame protocol, its codec and optional encryption, the
//! live socket table, and the WebSocket server that feeds decoded frames
//! into the broker engine.

pub mod codec;
pub mod connections;
pub mod crypto;
pub mod message;
pub mod server;

pub use connections::Connections;
pub use server::{BrokerServer, ServerError};

#[cfg(test)]
mod tests;

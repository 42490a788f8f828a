//! The broker crate module contains the routing and lifecycle engine:
//! service registry, pending-response buffer, TTL sweep, proxy fallback
//! and snapshot persistence.
//!
//! Public types:
//! - `Broker`: the engine the server feeds decoded frames into.
//! - `Message`: the unit of routing.
//! - `FrameSink`: how the engine writes to sockets it does not own.

pub mod engine;
pub mod message;
pub mod registry;
pub mod snapshot;

pub use engine::{Broker, BrokerOptions, FrameSink};
pub use message::{Message, MessageInfo, MessageOptions, MessageStatus};
pub use registry::{ServiceRegistry, SocketId};
pub use snapshot::Snapshot;

#[cfg(test)]
mod tests;

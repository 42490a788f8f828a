//! # relayq
//!
//! `relayq` is a request/response message broker built with Rust. Services
//! connect over WebSockets, register under a logical name, and exchange
//! correlated requests that the broker routes, buffers and, if needed,
//! forwards to an upstream broker.
//!
//! ## Core Modules
//!
//! - `queue`: Serial task queue with retry continuations; drives all work.
//! - `broker`: Routing engine: service registry, pending-response buffer, TTL sweep, proxying and snapshots.
//! - `client`: Broker client: correlated requests and request handling.
//! - `transport`: Wire frames, codec, optional encryption and the WebSocket server.
//! - `config`: Loading and validating server and client configuration.
//! - `persistence`: Key/value storage for broker snapshots (sled or in-memory).
//! - `utils`: Logging setup, error codes, ids and timestamps.

pub mod broker;
pub mod client;
pub mod config;
pub mod persistence;
pub mod queue;
pub mod transport;
pub mod utils;

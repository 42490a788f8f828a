//! The `utils` module provides a collection of utility functions and common
//! definitions used across the `relayq` crate.
//!
//! It centralizes the error-code table shared by the broker and its clients,
//! logging initialization, and the id/clock helpers every stage stamps
//! messages with.

pub mod error;
pub mod logging;

use uuid::Uuid;

/// Milliseconds since the UNIX epoch, the unit of every `info.*At` stamp.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// A fresh opaque identifier for messages and correlation ids.
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

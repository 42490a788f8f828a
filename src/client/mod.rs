//! The `client` module is the endpoint side of the broker protocol.
//!
//! A [`BrokerClient`] connects to a broker server, registers under a logical
//! name, sends correlated requests and serves requests routed to it through a
//! [`RequestHandler`]. Brokers also use it to reach upstream brokers.

mod broker_client;
mod error;
mod handler;
mod pending;

pub use broker_client::{BrokerClient, ConnectionState, Reply, RequestOutcome};
pub use error::ClientError;
pub use handler::{FnHandler, HandlerReply, NoHandler, RequestHandler, handler_fn};
pub use pending::{Completion, PendingRequests};

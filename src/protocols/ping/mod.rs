//! Ping handler.
//!
//! A minimal method for health checks and latency measurement:
//! - Caller sends: `{"name":["ping"],"type":"async","args":[]}`
//! - Handler replies: `"pong"`, or `"pong <message>"` when the first
//!   argument is a string
//!
//! No state is touched, so a round trip measures pure transport and
//! dispatch overhead.

pub mod handler;

pub use handler::PingHandler;

/// Method the handler is registered under.
pub const METHOD: &str = "ping";

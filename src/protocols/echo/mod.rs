//! Echo handler.
//!
//! Sends back whatever the caller sends, for throughput testing and data
//! integrity checks:
//! - `async` calls get their arguments back as the JSON reply
//! - `source` calls get each argument back as its own stream packet
//! - `sink` calls are drained and acknowledged with the end packet
//! - `duplex` calls get every inbound packet body back on the stream, with
//!   its body type, followed by an end packet once the caller ends its side

pub mod handler;

pub use handler::EchoHandler;

/// Method the handler is registered under.
pub const METHOD: &str = "echo";

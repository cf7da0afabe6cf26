//! Built-in handlers.
//!
//! - `ping`: health check and latency measurement
//! - `echo`: sends back whatever the caller sends

pub mod echo;
pub mod ping;

use std::sync::Arc;

use crate::mux::HandlerMux;

/// Register every built-in handler on `mux`.
pub fn register_builtin(mux: &mut HandlerMux) {
    mux.register(ping::METHOD, Arc::new(ping::PingHandler));
    mux.register(echo::METHOD, Arc::new(echo::EchoHandler));
}

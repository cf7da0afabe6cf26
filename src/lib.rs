//! muxrpc: many request/response exchanges over one connection.
//!
//! A [`Packer`] turns a byte connection into a pump of framed [`Packet`]s,
//! keeping reads and writes independent and making shutdown safe to race.
//! The session loop in [`server`] demultiplexes packets into per-request
//! [`Stream`]s and routes each new call through a [`HandlerMux`] to the
//! [`Handler`] registered for its method.
//!
//! ```ignore
//! use muxrpc::{handler_fn, HandlerMux, Request};
//! use std::sync::Arc;
//!
//! let mut mux = HandlerMux::new();
//! mux.register(["hello"], Arc::new(handler_fn(|_ctx, req: Request| async move {
//!     let _ = req.stream.pour_json(&"world").await;
//!     let _ = req.stream.close().await;
//! })));
//! ```

pub mod codec;
pub mod config;
pub mod error;
pub mod mux;
pub mod packer;
pub mod pipe;
pub mod protocols;
pub mod request;
pub mod server;
pub mod stream;

pub use codec::{BodyType, Flags, Packet};
pub use error::{is_already_closed_or_reset, Result, RpcError};
pub use mux::{handler_fn, Endpoint, Handler, HandlerMux};
pub use packer::Packer;
pub use request::{CallType, Method, Request};
pub use stream::{Stream, StreamConfig};

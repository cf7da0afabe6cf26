//! Error types and the closed-connection classifier.
//!
//! Most failures surfaced by the packer are either genuine protocol errors or
//! some flavour of "the other side is gone". [`is_already_closed_or_reset`]
//! lets callers tell the two apart so orderly shutdown does not look like an
//! alarm.

use std::error::Error as StdError;
use std::io;
use std::sync::Arc;

use thiserror::Error;

use crate::request::Method;

/// Main error type for muxrpc operations.
#[derive(Debug, Error)]
pub enum RpcError {
    /// Write attempted after the packer was closed.
    #[error("muxrpc: pour to closed sink")]
    SinkClosed,

    /// The session was torn down while the operation was pending.
    #[error("muxrpc: session terminated")]
    SessionTerminated,

    /// The caller's context was cancelled.
    #[error("muxrpc/packer: read packet canceled")]
    Canceled,

    /// Reading a packet from the transport failed.
    #[error("error reading packet: {0}")]
    Read(#[source] io::Error),

    /// Writing a packet to the transport failed.
    #[error("muxrpc: error writing packet: {0}")]
    Write(#[source] io::Error),

    /// Closing the underlying connection failed. Shared by every close caller.
    #[error("error closing underlying connection: {0}")]
    Close(#[source] Arc<io::Error>),

    /// Packet cannot be framed.
    #[error("invalid packet: {0}")]
    InvalidPacket(String),

    /// The peer ended a stream with an error.
    #[error("remote error: {0}")]
    Remote(String),

    /// Malformed call header or unexpected packet.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// No handler registered for the method.
    #[error("no such method: {0}")]
    UnknownMethod(Method),
}

/// Result type alias using RpcError.
pub type Result<T> = std::result::Result<T, RpcError>;

/// Text some network stacks report for I/O on a socket after close.
const CLOSED_CONN_MESSAGE: &str = "use of closed network connection";

/// Reports whether `err` means the connection or session is already closed,
/// rather than a real protocol failure.
///
/// Checks run over the whole cause chain in this order: muxrpc sentinels,
/// already-closed resources (bare or wrapped inside another `io::Error`),
/// connection reset / broken pipe, then the closed-connection message.
pub fn is_already_closed_or_reset(err: Option<&(dyn StdError + 'static)>) -> bool {
    let Some(err) = err else {
        return false;
    };

    let chain: Vec<&(dyn StdError + 'static)> = causes(err).collect();

    if chain.iter().any(|e| is_sentinel(*e)) {
        return true;
    }
    if chain.iter().filter_map(|e| as_io(*e)).any(is_closed_resource) {
        return true;
    }
    if chain.iter().filter_map(|e| as_io(*e)).any(is_conn_broken) {
        return true;
    }
    chain
        .iter()
        .any(|e| e.to_string().contains(CLOSED_CONN_MESSAGE))
}

impl RpcError {
    /// Shorthand for [`is_already_closed_or_reset`] on this error.
    pub fn is_already_closed_or_reset(&self) -> bool {
        is_already_closed_or_reset(Some(self))
    }
}

/// Walk `source()` links, descending into custom `io::Error` payloads which
/// `io::Error::source` skips over.
fn causes<'a>(
    err: &'a (dyn StdError + 'static),
) -> impl Iterator<Item = &'a (dyn StdError + 'static)> {
    std::iter::successors(Some(err), |e| {
        let e: &'a (dyn StdError + 'static) = *e;
        as_io(e)
            .and_then(|io_err| io_err.get_ref())
            .map(|inner| inner as &(dyn StdError + 'static))
            .or_else(|| e.source())
    })
}

fn as_io<'a>(err: &'a (dyn StdError + 'static)) -> Option<&'a io::Error> {
    err.downcast_ref::<io::Error>()
        .or_else(|| err.downcast_ref::<Arc<io::Error>>().map(|a| a.as_ref()))
}

fn is_sentinel(err: &(dyn StdError + 'static)) -> bool {
    matches!(
        err.downcast_ref::<RpcError>(),
        Some(RpcError::SinkClosed | RpcError::SessionTerminated)
    )
}

fn is_closed_resource(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::NotConnected
}

fn is_conn_broken(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify<E: StdError + 'static>(err: E) -> bool {
        is_already_closed_or_reset(Some(&err))
    }

    #[test]
    fn test_none_is_not_closed() {
        assert!(!is_already_closed_or_reset(None));
    }

    #[test]
    fn test_sentinels() {
        assert!(classify(RpcError::SinkClosed));
        assert!(classify(RpcError::SessionTerminated));
        assert!(RpcError::SinkClosed.is_already_closed_or_reset());
    }

    #[test]
    fn test_already_closed_bare_and_wrapped() {
        let bare = io::Error::new(io::ErrorKind::NotConnected, "file already closed");
        assert!(classify(bare));

        // Path-style wrapping: the closed condition sits inside another io::Error.
        let inner = io::Error::new(io::ErrorKind::NotConnected, "file already closed");
        let wrapped = io::Error::new(io::ErrorKind::Other, inner);
        assert!(classify(wrapped));

        let closed_on_close = RpcError::Close(Arc::new(io::Error::from(
            io::ErrorKind::NotConnected,
        )));
        assert!(closed_on_close.is_already_closed_or_reset());
    }

    #[test]
    fn test_reset_and_broken_pipe() {
        assert!(classify(RpcError::Read(io::Error::from(
            io::ErrorKind::ConnectionReset
        ))));
        assert!(classify(RpcError::Write(io::Error::from(
            io::ErrorKind::BrokenPipe
        ))));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_raw_os_errors() {
        // ECONNRESET and EPIPE
        let reset = io::Error::from_raw_os_error(104);
        let pipe = io::Error::from_raw_os_error(32);
        assert!(classify(RpcError::Read(reset)));
        assert!(classify(pipe));
    }

    #[test]
    fn test_closed_connection_message() {
        let err = io::Error::other("read tcp 127.0.0.1:1: use of closed network connection");
        assert!(classify(RpcError::Read(err)));
    }

    #[test]
    fn test_unrelated_errors() {
        assert!(!classify(io::Error::other("disk on fire")));
        assert!(!classify(RpcError::Protocol("bad header".into())));
        assert!(!classify(RpcError::Read(io::Error::from(
            io::ErrorKind::UnexpectedEof
        ))));
        assert!(!classify(RpcError::Canceled));
    }
}

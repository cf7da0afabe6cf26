//! Inbound call values: method paths, call headers and requests.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::error::{Result, RpcError};
use crate::stream::{Stream, StreamConfig};

/// Method path, e.g. `["foo", "bar"]`. Compared by exact full-path equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Method(Vec<String>);

impl Method {
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Method(segments.into_iter().map(Into::into).collect())
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("."))
    }
}

/// Splits on `.`: `"foo.bar"` is `["foo", "bar"]`.
impl From<&str> for Method {
    fn from(path: &str) -> Self {
        Method::new(path.split('.'))
    }
}

impl<const N: usize> From<[&str; N]> for Method {
    fn from(segments: [&str; N]) -> Self {
        Method::new(segments)
    }
}

/// Shape of an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallType {
    /// One request, one reply.
    Async,
    /// Callee streams values to the caller.
    Source,
    /// Caller streams values to the callee.
    Sink,
    /// Both directions stream.
    Duplex,
}

impl CallType {
    /// Stream configuration for the callee's side of the exchange.
    pub fn callee_config(self) -> StreamConfig {
        match self {
            CallType::Async => StreamConfig::default(),
            CallType::Source => StreamConfig {
                inbound_stream: false,
                outbound_stream: true,
            },
            CallType::Sink => StreamConfig {
                inbound_stream: true,
                outbound_stream: false,
            },
            CallType::Duplex => StreamConfig {
                inbound_stream: true,
                outbound_stream: true,
            },
        }
    }
}

/// JSON body of the packet that opens a call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallHeader {
    pub name: Method,
    #[serde(rename = "type", default = "default_call_type")]
    pub kind: CallType,
    #[serde(default)]
    pub args: Value,
}

fn default_call_type() -> CallType {
    CallType::Async
}

impl CallHeader {
    pub fn decode(body: &[u8]) -> Result<Self> {
        let header: CallHeader = serde_json::from_slice(body)
            .map_err(|e| RpcError::Protocol(format!("invalid call header: {e}")))?;
        if header.name.is_empty() {
            return Err(RpcError::Protocol("call header has empty name".into()));
        }
        Ok(header)
    }
}

/// An inbound call handed to a [`Handler`](crate::mux::Handler).
///
/// The handler owns the stream and must close it when the exchange is done.
pub struct Request {
    pub method: Method,
    pub kind: CallType,
    pub args: Value,
    pub stream: Stream,
}

impl Request {
    pub fn new(method: impl Into<Method>, stream: Stream) -> Self {
        Self {
            method: method.into(),
            kind: CallType::Async,
            args: Value::Null,
            stream,
        }
    }

    pub fn from_header(header: CallHeader, stream: Stream) -> Self {
        Self {
            method: header.name,
            kind: header.kind,
            args: header.args,
            stream,
        }
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method)
            .field("kind", &self.kind)
            .field("req", &self.stream.req())
            .finish()
    }
}

//! Per-request duplex stream.
//!
//! A [`Stream`] is one logical exchange on a shared connection. Inbound
//! packets arrive on its source, already demultiplexed by request number.
//! Outbound packets are tagged with the stream's number and poured into the
//! shared sink. Closing a stream ends the exchange. It never closes the
//! sink, which other streams share.

use bytes::Bytes;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::codec::{BodyType, Flags, Packet};
use crate::error::{Result, RpcError};
use crate::pipe::{Sink, Source};

/// Body of a successful end packet.
const END_OK: &[u8] = b"true";

/// Whether each direction of a stream carries stream packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamConfig {
    /// The peer sends a sequence of packets ending with an end packet.
    /// Without it, [`Stream::next`] reports end-of-stream straight away.
    pub inbound_stream: bool,
    /// Packets we send carry the stream flag.
    pub outbound_stream: bool,
}

/// Error object sent in an error end packet.
#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    name: &'a str,
    message: &'a str,
}

/// Handle for one multiplexed request.
pub struct Stream {
    req: i32,
    config: StreamConfig,
    source: Arc<dyn Source<Packet>>,
    sink: Arc<dyn Sink<Packet>>,
    closed: AtomicBool,
    poured: AtomicBool,
    remote_done: AtomicBool,
}

impl Stream {
    pub fn new(
        source: Arc<dyn Source<Packet>>,
        sink: Arc<dyn Sink<Packet>>,
        req: i32,
        config: StreamConfig,
    ) -> Self {
        Self {
            req,
            config,
            source,
            sink,
            closed: AtomicBool::new(false),
            poured: AtomicBool::new(false),
            remote_done: AtomicBool::new(false),
        }
    }

    pub fn req(&self) -> i32 {
        self.req
    }

    pub fn config(&self) -> StreamConfig {
        self.config
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Next body from the peer. `Ok(None)` once the peer has ended the stream.
    pub async fn next(&self, ctx: &CancellationToken) -> Result<Option<Bytes>> {
        Ok(self.next_typed(ctx).await?.map(|(body, _)| body))
    }

    /// Like [`next`](Self::next), keeping the body type the peer sent.
    ///
    /// A stream without `inbound_stream` carries no data from the peer and
    /// ends immediately.
    pub async fn next_typed(
        &self,
        ctx: &CancellationToken,
    ) -> Result<Option<(Bytes, BodyType)>> {
        if !self.config.inbound_stream || self.remote_done.load(Ordering::Acquire) {
            return Ok(None);
        }

        let Some(pkt) = self.source.next(ctx).await? else {
            self.remote_done.store(true, Ordering::Release);
            return Ok(None);
        };

        if pkt.flags.is_end_err() {
            self.remote_done.store(true, Ordering::Release);
            if pkt.body.as_ref() == END_OK {
                return Ok(None);
            }
            return Err(RpcError::Remote(error_message(&pkt.body)));
        }

        Ok(Some((pkt.body, pkt.flags.body_type())))
    }

    /// Send one body to the peer.
    pub async fn pour(&self, body: impl Into<Bytes>, kind: BodyType) -> Result<()> {
        if self.is_closed() {
            return Err(RpcError::SinkClosed);
        }
        let pkt = Packet::new(self.flags(kind), self.req, body);
        self.poured.store(true, Ordering::Release);
        self.sink.pour(pkt).await
    }

    /// Serialize `value` as JSON and send it.
    pub async fn pour_json<T: Serialize + ?Sized>(&self, value: &T) -> Result<()> {
        let body = serde_json::to_vec(value)
            .map_err(|e| RpcError::Protocol(format!("encode json body: {e}")))?;
        self.pour(body, BodyType::Json).await
    }

    /// End our side of the exchange. Later calls are no-ops.
    ///
    /// A non-streaming reply is complete once poured, so closing after it
    /// sends nothing.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if !self.config.outbound_stream && self.poured.load(Ordering::Acquire) {
            return Ok(());
        }
        let pkt = Packet::new(
            self.flags(BodyType::Json) | Flags::END_ERR,
            self.req,
            Bytes::from_static(END_OK),
        );
        self.sink.pour(pkt).await
    }

    /// End the exchange with an error the peer will see.
    pub async fn close_with_error(&self, message: &str) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let body = serde_json::to_vec(&ErrorBody {
            name: "Error",
            message,
        })
        .map_err(|e| RpcError::Protocol(format!("encode error body: {e}")))?;
        let pkt = Packet::new(
            self.flags(BodyType::Json) | Flags::END_ERR,
            self.req,
            body,
        );
        self.sink.pour(pkt).await
    }

    fn flags(&self, kind: BodyType) -> Flags {
        let flags = Flags::from(kind);
        if self.config.outbound_stream {
            flags | Flags::STREAM
        } else {
            flags
        }
    }
}

/// Pull `message` out of a JSON error body, falling back to the raw text.
fn error_message(body: &[u8]) -> String {
    serde_json::from_slice::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(String::from))
        .unwrap_or_else(|| String::from_utf8_lossy(body).into_owned())
}

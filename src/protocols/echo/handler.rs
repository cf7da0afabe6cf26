//! Echo call handler.

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::codec::BodyType;
use crate::error::Result;
use crate::mux::{Endpoint, Handler};
use crate::request::{CallType, Request};

/// Sends every inbound body back to the caller.
pub struct EchoHandler;

impl EchoHandler {
    /// Stream each argument back, one packet per element.
    async fn echo_args(&self, req: &Request) -> Result<usize> {
        let items: &[Value] = match &req.args {
            Value::Array(items) => items.as_slice(),
            Value::Null => &[],
            single => std::slice::from_ref(single),
        };
        for item in items {
            req.stream.pour_json(item).await?;
        }
        Ok(items.len())
    }

    /// Send every inbound body back with the body type it arrived with.
    async fn echo_stream(&self, ctx: &CancellationToken, req: &Request) -> Result<usize> {
        let mut echoed = 0;
        while let Some((body, kind)) = req.stream.next_typed(ctx).await? {
            echoed += body.len();
            req.stream.pour(body, kind).await?;
        }
        Ok(echoed)
    }

    /// Consume the caller's stream; the end packet acknowledges it.
    async fn drain(&self, ctx: &CancellationToken, req: &Request) -> Result<usize> {
        let mut received = 0;
        while let Some(body) = req.stream.next(ctx).await? {
            received += body.len();
        }
        Ok(received)
    }
}

#[async_trait]
impl Handler for EchoHandler {
    async fn handle_call(&self, ctx: CancellationToken, req: Request) {
        let result = match req.kind {
            CallType::Async => req.stream.pour_json(&req.args).await.map(|_| 0),
            CallType::Source => self.echo_args(&req).await,
            CallType::Sink => self.drain(&ctx, &req).await,
            CallType::Duplex => self.echo_stream(&ctx, &req).await,
        };

        match result {
            Ok(count) => {
                trace!(req = req.stream.req(), kind = ?req.kind, count, "Echo finished");
                if let Err(e) = req.stream.close().await {
                    debug!(error = %e, "Failed to close echo stream");
                }
            }
            Err(e) => {
                debug!(req = req.stream.req(), error = %e, "Echo failed");
                let _ = req.stream.close_with_error(&e.to_string()).await;
            }
        }
    }

    async fn handle_connect(&self, _ctx: CancellationToken, _endpoint: Endpoint) {}
}

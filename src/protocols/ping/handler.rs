//! Ping call handler.

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::mux::{Endpoint, Handler};
use crate::request::Request;

/// Answers `ping` with `pong`.
pub struct PingHandler;

/// Reply for the given call arguments.
fn reply(args: &Value) -> String {
    match args.get(0).and_then(Value::as_str) {
        Some(message) => format!("pong {message}"),
        None => "pong".to_string(),
    }
}

#[async_trait]
impl Handler for PingHandler {
    async fn handle_call(&self, _ctx: CancellationToken, req: Request) {
        let response = reply(&req.args);
        trace!(req = req.stream.req(), %response, "Ping");

        if let Err(e) = req.stream.pour_json(&response).await {
            debug!(error = %e, "Failed to send pong");
        }
        if let Err(e) = req.stream.close().await {
            debug!(error = %e, "Failed to close ping stream");
        }
    }

    async fn handle_connect(&self, _ctx: CancellationToken, endpoint: Endpoint) {
        debug!(peer = endpoint.remote(), "Ping available");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Packet;
    use crate::pipe::{duplex_pipe, Source};
    use crate::stream::{Stream, StreamConfig};
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn test_reply() {
        assert_eq!(reply(&json!([])), "pong");
        assert_eq!(reply(&Value::Null), "pong");
        assert_eq!(reply(&json!(["hello"])), "pong hello");
        assert_eq!(reply(&json!([42])), "pong");
    }

    #[tokio::test]
    async fn test_single_reply_no_end_packet() {
        let (back, forth) = duplex_pipe::<Packet>();
        let back = Arc::new(back);
        let mut req = Request::new(
            "ping",
            Stream::new(back.clone(), back.clone(), -1, StreamConfig::default()),
        );
        req.args = json!(["there"]);

        PingHandler.handle_call(CancellationToken::new(), req).await;
        drop(back);

        let ctx = CancellationToken::new();
        let pkt = forth.next(&ctx).await.unwrap().unwrap();
        assert_eq!(&pkt.body[..], br#""pong there""#);
        assert!(!pkt.flags.is_end_err());
        assert!(forth.next(&ctx).await.unwrap().is_none());
    }
}

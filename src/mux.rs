//! Handler registration and dispatch.
//!
//! [`HandlerMux`] is a static routing table from [`Method`] to [`Handler`].
//! Set it up before serving starts; dispatch takes `&self` and does no
//! locking of its own.

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use crate::error::RpcError;
use crate::request::{Method, Request};

/// Handle on an established session, passed to connect callbacks.
#[derive(Clone)]
pub struct Endpoint {
    remote: Arc<str>,
    session: CancellationToken,
}

impl Endpoint {
    pub fn new(remote: impl Into<Arc<str>>, session: CancellationToken) -> Self {
        Self {
            remote: remote.into(),
            session,
        }
    }

    /// Peer address or transport label.
    pub fn remote(&self) -> &str {
        &self.remote
    }

    /// Ask the session to shut down. The serving loop closes the connection.
    pub fn terminate(&self) {
        self.session.cancel();
    }

    pub fn is_terminated(&self) -> bool {
        self.session.is_cancelled()
    }

    /// Fires when the session ends.
    pub fn terminated(&self) -> &CancellationToken {
        &self.session
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("remote", &self.remote)
            .field("terminated", &self.is_terminated())
            .finish()
    }
}

/// Consumer of dispatched calls and session events.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Process one inbound call. The handler is responsible for closing
    /// `req.stream` when the exchange is done.
    async fn handle_call(&self, ctx: CancellationToken, req: Request);

    /// React to a newly established session.
    async fn handle_connect(&self, ctx: CancellationToken, endpoint: Endpoint);
}

/// Handler built from a call closure; connect events are ignored.
pub struct FnHandler<F> {
    call: F,
}

/// Wrap `f` as a [`Handler`].
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(CancellationToken, Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    FnHandler { call: f }
}

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(CancellationToken, Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn handle_call(&self, ctx: CancellationToken, req: Request) {
        (self.call)(ctx, req).await
    }

    async fn handle_connect(&self, _ctx: CancellationToken, _endpoint: Endpoint) {}
}

/// Routing table from method path to handler.
#[derive(Default)]
pub struct HandlerMux {
    handlers: HashMap<Method, Arc<dyn Handler>>,
    /// First-registration order, for connect fan-out.
    order: Vec<Method>,
}

impl HandlerMux {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route `method` to `handler`, replacing any earlier registration.
    pub fn register(&mut self, method: impl Into<Method>, handler: Arc<dyn Handler>) {
        let method = method.into();
        if self.handlers.insert(method.clone(), handler).is_none() {
            self.order.push(method);
        }
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Dispatch `req` to the handler registered for its exact method.
    ///
    /// Runs the handler to completion. Unknown methods are answered with an
    /// error end packet on the request's stream.
    pub async fn handle_call(&self, ctx: CancellationToken, req: Request) {
        match self.handlers.get(&req.method) {
            Some(handler) => {
                trace!(method = %req.method, req = req.stream.req(), "Dispatching call");
                handler.handle_call(ctx, req).await;
            }
            None => {
                warn!(method = %req.method, req = req.stream.req(), "No handler for method");
                let err = RpcError::UnknownMethod(req.method.clone());
                if let Err(e) = req.stream.close_with_error(&err.to_string()).await {
                    trace!(error = %e, "Failed to report unknown method");
                }
            }
        }
    }

    /// Notify every registered handler of a new session, in registration order.
    pub async fn handle_connect(&self, ctx: CancellationToken, endpoint: Endpoint) {
        for method in &self.order {
            if let Some(handler) = self.handlers.get(method) {
                handler.handle_connect(ctx.clone(), endpoint.clone()).await;
            }
        }
    }
}

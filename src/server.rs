//! TCP and stdio serving.
//!
//! Accepts connections, wraps each in a [`Packer`], turns call-opening
//! packets into [`Request`]s and hands them to the [`HandlerMux`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::codec::Packet;
use crate::config::Config;
use crate::error::{Result, RpcError};
use crate::mux::{Endpoint, HandlerMux};
use crate::packer::Packer;
use crate::pipe::{pipe, PipeSink, Sink, Source};
use crate::request::{CallHeader, Request};
use crate::stream::Stream;

/// Listen backlog for the accept socket.
const LISTEN_BACKLOG: i32 = 1024;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Server instance
pub struct Server {
    config: Config,
    mux: Arc<HandlerMux>,
    connection_limit: Arc<Semaphore>,
    shutdown: CancellationToken,
}

impl Server {
    /// Create a new server instance
    pub fn new(config: Config, mux: HandlerMux) -> Self {
        let connection_limit = Arc::new(Semaphore::new(config.max_connections));
        Server {
            config,
            mux: Arc::new(mux),
            connection_limit,
            shutdown: CancellationToken::new(),
        }
    }

    /// Token that stops the accept loop and every session when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Start the server and begin accepting connections
    pub async fn run(&self) -> std::result::Result<(), BoxError> {
        let addr: SocketAddr = self.config.listen.parse()?;
        let listener = TcpListener::from_std(create_listener(addr)?)?;
        info!(address = %addr, "Server listening");
        self.serve(listener).await
    }

    /// Accept loop over an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> std::result::Result<(), BoxError> {
        loop {
            // Wait for a connection slot
            let permit = self.connection_limit.clone().acquire_owned().await?;

            let accepted = tokio::select! {
                res = listener.accept() => res,
                _ = self.shutdown.cancelled() => {
                    info!("Server shutting down");
                    return Ok(());
                }
            };

            match accepted {
                Ok((stream, addr)) => {
                    debug!(peer = %addr, "New connection");
                    if let Err(e) = stream.set_nodelay(true) {
                        trace!(peer = %addr, error = %e, "Failed to set TCP_NODELAY");
                    }

                    let mux = Arc::clone(&self.mux);
                    let ctx = self.shutdown.child_token();
                    let max_body_size = self.config.max_body_size;

                    tokio::spawn(async move {
                        let remote = addr.to_string();
                        if let Err(e) = serve_session(stream, remote, mux, ctx, max_body_size).await
                        {
                            debug!(peer = %addr, error = %e, "Session error");
                        }
                        drop(permit);
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }
}

/// Serve a single session over stdin/stdout.
pub async fn serve_stdio(
    mux: Arc<HandlerMux>,
    ctx: CancellationToken,
    max_body_size: usize,
) -> Result<()> {
    let conn = tokio::io::join(tokio::io::stdin(), tokio::io::stdout());
    serve_session(conn, "stdio".to_string(), mux, ctx, max_body_size).await
}

/// Run one session to completion.
///
/// Returns `Ok(())` when the connection ends normally, including the
/// already-closed and reset conditions a hang-up produces.
pub async fn serve_session<T>(
    conn: T,
    remote: String,
    mux: Arc<HandlerMux>,
    ctx: CancellationToken,
    max_body_size: usize,
) -> Result<()>
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    let packer = Arc::new(Packer::with_max_body(conn, max_body_size));
    let session = ctx.child_token();
    let endpoint = Endpoint::new(remote.as_str(), session.clone());

    // Terminating the session closes the packer, which ends the read loop.
    let closer = Arc::clone(&packer);
    let watch = session.clone();
    tokio::spawn(async move {
        watch.cancelled().await;
        if let Err(e) = closer.close().await {
            debug!(error = %e, "Close on terminate failed");
        }
    });

    // Connect callbacks may block; keep them off the read loop.
    let connect_mux = Arc::clone(&mux);
    let connect_ctx = session.clone();
    tokio::spawn(async move {
        connect_mux.handle_connect(connect_ctx, endpoint).await;
    });

    let mut router = Router::new(Arc::clone(&packer), mux, session.clone());
    let outcome = loop {
        match packer.next(&session).await {
            Ok(Some(pkt)) => router.route(pkt).await,
            Ok(None) => break Ok(()),
            Err(RpcError::Canceled) => break Ok(()),
            Err(e) if e.is_already_closed_or_reset() => {
                debug!(peer = %remote, error = %e, "Connection closed by peer");
                break Ok(());
            }
            Err(e) => {
                warn!(peer = %remote, error = %e, "Session read failed");
                break Err(e);
            }
        }
    };

    router.shutdown();
    session.cancel();
    packer.close().await?;
    debug!(peer = %remote, "Session ended");
    outcome
}

/// Demultiplexes inbound packets onto per-request streams.
struct Router<T> {
    packer: Arc<Packer<T>>,
    mux: Arc<HandlerMux>,
    ctx: CancellationToken,
    streams: HashMap<i32, PipeSink<Packet>>,
}

impl<T> Router<T>
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    fn new(packer: Arc<Packer<T>>, mux: Arc<HandlerMux>, ctx: CancellationToken) -> Self {
        Self {
            packer,
            mux,
            ctx,
            streams: HashMap::new(),
        }
    }

    async fn route(&mut self, pkt: Packet) {
        if let Some(sink) = self.streams.get(&pkt.req) {
            let req = pkt.req;
            let end = pkt.flags.is_end_err();
            let delivered = sink.send(pkt).is_ok();
            if !delivered {
                trace!(req, "Stream reader gone, dropping packet");
            }
            if end || !delivered {
                sink.close_now();
                self.streams.remove(&req);
            }
            return;
        }

        if pkt.req >= 0 {
            // Replies to calls we originate; nothing here opens those.
            trace!(req = pkt.req, "Packet for unknown local stream");
            return;
        }

        if pkt.flags.is_end_err() {
            trace!(req = pkt.req, "End packet for unknown stream");
            return;
        }

        self.open_call(pkt).await;
    }

    async fn open_call(&mut self, pkt: Packet) {
        let header = match CallHeader::decode(&pkt.body) {
            Ok(header) => header,
            Err(e) => {
                warn!(req = pkt.req, error = %e, "Rejecting call");
                let stream = Stream::new(
                    Arc::new(pipe::<Packet>().1),
                    self.packer.clone(),
                    pkt.req,
                    Default::default(),
                );
                if let Err(e) = stream.close_with_error(&e.to_string()).await {
                    debug!(error = %e, "Failed to send call rejection");
                }
                return;
            }
        };

        let (sink, source) = pipe::<Packet>();
        let config = header.kind.callee_config();
        if config.inbound_stream {
            self.streams.insert(pkt.req, sink);
        }

        let source: Arc<dyn Source<Packet>> = Arc::new(source);
        let out: Arc<dyn Sink<Packet>> = self.packer.clone();
        let stream = Stream::new(source, out, pkt.req, config);
        let req = Request::from_header(header, stream);
        debug!(method = %req.method, kind = ?req.kind, req = pkt.req, "New call");

        let mux = Arc::clone(&self.mux);
        let ctx = self.ctx.clone();
        tokio::spawn(async move {
            mux.handle_call(ctx, req).await;
        });
    }

    /// End every open stream so blocked readers see end-of-stream.
    fn shutdown(&mut self) {
        for (_, sink) in self.streams.drain() {
            sink.close_now();
        }
    }
}

/// Create a TCP listener with SO_REUSEADDR.
fn create_listener(addr: SocketAddr) -> std::io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    Ok(socket.into())
}

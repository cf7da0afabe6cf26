//! Packet pump over one duplex connection.
//!
//! A [`Packer`] owns the connection and exposes it as a [`Source`] and
//! [`Sink`] of [`Packet`]s. Reads and writes hold separate locks, so inbound
//! and outbound traffic never wait on each other.
//!
//! Request numbers are flipped on read: the wire numbers a stream from the
//! side that opened it, so after negation streams we opened are positive and
//! streams the peer opened are negative, whichever side sent the packet.

use async_trait::async_trait;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::{Mutex, OnceCell};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::codec::{Packet, PacketReader, PacketWriter, DEFAULT_MAX_BODY_SIZE};
use crate::error::{is_already_closed_or_reset, Result, RpcError};
use crate::pipe::{Sink, Source};

/// Longest a close waits for the peer to accept the goodbye frame.
pub const GOODBYE_TIMEOUT: Duration = Duration::from_millis(250);

/// Packet source and sink bound to one connection.
pub struct Packer<T> {
    reader: Mutex<Option<PacketReader<ReadHalf<T>>>>,
    writer: Mutex<Option<PacketWriter<WriteHalf<T>>>>,
    max_body_size: usize,

    /// Outcome of the single real close, shared by every caller.
    closed: OnceCell<std::result::Result<(), Arc<io::Error>>>,
    /// Fired as soon as a close begins.
    closing: CancellationToken,
}

impl<T> Packer<T>
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Wrap an open connection with the default body size limit.
    pub fn new(conn: T) -> Self {
        Self::with_max_body(conn, DEFAULT_MAX_BODY_SIZE)
    }

    pub fn with_max_body(conn: T, max_body_size: usize) -> Self {
        let (r, w) = tokio::io::split(conn);
        Self {
            reader: Mutex::new(Some(PacketReader::new(r, max_body_size))),
            writer: Mutex::new(Some(PacketWriter::new(w))),
            max_body_size,
            closed: OnceCell::new(),
            closing: CancellationToken::new(),
        }
    }

    /// Token that fires once the packer starts closing.
    pub fn closing(&self) -> &CancellationToken {
        &self.closing
    }

    pub fn is_closed(&self) -> bool {
        self.closing.is_cancelled()
    }

    /// Pull the next inbound packet, with `req` negated.
    ///
    /// `Ok(None)` means end-of-stream: the peer hung up or the packer was
    /// closed. `ctx` is checked only once the read returns; a read already
    /// blocked in the transport is interrupted by [`close`](Self::close) and
    /// nothing else, so a frame is never abandoned halfway while the
    /// connection stays in use.
    pub async fn next(&self, ctx: &CancellationToken) -> Result<Option<Packet>> {
        let mut guard = self.reader.lock().await;
        let read = match guard.as_mut() {
            None => return Ok(None),
            Some(_) if self.closing.is_cancelled() => None,
            Some(reader) => tokio::select! {
                biased;
                res = reader.read_packet() => Some(res),
                _ = self.closing.cancelled() => None,
            },
        };

        // Once closing, the read half goes with whoever sees it first.
        let read = match read {
            Some(Err(_)) | None if self.closing.is_cancelled() => {
                guard.take();
                return Ok(None);
            }
            Some(read) => read,
            None => return Ok(None),
        };
        if ctx.is_cancelled() {
            return Err(RpcError::Canceled);
        }

        match read {
            Ok(Some(mut pkt)) => {
                pkt.req = -pkt.req;
                trace!(req = pkt.req, flags = ?pkt.flags, len = pkt.body.len(), "Read packet");
                Ok(Some(pkt))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(RpcError::Read(e)),
        }
    }

    /// Write one outbound packet.
    pub async fn pour(&self, pkt: Packet) -> Result<()> {
        if self.closing.is_cancelled() {
            return Err(RpcError::SinkClosed);
        }
        if pkt.body.len() > self.max_body_size {
            return Err(RpcError::InvalidPacket(format!(
                "body of {} bytes exceeds limit of {}",
                pkt.body.len(),
                self.max_body_size
            )));
        }

        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(RpcError::SinkClosed)?;
        trace!(req = pkt.req, flags = ?pkt.flags, len = pkt.body.len(), "Write packet");

        let written = tokio::select! {
            biased;
            res = writer.write_packet(&pkt) => Some(res),
            _ = self.closing.cancelled() => None,
        };
        match written {
            Some(res) => res.map_err(RpcError::Write),
            None => {
                // The frame may be torn; no goodbye may follow it.
                guard.take();
                debug!(req = pkt.req, "Write interrupted by close");
                Err(RpcError::SinkClosed)
            }
        }
    }

    /// Close the connection.
    ///
    /// Safe to call any number of times from any number of tasks. One call
    /// performs the close; every caller gets the same outcome, with
    /// already-closed and reset conditions reported as success.
    ///
    /// Pending reads and writes are interrupted. The goodbye frame is sent
    /// only if it fits within [`GOODBYE_TIMEOUT`]. Dropping the returned
    /// future early still leaves the packer closed.
    pub async fn close(&self) -> Result<()> {
        self.closing.cancel();

        let outcome = self
            .closed
            .get_or_init(|| async {
                let writer = self.writer.lock().await.take();
                let res = match writer {
                    Some(mut writer) => {
                        match tokio::time::timeout(GOODBYE_TIMEOUT, writer.close()).await {
                            Ok(res) => res,
                            Err(_) => {
                                debug!("Peer not draining, dropping goodbye");
                                Ok(())
                            }
                        }
                    }
                    None => Ok(()),
                };
                self.reader.lock().await.take();
                debug!(ok = res.is_ok(), "Packer closed");
                res.map_err(Arc::new)
            })
            .await;

        match outcome {
            Ok(()) => Ok(()),
            Err(e) if is_already_closed_or_reset(Some(e.as_ref())) => Ok(()),
            Err(e) => Err(RpcError::Close(Arc::clone(e))),
        }
    }
}

#[async_trait]
impl<T> Source<Packet> for Packer<T>
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn next(&self, ctx: &CancellationToken) -> Result<Option<Packet>> {
        Packer::next(self, ctx).await
    }
}

#[async_trait]
impl<T> Sink<Packet> for Packer<T>
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn pour(&self, pkt: Packet) -> Result<()> {
        Packer::pour(self, pkt).await
    }

    async fn close(&self) -> Result<()> {
        Packer::close(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Flags, PacketReader, PacketWriter};
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::task::{Context, Poll};
    use tokio::io::{DuplexStream, ReadBuf};
    use tokio::task::JoinSet;
    use tokio_test::io::Builder;

    /// Connection wrapper that counts shutdowns and can fail them.
    struct TrackedConn {
        inner: DuplexStream,
        shutdowns: Arc<AtomicUsize>,
        fail_with: Option<io::ErrorKind>,
    }

    impl AsyncRead for TrackedConn {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for TrackedConn {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Pin::new(&mut self.inner).poll_write(cx, buf)
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_flush(cx)
        }

        fn poll_shutdown(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
        ) -> Poll<io::Result<()>> {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
            if let Some(kind) = self.fail_with {
                return Poll::Ready(Err(io::Error::new(kind, "shutdown failed")));
            }
            Pin::new(&mut self.inner).poll_shutdown(cx)
        }
    }

    fn tracked(fail_with: Option<io::ErrorKind>) -> (TrackedConn, DuplexStream, Arc<AtomicUsize>) {
        let (local, remote) = tokio::io::duplex(4096);
        let shutdowns = Arc::new(AtomicUsize::new(0));
        let conn = TrackedConn {
            inner: local,
            shutdowns: Arc::clone(&shutdowns),
            fail_with,
        };
        (conn, remote, shutdowns)
    }

    async fn close_concurrently<T>(packer: Arc<Packer<T>>, n: usize) -> Vec<Result<()>>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let mut set = JoinSet::new();
        for _ in 0..n {
            let packer = Arc::clone(&packer);
            set.spawn(async move { packer.close().await });
        }
        let mut results = Vec::with_capacity(n);
        while let Some(res) = set.join_next().await {
            results.push(res.unwrap());
        }
        results
    }

    #[tokio::test]
    async fn test_next_negates_req() {
        let mock = Builder::new()
            .read(&[2, 0, 0, 0, 2, 0, 0, 0, 5, b'{', b'}'])
            .build();
        let packer = Packer::new(mock);
        let ctx = CancellationToken::new();

        let pkt = packer.next(&ctx).await.unwrap().unwrap();
        assert_eq!(pkt.req, -5);
        assert_eq!(&pkt.body[..], b"{}");

        // Transport EOF is a clean end.
        assert!(packer.next(&ctx).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_echo_observed_negated() {
        let (local, remote) = tokio::io::duplex(4096);
        let packer = Packer::new(local);
        let ctx = CancellationToken::new();

        let (r, w) = tokio::io::split(remote);
        let mut peer_reader = PacketReader::new(r, DEFAULT_MAX_BODY_SIZE);
        let mut peer_writer = PacketWriter::new(w);

        for n in [1, 7, -3, i32::MAX, i32::MIN + 1] {
            packer
                .pour(Packet::new(Flags::BINARY, n, &b"x"[..]))
                .await
                .unwrap();
            let seen = peer_reader.read_packet().await.unwrap().unwrap();
            assert_eq!(seen.req, n);
            peer_writer.write_packet(&seen).await.unwrap();

            let echoed = packer.next(&ctx).await.unwrap().unwrap();
            assert_eq!(echoed.req, -n);
        }
    }

    #[tokio::test]
    async fn test_next_cancelled_after_read() {
        let mock = Builder::new()
            .read(&[0, 0, 0, 0, 0, 0, 0, 0, 1])
            .build();
        let packer = Packer::new(mock);
        let ctx = CancellationToken::new();
        ctx.cancel();

        assert!(matches!(packer.next(&ctx).await, Err(RpcError::Canceled)));
    }

    #[tokio::test]
    async fn test_read_error_wrapped() {
        let mock = Builder::new()
            .read_error(io::Error::other("wire snapped"))
            .build();
        let packer = Packer::new(mock);
        let err = packer.next(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, RpcError::Read(_)));
        assert!(!err.is_already_closed_or_reset());
    }

    #[tokio::test]
    async fn test_pending_next_ends_on_close() {
        let (local, _remote) = tokio::io::duplex(4096);
        let packer = Arc::new(Packer::new(local));

        let reader = Arc::clone(&packer);
        let pending = tokio::spawn(async move { reader.next(&CancellationToken::new()).await });
        tokio::task::yield_now().await;

        packer.close().await.unwrap();
        assert!(pending.await.unwrap().unwrap().is_none());
        assert!(packer.next(&CancellationToken::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_pour_after_close() {
        let (conn, _remote, _) = tracked(None);
        let packer = Packer::new(conn);
        packer.close().await.unwrap();

        let err = packer
            .pour(Packet::new(Flags::JSON, 1, &b"{}"[..]))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::SinkClosed));
    }

    #[tokio::test]
    async fn test_pour_rejects_oversized_body() {
        let (local, _remote) = tokio::io::duplex(64);
        let packer = Packer::with_max_body(local, 4);
        let err = packer
            .pour(Packet::new(Flags::BINARY, 1, vec![0u8; 5]))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::InvalidPacket(_)));
    }

    #[tokio::test]
    async fn test_close_sends_goodbye() {
        let (local, remote) = tokio::io::duplex(4096);
        let packer = Packer::new(local);
        packer.close().await.unwrap();

        let mut peer = PacketReader::new(remote, DEFAULT_MAX_BODY_SIZE);
        assert!(peer.read_packet().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_close_runs_once() {
        let (conn, _remote, shutdowns) = tracked(None);
        let packer = Arc::new(Packer::new(conn));

        let results = close_concurrently(Arc::clone(&packer), 16).await;
        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);

        // Sequential calls keep reporting the same outcome.
        packer.close().await.unwrap();
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_close_error_shared() {
        let (conn, _remote, shutdowns) = tracked(Some(io::ErrorKind::PermissionDenied));
        let packer = Arc::new(Packer::new(conn));

        let results = close_concurrently(Arc::clone(&packer), 8).await;
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);

        let causes: Vec<_> = results
            .into_iter()
            .map(|r| match r {
                Err(RpcError::Close(cause)) => cause,
                other => panic!("unexpected: {:?}", other),
            })
            .collect();
        assert!(causes.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert!(packer.is_closed());
    }

    #[tokio::test]
    async fn test_close_already_closed_is_success() {
        let (conn, _remote, _) = tracked(Some(io::ErrorKind::NotConnected));
        let packer = Arc::new(Packer::new(conn));

        let results = close_concurrently(packer, 4).await;
        assert!(results.iter().all(|r| r.is_ok()));
    }

    #[tokio::test]
    async fn test_close_interrupts_stalled_pour() {
        let (local, _remote) = tokio::io::duplex(64);
        let packer = Arc::new(Packer::new(local));

        let writer = Arc::clone(&packer);
        let stalled = tokio::spawn(async move {
            writer
                .pour(Packet::new(Flags::BINARY, 1, vec![7u8; 4096]))
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!stalled.is_finished());

        tokio::time::timeout(Duration::from_secs(2), packer.close())
            .await
            .expect("close waited on the stalled write")
            .unwrap();
        assert!(packer.is_closed());
        assert!(matches!(stalled.await.unwrap(), Err(RpcError::SinkClosed)));
    }

    #[tokio::test]
    async fn test_close_with_full_transport() {
        let (local, _remote) = tokio::io::duplex(16);
        let packer = Packer::new(local);

        // Header plus seven bytes fills the transport exactly.
        packer
            .pour(Packet::new(Flags::BINARY, 1, vec![0u8; 7]))
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(2), packer.close())
            .await
            .expect("close waited on the goodbye frame")
            .unwrap();
        assert!(packer.is_closed());
    }

    #[tokio::test]
    async fn test_abandoned_close_still_closes() {
        let (local, _remote) = tokio::io::duplex(16);
        let packer = Packer::new(local);
        packer
            .pour(Packet::new(Flags::BINARY, 1, vec![0u8; 7]))
            .await
            .unwrap();

        let abandoned = tokio::time::timeout(Duration::from_millis(1), packer.close()).await;
        assert!(abandoned.is_err());

        assert!(packer.is_closed());
        assert!(matches!(
            packer.pour(Packet::new(Flags::JSON, 2, &b"{}"[..])).await,
            Err(RpcError::SinkClosed)
        ));
        assert!(packer.next(&CancellationToken::new()).await.unwrap().is_none());
        packer.close().await.unwrap();
    }
}

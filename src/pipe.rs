//! Pull-based sources and push-based sinks.
//!
//! The same two traits describe the physical connection (see
//! [`Packer`](crate::packer::Packer)) and the in-memory channels that carry
//! one logical stream's packets from the session loop to its handler.

use async_trait::async_trait;
use std::sync::Mutex as StdMutex;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::error::{Result, RpcError};

/// Single-consumer source of values.
#[async_trait]
pub trait Source<T: Send>: Send + Sync {
    /// Pull the next value. `Ok(None)` is end-of-stream.
    async fn next(&self, ctx: &CancellationToken) -> Result<Option<T>>;
}

/// Destination for values.
#[async_trait]
pub trait Sink<T: Send>: Send + Sync {
    /// Push one value.
    async fn pour(&self, value: T) -> Result<()>;

    /// Close the sink. Later pours fail with [`RpcError::SinkClosed`].
    async fn close(&self) -> Result<()>;
}

/// Sending half of an in-memory pipe.
pub struct PipeSink<T> {
    tx: StdMutex<Option<mpsc::UnboundedSender<T>>>,
}

/// Receiving half of an in-memory pipe.
pub struct PipeSource<T> {
    rx: Mutex<mpsc::UnboundedReceiver<T>>,
}

/// Create an unbounded in-memory pipe.
pub fn pipe<T>() -> (PipeSink<T>, PipeSource<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        PipeSink {
            tx: StdMutex::new(Some(tx)),
        },
        PipeSource { rx: Mutex::new(rx) },
    )
}

impl<T> PipeSink<T> {
    fn sender(&self) -> Option<mpsc::UnboundedSender<T>> {
        self.tx.lock().ok().and_then(|guard| guard.clone())
    }

    /// Push without awaiting; the pipe is unbounded.
    pub fn send(&self, value: T) -> Result<()> {
        let tx = self.sender().ok_or(RpcError::SinkClosed)?;
        tx.send(value).map_err(|_| RpcError::SinkClosed)
    }

    /// Drop the sender so the source sees end-of-stream once drained.
    pub fn close_now(&self) {
        if let Ok(mut guard) = self.tx.lock() {
            guard.take();
        }
    }
}

#[async_trait]
impl<T: Send + 'static> Sink<T> for PipeSink<T> {
    async fn pour(&self, value: T) -> Result<()> {
        self.send(value)
    }

    async fn close(&self) -> Result<()> {
        self.close_now();
        Ok(())
    }
}

#[async_trait]
impl<T: Send + 'static> Source<T> for PipeSource<T> {
    async fn next(&self, ctx: &CancellationToken) -> Result<Option<T>> {
        let mut rx = self.rx.lock().await;
        tokio::select! {
            biased;
            value = rx.recv() => Ok(value),
            _ = ctx.cancelled() => Err(RpcError::Canceled),
        }
    }
}

/// One end of a duplex pipe: reads what the other end pours and vice versa.
pub struct Duplex<T> {
    sink: PipeSink<T>,
    source: PipeSource<T>,
}

/// Create two cross-connected duplex ends.
pub fn duplex_pipe<T>() -> (Duplex<T>, Duplex<T>) {
    let (a_tx, a_rx) = pipe();
    let (b_tx, b_rx) = pipe();
    (
        Duplex {
            sink: a_tx,
            source: b_rx,
        },
        Duplex {
            sink: b_tx,
            source: a_rx,
        },
    )
}

#[async_trait]
impl<T: Send + 'static> Source<T> for Duplex<T> {
    async fn next(&self, ctx: &CancellationToken) -> Result<Option<T>> {
        self.source.next(ctx).await
    }
}

#[async_trait]
impl<T: Send + 'static> Sink<T> for Duplex<T> {
    async fn pour(&self, value: T) -> Result<()> {
        self.sink.pour(value).await
    }

    async fn close(&self) -> Result<()> {
        self.sink.close().await
    }
}

// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Stream Pipe
//!
//! Bidirectional byte relay between two duplex endpoints.
//!
//! Both copy directions are polled together by one `tokio::join!`, so neither
//! can be awaited before the other has started, and [`StreamPipe::relay`]
//! returns only after both have finished. A [`PipeCloser`] aborts both
//! directions at once; this is how a session tears down pipes whose peers
//! never hang up. End-of-stream and the usual peer-closed errors
//! (`BrokenPipe`, `ConnectionReset`, ...) end a direction quietly.
//!
//! A pipe built with [`StreamPipe::ending_with_backward`] also stops the
//! forward direction once the backward one has ended, for producers (a
//! container's output) whose end means nobody reads the forward side anymore.
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure Layer
//! - **Purpose:** Relay session stdio and bridge connections

use parking_lot::Mutex;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

const COPY_BUFFER_SIZE: usize = 32 * 1024;

/// True for errors that only mean the other side went away.
pub fn is_peer_closed(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
    )
}

#[derive(Debug, Default)]
pub struct DirectionOutcome {
    pub bytes: u64,
    pub error: Option<io::Error>,
}

/// Copy until end-of-stream or error, then shut the writer down.
pub async fn copy_direction<R, W>(reader: &mut R, writer: &mut W) -> DirectionOutcome
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut outcome = DirectionOutcome::default();
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                if !is_peer_closed(&e) {
                    outcome.error = Some(e);
                }
                break;
            }
        };
        if let Err(e) = writer.write_all(&buf[..n]).await {
            if !is_peer_closed(&e) {
                outcome.error = Some(e);
            }
            break;
        }
        outcome.bytes += n as u64;
    }

    if let Err(e) = writer.flush().await {
        if outcome.error.is_none() && !is_peer_closed(&e) {
            outcome.error = Some(e);
        }
    }
    if let Err(e) = writer.shutdown().await {
        if !is_peer_closed(&e) {
            debug!("Stream pipe writer shutdown failed: {}", e);
        }
    }
    outcome
}

/// Closes every direction of the pipe it was taken from. Idempotent.
#[derive(Clone, Debug)]
pub struct PipeCloser(CancellationToken);

impl PipeCloser {
    pub fn close(&self) {
        self.0.cancel();
    }

    /// Resolves once the pipe has been closed.
    pub async fn closed(&self) {
        self.0.cancelled().await
    }
}

/// Writer whose shutdown only flushes, for streams that outlive the pipe
/// writing into them.
pub struct KeepOpen<W>(pub W);

impl<W: AsyncWrite + Unpin> AsyncWrite for KeepOpen<W> {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.0).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.0).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.0).poll_flush(cx)
    }
}

#[derive(Debug, Default)]
pub struct PipeReport {
    /// `None` when the direction was cut short by a close
    pub forward_bytes: Option<u64>,
    pub backward_bytes: Option<u64>,
    /// First non peer-closed error observed in either direction
    pub error: Option<io::Error>,
    pub closed: bool,
}

pub struct StreamPipe {
    closer: CancellationToken,
    first_error: Arc<Mutex<Option<io::Error>>>,
    forward_follows_backward: bool,
}

impl Default for StreamPipe {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamPipe {
    pub fn new() -> Self {
        Self {
            closer: CancellationToken::new(),
            first_error: Arc::new(Mutex::new(None)),
            forward_follows_backward: false,
        }
    }

    /// Pipe that also closes when `parent` is cancelled.
    pub fn scoped(parent: &CancellationToken) -> Self {
        Self {
            closer: parent.child_token(),
            first_error: Arc::new(Mutex::new(None)),
            forward_follows_backward: false,
        }
    }

    /// Stop the forward direction as soon as the backward one ends.
    pub fn ending_with_backward(mut self) -> Self {
        self.forward_follows_backward = true;
        self
    }

    pub fn closer(&self) -> PipeCloser {
        PipeCloser(self.closer.clone())
    }

    /// Relay `a` to `b` and `b` to `a`.
    pub async fn relay<A, B>(self, a: A, b: B) -> PipeReport
    where
        A: AsyncRead + AsyncWrite + Send + Unpin,
        B: AsyncRead + AsyncWrite + Send + Unpin,
    {
        let (a_read, a_write) = tokio::io::split(a);
        let (b_read, b_write) = tokio::io::split(b);
        self.join((a_read, b_write), (b_read, a_write)).await
    }

    /// Run two independent directions as one pipe.
    pub async fn join<R1, W1, R2, W2>(self, forward: (R1, W1), backward: (R2, W2)) -> PipeReport
    where
        R1: AsyncRead + Send + Unpin,
        W1: AsyncWrite + Send + Unpin,
        R2: AsyncRead + Send + Unpin,
        W2: AsyncWrite + Send + Unpin,
    {
        let forward_stop = self.closer.child_token();
        let (forward_bytes, backward_bytes) = tokio::join!(
            self.direction("forward", forward.0, forward.1, &forward_stop),
            async {
                let bytes = self
                    .direction("backward", backward.0, backward.1, &self.closer)
                    .await;
                if self.forward_follows_backward {
                    forward_stop.cancel();
                }
                bytes
            },
        );

        let closed = self.closer.is_cancelled();
        let error = self.first_error.lock().take();
        PipeReport {
            forward_bytes,
            backward_bytes,
            error,
            closed,
        }
    }

    async fn direction<R, W>(
        &self,
        name: &'static str,
        mut reader: R,
        mut writer: W,
        stop: &CancellationToken,
    ) -> Option<u64>
    where
        R: AsyncRead + Send + Unpin,
        W: AsyncWrite + Send + Unpin,
    {
        let outcome = tokio::select! {
            outcome = copy_direction(&mut reader, &mut writer) => Some(outcome),
            _ = stop.cancelled() => None,
        };

        match outcome {
            Some(outcome) => {
                if let Some(e) = outcome.error {
                    debug!(direction = name, "Stream pipe direction failed: {}", e);
                    let mut first = self.first_error.lock();
                    if first.is_none() {
                        *first = Some(e);
                    }
                }
                Some(outcome.bytes)
            }
            None => {
                let _ = writer.shutdown().await;
                debug!(direction = name, "Stream pipe direction closed");
                None
            }
        }
    }
}

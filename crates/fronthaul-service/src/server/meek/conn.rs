//! Meek session byte stream
//!
//! A meek session relays a single logical byte stream over a sequence of
//! short HTTP exchanges. [`MeekConn::pair`] yields the two ends of the
//! bridge: a [`MeekStream`] implementing `AsyncRead + AsyncWrite`, handed to
//! the tunnel client handler as an ordinary connected stream, and a
//! [`MeekConn`] kept by the session, which the HTTP handler drives with one
//! [`pump_reads`](MeekConn::pump_reads) and one
//! [`pump_writes`](MeekConn::pump_writes) per request.
//!
//! The bridge is four single-slot rendezvous channels plus a close signal.
//! Each queue has exactly one producer and one consumer; every wait also
//! selects on the close signal. `MeekStream` holds its halves exclusively,
//! so the stream side needs no locks; the pump halves sit behind async
//! mutexes because the HTTP handler serves at most one request per session
//! at a time but may race a stale retransmission.

use std::{
    future::Future,
    io,
    net::SocketAddr,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use bytes::Bytes;
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf},
    sync::{mpsc, Mutex},
    time::Instant,
};
use tokio_util::sync::{CancellationToken, PollSender, WaitForCancellationFutureOwned};

use super::{
    MEEK_EXTENDED_TURN_AROUND_TIMEOUT, MEEK_MAX_PAYLOAD_LENGTH, MEEK_PROTOCOL_VERSION_2,
    MEEK_TURN_AROUND_TIMEOUT,
};

type BoxReader = Box<dyn AsyncRead + Send + Unpin>;

/// Failure of a pump call
#[derive(Debug, Error)]
pub enum PumpError {
    /// The session stream was closed; the HTTP exchange ends quietly
    #[error("meek connection closed")]
    Closed,
    #[error("{0}")]
    Io(#[from] io::Error),
}

struct Shared {
    remote_addr: SocketAddr,
    protocol_version: i32,
    closed: CancellationToken,
}

struct PumpReadHalf {
    ready_reader: mpsc::Sender<BoxReader>,
    read_result: mpsc::Receiver<Option<io::Error>>,
}

struct PumpWriteHalf {
    next_write: mpsc::Receiver<Bytes>,
    write_result: mpsc::Sender<io::Result<()>>,
}

/// Session-side handle driven by the HTTP handler
pub struct MeekConn {
    shared: Arc<Shared>,
    pump_read: Mutex<PumpReadHalf>,
    pump_write: Mutex<PumpWriteHalf>,
}

impl MeekConn {
    /// Creates the two ends of a session bridge. `remote_addr` is the
    /// client address reported by [`MeekStream::remote_addr`]; the port is a
    /// stub.
    pub fn pair(remote_addr: SocketAddr, protocol_version: i32) -> (MeekConn, MeekStream) {
        let shared = Arc::new(Shared {
            remote_addr,
            protocol_version,
            closed: CancellationToken::new(),
        });

        let (ready_reader_tx, ready_reader_rx) = mpsc::channel(1);
        let (read_result_tx, read_result_rx) = mpsc::channel(1);
        let (next_write_tx, next_write_rx) = mpsc::channel(1);
        let (write_result_tx, write_result_rx) = mpsc::channel(1);

        let conn = MeekConn {
            shared: shared.clone(),
            pump_read: Mutex::new(PumpReadHalf {
                ready_reader: ready_reader_tx,
                read_result: read_result_rx,
            }),
            pump_write: Mutex::new(PumpWriteHalf {
                next_write: next_write_rx,
                write_result: write_result_tx,
            }),
        };

        let stream = MeekStream {
            closed_read: Box::pin(shared.closed.clone().cancelled_owned()),
            closed_write: Box::pin(shared.closed.clone().cancelled_owned()),
            shared,
            ready_reader: ready_reader_rx,
            current_reader: None,
            read_result: read_result_tx,
            next_write: PollSender::new(next_write_tx),
            write_result: write_result_rx,
            pending_write: None,
        };

        (conn, stream)
    }

    /// Feeds `reader` (an HTTP request body) to the stream side. Blocks
    /// until the reader is fully drained by stream reads or the session
    /// closes.
    pub async fn pump_reads<R>(&self, reader: R) -> Result<(), PumpError>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let mut half = self.pump_read.lock().await;

        tokio::select! {
            result = half.ready_reader.send(Box::new(reader)) => {
                if result.is_err() {
                    return Err(PumpError::Closed);
                }
            }
            _ = self.shared.closed.cancelled() => return Err(PumpError::Closed),
        }

        tokio::select! {
            result = half.read_result.recv() => match result {
                Some(None) => Ok(()),
                Some(Some(err)) => Err(PumpError::Io(err)),
                None => Err(PumpError::Closed),
            },
            _ = self.shared.closed.cancelled() => Err(PumpError::Closed),
        }
    }

    /// Drains pending stream writes into `writer` (an HTTP response body).
    /// Returns once the response limits are met: a single payload for
    /// protocol v1 clients, or for v2+ a turn-around pause with no pending
    /// write, bounded by the extended turn-around cap.
    pub async fn pump_writes<W>(&self, writer: &mut W) -> Result<(), PumpError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut half = self.pump_write.lock().await;

        let start = Instant::now();
        let turn_around = tokio::time::sleep(MEEK_TURN_AROUND_TIMEOUT);
        tokio::pin!(turn_around);

        loop {
            tokio::select! {
                chunk = half.next_write.recv() => {
                    let chunk = match chunk {
                        Some(chunk) => chunk,
                        None => return Err(PumpError::Closed),
                    };

                    let result = write_chunk(writer, &chunk).await;

                    // The stream side blocks on this result; always publish it
                    let report = match &result {
                        Ok(()) => Ok(()),
                        Err(err) => Err(clone_io_error(err)),
                    };
                    let _ = half.write_result.try_send(report);

                    result?;

                    if self.shared.protocol_version < MEEK_PROTOCOL_VERSION_2 {
                        // v1 clients expect at most one payload per response
                        return Ok(());
                    }
                    if start.elapsed() >= MEEK_EXTENDED_TURN_AROUND_TIMEOUT {
                        return Ok(());
                    }
                    turn_around.as_mut().reset(Instant::now() + MEEK_TURN_AROUND_TIMEOUT);
                }
                _ = &mut turn_around => return Ok(()),
                _ = self.shared.closed.cancelled() => return Err(PumpError::Closed),
            }
        }
    }

    /// Closes the session stream, interrupting any blocked stream or pump
    /// operation. Idempotent.
    pub fn close(&self) {
        self.shared.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }
}

async fn write_chunk<W>(writer: &mut W, chunk: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    writer.write_all(chunk).await?;
    writer.flush().await
}

fn clone_io_error(err: &io::Error) -> io::Error {
    io::Error::new(err.kind(), err.to_string())
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "meek connection closed")
}

/// The connected byte stream a meek session presents to the tunnel client
/// handler.
///
/// Reads block until an HTTP request body arrives; writes block until an
/// HTTP response collects the chunk. Each write consumes at most 64 KiB, so
/// callers that must place an entire buffer use `write_all`. There are no
/// I/O deadlines; cancellation is by [`close`](Self::close) (or drop).
pub struct MeekStream {
    shared: Arc<Shared>,
    closed_read: Pin<Box<WaitForCancellationFutureOwned>>,
    closed_write: Pin<Box<WaitForCancellationFutureOwned>>,
    ready_reader: mpsc::Receiver<BoxReader>,
    current_reader: Option<BoxReader>,
    read_result: mpsc::Sender<Option<io::Error>>,
    next_write: PollSender<Bytes>,
    write_result: mpsc::Receiver<io::Result<()>>,
    pending_write: Option<usize>,
}

impl MeekStream {
    /// The client address derived from the HTTP request that created the
    /// session; the port is a stub zero.
    pub fn remote_addr(&self) -> SocketAddr {
        self.shared.remote_addr
    }

    pub fn protocol_version(&self) -> i32 {
        self.shared.protocol_version
    }

    /// Closes the stream, interrupting pending operations on both ends.
    /// Idempotent.
    pub fn close(&self) {
        self.shared.closed.cancel();
    }
}

impl Drop for MeekStream {
    fn drop(&mut self) {
        self.shared.closed.cancel();
    }
}

impl AsyncRead for MeekStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        loop {
            if this.shared.closed.is_cancelled() {
                return Poll::Ready(Ok(()));
            }
            if this.closed_read.as_mut().poll(cx).is_ready() {
                return Poll::Ready(Ok(()));
            }

            let reader = match this.current_reader {
                Some(ref mut reader) => reader,
                None => match this.ready_reader.poll_recv(cx) {
                    Poll::Ready(Some(reader)) => this.current_reader.insert(reader),
                    Poll::Ready(None) => return Poll::Ready(Ok(())),
                    Poll::Pending => return Poll::Pending,
                },
            };

            let filled_before = buf.filled().len();
            match Pin::new(reader).poll_read(cx, buf) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Ok(())) => {
                    let n = buf.filled().len() - filled_before;
                    if n > 0 {
                        // The request body may hold more; keep draining it
                        // on subsequent reads while the pump stays blocked.
                        return Poll::Ready(Ok(()));
                    }

                    // Request body exhausted; release the pump and wait for
                    // the next request rather than surfacing a false EOF.
                    this.current_reader = None;
                    let _ = this.read_result.try_send(None);
                }
                Poll::Ready(Err(err)) => {
                    this.current_reader = None;
                    let _ = this.read_result.try_send(Some(clone_io_error(&err)));
                    return Poll::Ready(Err(err));
                }
            }
        }
    }
}

impl AsyncWrite for MeekStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        loop {
            if this.shared.closed.is_cancelled() {
                return Poll::Ready(Err(closed_error()));
            }
            if this.closed_write.as_mut().poll(cx).is_ready() {
                return Poll::Ready(Err(closed_error()));
            }

            if let Some(len) = this.pending_write {
                match this.write_result.poll_recv(cx) {
                    Poll::Ready(Some(Ok(()))) => {
                        this.pending_write = None;
                        return Poll::Ready(Ok(len));
                    }
                    Poll::Ready(Some(Err(err))) => {
                        this.pending_write = None;
                        return Poll::Ready(Err(err));
                    }
                    Poll::Ready(None) => return Poll::Ready(Err(closed_error())),
                    Poll::Pending => return Poll::Pending,
                }
            }

            match this.next_write.poll_reserve(cx) {
                Poll::Ready(Ok(())) => {
                    let chunk_len = buf.len().min(MEEK_MAX_PAYLOAD_LENGTH);
                    if chunk_len == 0 {
                        return Poll::Ready(Ok(0));
                    }
                    if this
                        .next_write
                        .send_item(Bytes::copy_from_slice(&buf[..chunk_len]))
                        .is_err()
                    {
                        return Poll::Ready(Err(closed_error()));
                    }
                    this.pending_write = Some(chunk_len);
                    // Loop to wait on the per-chunk result
                }
                Poll::Ready(Err(..)) => return Poll::Ready(Err(closed_error())),
                Poll::Pending => return Poll::Pending,
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.shared.closed.cancel();
        Poll::Ready(Ok(()))
    }
}

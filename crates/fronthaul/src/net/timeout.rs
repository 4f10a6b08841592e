//! Byte stream with read/write idle timeouts
//!
//! Used by the meek HTTP front to bound how long a client may stall while
//! sending a request or draining a response, independent of HTTP-level
//! behavior. A timed-out direction surfaces `TimedOut`, which tears down the
//! connection.

use std::{
    future::Future,
    io,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use pin_project::pin_project;
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    time::{sleep_until, Instant, Sleep},
};

#[pin_project]
pub struct IdleTimeoutStream<S> {
    #[pin]
    stream: S,
    read_timeout: Duration,
    write_timeout: Duration,
    read_deadline: Option<Pin<Box<Sleep>>>,
    write_deadline: Option<Pin<Box<Sleep>>>,
}

impl<S> IdleTimeoutStream<S> {
    pub fn new(stream: S, read_timeout: Duration, write_timeout: Duration) -> IdleTimeoutStream<S> {
        IdleTimeoutStream {
            stream,
            read_timeout,
            write_timeout,
            read_deadline: None,
            write_deadline: None,
        }
    }
}

fn poll_deadline(
    deadline: &mut Option<Pin<Box<Sleep>>>,
    timeout: Duration,
    cx: &mut Context<'_>,
) -> Poll<()> {
    let sleep = deadline.get_or_insert_with(|| Box::pin(sleep_until(Instant::now() + timeout)));
    sleep.as_mut().poll(cx)
}

impl<S> AsyncRead for IdleTimeoutStream<S>
where
    S: AsyncRead,
{
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.project();
        match this.stream.poll_read(cx, buf) {
            Poll::Ready(result) => {
                *this.read_deadline = None;
                Poll::Ready(result)
            }
            Poll::Pending => {
                if poll_deadline(this.read_deadline, *this.read_timeout, cx).is_ready() {
                    return Poll::Ready(Err(io::Error::new(io::ErrorKind::TimedOut, "read timeout")));
                }
                Poll::Pending
            }
        }
    }
}

impl<S> AsyncWrite for IdleTimeoutStream<S>
where
    S: AsyncWrite,
{
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.project();
        match this.stream.poll_write(cx, buf) {
            Poll::Ready(result) => {
                *this.write_deadline = None;
                Poll::Ready(result)
            }
            Poll::Pending => {
                if poll_deadline(this.write_deadline, *this.write_timeout, cx).is_ready() {
                    return Poll::Ready(Err(io::Error::new(io::ErrorKind::TimedOut, "write timeout")));
                }
                Poll::Pending
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().stream.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().stream.poll_shutdown(cx)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_read_timeout_fires() {
        let (client, _server) = tokio::io::duplex(64);
        let mut stream =
            IdleTimeoutStream::new(client, Duration::from_millis(50), Duration::from_secs(10));

        let mut buffer = [0u8; 8];
        let err = stream.read(&mut buffer).await.expect_err("read timeout");
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn test_activity_resets_deadline() {
        use tokio::io::AsyncWriteExt;

        let (client, mut server) = tokio::io::duplex(64);
        let mut stream =
            IdleTimeoutStream::new(client, Duration::from_millis(100), Duration::from_secs(10));

        tokio::spawn(async move {
            for _ in 0..3 {
                tokio::time::sleep(Duration::from_millis(40)).await;
                server.write_all(b"x").await.unwrap();
            }
        });

        // Three reads each arrive within the idle window
        let mut buffer = [0u8; 1];
        for _ in 0..3 {
            stream.read_exact(&mut buffer).await.expect("read");
        }
    }
}

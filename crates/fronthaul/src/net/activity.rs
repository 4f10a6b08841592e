//! Activity-monitored UDP socket
//!
//! Wraps a connected UDP socket for use as a port forward: every send or
//! receive refreshes the socket's LRU position, receives time out once both
//! directions have been idle for the configured duration, and a close handle
//! interrupts a blocked receive so the owner can finalize.

use std::{
    io,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use tokio::{net::UdpSocket, time::Instant};
use tokio_util::sync::CancellationToken;

use super::lru::LruEntry;

pub struct ActivityUdpSocket {
    socket: UdpSocket,
    idle_timeout: Option<Duration>,
    lru_entry: LruEntry,
    close: CancellationToken,
    epoch: Instant,
    last_activity: AtomicU64,
}

impl ActivityUdpSocket {
    pub fn new(
        socket: UdpSocket,
        idle_timeout: Option<Duration>,
        lru_entry: LruEntry,
        close: CancellationToken,
    ) -> ActivityUdpSocket {
        let epoch = Instant::now();
        ActivityUdpSocket {
            socket,
            idle_timeout,
            lru_entry,
            close,
            epoch,
            last_activity: AtomicU64::new(0),
        }
    }

    pub fn close_handle(&self) -> CancellationToken {
        self.close.clone()
    }

    /// Signals close; a blocked [`recv`](Self::recv) returns promptly
    pub fn close(&self) {
        self.close.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.close.is_cancelled()
    }

    /// Removes the socket's LRU entry; called by the owner during cleanup
    pub fn remove_lru_entry(&self) {
        self.lru_entry.remove();
    }

    fn touch(&self) {
        let elapsed = self.epoch.elapsed().as_nanos() as u64;
        self.last_activity.store(elapsed, Ordering::Relaxed);
        self.lru_entry.touch();
    }

    fn idle_deadline(&self) -> Option<Instant> {
        let idle_timeout = self.idle_timeout?;
        let last = Duration::from_nanos(self.last_activity.load(Ordering::Relaxed));
        Some(self.epoch + last + idle_timeout)
    }

    pub async fn send(&self, packet: &[u8]) -> io::Result<usize> {
        let n = self.socket.send(packet).await?;
        self.touch();
        Ok(n)
    }

    /// Receives one datagram. Fails with `TimedOut` when both directions
    /// have been idle past the configured timeout, and with `ConnectionAborted`
    /// when the close handle fires.
    pub async fn recv(&self, buffer: &mut [u8]) -> io::Result<usize> {
        loop {
            let idle = async {
                match self.idle_deadline() {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = self.close.cancelled() => {
                    return Err(io::Error::new(
                        io::ErrorKind::ConnectionAborted,
                        "use of closed connection",
                    ));
                }
                _ = idle => {
                    // Activity may have happened while blocked; re-check
                    if let Some(deadline) = self.idle_deadline() {
                        if Instant::now() < deadline {
                            continue;
                        }
                    }
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "idle port forward"));
                }
                result = self.socket.recv(buffer) => {
                    let n = result?;
                    self.touch();
                    return Ok(n);
                }
            }
        }
    }
}

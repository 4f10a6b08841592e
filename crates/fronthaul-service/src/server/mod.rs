//! Fronthaul tunnel server
//!
//! The meek front accepts disguised HTTP(S) exchanges and surfaces each
//! client session as a connected byte stream; that stream is attached to a
//! [`TunnelClient`] as its single udpgw channel, multiplexing the client's
//! UDP port forwards.

use std::{
    io,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc, Mutex,
    },
};

use log::info;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpListener,
};
use tokio_util::sync::CancellationToken;

use crate::config::Config;

pub use self::{
    meek::{ClientHandler, MeekServer, MeekStream},
    udpgw::UdpgwMultiplexer,
};

pub mod meek;
pub mod udpgw;

#[derive(Default)]
struct TrafficState {
    concurrent_port_forward_count: AtomicI64,
    total_port_forward_count: AtomicI64,
    bytes_up: AtomicI64,
    bytes_down: AtomicI64,
}

/// Per-client tunnel state: UDP traffic accounting, the port-forward quota,
/// and the client's single udpgw channel.
pub struct TunnelClient {
    config: Arc<Config>,
    udp_channel: Mutex<Option<CancellationToken>>,
    udp_traffic: TrafficState,
}

impl TunnelClient {
    pub fn new(config: Arc<Config>) -> TunnelClient {
        TunnelClient {
            config,
            udp_channel: Mutex::new(None),
            udp_traffic: TrafficState::default(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Whether a UDP port forward to `port` is allowed by the configured
    /// allow and deny lists
    pub fn is_port_forward_permitted(&self, port: u16) -> bool {
        if !self.config.allow_udp_ports.is_empty() {
            return self.config.allow_udp_ports.contains(&port);
        }
        !self.config.deny_udp_ports.contains(&port)
    }

    pub fn opened_udp_port_forward(&self) {
        self.udp_traffic
            .concurrent_port_forward_count
            .fetch_add(1, Ordering::Relaxed);
        self.udp_traffic
            .total_port_forward_count
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Checked after [`opened_udp_port_forward`](Self::opened_udp_port_forward)
    /// so a concurrent natural close cannot drive the count below zero
    pub fn is_udp_port_forward_limit_exceeded(&self) -> bool {
        let max_count = self.config.max_udp_port_forward_count;
        max_count > 0
            && self
                .udp_traffic
                .concurrent_port_forward_count
                .load(Ordering::Relaxed)
                > max_count
    }

    pub fn closed_udp_port_forward(&self, bytes_up: i64, bytes_down: i64) {
        self.udp_traffic
            .concurrent_port_forward_count
            .fetch_sub(1, Ordering::Relaxed);
        self.udp_traffic.bytes_up.fetch_add(bytes_up, Ordering::Relaxed);
        self.udp_traffic
            .bytes_down
            .fetch_add(bytes_down, Ordering::Relaxed);
    }

    pub fn udp_port_forward_count(&self) -> i64 {
        self.udp_traffic
            .concurrent_port_forward_count
            .load(Ordering::Relaxed)
    }

    /// Installs `channel` as this client's UDP channel and multiplexes
    /// udpgw port forwards on it until it closes. Each client has at most
    /// one UDP channel; any existing one is closed before the new one is
    /// installed.
    pub async fn attach_udp_channel<S>(self: Arc<Self>, channel: S)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let channel_close = CancellationToken::new();
        {
            let mut current = self.udp_channel.lock().unwrap();
            if let Some(previous) = current.take() {
                previous.cancel();
            }
            *current = Some(channel_close.clone());
        }

        UdpgwMultiplexer::new(self.clone(), channel, channel_close)
            .run()
            .await;
    }
}

/// Runs the tunnel server until the shutdown signal fires: a meek front
/// whose session streams each speak the udpgw protocol.
pub async fn run(config: Config, shutdown: CancellationToken) -> io::Result<()> {
    let config = Arc::new(config);

    let listener = TcpListener::bind(&config.listen_address).await?;

    let handler_config = config.clone();
    let client_handler: ClientHandler = Arc::new(move |stream: MeekStream| {
        let client = Arc::new(TunnelClient::new(handler_config.clone()));
        Box::pin(async move {
            client.attach_udp_channel(stream).await;
        })
    });

    let server = Arc::new(MeekServer::new(config, client_handler, shutdown)?);

    info!("fronthaul server starting");
    server.run(listener).await
}

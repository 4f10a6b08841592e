//! udpgw port-forward multiplexer
//!
//! A single reliable in-tunnel channel carries many concurrent UDP port
//! forwards using the udpgw protocol. The main loop reads client messages
//! from the channel and sends each packet upstream, dialing a new UDP socket
//! per flow; one relay task per flow reads downstream datagrams and writes
//! them back to the channel with the udpgw preamble.
//!
//! The relay task is the sole remover of its flow's map entry; the main loop
//! only ever closes a flow's socket and lets the relay finalize. Between an
//! eviction and its finalization the map may briefly hold a closed flow.

use std::{
    collections::HashMap,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc, Mutex,
    },
};

use log::{debug, warn};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf},
    net::UdpSocket,
    sync::Mutex as AsyncMutex,
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;

use fronthaul::{
    net::{ActivityUdpSocket, LruConns},
    udpgw::{self, MAX_MESSAGE_SIZE, MAX_PAYLOAD_SIZE},
};

use super::TunnelClient;

struct UdpFlow {
    conn_id: u16,
    preamble_size: usize,
    remote_ip: IpAddr,
    remote_port: u16,
    conn: ActivityUdpSocket,
    bytes_up: AtomicI64,
    bytes_down: AtomicI64,
}

type FlowMap = Arc<Mutex<HashMap<u16, Arc<UdpFlow>>>>;

/// Multiplexes UDP port forwards over one reliable channel.
///
/// Runs until the channel reaches EOF, fails, or the channel close signal
/// fires; on exit every flow is closed and all relay tasks are awaited.
pub struct UdpgwMultiplexer<S> {
    client: Arc<TunnelClient>,
    channel_reader: ReadHalf<S>,
    channel_writer: Arc<AsyncMutex<WriteHalf<S>>>,
    channel_close: CancellationToken,
    flows: FlowMap,
    flow_lru: LruConns,
}

impl<S> UdpgwMultiplexer<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// `channel_close` interrupts the channel from either side: the main
    /// loop stops reading and relay tasks stop writing.
    pub fn new(
        client: Arc<TunnelClient>,
        channel: S,
        channel_close: CancellationToken,
    ) -> UdpgwMultiplexer<S> {
        let (channel_reader, channel_writer) = tokio::io::split(channel);
        UdpgwMultiplexer {
            client,
            channel_reader,
            channel_writer: Arc::new(AsyncMutex::new(channel_writer)),
            channel_close,
            flows: Arc::new(Mutex::new(HashMap::new())),
            flow_lru: LruConns::new(),
        }
    }

    pub async fn run(mut self) {
        // One upstream scratch buffer per channel; each decode overwrites
        // the previous message's packet.
        let mut buffer = vec![0u8; MAX_MESSAGE_SIZE];
        let mut relay_tasks = JoinSet::new();

        loop {
            let message = tokio::select! {
                _ = self.channel_close.cancelled() => break,
                decoded = udpgw::read_message(&mut self.channel_reader, &mut buffer) => {
                    match decoded {
                        Ok(message) => message,
                        Err(err) => {
                            if !err.is_eof() {
                                warn!("read udpgw message failed, error: {}", err);
                            }
                            break;
                        }
                    }
                }
            };

            let mut flow = self.flows.lock().unwrap().get(&message.conn_id).cloned();

            if message.discard_existing_conn {
                if let Some(existing) = flow.take() {
                    // The flow's relay task completes cleanup once the
                    // socket close takes effect
                    existing.conn.close();
                }
            }

            if let Some(ref existing) = flow {
                // A reused conn ID must keep its original remote address
                if existing.remote_ip != message.remote_ip
                    || existing.remote_port != message.remote_port
                {
                    warn!(
                        "UDP port forward remote address mismatch, conn_id: {}",
                        message.conn_id
                    );
                    continue;
                }
            }

            let flow = match flow {
                Some(flow) => flow,
                None => {
                    if !self.client.is_port_forward_permitted(message.remote_port) {
                        // The udpgw protocol has no error response; discard
                        // the message and read another
                        continue;
                    }

                    self.client.opened_udp_port_forward();

                    // The count is incremented before the limit check so a
                    // concurrent close cannot drive the counter negative
                    if self.client.is_udp_port_forward_limit_exceeded() {
                        self.flow_lru.close_oldest();
                        debug!(
                            "closed LRU UDP port forward, max_count: {}",
                            self.client.config().max_udp_port_forward_count
                        );
                    }

                    let (dial_ip, dial_port) = if message.forward_dns {
                        self.transparent_dns_address(message.remote_ip, message.remote_port)
                    } else {
                        (message.remote_ip, message.remote_port)
                    };

                    debug!(
                        "dialing UDP port forward, remote_addr: {}:{}, conn_id: {}",
                        dial_ip, dial_port, message.conn_id
                    );

                    let socket = match dial_udp(dial_ip, dial_port).await {
                        Ok(socket) => socket,
                        Err(err) => {
                            self.client.closed_udp_port_forward(0, 0);
                            warn!("dial UDP failed, error: {}", err);
                            continue;
                        }
                    };

                    let close = CancellationToken::new();
                    let lru_entry = self.flow_lru.add(close.clone());
                    let conn = ActivityUdpSocket::new(
                        socket,
                        self.client.config().idle_udp_port_forward_timeout(),
                        lru_entry,
                        close,
                    );

                    let flow = Arc::new(UdpFlow {
                        conn_id: message.conn_id,
                        preamble_size: message.preamble_size,
                        remote_ip: message.remote_ip,
                        remote_port: message.remote_port,
                        conn,
                        bytes_up: AtomicI64::new(0),
                        bytes_down: AtomicI64::new(0),
                    });

                    self.flows
                        .lock()
                        .unwrap()
                        .insert(flow.conn_id, flow.clone());

                    relay_tasks.spawn(relay_downstream(
                        flow.clone(),
                        self.channel_writer.clone(),
                        self.channel_close.clone(),
                        self.flows.clone(),
                        self.client.clone(),
                    ));

                    flow
                }
            };

            // UDP sends complete without blocking; an error here means the
            // socket is done and its relay task will reap it
            if let Err(err) = flow.conn.send(message.packet).await {
                debug!("upstream UDP relay failed, error: {}", err);
                flow.conn.close();
            }

            flow.bytes_up
                .fetch_add(message.packet.len() as i64, Ordering::Relaxed);
        }

        // Close every flow and wait for the relay tasks to finalize
        {
            let flows = self.flows.lock().unwrap();
            for flow in flows.values() {
                flow.conn.close();
            }
        }
        while relay_tasks.join_next().await.is_some() {}
    }

    fn transparent_dns_address(&self, dial_ip: IpAddr, dial_port: u16) -> (IpAddr, u16) {
        match self.client.config().udp_forward_dns_address() {
            Some(resolver) => (resolver.ip(), resolver.port()),
            None => (dial_ip, dial_port),
        }
    }
}

async fn dial_udp(remote_ip: IpAddr, remote_port: u16) -> std::io::Result<UdpSocket> {
    let bind_addr: SocketAddr = match remote_ip {
        IpAddr::V4(..) => (IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0).into(),
        IpAddr::V6(..) => (IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0).into(),
    };
    let socket = UdpSocket::bind(bind_addr).await?;
    socket.connect((remote_ip, remote_port)).await?;
    Ok(socket)
}

/// Relays downstream datagrams for one flow until its socket closes, times
/// out idle, or the channel fails. On exit the task removes the flow from
/// the map, drops its LRU entry, and reports final byte counts.
async fn relay_downstream<S>(
    flow: Arc<UdpFlow>,
    channel_writer: Arc<AsyncMutex<WriteHalf<S>>>,
    channel_close: CancellationToken,
    flows: FlowMap,
    client: Arc<TunnelClient>,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    // One downstream buffer per flow: datagrams land past the preamble so
    // the preamble can be written in place for the channel write.
    let mut buffer = vec![0u8; MAX_MESSAGE_SIZE];

    loop {
        let packet_size = match flow.conn.recv(&mut buffer[flow.preamble_size..]).await {
            Ok(packet_size) => packet_size,
            Err(err) => {
                if err.kind() != std::io::ErrorKind::ConnectionAborted {
                    debug!("downstream UDP relay failed, error: {}", err);
                }
                break;
            }
        };

        if packet_size > MAX_PAYLOAD_SIZE {
            warn!("unexpected packet size: {}", packet_size);
            break;
        }

        let encoded = udpgw::write_preamble(
            flow.preamble_size,
            flow.conn_id,
            &flow.remote_ip,
            flow.remote_port,
            packet_size as u16,
            &mut buffer,
        );

        let written = match encoded {
            Ok(()) => {
                let mut writer = channel_writer.lock().await;
                writer
                    .write_all(&buffer[..flow.preamble_size + packet_size])
                    .await
            }
            Err(err) => {
                warn!("write udpgw preamble failed, error: {}", err);
                break;
            }
        };

        if let Err(err) = written {
            // Interrupt the channel's main loop as well
            channel_close.cancel();
            debug!("downstream channel write failed, error: {}", err);
            break;
        }

        flow.bytes_down
            .fetch_add(packet_size as i64, Ordering::Relaxed);
    }

    // Sole removal point for this flow's entry. A rebind may already have
    // installed a replacement under the same conn ID; leave that one alone.
    {
        let mut flows = flows.lock().unwrap();
        if let Some(current) = flows.get(&flow.conn_id) {
            if Arc::ptr_eq(current, &flow) {
                flows.remove(&flow.conn_id);
            }
        }
    }

    flow.conn.remove_lru_entry();
    flow.conn.close();

    let bytes_up = flow.bytes_up.load(Ordering::Relaxed);
    let bytes_down = flow.bytes_down.load(Ordering::Relaxed);
    client.closed_udp_port_forward(bytes_up, bytes_down);

    debug!(
        "UDP port forward closed, remote_addr: {}:{}, bytes_up: {}, bytes_down: {}, conn_id: {}",
        flow.remote_ip, flow.remote_port, bytes_up, bytes_down, flow.conn_id
    );
}

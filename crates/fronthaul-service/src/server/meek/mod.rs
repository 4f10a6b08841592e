//! Meek HTTP(S) tunnel front
//!
//! Meek tunnels a byte stream over HTTP: upstream traffic arrives in request
//! bodies and downstream traffic is sent in response bodies. The sequence of
//! exchanges belonging to one flow is associated by a session ID submitted as
//! an HTTP cookie. Meek may be fronted through a CDN or direct, and may be
//! HTTP or HTTPS.
//!
//! The server hooks into the tunnel client handler through [`MeekStream`],
//! which turns the per-session HTTP payload traffic into an ordinary
//! connected byte stream.

use std::{
    collections::HashMap,
    convert::Infallible,
    io,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    pin::Pin,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, RwLock,
    },
    time::Duration,
};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use bytes::Bytes;
use futures::{future::BoxFuture, SinkExt, StreamExt};
use http_body_util::{combinators::BoxBody, BodyExt, BodyStream, Full, StreamBody};
use hyper::{
    body::{Frame, Incoming},
    header::{self, HeaderMap, HeaderValue},
    server::conn::http1,
    service::service_fn,
    Request, Response, StatusCode,
};
use hyper_util::rt::TokioIo;
use log::{debug, error, info, warn};
use openssl::ssl::{Ssl, SslAcceptor};
use rand::{rngs::OsRng, Rng, RngCore};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpListener, TcpStream},
    sync::mpsc,
    time::Instant,
};
use tokio_openssl::SslStream;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::{
    io::{CopyToBytes, SinkWriter, StreamReader},
    sync::{CancellationToken, PollSender},
};

use fronthaul::{
    cookie::{open_cookie, CookieError},
    net::{ConnSet, IdleTimeoutStream},
};

use crate::config::Config;

pub use self::conn::{MeekConn, MeekStream, PumpError};

pub mod conn;
mod tls;

/// Protocol version 1 clients expect at most 64 KiB response bodies and
/// resubmit their original cookie with every request.
pub const MEEK_PROTOCOL_VERSION_1: i32 = 1;

/// Protocol version 2 clients receive a server-chosen session ID via
/// Set-Cookie on their first response and echo it on subsequent requests.
pub const MEEK_PROTOCOL_VERSION_2: i32 = 2;

pub const MEEK_MAX_PAYLOAD_LENGTH: usize = 0x10000;
pub const MEEK_TURN_AROUND_TIMEOUT: Duration = Duration::from_millis(20);
pub const MEEK_EXTENDED_TURN_AROUND_TIMEOUT: Duration = Duration::from_millis(100);
pub const MEEK_MAX_SESSION_STALENESS: Duration = Duration::from_secs(45);
pub const MEEK_HTTP_CLIENT_READ_TIMEOUT: Duration = Duration::from_secs(45);
pub const MEEK_HTTP_CLIENT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);
pub const MEEK_MIN_SESSION_ID_LENGTH: usize = 8;
pub const MEEK_MAX_SESSION_ID_LENGTH: usize = 20;

type ResponseBody = BoxBody<Bytes, io::Error>;

/// Handler invoked with the byte stream of each new meek session
pub type ClientHandler = Arc<dyn Fn(MeekStream) -> BoxFuture<'static, ()> + Send + Sync>;

pub(crate) struct MeekSession {
    pub(crate) conn: MeekConn,
    protocol_version: i32,
    session_id_sent: AtomicBool,
    last_activity: AtomicU64,
}

impl MeekSession {
    fn touch(&self, epoch: Instant) {
        let elapsed = epoch.elapsed().as_nanos() as u64;
        self.last_activity.store(elapsed, Ordering::Relaxed);
    }

    fn expired(&self, epoch: Instant) -> bool {
        let last = Duration::from_nanos(self.last_activity.load(Ordering::Relaxed));
        epoch.elapsed().saturating_sub(last) > MEEK_MAX_SESSION_STALENESS
    }
}

/// The meek tunnel front.
///
/// Serves HTTP or HTTPS on a listener, maintains the session table, and
/// spawns the client handler with each new session's byte stream.
pub struct MeekServer {
    config: Arc<Config>,
    tls_acceptor: Option<SslAcceptor>,
    client_handler: ClientHandler,
    open_conns: ConnSet,
    shutdown: CancellationToken,
    sessions: RwLock<HashMap<String, Arc<MeekSession>>>,
    epoch: Instant,
}

impl MeekServer {
    /// Creates a meek server. With `Config::use_tls`, a TLS acceptor is
    /// built with a certificate self-signed for the configured common name.
    pub fn new(
        config: Arc<Config>,
        client_handler: ClientHandler,
        shutdown: CancellationToken,
    ) -> io::Result<MeekServer> {
        let tls_acceptor = if config.use_tls {
            let acceptor = tls::make_tls_acceptor(&config)
                .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
            Some(acceptor)
        } else {
            None
        };

        Ok(MeekServer {
            config,
            tls_acceptor,
            client_handler,
            open_conns: ConnSet::new(),
            shutdown,
            sessions: RwLock::new(HashMap::new()),
            epoch: Instant::now(),
        })
    }

    /// Serves connections from `listener` until the shutdown signal fires.
    /// Also runs the periodic reaper that expires stale sessions.
    pub async fn run(self: Arc<Self>, listener: TcpListener) -> io::Result<()> {
        info!(
            "meek server listening on {} ({})",
            listener.local_addr()?,
            if self.tls_acceptor.is_some() { "https" } else { "http" },
        );

        let reaper = {
            let server = self.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(MEEK_MAX_SESSION_STALENESS / 2);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => server.reap_expired_sessions(),
                        _ = server.shutdown.cancelled() => break,
                    }
                }
            })
        };

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(err) => {
                            error!("accept failed, error: {}", err);
                            continue;
                        }
                    };
                    let server = self.clone();
                    tokio::spawn(async move {
                        server.serve_client(stream, peer).await;
                    });
                }
            }
        }

        // Idle keep-alive connections would otherwise outlive the listener
        self.open_conns.close_all();
        self.close_all_sessions();
        let _ = reaper.await;

        Ok(())
    }

    async fn serve_client(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let guard = self.open_conns.add();
        let conn_close = guard.close_handle();

        let stream = IdleTimeoutStream::new(
            stream,
            MEEK_HTTP_CLIENT_READ_TIMEOUT,
            MEEK_HTTP_CLIENT_WRITE_TIMEOUT,
        );

        match self.tls_acceptor {
            Some(ref acceptor) => {
                let ssl = match Ssl::new(acceptor.context()) {
                    Ok(ssl) => ssl,
                    Err(err) => {
                        warn!("TLS setup failed, error: {}", err);
                        return;
                    }
                };
                let mut tls_stream = match SslStream::new(ssl, stream) {
                    Ok(tls_stream) => tls_stream,
                    Err(err) => {
                        warn!("TLS setup failed, error: {}", err);
                        return;
                    }
                };
                if let Err(err) = Pin::new(&mut tls_stream).accept().await {
                    debug!("TLS handshake failed, client: {}, error: {}", peer, err);
                    return;
                }
                self.clone().serve_http(tls_stream, peer, conn_close).await;
            }
            None => {
                self.clone().serve_http(stream, peer, conn_close).await;
            }
        }
    }

    async fn serve_http<S>(self: Arc<Self>, io: S, peer: SocketAddr, conn_close: CancellationToken)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let server = self.clone();
        let close_for_service = conn_close.clone();
        let service = service_fn(move |request| {
            let server = server.clone();
            let conn_close = close_for_service.clone();
            async move { server.handle_request(request, peer, conn_close).await }
        });

        // http1-only; HTTP/2 stays disabled
        let connection = http1::Builder::new()
            .keep_alive(true)
            .serve_connection(TokioIo::new(io), service);
        tokio::pin!(connection);

        tokio::select! {
            result = connection.as_mut() => {
                if let Err(err) = result {
                    debug!("http connection ended, client: {}, error: {}", peer, err);
                }
            }
            // Dropping the connection force-closes the socket
            _ = conn_close.cancelled() => {}
        }
    }

    /// Serves one meek request: the request body is pumped into the
    /// session's stream as upstream traffic and the response body is fed
    /// from the stream's pending writes.
    async fn handle_request(
        self: Arc<Self>,
        request: Request<Incoming>,
        peer: SocketAddr,
        conn_close: CancellationToken,
    ) -> Result<Response<ResponseBody>, Infallible> {
        // The first cookie in iteration order carries the meek cookie or
        // session ID. Also screen for prohibited headers.

        let (cookie_name, cookie_value) = match first_cookie(request.headers()) {
            Some(cookie) if !cookie.1.is_empty() => cookie,
            _ => {
                warn!("missing meek cookie, client: {}", peer);
                return Ok(self.terminate_connection());
            }
        };

        for prohibited in &self.config.meek_prohibited_headers {
            let value = request
                .headers()
                .get(prohibited)
                .and_then(|value| value.to_str().ok())
                .unwrap_or_default();
            if !prohibited.is_empty() {
                warn!(
                    "prohibited meek header, header: {}, value: {}",
                    prohibited, value
                );
                return Ok(self.terminate_connection());
            }
        }

        let (session_id, session) = match self.get_session(request.headers(), peer, &cookie_value)
        {
            Ok(found) => found,
            Err(err) => {
                warn!("session lookup failed, error: {}", err);
                return Ok(self.terminate_connection());
            }
        };

        // Feed the request body to a tunnel read blocked on this session

        let body_reader = StreamReader::new(BodyStream::new(request.into_body()).map(
            |result| match result {
                Ok(frame) => Ok(frame.into_data().unwrap_or_default()),
                Err(err) => Err(io::Error::new(io::ErrorKind::Other, err)),
            },
        ));

        if let Err(err) = session.conn.pump_reads(body_reader).await {
            if !matches!(err, PumpError::Closed) {
                warn!("pump reads failed, error: {}", err);
            }
            self.close_session(&session_id);
            return Ok(self.terminate_connection());
        }

        // Promote the client's original cookie to the server-chosen session
        // ID once per session, before the first response body.

        let (body_tx, body_rx) = mpsc::channel::<Bytes>(1);
        let body_stream =
            ReceiverStream::new(body_rx).map(|chunk| Ok::<_, io::Error>(Frame::data(chunk)));
        let mut response = Response::new(BodyExt::boxed(StreamBody::new(body_stream)));

        if session.protocol_version >= MEEK_PROTOCOL_VERSION_2
            && !session.session_id_sent.load(Ordering::Relaxed)
        {
            match HeaderValue::from_str(&format!("{}={}", cookie_name, session_id)) {
                Ok(value) => {
                    response.headers_mut().insert(header::SET_COOKIE, value);
                    session.session_id_sent.store(true, Ordering::Relaxed);
                }
                Err(err) => {
                    warn!("session cookie rejected, error: {}", err);
                }
            }
        }

        // Feed tunnel writes into the response body until a turn-around
        // condition ends the exchange.

        let server = self.clone();
        tokio::spawn(async move {
            let sink = PollSender::new(body_tx)
                .sink_map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe));
            let mut writer = SinkWriter::new(CopyToBytes::new(sink));

            if let Err(err) = session.conn.pump_writes(&mut writer).await {
                if !matches!(err, PumpError::Closed) {
                    warn!("pump writes failed, error: {}", err);
                }
                server.close_session(&session_id);
                conn_close.cancel();
            }
        });

        Ok(response)
    }

    /// Looks up the session for a meek cookie/session ID value. A miss
    /// treats the value as a new meek cookie: its payload is decrypted and a
    /// new session is established, with the client handler spawned on the
    /// session's stream.
    fn get_session(
        &self,
        headers: &HeaderMap,
        peer: SocketAddr,
        cookie_value: &str,
    ) -> Result<(String, Arc<MeekSession>), CookieError> {
        {
            let sessions = self.sessions.read().unwrap();
            if let Some(session) = sessions.get(cookie_value) {
                session.touch(self.epoch);
                return Ok((cookie_value.to_owned(), session.clone()));
            }
        }

        let session_data = open_cookie(
            &self.config.meek_obfuscated_key,
            &self.config.meek_cookie_encryption_private_key,
            cookie_value,
        )?;

        // Determine the client address for the tunnel handler. Behind an
        // intermediate proxy or CDN the original address may be available in
        // a forwarded-for style header holding a comma-separated proxy
        // chain, whose first entry should be the client.
        let mut client_ip = peer.ip().to_string();
        for forwarded in &self.config.meek_proxy_forwarded_for_headers {
            if let Some(value) = headers.get(forwarded).and_then(|value| value.to_str().ok()) {
                if !value.is_empty() {
                    let proxy_client_ip = forwarded.split(',').next().unwrap_or_default();
                    if client_ip.parse::<IpAddr>().is_ok() {
                        client_ip = proxy_client_ip.to_owned();
                        break;
                    }
                }
            }
        }
        let remote_ip = client_ip
            .parse::<IpAddr>()
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));

        let (conn, stream) = MeekConn::pair(
            SocketAddr::new(remote_ip, 0),
            session_data.protocol_version,
        );

        let session = Arc::new(MeekSession {
            conn,
            protocol_version: session_data.protocol_version,
            session_id_sent: AtomicBool::new(false),
            last_activity: AtomicU64::new(0),
        });
        session.touch(self.epoch);

        // v1 clients always resubmit their original cookie; only v2+
        // sessions get a server-chosen ID.
        let session_id = if session_data.protocol_version >= MEEK_PROTOCOL_VERSION_2 {
            make_session_id()
        } else {
            cookie_value.to_owned()
        };

        self.sessions
            .write()
            .unwrap()
            .insert(session_id.clone(), session.clone());

        debug!(
            "new meek session, client: {}, version: {}",
            remote_ip, session_data.protocol_version
        );

        tokio::spawn((self.client_handler)(stream));

        Ok((session_id, session))
    }

    /// Closes a session and removes it from the table
    pub fn close_session(&self, session_id: &str) {
        let mut sessions = self.sessions.write().unwrap();
        if let Some(session) = sessions.remove(session_id) {
            session.conn.close();
        }
    }

    fn close_all_sessions(&self) {
        let mut sessions = self.sessions.write().unwrap();
        for session in sessions.values() {
            session.conn.close();
        }
        sessions.clear();
    }

    fn reap_expired_sessions(&self) {
        let epoch = self.epoch;
        let mut sessions = self.sessions.write().unwrap();
        sessions.retain(|_, session| {
            if session.expired(epoch) {
                session.conn.close();
                false
            } else {
                true
            }
        });
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().unwrap().len()
    }

    /// Sends a 404 and disposes of the persistent client connection
    fn terminate_connection(&self) -> Response<ResponseBody> {
        let mut response = Response::new(full_body("404 page not found\n"));
        *response.status_mut() = StatusCode::NOT_FOUND;
        response
            .headers_mut()
            .insert(header::CONNECTION, HeaderValue::from_static("close"));
        response
    }
}

fn full_body(content: &'static str) -> ResponseBody {
    Full::new(Bytes::from_static(content.as_bytes()))
        .map_err(|never| match never {})
        .boxed()
}

fn first_cookie(headers: &HeaderMap) -> Option<(String, String)> {
    let header = headers.get(header::COOKIE)?.to_str().ok()?;
    let first = header.split(';').next()?.trim();
    let (name, value) = first.split_once('=')?;
    Some((name.trim().to_owned(), value.trim().to_owned()))
}

/// Creates a new session ID: 8 to 20 characters of URL-safe base64 from a
/// cryptographic RNG. The variable size frustrates traffic analysis of both
/// plaintext and TLS meek traffic.
fn make_session_id() -> String {
    let size = OsRng.gen_range(MEEK_MIN_SESSION_ID_LENGTH..=MEEK_MAX_SESSION_ID_LENGTH);
    let mut bytes = vec![0u8; size];
    OsRng.fill_bytes(&mut bytes);
    let mut session_id = URL_SAFE_NO_PAD.encode(&bytes);
    session_id.truncate(size);
    session_id
}

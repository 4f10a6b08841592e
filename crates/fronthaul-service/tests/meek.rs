//! Meek end-to-end tests: real HTTP exchanges against a live listener

use std::{net::SocketAddr, sync::Arc, time::Duration};

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{
    body::Incoming,
    client::conn::http1::SendRequest,
    header::{self, HeaderValue},
    Method, Request, StatusCode,
};
use hyper_util::rt::TokioIo;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::mpsc,
    time::timeout,
};
use tokio_util::sync::CancellationToken;

use fronthaul::cookie::{generate_key_pair, seal_cookie, ClientSessionData};
use fronthaul_service::{
    config::Config,
    server::meek::{
        ClientHandler, MeekServer, MEEK_MAX_SESSION_ID_LENGTH, MEEK_MIN_SESSION_ID_LENGTH,
    },
};

const OBFUSCATED_KEY: &str = "integration-test-keyword";

/// Echoes tunnel bytes back with independent read and write tasks, the way
/// a real tunnel consumer stays full-duplex.
fn echo_handler() -> ClientHandler {
    Arc::new(|stream| {
        Box::pin(async move {
            let (mut read_half, mut write_half) = tokio::io::split(stream);
            let (chunk_tx, mut chunk_rx) = mpsc::unbounded_channel::<Vec<u8>>();

            let reader = tokio::spawn(async move {
                let mut buffer = [0u8; 4096];
                loop {
                    match read_half.read(&mut buffer).await {
                        Ok(0) | Err(..) => break,
                        Ok(n) => {
                            if chunk_tx.send(buffer[..n].to_vec()).is_err() {
                                break;
                            }
                        }
                    }
                }
            });

            while let Some(chunk) = chunk_rx.recv().await {
                if write_half.write_all(&chunk).await.is_err() {
                    break;
                }
            }
            let _ = reader.await;
        })
    })
}

struct TestServer {
    addr: SocketAddr,
    server: Arc<MeekServer>,
    public_key: String,
    shutdown: CancellationToken,
}

async fn start_server(configure: impl FnOnce(&mut Config)) -> TestServer {
    let (private_key, public_key) = generate_key_pair();

    let mut config = Config {
        meek_obfuscated_key: OBFUSCATED_KEY.to_owned(),
        meek_cookie_encryption_private_key: private_key,
        ..Config::default()
    };
    configure(&mut config);

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");

    let shutdown = CancellationToken::new();
    let server = Arc::new(
        MeekServer::new(Arc::new(config), echo_handler(), shutdown.clone()).expect("server"),
    );
    tokio::spawn(server.clone().run(listener));

    TestServer {
        addr,
        server,
        public_key,
        shutdown,
    }
}

fn new_cookie(public_key: &str, protocol_version: i32) -> String {
    let session_data = ClientSessionData {
        protocol_version,
        client_session_id: "sid".to_owned(),
        client_region_hint: "1.2.3.4".to_owned(),
    };
    seal_cookie(OBFUSCATED_KEY, public_key, &session_data, 32).expect("cookie")
}

async fn connect(addr: SocketAddr) -> SendRequest<Full<Bytes>> {
    let stream = TcpStream::connect(addr).await.expect("connect");
    let (sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .expect("handshake");
    tokio::spawn(connection);
    sender
}

struct MeekResponse {
    status: StatusCode,
    set_cookie: Option<String>,
    connection: Option<String>,
    body: Vec<u8>,
}

async fn meek_request(
    sender: &mut SendRequest<Full<Bytes>>,
    cookie: &str,
    body: &[u8],
) -> MeekResponse {
    let request = Request::builder()
        .method(Method::POST)
        .uri("/")
        .header(header::HOST, "www.example.org")
        .header(header::COOKIE, HeaderValue::from_str(cookie).expect("cookie value"))
        .body(Full::new(Bytes::copy_from_slice(body)))
        .expect("request");

    let response: hyper::Response<Incoming> = timeout(
        Duration::from_secs(10),
        sender.send_request(request),
    )
    .await
    .expect("response timeout")
    .expect("response");

    let status = response.status();
    let header_string = |name: header::HeaderName| {
        response
            .headers()
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned)
    };
    let set_cookie = header_string(header::SET_COOKIE);
    let connection = header_string(header::CONNECTION);

    let body = timeout(Duration::from_secs(10), response.into_body().collect())
        .await
        .expect("body timeout")
        .expect("body")
        .to_bytes()
        .to_vec();

    MeekResponse {
        status,
        set_cookie,
        connection,
        body,
    }
}

#[tokio::test]
async fn test_v2_handshake_and_resume() {
    let test_server = start_server(|_| {}).await;

    let cookie_value = new_cookie(&test_server.public_key, 2);
    let mut sender = connect(test_server.addr).await;

    // The first exchange promotes the cookie to a server-chosen session ID
    // and relays the request body through the echo handler.
    let response = meek_request(&mut sender, &format!("key={cookie_value}"), b"hello").await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body, b"hello");

    let set_cookie = response.set_cookie.expect("session cookie");
    let (name, session_id) = set_cookie.split_once('=').expect("cookie pair");
    assert_eq!(name, "key");
    assert!(session_id.len() >= MEEK_MIN_SESSION_ID_LENGTH);
    assert!(session_id.len() <= MEEK_MAX_SESSION_ID_LENGTH);
    assert_eq!(test_server.server.session_count(), 1);

    // Subsequent exchanges echo the session ID and carry no Set-Cookie
    let response = meek_request(&mut sender, &format!("key={session_id}"), b"again").await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body, b"again");
    assert!(response.set_cookie.is_none());
    assert_eq!(test_server.server.session_count(), 1);

    test_server.shutdown.cancel();
}

#[tokio::test]
async fn test_v1_compatibility() {
    let test_server = start_server(|_| {}).await;

    let cookie_value = new_cookie(&test_server.public_key, 1);
    let mut sender = connect(test_server.addr).await;

    // v1 sessions never receive a session ID
    let response = meek_request(&mut sender, &format!("key={cookie_value}"), b"hello").await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body, b"hello");
    assert!(response.set_cookie.is_none());

    // Resubmitting the original cookie resumes the same session
    let response = meek_request(&mut sender, &format!("key={cookie_value}"), b"world").await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body, b"world");
    assert_eq!(test_server.server.session_count(), 1);

    test_server.shutdown.cancel();
}

#[tokio::test]
async fn test_missing_cookie_rejected() {
    let test_server = start_server(|_| {}).await;

    let mut sender = connect(test_server.addr).await;
    let request = Request::builder()
        .method(Method::POST)
        .uri("/")
        .header(header::HOST, "www.example.org")
        .body(Full::new(Bytes::new()))
        .expect("request");

    let response = sender.send_request(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(
        response
            .headers()
            .get(header::CONNECTION)
            .and_then(|value| value.to_str().ok()),
        Some("close")
    );

    test_server.shutdown.cancel();
}

#[tokio::test]
async fn test_invalid_cookie_rejected() {
    let test_server = start_server(|_| {}).await;

    let mut sender = connect(test_server.addr).await;
    let response = meek_request(&mut sender, "key=AAAA", b"").await;
    assert_eq!(response.status, StatusCode::NOT_FOUND);
    assert_eq!(response.connection.as_deref(), Some("close"));
    assert_eq!(test_server.server.session_count(), 0);

    test_server.shutdown.cancel();
}

#[tokio::test]
async fn test_prohibited_header_config_rejects_requests() {
    let test_server = start_server(|config| {
        config.meek_prohibited_headers = vec!["Via".to_owned()];
    }).await;

    // Any non-empty prohibited header entry rejects the request, whether or
    // not the header is present on the wire.
    let cookie_value = new_cookie(&test_server.public_key, 2);
    let mut sender = connect(test_server.addr).await;
    let response = meek_request(&mut sender, &format!("key={cookie_value}"), b"hi").await;
    assert_eq!(response.status, StatusCode::NOT_FOUND);

    test_server.shutdown.cancel();
}

#[tokio::test]
async fn test_large_upstream_body() {
    let test_server = start_server(|_| {}).await;

    let cookie_value = new_cookie(&test_server.public_key, 2);
    let mut sender = connect(test_server.addr).await;

    let payload: Vec<u8> = (0..100_000u32).map(|value| value as u8).collect();
    let response = meek_request(&mut sender, &format!("key={cookie_value}"), &payload).await;
    assert_eq!(response.status, StatusCode::OK);

    // The echo comes back across as many exchanges as the response caps
    // require.
    let session_cookie = response.set_cookie.expect("session cookie");
    let mut received = response.body;
    let mut rounds = 0;
    while received.len() < payload.len() {
        rounds += 1;
        assert!(rounds < 100, "echo did not complete, got {} bytes", received.len());
        let response = meek_request(&mut sender, &session_cookie, b"").await;
        assert_eq!(response.status, StatusCode::OK);
        received.extend_from_slice(&response.body);
    }
    assert_eq!(received, payload);

    test_server.shutdown.cancel();
}

#[tokio::test]
async fn test_shutdown_stops_server() {
    let test_server = start_server(|_| {}).await;

    let cookie_value = new_cookie(&test_server.public_key, 2);
    let mut sender = connect(test_server.addr).await;
    let response = meek_request(&mut sender, &format!("key={cookie_value}"), b"hello").await;
    assert_eq!(response.status, StatusCode::OK);

    test_server.shutdown.cancel();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // The tracked keep-alive connection is force-closed on shutdown
    let request = Request::builder()
        .method(Method::POST)
        .uri("/")
        .header(header::HOST, "www.example.org")
        .body(Full::new(Bytes::new()))
        .expect("request");
    let result = timeout(Duration::from_secs(5), sender.send_request(request)).await;
    assert!(matches!(result, Ok(Err(..))));
}

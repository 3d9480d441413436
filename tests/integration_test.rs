//! Integration tests for dialchain
//!
//! Runs whole chains against an in-process endpoint:
//! - HTTP CONNECT and SOCKS5 through shadowsocks + multiplex
//! - algeneva mutation and recovery on the far side
//! - proxyless attempts falling back to the proxy chain
//! - half-close across the local relay
//! - plain HTTP requests rewritten one by one on a kept-alive connection

use dialchain::algeneva::{read_head, AlgenevaAcceptor, AlgenevaDialer, Normalizer, Request, Strategy};
use dialchain::multiplex::{MuxConfig, Session};
use dialchain::policy::{AttemptHistory, FallbackDialer, Outcome, ProxylessDialer};
use dialchain::obfuscation::PacketDialer;
use dialchain::proxy::{relay, HttpProxyServer, Socks5Server};
use dialchain::shadowsocks::{ShadowsocksAcceptor, ShadowsocksConfig};
use dialchain::transport::{StreamDialer, TcpConn, TcpDialer, TransportConfig};
use dialchain::{BoxConn, ProxyConfig, Registry, SharedDialer};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const SECRET: &str = "integration-secret";

/// TCP echo target
async fn spawn_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let (mut socket, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => return,
            };
            tokio::spawn(async move {
                let (mut reader, mut writer) = socket.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
                let _ = writer.shutdown().await;
            });
        }
    });

    addr
}

#[derive(Clone)]
enum Endpoint {
    Shadowsocks(ShadowsocksAcceptor),
    Algeneva(AlgenevaAcceptor, mpsc::UnboundedSender<Request>),
}

struct EndpointHandle {
    addr: SocketAddr,
    connections: Arc<AtomicUsize>,
}

/// Far end of a chain: protocol accept, multiplexer, dial and relay
async fn spawn_endpoint(endpoint: Endpoint) -> EndpointHandle {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connections = Arc::new(AtomicUsize::new(0));
    let counter = connections.clone();

    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => return,
            };
            counter.fetch_add(1, Ordering::SeqCst);
            let endpoint = endpoint.clone();

            tokio::spawn(async move {
                let conn = TcpConn::new(stream).unwrap();
                let conn: BoxConn = match endpoint {
                    Endpoint::Shadowsocks(acceptor) => match acceptor.accept(conn).await {
                        Ok((conn, _decoy)) => Box::new(conn),
                        Err(_) => return,
                    },
                    Endpoint::Algeneva(acceptor, requests) => match acceptor.accept(conn).await {
                        Ok((conn, request)) => {
                            let _ = requests.send(request);
                            Box::new(conn)
                        }
                        Err(_) => return,
                    },
                };

                let (_session, mut incoming) = Session::server(conn, MuxConfig::default());
                while let Some(stream) = incoming.accept().await {
                    tokio::spawn(async move {
                        let Ok(remote) = TcpDialer::default()
                            .dial_stream(stream.destination())
                            .await
                        else {
                            return;
                        };
                        let _ = relay(stream, remote, CancellationToken::new()).await;
                    });
                }
            });
        }
    });

    EndpointHandle { addr, connections }
}

fn shadowsocks_params() -> HashMap<String, String> {
    let mut params = HashMap::new();
    params.insert("cipher".to_string(), "chacha20-ietf-poly1305".to_string());
    params.insert("secret".to_string(), SECRET.to_string());
    params
}

fn shadowsocks_endpoint() -> Endpoint {
    let config = ShadowsocksConfig::from_params(&shadowsocks_params()).unwrap();
    Endpoint::Shadowsocks(ShadowsocksAcceptor::new(&config))
}

fn proxy_config(endpoint: SocketAddr, protocol: &str, params: HashMap<String, String>) -> ProxyConfig {
    ProxyConfig {
        server: endpoint.ip().to_string(),
        port: endpoint.port(),
        protocol: protocol.to_string(),
        params,
    }
}

async fn echo_roundtrip(conn: &mut (impl AsyncReadExt + AsyncWriteExt + Unpin), msg: &[u8]) {
    conn.write_all(msg).await.unwrap();
    let mut buf = vec![0u8; msg.len()];
    conn.read_exact(&mut buf).await.unwrap();
    assert_eq!(buf, msg);
}

/// Reply of [`spawn_origin`] to every request
const ORIGIN_RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok";

/// HTTP origin: reports each request head plus its `Content-Length` body,
/// answers [`ORIGIN_RESPONSE`] and closes
async fn spawn_origin() -> (SocketAddr, mpsc::UnboundedReceiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        loop {
            let (mut socket, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => return,
            };
            let tx = tx.clone();
            tokio::spawn(async move {
                let Ok(head) = read_head(&mut socket).await else {
                    return;
                };
                let head = String::from_utf8_lossy(&head).into_owned();
                let len = head
                    .lines()
                    .find_map(|line| line.strip_prefix("Content-Length: "))
                    .and_then(|v| v.trim().parse().ok())
                    .unwrap_or(0);
                let mut body = vec![0u8; len];
                if socket.read_exact(&mut body).await.is_err() {
                    return;
                }
                let _ = tx.send(head + &String::from_utf8_lossy(&body));
                let _ = socket.write_all(ORIGIN_RESPONSE).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    (addr, rx)
}

/// Read a response head byte by byte
async fn read_response_head(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).await.unwrap();
        head.push(byte[0]);
    }
    String::from_utf8(head).unwrap()
}

/// HTTP CONNECT through shadowsocks and the multiplexer
#[tokio::test]
async fn test_http_connect_through_shadowsocks_chain() {
    let target = spawn_echo().await;
    let endpoint = spawn_endpoint(shadowsocks_endpoint()).await;

    let chain = Registry::with_defaults()
        .build_chain(&proxy_config(endpoint.addr, "shadowsocks", shadowsocks_params()))
        .unwrap();
    assert_eq!(
        chain.stages(),
        &["tcp", "shadowsocks", "multiplex", "logging"]
    );
    let totals = chain.totals();

    let cancel = CancellationToken::new();
    let server = HttpProxyServer::bind("127.0.0.1:0", Arc::new(chain))
        .await
        .unwrap()
        .with_cancel(cancel.clone());
    let proxy_addr = server.local_addr().unwrap();
    tokio::spawn(server.run());

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    client
        .write_all(format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n\r\n", target, target).as_bytes())
        .await
        .unwrap();
    let head = read_response_head(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 200"), "unexpected reply {:?}", head);

    echo_roundtrip(&mut client, b"hello through the chain").await;
    echo_roundtrip(&mut client, &vec![0x5a; 64 * 1024]).await;

    assert!(totals.bytes_written() >= 64 * 1024);
    assert!(totals.bytes_read() >= 64 * 1024);
    cancel.cancel();
}

/// SOCKS5 CONNECT, two clients sharing one physical session
#[tokio::test]
async fn test_socks5_streams_share_one_connection() {
    let target = spawn_echo().await;
    let endpoint = spawn_endpoint(shadowsocks_endpoint()).await;

    let chain = Registry::with_defaults()
        .build_chain(&proxy_config(endpoint.addr, "shadowsocks", shadowsocks_params()))
        .unwrap();

    let cancel = CancellationToken::new();
    let server = Socks5Server::bind("127.0.0.1:0", Arc::new(chain))
        .await
        .unwrap()
        .with_cancel(cancel.clone());
    let proxy_addr = server.local_addr().unwrap();
    tokio::spawn(server.run());

    let mut clients = Vec::new();
    for i in 0..2u8 {
        let mut client = TcpStream::connect(proxy_addr).await.unwrap();
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut choice = [0u8; 2];
        client.read_exact(&mut choice).await.unwrap();
        assert_eq!(choice, [0x05, 0x00]);

        let host = target.ip().to_string();
        let mut request = vec![0x05, 0x01, 0x00, 0x03, host.len() as u8];
        request.extend_from_slice(host.as_bytes());
        request.extend_from_slice(&target.port().to_be_bytes());
        client.write_all(&request).await.unwrap();

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], 0x00, "SOCKS5 reply code");

        echo_roundtrip(&mut client, &[i; 32]).await;
        clients.push(client);
    }

    assert_eq!(endpoint.connections.load(Ordering::SeqCst), 1);
    cancel.cancel();
}

/// Every dial reaches the configured server, which reaches the destination
#[tokio::test]
async fn test_chain_dials_configured_server() {
    let target = spawn_echo().await;
    let endpoint = spawn_endpoint(shadowsocks_endpoint()).await;

    let chain = Registry::with_defaults()
        .with_transport(TransportConfig::default())
        .build_chain(&proxy_config(endpoint.addr, "shadowsocks", shadowsocks_params()))
        .unwrap();
    assert_eq!(chain.server(), endpoint.addr.to_string());

    let mut conn = chain.dial_stream(&target.to_string()).await.unwrap();
    echo_roundtrip(&mut conn, b"via the endpoint").await;
    assert_eq!(endpoint.connections.load(Ordering::SeqCst), 1);
}

/// Wrong secret: the endpoint cannot open the session
#[tokio::test]
async fn test_shadowsocks_wrong_secret_fails() {
    let target = spawn_echo().await;
    let endpoint = spawn_endpoint(shadowsocks_endpoint()).await;

    let mut params = shadowsocks_params();
    params.insert("secret".to_string(), "not-the-secret".to_string());
    let chain = Registry::with_defaults()
        .build_chain(&proxy_config(endpoint.addr, "shadowsocks", params))
        .unwrap();

    let result = tokio::time::timeout(Duration::from_secs(5), async {
        let mut conn = chain.dial_stream(&target.to_string()).await?;
        conn.write_all(b"ping").await?;
        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).await?;
        Ok::<_, Box<dyn std::error::Error + Send + Sync>>(())
    })
    .await
    .unwrap();
    assert!(result.is_err());
}

/// A mutated CONNECT is recovered by the endpoint
#[tokio::test]
async fn test_algeneva_mutation_recovered() {
    let target = spawn_echo().await;
    let (tx, mut requests) = mpsc::unbounded_channel();
    let endpoint = spawn_endpoint(Endpoint::Algeneva(AlgenevaAcceptor::new(), tx)).await;

    let mut params = HashMap::new();
    params.insert(
        "strategy".to_string(),
        "[HTTP:method:*]-insert{%0A:end:value:4}-|".to_string(),
    );
    let chain = Registry::with_defaults()
        .build_chain(&proxy_config(endpoint.addr, "algeneva", params))
        .unwrap();
    assert!(chain.rewrites_http());

    let mut conn = chain.dial_stream(&target.to_string()).await.unwrap();
    echo_roundtrip(&mut conn, b"after the mutated head").await;

    let request = requests.recv().await.unwrap();
    assert_eq!(request.method, "CONNECT");
    assert_eq!(request.target(), Some("mux.invalid:443"));
    assert_eq!(request.version, "HTTP/1.1");
}

/// Proxyless failure falls back and is remembered
#[tokio::test]
async fn test_proxyless_falls_back_to_chain() {
    let target = spawn_echo().await;
    let endpoint = spawn_endpoint(shadowsocks_endpoint()).await;

    // Nothing listens here once the listener is dropped
    let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let closed_addr = closed.local_addr().unwrap();
    drop(closed);

    let chain: SharedDialer = Arc::new(
        Registry::with_defaults()
            .build_chain(&proxy_config(endpoint.addr, "shadowsocks", shadowsocks_params()))
            .unwrap(),
    );

    // Direct attempts always go to the closed port
    struct Redirect(TcpDialer, String);

    #[async_trait::async_trait]
    impl StreamDialer for Redirect {
        async fn dial_stream(
            &self,
            _addr: &str,
        ) -> Result<BoxConn, dialchain::transport::TransportError> {
            self.0.dial_stream(&self.1).await
        }

        fn name(&self) -> &'static str {
            "redirect"
        }
    }

    let history = Arc::new(AttemptHistory::default());
    let direct = ProxylessDialer::with_fingerprint(
        Arc::new(Redirect(TcpDialer::default(), closed_addr.to_string())),
        "split:2",
        history.clone(),
    );
    let dialer = FallbackDialer::new(Arc::new(direct), chain);

    let mut conn = dialer.dial_stream(&target.to_string()).await.unwrap();
    echo_roundtrip(&mut conn, b"fallback").await;

    let record = history.get(&target.ip().to_string()).unwrap();
    assert_eq!(record.attempts, 1);
    assert_eq!(record.last_outcome, Outcome::Failure);

    // Recent failure with the same fingerprint: no second direct attempt
    let mut conn = dialer.dial_stream(&target.to_string()).await.unwrap();
    echo_roundtrip(&mut conn, b"again").await;
    assert_eq!(history.get(&target.ip().to_string()).unwrap().attempts, 1);
}

/// Proxyless success over real packet manipulation
#[tokio::test]
async fn test_proxyless_split_succeeds() {
    let target = spawn_echo().await;
    let history = Arc::new(AttemptHistory::default());
    let packet = PacketDialer::parse(TcpDialer::default(), "split:2").unwrap();
    let direct = ProxylessDialer::new(packet, history.clone());

    let mut conn = direct.dial_stream(&target.to_string()).await.unwrap();
    echo_roundtrip(&mut conn, b"split across writes").await;

    let record = history.get(&target.ip().to_string()).unwrap();
    assert_eq!(record.last_outcome, Outcome::Success);
    assert!(record.last_success.is_some());
}

/// Client half-close reaches the target while the reply still flows back
#[tokio::test]
async fn test_http_connect_half_close() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target = listener.local_addr().unwrap();
    let target_task = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut received = Vec::new();
        socket.read_to_end(&mut received).await.unwrap();
        socket.write_all(b"got it").await.unwrap();
        socket.shutdown().await.unwrap();
        received
    });

    let cancel = CancellationToken::new();
    let server = HttpProxyServer::bind("127.0.0.1:0", Arc::new(TcpDialer::default()))
        .await
        .unwrap()
        .with_cancel(cancel.clone());
    let proxy_addr = server.local_addr().unwrap();
    tokio::spawn(server.run());

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    client
        .write_all(format!("CONNECT {} HTTP/1.1\r\n\r\n", target).as_bytes())
        .await
        .unwrap();
    let head = read_response_head(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 200"));

    client.write_all(b"request body").await.unwrap();
    client.shutdown().await.unwrap();

    let mut reply = Vec::new();
    client.read_to_end(&mut reply).await.unwrap();
    assert_eq!(reply, b"got it");
    assert_eq!(target_task.await.unwrap(), b"request body");
    cancel.cancel();
}

/// Every plain request on one client connection is rewritten and sent to
/// its own target
#[tokio::test]
async fn test_plain_http_rewritten_per_request() {
    let (first_origin, mut first_requests) = spawn_origin().await;
    let (second_origin, mut second_requests) = spawn_origin().await;
    let endpoint = spawn_endpoint(shadowsocks_endpoint()).await;

    let chain = Registry::with_defaults()
        .build_chain(&proxy_config(endpoint.addr, "shadowsocks", shadowsocks_params()))
        .unwrap();

    let cancel = CancellationToken::new();
    let server = HttpProxyServer::bind("127.0.0.1:0", Arc::new(chain))
        .await
        .unwrap()
        .with_auth_token("X-Proxy-Auth-Token".to_string(), "tok".to_string())
        .with_cancel(cancel.clone());
    let proxy_addr = server.local_addr().unwrap();
    tokio::spawn(server.run());

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    let requests = [
        format!(
            "GET http://{0}/a HTTP/1.1\r\nHost: {0}\r\nProxy-Connection: keep-alive\r\nKeep-Alive: timeout=5\r\n\r\n",
            first_origin
        ),
        format!(
            "POST http://{0}/b HTTP/1.1\r\nHost: {0}\r\nProxy-Connection: keep-alive\r\nContent-Length: 5\r\n\r\nhello",
            second_origin
        ),
    ];
    for request in &requests {
        client.write_all(request.as_bytes()).await.unwrap();
        let mut response = vec![0u8; ORIGIN_RESPONSE.len()];
        client.read_exact(&mut response).await.unwrap();
        assert_eq!(response, ORIGIN_RESPONSE);
    }

    let first = first_requests.recv().await.unwrap();
    assert_eq!(
        first,
        format!(
            "GET /a HTTP/1.1\r\nHost: {}\r\nConnection: close\r\nX-Proxy-Auth-Token: tok\r\n\r\n",
            first_origin
        )
    );

    let second = second_requests.recv().await.unwrap();
    assert_eq!(
        second,
        format!(
            "POST /b HTTP/1.1\r\nHost: {}\r\nContent-Length: 5\r\nConnection: close\r\nX-Proxy-Auth-Token: tok\r\n\r\nhello",
            second_origin
        )
    );

    // One request each: the second never reached the first origin
    assert!(first_requests.try_recv().is_err());
    cancel.cancel();
}

/// Oversized and non-UTF-8 request heads get a 400
#[tokio::test]
async fn test_http_bad_heads_rejected() {
    let cancel = CancellationToken::new();
    let server = HttpProxyServer::bind("127.0.0.1:0", Arc::new(TcpDialer::default()))
        .await
        .unwrap()
        .with_cancel(cancel.clone());
    let proxy_addr = server.local_addr().unwrap();
    tokio::spawn(server.run());

    // Exactly the head limit without a line break, all of it consumed
    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    client.write_all(&vec![b'A'; 64 * 1024]).await.unwrap();
    let head = read_response_head(&mut client).await;
    assert_eq!(head, "HTTP/1.1 400 Bad Request\r\n\r\n");

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    client
        .write_all(b"GET http://127.0.0.1:1/ HTTP/1.1\r\nHost: \xff\xfe\r\n\r\n")
        .await
        .unwrap();
    let head = read_response_head(&mut client).await;
    assert_eq!(head, "HTTP/1.1 400 Bad Request\r\n\r\n");
    cancel.cancel();
}

/// The mutated head on the wire is the plain CONNECT plus the inserted bytes
#[tokio::test]
async fn test_algeneva_head_differs_by_insertion() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let server = listener.local_addr().unwrap();
    let capture = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let head = read_head(&mut socket).await.unwrap();
        socket.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await.unwrap();
        head
    });

    let strategy: Strategy = "[HTTP:method:*]-insert{%0A:end:value:4}-|".parse().unwrap();
    let dialer = AlgenevaDialer::new(Arc::new(TcpDialer::default()), server.to_string(), strategy);
    let _conn = dialer.dial_stream("example.com:443").await.unwrap();

    let mutated = capture.await.unwrap();
    let plain = Request::connect("example.com:443").to_bytes();
    let at = "CONNECT".len();
    assert_eq!(mutated.len(), plain.len() + 4);
    assert_eq!(&mutated[..at], &plain[..at]);
    assert_eq!(&mutated[at..at + 4], b"\n\n\n\n");
    assert_eq!(&mutated[at + 4..], &plain[at..]);

    let recovered = Normalizer::new().normalize(&mutated).unwrap();
    assert_eq!(recovered.method, "CONNECT");
    assert_eq!(recovered.target(), Some("example.com:443"));
    assert_eq!(recovered.header("host"), Some("example.com:443"));
}

/// Unknown protocols fail at the protocol stage
#[test]
fn test_unknown_protocol_rejected() {
    let err = Registry::with_defaults()
        .build_chain(&proxy_config("127.0.0.1:1".parse().unwrap(), "wireguard", HashMap::new()))
        .unwrap_err();
    assert!(err.to_string().contains("protocol"));
}

//! HTTP proxy: CONNECT tunnels, Upgrade requests and plain requests

use super::{relay, Address, ProxyError};
use crate::transport::{BoxConn, SharedDialer, TcpConn, TransportError};
use base64::Engine;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Largest request head accepted from a client
const MAX_HEAD_SIZE: usize = 64 * 1024;

/// Largest chunk-size or trailer line in a chunked body
const MAX_CHUNK_LINE: usize = 4096;

/// Headers that never cross the proxy
const HOP_BY_HOP: [&str; 8] = [
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
    "keep-alive",
];

/// Parsed request head
#[derive(Debug)]
struct RequestHead {
    method: String,
    target: String,
    version: String,
    headers: Vec<(String, String)>,
}

impl RequestHead {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// How the request body is framed
    fn body(&self) -> Result<Body, ProxyError> {
        if let Some(coding) = self.header("transfer-encoding") {
            let last = coding.rsplit(',').next().unwrap_or_default().trim();
            return if last.eq_ignore_ascii_case("chunked") {
                Ok(Body::Chunked)
            } else {
                Err(ProxyError::BadRequest(format!("unsupported transfer coding {:?}", coding)))
            };
        }
        match self.header("content-length") {
            Some(len) => len
                .parse()
                .map(Body::Length)
                .map_err(|_| ProxyError::BadRequest(format!("invalid content length {:?}", len))),
            None => Ok(Body::Empty),
        }
    }

    fn is_upgrade(&self) -> bool {
        self.header("upgrade").is_some()
            && self.header("connection").is_some_and(|v| {
                v.split(',').any(|t| t.trim().eq_ignore_ascii_case("upgrade"))
            })
    }
}

/// Request body framing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Body {
    Empty,
    Length(u64),
    Chunked,
}

/// Per-connection settings shared by every handler task
#[derive(Clone)]
struct Settings {
    dialer: SharedDialer,
    auth: Option<(String, String)>,
    token: Option<(String, String)>,
    cancel: CancellationToken,
}

/// HTTP proxy server
pub struct HttpProxyServer {
    listener: TcpListener,
    settings: Settings,
}

impl HttpProxyServer {
    /// Bind a listener that dials every target through `dialer`
    pub async fn bind(addr: &str, dialer: SharedDialer) -> Result<Self, ProxyError> {
        let listener = TcpListener::bind(addr).await?;
        info!("HTTP proxy server listening on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            settings: Settings {
                dialer,
                auth: None,
                token: None,
                cancel: CancellationToken::new(),
            },
        })
    }

    /// Enable basic authentication
    pub fn with_auth(mut self, username: String, password: String) -> Self {
        self.settings.auth = Some((username, password));
        self
    }

    /// Add `header: token` to every forwarded request
    pub fn with_auth_token(mut self, header: String, token: String) -> Self {
        self.settings.token = Some((header, token));
        self
    }

    /// Stop accepting and end every relay when `cancel` fires
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.settings.cancel = cancel;
        self
    }

    /// Bound address
    pub fn local_addr(&self) -> Result<std::net::SocketAddr, ProxyError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept and handle incoming connections
    pub async fn run(self) -> Result<(), ProxyError> {
        loop {
            let (stream, peer_addr) = tokio::select! {
                _ = self.settings.cancel.cancelled() => return Ok(()),
                accepted = self.listener.accept() => accepted?,
            };
            debug!("New HTTP proxy connection from {}", peer_addr);

            let settings = self.settings.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, settings).await {
                    debug!("HTTP proxy connection from {} ended: {}", peer_addr, e);
                }
            });
        }
    }
}

async fn handle_connection(stream: TcpStream, settings: Settings) -> Result<(), ProxyError> {
    let mut reader = BufReader::new(stream);

    // Plain requests are answered one at a time on the same client
    // connection. CONNECT and Upgrade hand it over to the relay.
    loop {
        let head = match read_request(&mut reader).await {
            Ok(Some(head)) => head,
            Ok(None) => return Ok(()),
            Err(ProxyError::BadRequest(reason)) => {
                respond(reader.get_mut(), "400 Bad Request").await?;
                return Err(ProxyError::BadRequest(reason));
            }
            Err(e) => return Err(e),
        };

        if let Some((user, pass)) = &settings.auth {
            if !check_basic_auth(head.header("proxy-authorization"), user, pass) {
                let stream = reader.get_mut();
                stream
                    .write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\n")
                    .await?;
                stream
                    .write_all(b"Proxy-Authenticate: Basic realm=\"dialchain\"\r\n\r\n")
                    .await?;
                return Err(ProxyError::AuthenticationFailed);
            }
        }

        if head.method.eq_ignore_ascii_case("CONNECT") || head.is_upgrade() {
            return tunnel(reader, head, &settings).await;
        }
        if !forward(&mut reader, &head, &settings).await? {
            return Ok(());
        }
    }
}

/// CONNECT and Upgrade: answer or forward the head, then relay
async fn tunnel(
    mut reader: BufReader<TcpStream>,
    head: RequestHead,
    settings: &Settings,
) -> Result<(), ProxyError> {
    let connect = head.method.eq_ignore_ascii_case("CONNECT");
    let (address, upgrade_request) = if connect {
        (Address::parse_authority(&head.target, 443), None)
    } else {
        match plain_target(&head) {
            Ok((address, path)) => (Ok(address), Some(rewrite_request(&head, &path, settings))),
            Err(e) => (Err(e), None),
        }
    };
    let address = match address {
        Ok(address) => address,
        Err(e) => {
            respond(reader.get_mut(), "400 Bad Request").await?;
            return Err(e);
        }
    };

    let mut remote = dial(&mut reader, &head, &address, settings).await?;
    match upgrade_request {
        None => {
            respond(reader.get_mut(), "200 Connection established").await?;
        }
        Some(request) => {
            remote.write_all(&request).await?;
        }
    }

    // Bytes the client sent after the head
    let buffered = reader.buffer().to_vec();
    if !buffered.is_empty() {
        remote.write_all(&buffered).await?;
    }
    remote.flush().await?;

    let client = TcpConn::new(reader.into_inner())?;
    let outcome = relay(client, remote, settings.cancel.clone()).await;
    if !outcome.is_clean() {
        debug!("relay to {} ended with {:?}", address, outcome);
    }
    Ok(())
}

/// Forward one plain request and copy its response back.
///
/// The upstream is asked to close after responding, so the response ends
/// at upstream EOF. Returns `false` once the connection should end.
async fn forward(
    reader: &mut BufReader<TcpStream>,
    head: &RequestHead,
    settings: &Settings,
) -> Result<bool, ProxyError> {
    let target = plain_target(head).and_then(|(address, path)| Ok((address, path, head.body()?)));
    let (address, path, body) = match target {
        Ok(target) => target,
        Err(e) => {
            respond(reader.get_mut(), "400 Bad Request").await?;
            return Err(e);
        }
    };

    let mut remote = dial(reader, head, &address, settings).await?;
    remote.write_all(&rewrite_request(head, &path, settings)).await?;
    match body {
        Body::Empty => {}
        Body::Length(len) => {
            let copied = tokio::io::copy(&mut (&mut *reader).take(len), &mut remote).await?;
            if copied < len {
                return Err(ProxyError::BadRequest("request body truncated".into()));
            }
        }
        Body::Chunked => forward_chunked(reader, &mut remote).await?,
    }
    remote.flush().await?;

    let copied = tokio::select! {
        _ = settings.cancel.cancelled() => return Ok(false),
        copied = tokio::io::copy(&mut remote, reader.get_mut()) => copied?,
    };
    debug!("{} {} answered with {} bytes", head.method, address, copied);
    Ok(true)
}

async fn dial(
    reader: &mut BufReader<TcpStream>,
    head: &RequestHead,
    address: &Address,
    settings: &Settings,
) -> Result<BoxConn, ProxyError> {
    debug!("HTTP {} to {}", head.method, address);
    match settings.dialer.dial_stream(&address.to_string()).await {
        Ok(remote) => Ok(remote),
        Err(e) => {
            let status = match e {
                TransportError::Timeout => "504 Gateway Timeout",
                _ => "502 Bad Gateway",
            };
            warn!("dial {} failed: {}", address, e);
            respond(reader.get_mut(), status).await?;
            Err(e.into())
        }
    }
}

async fn respond(stream: &mut TcpStream, status: &str) -> Result<(), ProxyError> {
    stream
        .write_all(format!("HTTP/1.1 {}\r\n\r\n", status).as_bytes())
        .await?;
    Ok(())
}

/// Read one line within `budget` bytes, without its line ending.
/// `None` when the stream ends before the line starts.
async fn read_line<R>(reader: &mut R, budget: &mut usize) -> Result<Option<String>, ProxyError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let n = (&mut *reader)
        .take(*budget as u64)
        .read_until(b'\n', &mut line)
        .await?;
    *budget -= n;

    if !line.ends_with(b"\n") {
        return match (*budget, n) {
            (0, _) => Err(ProxyError::BadRequest("request head too large".into())),
            (_, 0) => Ok(None),
            _ => Err(ProxyError::BadRequest("unexpected end of head".into())),
        };
    }

    let line = String::from_utf8(line)
        .map_err(|_| ProxyError::BadRequest("request head is not valid UTF-8".into()))?;
    Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
}

/// Read the next request head; `None` once the client has closed
async fn read_request<R>(reader: &mut R) -> Result<Option<RequestHead>, ProxyError>
where
    R: AsyncBufRead + Unpin,
{
    let mut budget = MAX_HEAD_SIZE;

    // Empty lines ahead of a request line are skipped
    let request_line = loop {
        match read_line(reader, &mut budget).await? {
            None => return Ok(None),
            Some(line) if line.is_empty() => continue,
            Some(line) => break line,
        }
    };

    let parts: Vec<&str> = request_line.split_whitespace().collect();
    if parts.len() != 3 {
        return Err(ProxyError::BadRequest(format!(
            "invalid request line {:?}",
            request_line
        )));
    }

    let mut headers = Vec::new();
    loop {
        let line = read_line(reader, &mut budget)
            .await?
            .ok_or_else(|| ProxyError::BadRequest("unexpected end of head".into()))?;
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| ProxyError::BadRequest(format!("invalid header {:?}", line)))?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    Ok(Some(RequestHead {
        method: parts[0].to_string(),
        target: parts[1].to_string(),
        version: parts[2].to_string(),
        headers,
    }))
}

/// Copy a chunked body, re-framed without chunk extensions or trailers
async fn forward_chunked<R, W>(reader: &mut R, remote: &mut W) -> Result<(), ProxyError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + ?Sized,
{
    loop {
        let line = read_body_line(reader).await?;
        let size = line.split(';').next().unwrap_or_default().trim();
        let size = u64::from_str_radix(size, 16)
            .map_err(|_| ProxyError::BadRequest(format!("invalid chunk size {:?}", size)))?;

        if size == 0 {
            while !read_body_line(reader).await?.is_empty() {}
            remote.write_all(b"0\r\n\r\n").await?;
            return Ok(());
        }

        remote.write_all(format!("{:x}\r\n", size).as_bytes()).await?;
        let copied = tokio::io::copy(&mut (&mut *reader).take(size), remote).await?;
        if copied < size {
            return Err(ProxyError::BadRequest("request body truncated".into()));
        }
        remote.write_all(b"\r\n").await?;

        if !read_body_line(reader).await?.is_empty() {
            return Err(ProxyError::BadRequest("chunk data longer than its size".into()));
        }
    }
}

/// Chunk-size, chunk-end or trailer line
async fn read_body_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<String, ProxyError> {
    let mut budget = MAX_CHUNK_LINE;
    read_line(reader, &mut budget)
        .await?
        .ok_or_else(|| ProxyError::BadRequest("request body truncated".into()))
}

fn check_basic_auth(header: Option<&str>, user: &str, pass: &str) -> bool {
    let Some(encoded) = header.and_then(|v| v.strip_prefix("Basic ")) else {
        return false;
    };
    let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(encoded.trim()) else {
        return false;
    };
    match String::from_utf8(decoded) {
        Ok(credentials) => credentials.split_once(':') == Some((user, pass)),
        Err(_) => false,
    }
}

/// Target and origin-form path of a non-CONNECT request
fn plain_target(head: &RequestHead) -> Result<(Address, String), ProxyError> {
    let target = head.target.as_str();

    for (scheme, port) in [("http://", 80), ("https://", 443)] {
        let Some(rest) = strip_prefix_ignore_case(target, scheme) else {
            continue;
        };
        let (authority, path) = match rest.find('/') {
            Some(i) => (&rest[..i], &rest[i..]),
            None => (rest, "/"),
        };
        return Ok((Address::parse_authority(authority, port)?, path.to_string()));
    }

    let host = head
        .header("host")
        .ok_or_else(|| ProxyError::BadRequest("no absolute URI and no Host header".into()))?;
    Ok((Address::parse_authority(host, 80)?, target.to_string()))
}

fn strip_prefix_ignore_case<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    let head = s.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix).then(|| &s[prefix.len()..])
}

/// Rebuild a request head for forwarding: origin-form target, hop-by-hop
/// headers removed, auth token added. Plain requests ask the upstream to
/// close after one response and carry a chunked body re-framed by
/// [`forward_chunked`].
fn rewrite_request(head: &RequestHead, path: &str, settings: &Settings) -> Vec<u8> {
    let upgrade = head.is_upgrade();
    let chunked = !upgrade && head.body().is_ok_and(|body| body == Body::Chunked);

    // Headers named by Connection are hop-by-hop too
    let listed: Vec<String> = head
        .header("connection")
        .map(|v| v.split(',').map(|t| t.trim().to_ascii_lowercase()).collect())
        .unwrap_or_default();

    let mut out = format!("{} {} {}\r\n", head.method, path, head.version);
    for (name, value) in &head.headers {
        let lower = name.to_ascii_lowercase();
        let keep = if upgrade && lower == "upgrade" {
            true
        } else if chunked && lower == "content-length" {
            false
        } else {
            lower != "connection" && !HOP_BY_HOP.contains(&lower.as_str()) && !listed.contains(&lower)
        };
        if keep {
            out.push_str(&format!("{}: {}\r\n", name, value));
        }
    }
    if upgrade {
        out.push_str("Connection: Upgrade\r\n");
    } else {
        if chunked {
            out.push_str("Transfer-Encoding: chunked\r\n");
        }
        out.push_str("Connection: close\r\n");
    }
    if let Some((header, token)) = &settings.token {
        out.push_str(&format!("{}: {}\r\n", header, token));
    }
    out.push_str("\r\n");
    out.into_bytes()
}

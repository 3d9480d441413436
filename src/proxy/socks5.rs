//! SOCKS5 proxy implementation (RFC 1928), CONNECT only

use super::{relay, Address, ProxyError};
use crate::transport::{SharedDialer, TcpConn, TransportError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// SOCKS5 version
const SOCKS_VERSION: u8 = 0x05;

/// Authentication methods
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum AuthMethod {
    NoAuth = 0x00,
    UsernamePassword = 0x02,
    NoAcceptable = 0xFF,
}

/// SOCKS5 commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum Command {
    Connect = 0x01,
    Bind = 0x02,
    UdpAssociate = 0x03,
}

impl TryFrom<u8> for Command {
    type Error = ProxyError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Command::Connect),
            0x02 => Ok(Command::Bind),
            0x03 => Ok(Command::UdpAssociate),
            _ => Err(ProxyError::UnsupportedCommand(value)),
        }
    }
}

/// Address types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum AddressType {
    Ipv4 = 0x01,
    Domain = 0x03,
    Ipv6 = 0x04,
}

impl TryFrom<u8> for AddressType {
    type Error = ProxyError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(AddressType::Ipv4),
            0x03 => Ok(AddressType::Domain),
            0x04 => Ok(AddressType::Ipv6),
            _ => Err(ProxyError::UnsupportedAddressType(value)),
        }
    }
}

/// Reply codes
#[derive(Debug, Clone, Copy)]
#[repr(u8)]
enum Reply {
    Succeeded = 0x00,
    ConnectionNotAllowed = 0x02,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
    TtlExpired = 0x06,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

/// SOCKS5 proxy server
pub struct Socks5Server {
    listener: TcpListener,
    dialer: SharedDialer,
    /// Optional username/password authentication
    auth: Option<(String, String)>,
    cancel: CancellationToken,
}

impl Socks5Server {
    /// Bind a listener that dials every target through `dialer`
    pub async fn bind(addr: &str, dialer: SharedDialer) -> Result<Self, ProxyError> {
        let listener = TcpListener::bind(addr).await?;
        info!("SOCKS5 server listening on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            dialer,
            auth: None,
            cancel: CancellationToken::new(),
        })
    }

    /// Enable username/password authentication
    pub fn with_auth(mut self, username: String, password: String) -> Self {
        self.auth = Some((username, password));
        self
    }

    /// Stop accepting and end every relay when `cancel` fires
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
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
                _ = self.cancel.cancelled() => return Ok(()),
                accepted = self.listener.accept() => accepted?,
            };
            debug!("New SOCKS5 connection from {}", peer_addr);

            let dialer = self.dialer.clone();
            let auth = self.auth.clone();
            let cancel = self.cancel.clone();

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, auth, dialer, cancel).await {
                    debug!("SOCKS5 connection from {} ended: {}", peer_addr, e);
                }
            });
        }
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    auth: Option<(String, String)>,
    dialer: SharedDialer,
    cancel: CancellationToken,
) -> Result<(), ProxyError> {
    // Read greeting
    let mut buf = [0u8; 258];
    stream.read_exact(&mut buf[..2]).await?;

    if buf[0] != SOCKS_VERSION {
        return Err(ProxyError::InvalidSocksVersion(buf[0]));
    }

    let nmethods = buf[1] as usize;
    stream.read_exact(&mut buf[..nmethods]).await?;

    // Select authentication method
    let method = if auth.is_some() {
        if buf[..nmethods].contains(&(AuthMethod::UsernamePassword as u8)) {
            AuthMethod::UsernamePassword
        } else {
            AuthMethod::NoAcceptable
        }
    } else if buf[..nmethods].contains(&(AuthMethod::NoAuth as u8)) {
        AuthMethod::NoAuth
    } else {
        AuthMethod::NoAcceptable
    };

    stream.write_all(&[SOCKS_VERSION, method as u8]).await?;

    if method == AuthMethod::NoAcceptable {
        return Err(ProxyError::AuthenticationFailed);
    }

    if let (AuthMethod::UsernamePassword, Some((expected_user, expected_pass))) = (method, &auth) {
        // RFC 1929 sub-negotiation
        stream.read_exact(&mut buf[..2]).await?;
        let ulen = buf[1] as usize;
        stream.read_exact(&mut buf[..ulen]).await?;
        let username = String::from_utf8_lossy(&buf[..ulen]).to_string();

        stream.read_exact(&mut buf[..1]).await?;
        let plen = buf[0] as usize;
        stream.read_exact(&mut buf[..plen]).await?;
        let password = String::from_utf8_lossy(&buf[..plen]).to_string();

        let success = username == *expected_user && password == *expected_pass;
        stream.write_all(&[0x01, if success { 0x00 } else { 0x01 }]).await?;

        if !success {
            return Err(ProxyError::AuthenticationFailed);
        }
    }

    // Read request
    stream.read_exact(&mut buf[..4]).await?;

    if buf[0] != SOCKS_VERSION {
        return Err(ProxyError::InvalidSocksVersion(buf[0]));
    }

    let command = Command::try_from(buf[1]);
    let addr_type = match AddressType::try_from(buf[3]) {
        Ok(addr_type) => addr_type,
        Err(e) => {
            stream.write_all(&make_reply(Reply::AddressTypeNotSupported, None)).await?;
            return Err(e);
        }
    };

    let address = match addr_type {
        AddressType::Ipv4 => {
            let mut ip = [0u8; 4];
            stream.read_exact(&mut ip).await?;
            Address::Ipv4(ip, stream.read_u16().await?)
        }
        AddressType::Domain => {
            stream.read_exact(&mut buf[..1]).await?;
            let len = buf[0] as usize;
            stream.read_exact(&mut buf[..len]).await?;
            let domain = String::from_utf8_lossy(&buf[..len]).to_string();
            Address::Domain(domain, stream.read_u16().await?)
        }
        AddressType::Ipv6 => {
            let mut ip = [0u8; 16];
            stream.read_exact(&mut ip).await?;
            Address::Ipv6(ip, stream.read_u16().await?)
        }
    };

    match command {
        Ok(Command::Connect) => {}
        Ok(other) => {
            stream.write_all(&make_reply(Reply::CommandNotSupported, None)).await?;
            return Err(ProxyError::UnsupportedCommand(other as u8));
        }
        Err(e) => {
            stream.write_all(&make_reply(Reply::CommandNotSupported, None)).await?;
            return Err(e);
        }
    }

    debug!("SOCKS5 CONNECT to {}", address);

    // Dial before replying so the client learns about failures
    let remote = match dialer.dial_stream(&address.to_string()).await {
        Ok(remote) => remote,
        Err(e) => {
            warn!("dial {} failed: {}", address, e);
            stream.write_all(&make_reply(reply_for(&e), None)).await?;
            return Err(e.into());
        }
    };

    let bound = stream.local_addr().ok().map(|a| Address::new(&a.ip().to_string(), a.port()));
    stream.write_all(&make_reply(Reply::Succeeded, bound.as_ref())).await?;

    let client = TcpConn::new(stream)?;
    let outcome = relay(client, remote, cancel).await;
    if !outcome.is_clean() {
        debug!("relay to {} ended with {:?}", address, outcome);
    }
    Ok(())
}

fn reply_for(error: &TransportError) -> Reply {
    match error {
        TransportError::Timeout => Reply::TtlExpired,
        TransportError::ConditionsNotMet(_) => Reply::ConnectionNotAllowed,
        TransportError::Io(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
            Reply::ConnectionRefused
        }
        TransportError::InvalidAddress(_) => Reply::AddressTypeNotSupported,
        _ => Reply::HostUnreachable,
    }
}

fn make_reply(reply: Reply, bound: Option<&Address>) -> Vec<u8> {
    let mut buf = vec![SOCKS_VERSION, reply as u8, 0x00];

    match bound {
        Some(Address::Ipv4(ip, port)) => {
            buf.push(AddressType::Ipv4 as u8);
            buf.extend_from_slice(ip);
            buf.extend_from_slice(&port.to_be_bytes());
        }
        Some(Address::Ipv6(ip, port)) => {
            buf.push(AddressType::Ipv6 as u8);
            buf.extend_from_slice(ip);
            buf.extend_from_slice(&port.to_be_bytes());
        }
        Some(Address::Domain(domain, port)) => {
            buf.push(AddressType::Domain as u8);
            buf.push(domain.len() as u8);
            buf.extend_from_slice(domain.as_bytes());
            buf.extend_from_slice(&port.to_be_bytes());
        }
        None => {
            buf.push(AddressType::Ipv4 as u8);
            buf.extend_from_slice(&[0, 0, 0, 0, 0, 0]);
        }
    }

    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_encoding() {
        assert_eq!(
            make_reply(Reply::HostUnreachable, None),
            [0x05, 0x04, 0x00, 0x01, 0, 0, 0, 0, 0, 0]
        );
        let bound = Address::Ipv4([127, 0, 0, 1], 1080);
        assert_eq!(
            make_reply(Reply::Succeeded, Some(&bound)),
            [0x05, 0x00, 0x00, 0x01, 127, 0, 0, 1, 0x04, 0x38]
        );
    }

    #[test]
    fn test_reply_for_errors() {
        assert!(matches!(reply_for(&TransportError::Timeout), Reply::TtlExpired));
        assert!(matches!(
            reply_for(&TransportError::ConditionsNotMet("x".into())),
            Reply::ConnectionNotAllowed
        ));
        assert!(matches!(reply_for(&TransportError::Closed), Reply::HostUnreachable));
    }
}

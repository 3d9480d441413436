//! Request heads: building, serializing and lenient parsing

use super::AlgenevaError;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Upper bound on a request or response head
pub const MAX_HEAD_SIZE: usize = 16 * 1024;

/// Methods recognized by the lenient parser, longest first so that a
/// mutated token resolves to the most specific match
const KNOWN_METHODS: [&str; 9] = [
    "CONNECT", "OPTIONS", "DELETE", "PATCH", "TRACE", "HEAD", "POST", "PUT", "GET",
];

/// An HTTP/1.x request head
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: String,
    pub path: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
}

impl Request {
    /// `CONNECT target HTTP/1.1` with a matching `Host` header
    pub fn connect(target: &str) -> Self {
        Self {
            method: "CONNECT".into(),
            path: target.into(),
            version: "HTTP/1.1".into(),
            headers: vec![("Host".into(), target.into())],
        }
    }

    /// First header with this name, case-insensitive
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Tunnel target: the CONNECT authority, else the Host header
    pub fn target(&self) -> Option<&str> {
        if self.method == "CONNECT" && !self.path.is_empty() {
            Some(self.path.as_str())
        } else {
            self.header("host")
        }
    }

    /// Serialize the head, terminated by an empty line
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = format!("{} {} {}\r\n", self.method, self.path, self.version);
        for (name, value) in &self.headers {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        out.push_str("\r\n");
        out.into_bytes()
    }
}

/// Read a head up to and including the blank line.
///
/// Reads byte by byte so nothing past the head is consumed.
pub async fn read_head<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>, AlgenevaError> {
    let mut head = Vec::with_capacity(256);
    let mut byte = [0u8; 1];

    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_HEAD_SIZE {
            return Err(AlgenevaError::HeadTooLarge(MAX_HEAD_SIZE));
        }
        if reader.read(&mut byte).await? == 0 {
            return Err(AlgenevaError::Malformed(format!(
                "connection closed after {} bytes of head",
                head.len()
            )));
        }
        head.push(byte[0]);
    }

    Ok(head)
}

/// Status code of a response head
pub(crate) fn parse_status(head: &[u8]) -> Result<u16, AlgenevaError> {
    let text = String::from_utf8_lossy(head);
    let line = text.lines().next().unwrap_or_default();
    let mut parts = line.split_whitespace();

    match (parts.next(), parts.next()) {
        (Some(version), Some(code)) if version.starts_with("HTTP/") => code
            .parse()
            .map_err(|_| AlgenevaError::Malformed(format!("bad status line {:?}", line))),
        _ => Err(AlgenevaError::Malformed(format!("bad status line {:?}", line))),
    }
}

/// Lenient parser that recovers a canonical request from a mutated head
#[derive(Debug, Clone, Default)]
pub struct Normalizer;

impl Normalizer {
    pub fn new() -> Self {
        Self
    }

    /// Parse `head` back into a canonical request.
    ///
    /// The method is the known method found in the first token, the version
    /// is taken from the last token, header names lose whitespace and are
    /// lowercased, and repeated headers keep their first value.
    pub fn normalize(&self, head: &[u8]) -> Result<Request, AlgenevaError> {
        let text = std::str::from_utf8(head)
            .map_err(|_| AlgenevaError::Malformed("head is not UTF-8".into()))?;

        let mut lines = text.split("\r\n");
        let request_line = lines.next().unwrap_or_default();
        let tokens: Vec<&str> = request_line.split_whitespace().collect();
        if tokens.len() < 3 {
            return Err(AlgenevaError::Malformed(format!(
                "bad request line {:?}",
                request_line
            )));
        }

        let method = canonical_method(tokens[0])
            .ok_or_else(|| AlgenevaError::Malformed(format!("unknown method {:?}", tokens[0])))?;
        let version = canonical_version(tokens[tokens.len() - 1]);
        let path = tokens[1..tokens.len() - 1].concat();

        let mut headers: Vec<(String, String)> = Vec::new();
        for line in lines {
            let Some((name, value)) = line.split_once(':') else {
                continue;
            };
            let name: String = name
                .chars()
                .filter(|c| !c.is_whitespace())
                .collect::<String>()
                .to_ascii_lowercase();
            if name.is_empty() || headers.iter().any(|(n, _)| *n == name) {
                continue;
            }
            headers.push((name, value.trim().to_string()));
        }

        Ok(Request {
            method: method.to_string(),
            path,
            version: version.to_string(),
            headers,
        })
    }
}

fn canonical_method(token: &str) -> Option<&'static str> {
    let upper = token.to_ascii_uppercase();
    KNOWN_METHODS.into_iter().find(|m| upper.contains(m))
}

fn canonical_version(token: &str) -> &'static str {
    if token.to_ascii_uppercase().contains("HTTP/1.0") {
        "HTTP/1.0"
    } else {
        "HTTP/1.1"
    }
}

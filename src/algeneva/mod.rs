//! HTTP request mutation ("algeneva")
//!
//! Rewrites the CONNECT request that opens a tunnel according to a small
//! strategy language, so that on-path filters parsing the request see
//! something different from what a lenient server recovers.
//!
//! A strategy is a whitespace-separated list of rules:
//!
//! ```text
//! [HTTP:method:*]-insert{%0A:end:value:4}-|
//! [HTTP:host:*]-changecase{lower}(duplicate,)-|
//! ```

mod dialer;
mod request;
mod strategy;

pub use dialer::{AlgenevaAcceptor, AlgenevaDialer};
pub use request::{read_head, Normalizer, Request, MAX_HEAD_SIZE};
pub use strategy::{Action, Component, Field, Location, Rule, Strategy, Tree};

use thiserror::Error;

/// HTTP mutation errors
#[derive(Debug, Error)]
pub enum AlgenevaError {
    #[error("Invalid strategy: {0}")]
    InvalidStrategy(String),

    #[error("Invalid percent-encoding in {0:?}")]
    InvalidEncoding(String),

    #[error("Malformed HTTP head: {0}")]
    Malformed(String),

    #[error("HTTP head exceeds {0} bytes")]
    HeadTooLarge(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Decode `%XX` escapes in a strategy value
pub(crate) fn percent_decode(input: &str) -> Result<String, AlgenevaError> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = bytes
                .get(i + 1..i + 3)
                .filter(|h| h.iter().all(u8::is_ascii_hexdigit))
                .ok_or_else(|| AlgenevaError::InvalidEncoding(input.to_string()))?;
            let byte = hex::decode(hex).map_err(|_| AlgenevaError::InvalidEncoding(input.to_string()))?;
            out.extend_from_slice(&byte);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }

    String::from_utf8(out).map_err(|_| AlgenevaError::InvalidEncoding(input.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percent_decode() {
        assert_eq!(percent_decode("%0A").unwrap(), "\n");
        assert_eq!(percent_decode("a%20b").unwrap(), "a b");
        assert_eq!(percent_decode("plain").unwrap(), "plain");
        assert!(percent_decode("%G0").is_err());
        assert!(percent_decode("%0").is_err());
    }
}

//! Salt generation with an optional fixed-looking prefix
//!
//! The prefix grammar is a byte template: literal characters, `%XX`
//! escapes for arbitrary bytes, `$hex(..)` for a run of hex-encoded bytes
//! and `$rand(N)` for N fresh random bytes per salt. Example, a TLS
//! application-data record header followed by two random bytes:
//! `%17%03%03$rand(2)`.

use super::ShadowsocksError;
use crate::crypto::random_bytes;

#[derive(Debug, Clone, PartialEq, Eq)]
enum PrefixPart {
    Literal(Vec<u8>),
    Random(usize),
}

/// Produces per-connection salts
#[derive(Debug, Clone, Default)]
pub struct SaltGenerator {
    parts: Vec<PrefixPart>,
}

impl SaltGenerator {
    /// Fully random salts
    pub fn random() -> Self {
        Self::default()
    }

    /// Salts starting with the given literal bytes
    pub fn with_prefix(prefix: &[u8]) -> Self {
        Self {
            parts: vec![PrefixPart::Literal(prefix.to_vec())],
        }
    }

    /// Parse a prefix template
    pub fn parse(template: &str) -> Result<Self, ShadowsocksError> {
        let bytes = template.as_bytes();
        let mut parts = Vec::new();
        let mut literal = Vec::new();
        let mut i = 0;

        let invalid = |reason: &str| ShadowsocksError::InvalidPrefix(format!("{}: {}", reason, template));

        while i < bytes.len() {
            match bytes[i] {
                b'%' => {
                    let escape = template
                        .get(i + 1..i + 3)
                        .ok_or_else(|| invalid("truncated escape"))?;
                    if !escape.bytes().all(|b| b.is_ascii_hexdigit()) {
                        return Err(invalid("bad escape"));
                    }
                    let byte = u8::from_str_radix(escape, 16).map_err(|_| invalid("bad escape"))?;
                    literal.push(byte);
                    i += 3;
                }
                b'$' => {
                    let rest = &template[i + 1..];
                    let open = rest.find('(').ok_or_else(|| invalid("expected '('"))?;
                    let close = rest.find(')').ok_or_else(|| invalid("unclosed '('"))?;
                    if close < open {
                        return Err(invalid("unbalanced parentheses"));
                    }
                    let name = &rest[..open];
                    let arg = &rest[open + 1..close];
                    match name {
                        "hex" => {
                            let decoded = hex::decode(arg).map_err(|_| invalid("bad hex"))?;
                            literal.extend_from_slice(&decoded);
                        }
                        "rand" => {
                            let n: usize = arg.parse().map_err(|_| invalid("bad length"))?;
                            if !literal.is_empty() {
                                parts.push(PrefixPart::Literal(std::mem::take(&mut literal)));
                            }
                            parts.push(PrefixPart::Random(n));
                        }
                        _ => return Err(invalid("unknown function")),
                    }
                    i += 1 + close + 1;
                }
                b => {
                    literal.push(b);
                    i += 1;
                }
            }
        }

        if !literal.is_empty() {
            parts.push(PrefixPart::Literal(literal));
        }

        Ok(Self { parts })
    }

    /// Length of the prefix in bytes, saturating at `usize::MAX`
    pub fn prefix_len(&self) -> usize {
        self.parts
            .iter()
            .map(|part| match part {
                PrefixPart::Literal(bytes) => bytes.len(),
                PrefixPart::Random(n) => *n,
            })
            .fold(0usize, usize::saturating_add)
    }

    /// Check that the prefix fits a salt of `salt_len` bytes
    pub fn check(&self, salt_len: usize) -> Result<(), ShadowsocksError> {
        let prefix_len = self.prefix_len();
        if prefix_len > salt_len {
            return Err(ShadowsocksError::PrefixTooLong {
                prefix_len,
                salt_len,
            });
        }
        Ok(())
    }

    /// Generate one salt: the prefix, padded with random bytes to `salt_len`
    pub fn generate(&self, salt_len: usize) -> Result<Vec<u8>, ShadowsocksError> {
        self.check(salt_len)?;

        let mut salt = vec![0u8; salt_len];
        random_bytes(&mut salt)?;

        let mut offset = 0;
        for part in &self.parts {
            match part {
                PrefixPart::Literal(bytes) => {
                    salt[offset..offset + bytes.len()].copy_from_slice(bytes);
                    offset += bytes.len();
                }
                PrefixPart::Random(n) => offset += n,
            }
        }

        Ok(salt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_salt_length() {
        let generator = SaltGenerator::random();
        for len in [16, 32] {
            assert_eq!(generator.generate(len).unwrap().len(), len);
        }
        assert_ne!(generator.generate(32).unwrap(), generator.generate(32).unwrap());
    }

    #[test]
    fn test_prefix_preserved() {
        let generator = SaltGenerator::with_prefix(b"\x16\x03\x01");
        let salt = generator.generate(16).unwrap();
        assert_eq!(salt.len(), 16);
        assert_eq!(&salt[..3], b"\x16\x03\x01");
    }

    #[test]
    fn test_prefix_exact_length() {
        let generator = SaltGenerator::with_prefix(&[0xAB; 16]);
        assert_eq!(generator.generate(16).unwrap(), vec![0xAB; 16]);
    }

    #[test]
    fn test_prefix_too_long() {
        let generator = SaltGenerator::with_prefix(&[0u8; 17]);
        let err = generator.generate(16).unwrap_err();
        assert!(matches!(
            err,
            ShadowsocksError::PrefixTooLong {
                prefix_len: 17,
                salt_len: 16
            }
        ));
    }

    #[test]
    fn test_parse_template() {
        let generator = SaltGenerator::parse("GET%20$hex(2f41)$rand(2)x").unwrap();
        assert_eq!(generator.prefix_len(), 9);

        let salt = generator.generate(32).unwrap();
        assert_eq!(&salt[..6], b"GET /A");
        assert_eq!(salt[8], b'x');
    }

    #[test]
    fn test_parse_errors() {
        assert!(SaltGenerator::parse("%zz").is_err());
        assert!(SaltGenerator::parse("%1").is_err());
        assert!(SaltGenerator::parse("$rand(x)").is_err());
        assert!(SaltGenerator::parse("$hex(abc)").is_err());
        assert!(SaltGenerator::parse("$nope(1)").is_err());
        assert!(SaltGenerator::parse("$rand(3").is_err());
    }

    #[test]
    fn test_huge_random_lengths_rejected() {
        let generator = SaltGenerator::parse("$rand(18446744073709551615)$rand(1)").unwrap();
        assert_eq!(generator.prefix_len(), usize::MAX);
        assert!(matches!(
            generator.check(16),
            Err(ShadowsocksError::PrefixTooLong { salt_len: 16, .. })
        ));
        assert!(generator.generate(32).is_err());
    }
}

//! AEAD ciphers for the Shadowsocks chunk format
//!
//! Each direction of a connection owns one [`Cipher`] keyed with its
//! session subkey. The nonce is a 12-byte little-endian counter, starting
//! at zero and incremented after every seal/open.

use super::{derive_subkey, evp_bytes_to_key, CryptoError, NONCE_LEN, TAG_LEN};
use ring::aead::{self, Aad, LessSafeKey, Nonce, UnboundKey};
use std::fmt;
use std::str::FromStr;

/// Supported AEAD methods
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherKind {
    Aes128Gcm,
    Aes256Gcm,
    ChaCha20Poly1305,
}

impl CipherKind {
    /// Key length in bytes
    pub fn key_len(&self) -> usize {
        match self {
            CipherKind::Aes128Gcm => 16,
            CipherKind::Aes256Gcm | CipherKind::ChaCha20Poly1305 => 32,
        }
    }

    /// Salt length in bytes (equal to the key length)
    pub fn salt_len(&self) -> usize {
        self.key_len()
    }

    /// Tag length in bytes
    pub fn tag_len(&self) -> usize {
        TAG_LEN
    }

    /// Derive the master key for a password
    pub fn master_key(&self, password: &str) -> Vec<u8> {
        evp_bytes_to_key(password.as_bytes(), self.key_len())
    }

    fn algorithm(&self) -> &'static aead::Algorithm {
        match self {
            CipherKind::Aes128Gcm => &aead::AES_128_GCM,
            CipherKind::Aes256Gcm => &aead::AES_256_GCM,
            CipherKind::ChaCha20Poly1305 => &aead::CHACHA20_POLY1305,
        }
    }
}

impl FromStr for CipherKind {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "aes-128-gcm" => Ok(CipherKind::Aes128Gcm),
            "aes-256-gcm" => Ok(CipherKind::Aes256Gcm),
            "chacha20-ietf-poly1305" | "chacha20-poly1305" => Ok(CipherKind::ChaCha20Poly1305),
            other => Err(CryptoError::UnsupportedCipher(other.to_string())),
        }
    }
}

impl fmt::Display for CipherKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CipherKind::Aes128Gcm => "aes-128-gcm",
            CipherKind::Aes256Gcm => "aes-256-gcm",
            CipherKind::ChaCha20Poly1305 => "chacha20-ietf-poly1305",
        };
        f.write_str(name)
    }
}

/// One direction of an AEAD session
pub struct Cipher {
    key: LessSafeKey,
    nonce: [u8; NONCE_LEN],
}

impl Cipher {
    /// Create a cipher from a raw subkey
    pub fn new(kind: CipherKind, key: &[u8]) -> Result<Self, CryptoError> {
        let unbound_key =
            UnboundKey::new(kind.algorithm(), key).map_err(|_| CryptoError::InvalidKeyLength)?;

        Ok(Self {
            key: LessSafeKey::new(unbound_key),
            nonce: [0u8; NONCE_LEN],
        })
    }

    /// Create the session cipher for a salt
    pub fn for_session(kind: CipherKind, master: &[u8], salt: &[u8]) -> Result<Self, CryptoError> {
        let subkey = derive_subkey(master, salt)?;
        Self::new(kind, &subkey)
    }

    /// Encrypt `buffer` in place, appending the tag
    pub fn seal(&mut self, buffer: &mut Vec<u8>) -> Result<(), CryptoError> {
        let nonce = Nonce::assume_unique_for_key(self.nonce);
        self.key
            .seal_in_place_append_tag(nonce, Aad::empty(), buffer)
            .map_err(|_| CryptoError::Encryption)?;
        self.increment_nonce();
        Ok(())
    }

    /// Decrypt `buffer` (ciphertext + tag) in place, returning the plaintext
    pub fn open<'a>(&mut self, buffer: &'a mut [u8]) -> Result<&'a mut [u8], CryptoError> {
        let nonce = Nonce::assume_unique_for_key(self.nonce);
        let plaintext = self
            .key
            .open_in_place(nonce, Aad::empty(), buffer)
            .map_err(|_| CryptoError::AuthenticationFailed)?;
        self.increment_nonce();
        Ok(plaintext)
    }

    fn increment_nonce(&mut self) {
        for byte in self.nonce.iter_mut() {
            let (next, overflow) = byte.overflowing_add(1);
            *byte = next;
            if !overflow {
                break;
            }
        }
    }

    /// Current nonce value
    pub fn nonce(&self) -> &[u8; NONCE_LEN] {
        &self.nonce
    }
}

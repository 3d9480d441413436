//! Cryptographic primitives for the Shadowsocks layer
//!
//! This module provides:
//! - AEAD ciphers (AES-128-GCM, AES-256-GCM, ChaCha20-Poly1305) with the
//!   little-endian counter nonce used by Shadowsocks
//! - EVP_BytesToKey master-key derivation
//! - HKDF-SHA1 per-connection subkeys
//! - Secure random number generation

mod aead;
mod kdf;

pub use aead::{Cipher, CipherKind};
pub use kdf::{derive_subkey, evp_bytes_to_key};

use thiserror::Error;

/// Length of nonce in bytes
pub const NONCE_LEN: usize = 12;

/// Length of authentication tag in bytes
pub const TAG_LEN: usize = 16;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Unsupported cipher: {0}")]
    UnsupportedCipher(String),

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Encryption failed")]
    Encryption,

    #[error("Authentication failed")]
    AuthenticationFailed,

    #[error("Invalid key length")]
    InvalidKeyLength,

    #[error("Random generator failure")]
    Random,
}

/// Fill `buf` with cryptographically secure random bytes
pub fn random_bytes(buf: &mut [u8]) -> Result<(), CryptoError> {
    use ring::rand::{SecureRandom, SystemRandom};
    SystemRandom::new()
        .fill(buf)
        .map_err(|_| CryptoError::Random)
}

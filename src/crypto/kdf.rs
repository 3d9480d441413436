//! Key Derivation Functions
//!
//! Master key: OpenSSL EVP_BytesToKey with MD5 and no salt.
//! Session subkey: HKDF-SHA1(master, salt, "ss-subkey").

use super::CryptoError;
use md5::{Digest, Md5};
use ring::hkdf::{self, Salt, HKDF_SHA1_FOR_LEGACY_USE_ONLY};

const SUBKEY_INFO: &[u8] = b"ss-subkey";

/// Derive a `key_len`-byte master key from a password
pub fn evp_bytes_to_key(password: &[u8], key_len: usize) -> Vec<u8> {
    let mut key = Vec::with_capacity(key_len + 16);
    let mut prev: Vec<u8> = Vec::new();

    while key.len() < key_len {
        let mut hasher = Md5::new();
        hasher.update(&prev);
        hasher.update(password);
        prev = hasher.finalize().to_vec();
        key.extend_from_slice(&prev);
    }

    key.truncate(key_len);
    key
}

/// Derive the per-connection subkey for one direction
pub fn derive_subkey(master: &[u8], salt: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let prk = Salt::new(HKDF_SHA1_FOR_LEGACY_USE_ONLY, salt).extract(master);
    let info = [SUBKEY_INFO];
    let okm = prk
        .expand(&info, HkdfLen(master.len()))
        .map_err(|_| CryptoError::KeyDerivation("HKDF expand failed".to_string()))?;

    let mut subkey = vec![0u8; master.len()];
    okm.fill(&mut subkey)
        .map_err(|_| CryptoError::KeyDerivation("HKDF fill failed".to_string()))?;
    Ok(subkey)
}

/// Helper struct for HKDF output length
struct HkdfLen(usize);

impl hkdf::KeyType for HkdfLen {
    fn len(&self) -> usize {
        self.0
    }
}

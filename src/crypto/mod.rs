//! Cryptographic primitives for the tunnel wire codec
//!
//! This module provides:
//! - Stream ciphers addressed by method name (`none`, `aes-*-cfb`)
//! - MD5-based `EVP_BytesToKey` key derivation from the shared secret
//! - The [`Encryptor`]: per-direction IV framing on top of a stream cipher
//! - Secure random number generation

mod cipher;
mod encryptor;

pub use cipher::CipherKind;
pub use encryptor::Encryptor;

use thiserror::Error;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Unsupported cipher method: {0}")]
    UnsupportedMethod(String),

    #[error("Invalid key or IV length")]
    InvalidKeyLength,

    #[error("Packet too short: {0} bytes")]
    PacketTooShort(usize),
}

/// Generate cryptographically secure random bytes
pub fn random_bytes(buf: &mut [u8]) {
    use ring::rand::{SecureRandom, SystemRandom};
    let rng = SystemRandom::new();
    if rng.fill(buf).is_err() {
        // The system RNG only fails when the OS source is unavailable.
        use rand::RngCore;
        rand::thread_rng().fill_bytes(buf);
    }
}

/// Derive a key of `key_len` bytes from a password (OpenSSL `EVP_BytesToKey`, MD5, no salt)
pub fn evp_bytes_to_key(password: &[u8], key_len: usize) -> Vec<u8> {
    let mut key = Vec::with_capacity(key_len + 16);
    let mut prev: Vec<u8> = Vec::new();

    while key.len() < key_len {
        let mut data = Vec::with_capacity(prev.len() + password.len());
        data.extend_from_slice(&prev);
        data.extend_from_slice(password);
        let digest = md5::compute(&data);
        key.extend_from_slice(&digest.0);
        prev = digest.0.to_vec();
    }

    key.truncate(key_len);
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_bytes() {
        let mut buf1 = [0u8; 32];
        let mut buf2 = [0u8; 32];
        random_bytes(&mut buf1);
        random_bytes(&mut buf2);
        assert_ne!(buf1, buf2);
    }

    #[test]
    fn test_evp_bytes_to_key() {
        // First block is md5(password)
        let key = evp_bytes_to_key(b"password", 16);
        assert_eq!(key, md5::compute(b"password").0.to_vec());

        // Second block chains the previous digest
        let key = evp_bytes_to_key(b"password", 32);
        let first = md5::compute(b"password").0;
        let mut chained = first.to_vec();
        chained.extend_from_slice(b"password");
        let second = md5::compute(&chained).0;
        assert_eq!(&key[..16], &first[..]);
        assert_eq!(&key[16..], &second[..]);

        assert_eq!(evp_bytes_to_key(b"secret", 24).len(), 24);
        assert!(evp_bytes_to_key(b"secret", 0).is_empty());
    }
}

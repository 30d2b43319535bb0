//! Stream cipher registry
//!
//! Ciphers are resolved by method name and used as opaque keystream
//! transforms. AES variants run in CFB-128 mode with buffered state so that
//! arbitrarily sized chunks can be processed across calls.

use super::CryptoError;
use aes::{Aes128, Aes192, Aes256};
use cfb_mode::cipher::KeyIvInit;
use cfb_mode::{BufDecryptor, BufEncryptor};
use std::fmt;
use std::str::FromStr;

/// Cipher method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CipherKind {
    /// Identity transform, no IV
    None,
    Aes128Cfb,
    Aes192Cfb,
    Aes256Cfb,
}

impl CipherKind {
    /// Every supported method name
    pub const ALL: [CipherKind; 4] = [
        CipherKind::None,
        CipherKind::Aes128Cfb,
        CipherKind::Aes192Cfb,
        CipherKind::Aes256Cfb,
    ];

    /// Method name as written in configuration
    pub fn name(&self) -> &'static str {
        match self {
            CipherKind::None => "none",
            CipherKind::Aes128Cfb => "aes-128-cfb",
            CipherKind::Aes192Cfb => "aes-192-cfb",
            CipherKind::Aes256Cfb => "aes-256-cfb",
        }
    }

    /// Key length in bytes
    pub fn key_len(&self) -> usize {
        match self {
            CipherKind::None => 16,
            CipherKind::Aes128Cfb => 16,
            CipherKind::Aes192Cfb => 24,
            CipherKind::Aes256Cfb => 32,
        }
    }

    /// IV length in bytes
    pub fn iv_len(&self) -> usize {
        match self {
            CipherKind::None => 0,
            CipherKind::Aes128Cfb | CipherKind::Aes192Cfb | CipherKind::Aes256Cfb => 16,
        }
    }

    pub(crate) fn encrypter(&self, key: &[u8], iv: &[u8]) -> Result<StreamEncrypter, CryptoError> {
        let map = |_| CryptoError::InvalidKeyLength;
        Ok(match self {
            CipherKind::None => StreamEncrypter::Identity,
            CipherKind::Aes128Cfb => {
                StreamEncrypter::Aes128(BufEncryptor::new_from_slices(key, iv).map_err(map)?)
            }
            CipherKind::Aes192Cfb => {
                StreamEncrypter::Aes192(BufEncryptor::new_from_slices(key, iv).map_err(map)?)
            }
            CipherKind::Aes256Cfb => {
                StreamEncrypter::Aes256(BufEncryptor::new_from_slices(key, iv).map_err(map)?)
            }
        })
    }

    pub(crate) fn decrypter(&self, key: &[u8], iv: &[u8]) -> Result<StreamDecrypter, CryptoError> {
        let map = |_| CryptoError::InvalidKeyLength;
        Ok(match self {
            CipherKind::None => StreamDecrypter::Identity,
            CipherKind::Aes128Cfb => {
                StreamDecrypter::Aes128(BufDecryptor::new_from_slices(key, iv).map_err(map)?)
            }
            CipherKind::Aes192Cfb => {
                StreamDecrypter::Aes192(BufDecryptor::new_from_slices(key, iv).map_err(map)?)
            }
            CipherKind::Aes256Cfb => {
                StreamDecrypter::Aes256(BufDecryptor::new_from_slices(key, iv).map_err(map)?)
            }
        })
    }
}

impl FromStr for CipherKind {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        CipherKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.name() == lower || (lower == "plain" && *kind == CipherKind::None))
            .ok_or_else(|| CryptoError::UnsupportedMethod(s.to_string()))
    }
}

impl fmt::Display for CipherKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Keystream state for the sending direction
pub(crate) enum StreamEncrypter {
    Identity,
    Aes128(BufEncryptor<Aes128>),
    Aes192(BufEncryptor<Aes192>),
    Aes256(BufEncryptor<Aes256>),
}

impl StreamEncrypter {
    pub(crate) fn apply(&mut self, data: &mut [u8]) {
        match self {
            StreamEncrypter::Identity => {}
            StreamEncrypter::Aes128(c) => c.encrypt(data),
            StreamEncrypter::Aes192(c) => c.encrypt(data),
            StreamEncrypter::Aes256(c) => c.encrypt(data),
        }
    }
}

/// Keystream state for the receiving direction
pub(crate) enum StreamDecrypter {
    Identity,
    Aes128(BufDecryptor<Aes128>),
    Aes192(BufDecryptor<Aes192>),
    Aes256(BufDecryptor<Aes256>),
}

impl StreamDecrypter {
    pub(crate) fn apply(&mut self, data: &mut [u8]) {
        match self {
            StreamDecrypter::Identity => {}
            StreamDecrypter::Aes128(c) => c.decrypt(data),
            StreamDecrypter::Aes192(c) => c.decrypt(data),
            StreamDecrypter::Aes256(c) => c.decrypt(data),
        }
    }
}

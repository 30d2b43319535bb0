//! IV-framed stream encryption
//!
//! Stream format (each direction independently):
//! ```text
//! +-------+-----------------------------+
//! |  IV   |  keystream XOR payload ...  |
//! +-------+-----------------------------+
//! ```
//! The sending side emits a fresh random IV in front of its first chunk.
//! The receiving side buffers bytes until a whole IV has arrived, then
//! decrypts everything that follows. UDP packets carry their own IV.

use super::cipher::{StreamDecrypter, StreamEncrypter};
use super::{evp_bytes_to_key, random_bytes, CipherKind, CryptoError};
use bytes::{Bytes, BytesMut};

/// Per-session encryptor for one tunnel connection
pub struct Encryptor {
    kind: CipherKind,
    key: Vec<u8>,
    enc: Option<StreamEncrypter>,
    dec: Option<StreamDecrypter>,
    send_iv: Vec<u8>,
    /// Partial IV collected across `decrypt` calls
    recv_iv: BytesMut,
}

impl Encryptor {
    /// Create an encryptor from a method and shared secret
    pub fn new(kind: CipherKind, password: &str) -> Self {
        let key = evp_bytes_to_key(password.as_bytes(), kind.key_len());
        Self {
            kind,
            key,
            enc: None,
            dec: None,
            send_iv: Vec::new(),
            recv_iv: BytesMut::new(),
        }
    }

    /// Cipher method
    pub fn kind(&self) -> CipherKind {
        self.kind
    }

    /// Derived key
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// IV length of the method
    pub fn iv_len(&self) -> usize {
        self.kind.iv_len()
    }

    /// IV used for the sending direction (empty before the first `encrypt`)
    pub fn send_iv(&self) -> &[u8] {
        &self.send_iv
    }

    /// Encrypt a chunk; the first call prepends a fresh IV
    pub fn encrypt(&mut self, plain: &[u8]) -> Result<Bytes, CryptoError> {
        let mut out = BytesMut::with_capacity(plain.len() + self.iv_len());

        if self.enc.is_none() {
            let mut iv = vec![0u8; self.iv_len()];
            random_bytes(&mut iv);
            self.enc = Some(self.kind.encrypter(&self.key, &iv)?);
            out.extend_from_slice(&iv);
            self.send_iv = iv;
        }

        let start = out.len();
        out.extend_from_slice(plain);
        if let Some(enc) = self.enc.as_mut() {
            enc.apply(&mut out[start..]);
        }
        Ok(out.freeze())
    }

    /// Decrypt a chunk; IV bytes are consumed and cached until complete
    pub fn decrypt(&mut self, data: &[u8]) -> Result<Bytes, CryptoError> {
        let mut data = data;

        if self.dec.is_none() {
            let need = self.iv_len() - self.recv_iv.len();
            let take = need.min(data.len());
            self.recv_iv.extend_from_slice(&data[..take]);
            data = &data[take..];

            if self.recv_iv.len() < self.iv_len() {
                return Ok(Bytes::new());
            }
            self.dec = Some(self.kind.decrypter(&self.key, &self.recv_iv)?);
        }

        let mut out = BytesMut::from(data);
        if let Some(dec) = self.dec.as_mut() {
            dec.apply(&mut out);
        }
        Ok(out.freeze())
    }

    /// Encrypt a standalone UDP packet with its own IV
    pub fn encrypt_udp(&self, plain: &[u8]) -> Result<Bytes, CryptoError> {
        let mut iv = vec![0u8; self.iv_len()];
        random_bytes(&mut iv);
        let mut enc = self.kind.encrypter(&self.key, &iv)?;

        let mut out = BytesMut::with_capacity(iv.len() + plain.len());
        out.extend_from_slice(&iv);
        out.extend_from_slice(plain);
        enc.apply(&mut out[iv.len()..]);
        Ok(out.freeze())
    }

    /// Decrypt a standalone UDP packet
    pub fn decrypt_udp(&self, packet: &[u8]) -> Result<Bytes, CryptoError> {
        let iv_len = self.iv_len();
        if packet.len() < iv_len {
            return Err(CryptoError::PacketTooShort(packet.len()));
        }
        let (iv, body) = packet.split_at(iv_len);
        let mut dec = self.kind.decrypter(&self.key, iv)?;
        let mut out = BytesMut::from(body);
        dec.apply(&mut out);
        Ok(out.freeze())
    }
}

//! Wire codec
//!
//! Composes the three per-session transforms in their fixed order:
//!
//! ```text
//! send:    plaintext -> protocol plugin -> stream cipher -> obfs plugin -> socket
//! receive: socket -> obfs plugin -> stream cipher -> protocol plugin -> plaintext
//! ```
//!
//! The UDP codec applies the UDP variants of the same transforms to whole
//! datagrams, each with its own IV.

use crate::crypto::{CryptoError, Encryptor};
use crate::obfuscation::{
    create_obfs, create_protocol, ObfsPlugin, ObfuscationError, PluginContext, ProtocolPlugin,
};
use crate::server::ServerProfile;
use bytes::Bytes;
use thiserror::Error;

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Cipher error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Obfuscation error: {0}")]
    Obfuscation(#[from] ObfuscationError),
}

fn plugin_context(server: &ServerProfile, param: &str, iv_len: usize, head_len: usize) -> PluginContext {
    let mut ctx = PluginContext::new(server.host.clone(), server.port, param);
    ctx.iv_len = iv_len;
    ctx.head_len = head_len;
    ctx
}

/// Stream codec for one TCP tunnel connection
pub struct WireCodec {
    protocol: Box<dyn ProtocolPlugin>,
    encryptor: Encryptor,
    obfs: Box<dyn ObfsPlugin>,
}

impl WireCodec {
    /// Build a codec for `server`; `head_len` is the length of the first header sent
    pub fn new(server: &ServerProfile, head_len: usize) -> Result<Self, CodecError> {
        let encryptor = Encryptor::new(server.method, &server.password);
        let iv_len = encryptor.iv_len();
        let protocol = create_protocol(
            &server.protocol,
            &plugin_context(server, &server.protocol_param, iv_len, head_len),
        )?;
        let obfs = create_obfs(
            &server.obfs,
            &plugin_context(server, &server.obfs_param, iv_len, head_len),
        )?;
        Ok(Self {
            protocol,
            encryptor,
            obfs,
        })
    }

    /// Encode client bytes for the server
    pub fn encode(&mut self, data: &[u8]) -> Result<Bytes, CodecError> {
        let framed = self.protocol.client_pre_encrypt(data)?;
        let cipher = self.encryptor.encrypt(&framed)?;
        Ok(self.obfs.client_encode(&cipher)?)
    }

    /// Decode server bytes; the flag asks for `encode(&[])` to be sent back
    pub fn decode(&mut self, data: &[u8]) -> Result<(Bytes, bool), CodecError> {
        let always = self.obfs.is_always_sendback();
        let (cipher, sendback) = self.obfs.client_decode(data)?;
        if cipher.is_empty() {
            return Ok((Bytes::new(), sendback || always));
        }
        let framed = self.encryptor.decrypt(&cipher)?;
        let plain = self.protocol.client_post_decrypt(&framed)?;
        Ok((plain, sendback || always))
    }

    /// Worst-case bytes added per chunk
    pub fn overhead(&self) -> usize {
        self.protocol.overhead() + self.obfs.overhead()
    }

    /// Whether an empty `encode` is a valid keepalive probe
    pub fn is_keep_alive(&self) -> bool {
        self.protocol.is_keep_alive()
    }

    pub fn protocol_name(&self) -> &'static str {
        self.protocol.name()
    }

    pub fn obfs_name(&self) -> &'static str {
        self.obfs.name()
    }
}

/// Datagram codec for UDP relayed straight to the server
pub struct UdpCodec {
    protocol: Box<dyn ProtocolPlugin>,
    encryptor: Encryptor,
    obfs: Box<dyn ObfsPlugin>,
}

impl UdpCodec {
    pub fn new(server: &ServerProfile) -> Result<Self, CodecError> {
        let encryptor = Encryptor::new(server.method, &server.password);
        let iv_len = encryptor.iv_len();
        let protocol = create_protocol(
            &server.protocol,
            &plugin_context(server, &server.protocol_param, iv_len, 0),
        )?;
        let obfs = create_obfs(
            &server.obfs,
            &plugin_context(server, &server.obfs_param, iv_len, 0),
        )?;
        Ok(Self {
            protocol,
            encryptor,
            obfs,
        })
    }

    /// Encode one datagram (`[addr header][payload]`)
    pub fn encode(&mut self, datagram: &[u8]) -> Result<Bytes, CodecError> {
        let framed = self.protocol.client_udp_pre_encrypt(datagram)?;
        let cipher = self.encryptor.encrypt_udp(&framed)?;
        Ok(self.obfs.client_udp_encode(&cipher)?)
    }

    /// Decode one datagram from the server
    pub fn decode(&mut self, packet: &[u8]) -> Result<Bytes, CodecError> {
        let cipher = self.obfs.client_udp_decode(packet)?;
        let framed = self.encryptor.decrypt_udp(&cipher)?;
        Ok(self.protocol.client_udp_post_decrypt(&framed)?)
    }
}

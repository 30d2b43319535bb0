//! Traffic obfuscation layer
//!
//! Two plugin families wrap the stream cipher:
//!
//! - **Protocol plugins** run before encryption (`client_pre_encrypt`) and
//!   after decryption (`client_post_decrypt`). They frame, pad and check
//!   the plaintext stream.
//! - **Obfuscation plugins** run after encryption (`client_encode`) and
//!   before decryption (`client_decode`). They disguise the cipher stream
//!   as another protocol and may demand an immediate reply ("sendback").
//!
//! Both are resolved by name from a fixed registry and are otherwise opaque
//! to the tunnel.

mod http_simple;
mod padding;
mod plain;
mod random_head;
mod verify;

pub use http_simple::HttpSimple;
pub(crate) use http_simple::find_subsequence;
pub use padding::Padding;
pub use plain::{Origin, Plain};
pub use random_head::RandomHead;
pub use verify::VerifySimple;

use bytes::Bytes;
use thiserror::Error;

/// Plugin errors
#[derive(Debug, Error)]
pub enum ObfuscationError {
    #[error("Unknown protocol plugin: {0}")]
    UnknownProtocol(String),

    #[error("Unknown obfuscation plugin: {0}")]
    UnknownObfs(String),

    #[error("Checksum mismatch")]
    ChecksumMismatch,

    #[error("Invalid chunk length: {0}")]
    InvalidLength(usize),

    #[error("Malformed response: {0}")]
    Malformed(String),
}

/// What a plugin knows about the server it talks to
#[derive(Debug, Clone)]
pub struct PluginContext {
    /// Server host as configured
    pub host: String,
    /// Server TCP port
    pub port: u16,
    /// Plugin parameter string
    pub param: String,
    /// IV length of the cipher in use
    pub iv_len: usize,
    /// Length of the address header that starts the stream
    pub head_len: usize,
}

impl PluginContext {
    pub fn new(host: impl Into<String>, port: u16, param: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            param: param.into(),
            iv_len: 0,
            head_len: 30,
        }
    }
}

/// Plaintext framing applied before encryption
pub trait ProtocolPlugin: Send {
    /// Registry name
    fn name(&self) -> &'static str;

    /// Frame outgoing plaintext
    fn client_pre_encrypt(&mut self, plain: &[u8]) -> Result<Bytes, ObfuscationError>;

    /// Unframe incoming plaintext; may return empty while a frame is incomplete
    fn client_post_decrypt(&mut self, data: &[u8]) -> Result<Bytes, ObfuscationError>;

    /// Frame an outgoing UDP datagram
    fn client_udp_pre_encrypt(&mut self, plain: &[u8]) -> Result<Bytes, ObfuscationError> {
        Ok(Bytes::copy_from_slice(plain))
    }

    /// Unframe an incoming UDP datagram
    fn client_udp_post_decrypt(&mut self, data: &[u8]) -> Result<Bytes, ObfuscationError> {
        Ok(Bytes::copy_from_slice(data))
    }

    /// Worst-case bytes added per chunk
    fn overhead(&self) -> usize;

    /// Whether an empty chunk is a valid keepalive probe
    fn is_keep_alive(&self) -> bool {
        false
    }
}

/// Camouflage applied after encryption
pub trait ObfsPlugin: Send {
    /// Registry name
    fn name(&self) -> &'static str;

    /// Disguise outgoing cipher bytes
    fn client_encode(&mut self, data: &[u8]) -> Result<Bytes, ObfuscationError>;

    /// Strip camouflage from incoming bytes.
    ///
    /// The flag asks the caller to send `client_encode(&[])` right away.
    fn client_decode(&mut self, data: &[u8]) -> Result<(Bytes, bool), ObfuscationError>;

    /// Disguise an outgoing UDP packet
    fn client_udp_encode(&mut self, data: &[u8]) -> Result<Bytes, ObfuscationError> {
        Ok(Bytes::copy_from_slice(data))
    }

    /// Strip camouflage from an incoming UDP packet
    fn client_udp_decode(&mut self, data: &[u8]) -> Result<Bytes, ObfuscationError> {
        Ok(Bytes::copy_from_slice(data))
    }

    /// Worst-case bytes added per chunk
    fn overhead(&self) -> usize;

    /// Whether every received chunk must be answered immediately
    fn is_always_sendback(&self) -> bool {
        false
    }
}

/// Protocol plugin names known to the registry
pub const PROTOCOL_NAMES: [&str; 2] = ["origin", "verify_simple"];

/// Obfuscation plugin names known to the registry
pub const OBFS_NAMES: [&str; 3] = ["plain", "http_simple", "random_head"];

fn normalize(name: &str) -> String {
    let lower = name.trim().to_ascii_lowercase();
    if lower.is_empty() {
        return lower;
    }
    lower.trim_end_matches("_compatible").to_string()
}

/// Resolve a protocol plugin by name
pub fn create_protocol(
    name: &str,
    ctx: &PluginContext,
) -> Result<Box<dyn ProtocolPlugin>, ObfuscationError> {
    match normalize(name).as_str() {
        "" | "origin" => Ok(Box::new(Origin)),
        "verify_simple" => Ok(Box::new(VerifySimple::new(ctx))),
        _ => Err(ObfuscationError::UnknownProtocol(name.to_string())),
    }
}

/// Resolve an obfuscation plugin by name
pub fn create_obfs(name: &str, ctx: &PluginContext) -> Result<Box<dyn ObfsPlugin>, ObfuscationError> {
    match normalize(name).as_str() {
        "" | "plain" => Ok(Box::new(Plain)),
        "http_simple" => Ok(Box::new(HttpSimple::new(ctx.clone()))),
        "random_head" => Ok(Box::new(RandomHead::new())),
        _ => Err(ObfuscationError::UnknownObfs(name.to_string())),
    }
}

/// Check that a plugin name resolves, without building it
pub fn validate_names(protocol: &str, obfs: &str) -> Result<(), ObfuscationError> {
    let ctx = PluginContext::new("localhost", 0, "");
    create_protocol(protocol, &ctx)?;
    create_obfs(obfs, &ctx)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_resolves_known_names() {
        let ctx = PluginContext::new("example.com", 443, "");
        for name in PROTOCOL_NAMES {
            assert_eq!(create_protocol(name, &ctx).unwrap().name(), name);
        }
        for name in OBFS_NAMES {
            assert_eq!(create_obfs(name, &ctx).unwrap().name(), name);
        }
        assert_eq!(create_obfs("", &ctx).unwrap().name(), "plain");
        assert_eq!(
            create_obfs("http_simple_compatible", &ctx).unwrap().name(),
            "http_simple"
        );
    }

    #[test]
    fn test_registry_rejects_unknown() {
        let ctx = PluginContext::new("example.com", 443, "");
        assert!(matches!(
            create_protocol("auth_chain_z", &ctx),
            Err(ObfuscationError::UnknownProtocol(_))
        ));
        assert!(matches!(
            create_obfs("tls9", &ctx),
            Err(ObfuscationError::UnknownObfs(_))
        ));
        assert!(validate_names("origin", "tls9").is_err());
        assert!(validate_names("verify_simple", "http_simple").is_ok());
    }
}

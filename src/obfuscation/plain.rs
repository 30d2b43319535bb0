//! Identity plugins

use super::{ObfsPlugin, ObfuscationError, ProtocolPlugin};
use bytes::Bytes;

/// `origin` protocol: plaintext passes unchanged
#[derive(Debug, Default)]
pub struct Origin;

impl ProtocolPlugin for Origin {
    fn name(&self) -> &'static str {
        "origin"
    }

    fn client_pre_encrypt(&mut self, plain: &[u8]) -> Result<Bytes, ObfuscationError> {
        Ok(Bytes::copy_from_slice(plain))
    }

    fn client_post_decrypt(&mut self, data: &[u8]) -> Result<Bytes, ObfuscationError> {
        Ok(Bytes::copy_from_slice(data))
    }

    fn overhead(&self) -> usize {
        0
    }
}

/// `plain` obfuscation: cipher bytes go out undisguised
#[derive(Debug, Default)]
pub struct Plain;

impl ObfsPlugin for Plain {
    fn name(&self) -> &'static str {
        "plain"
    }

    fn client_encode(&mut self, data: &[u8]) -> Result<Bytes, ObfuscationError> {
        Ok(Bytes::copy_from_slice(data))
    }

    fn client_decode(&mut self, data: &[u8]) -> Result<(Bytes, bool), ObfuscationError> {
        Ok((Bytes::copy_from_slice(data), false))
    }

    fn overhead(&self) -> usize {
        0
    }
}

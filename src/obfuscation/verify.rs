//! `verify_simple` protocol: random-padded, CRC-checked chunks
//!
//! Chunk format:
//! ```text
//! +-----------+---------+------------------+---------+-------------+
//! | Len (2B)  | Rnd (1B)| Rnd-1 pad bytes  |  Data   | ~CRC32 (4B) |
//! +-----------+---------+------------------+---------+-------------+
//! ```
//! `Len` covers the whole chunk, big endian. The trailing word is the
//! complemented CRC-32 of everything before it, little endian, so the CRC of
//! a valid chunk is always `0xFFFFFFFF`.

use super::{ObfuscationError, Padding, PluginContext, ProtocolPlugin};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Largest data payload per chunk
const UNIT_LEN: usize = 8100;

/// Largest accepted chunk
const MAX_CHUNK_LEN: usize = 8192;

/// Smallest valid chunk: length + rnd byte + crc
const MIN_CHUNK_LEN: usize = 7;

const CRC_RESIDUE: u32 = 0xFFFF_FFFF;

/// `verify_simple` protocol plugin
pub struct VerifySimple {
    padding: Padding,
    recv_buf: BytesMut,
}

impl VerifySimple {
    pub fn new(_ctx: &PluginContext) -> Self {
        Self {
            padding: Padding::new(1, 16),
            recv_buf: BytesMut::new(),
        }
    }

    fn pack_chunk(&self, data: &[u8], out: &mut BytesMut) {
        let rnd_len = self.padding.pick_len();
        let total = 2 + rnd_len + data.len() + 4;
        let start = out.len();

        out.put_u16(total as u16);
        out.put_u8(rnd_len as u8);
        out.put_slice(&self.padding.generate(rnd_len - 1));
        out.put_slice(data);

        let crc = crc32fast::hash(&out[start..]);
        out.put_u32_le(!crc);
    }
}

impl ProtocolPlugin for VerifySimple {
    fn name(&self) -> &'static str {
        "verify_simple"
    }

    fn client_pre_encrypt(&mut self, plain: &[u8]) -> Result<Bytes, ObfuscationError> {
        let mut out = BytesMut::with_capacity(plain.len() + self.overhead());
        if plain.is_empty() {
            self.pack_chunk(&[], &mut out);
        }
        for chunk in plain.chunks(UNIT_LEN) {
            self.pack_chunk(chunk, &mut out);
        }
        Ok(out.freeze())
    }

    fn client_post_decrypt(&mut self, data: &[u8]) -> Result<Bytes, ObfuscationError> {
        self.recv_buf.extend_from_slice(data);
        let mut out = BytesMut::new();

        while self.recv_buf.len() >= 2 {
            let length = u16::from_be_bytes([self.recv_buf[0], self.recv_buf[1]]) as usize;
            if !(MIN_CHUNK_LEN..MAX_CHUNK_LEN).contains(&length) {
                self.recv_buf.clear();
                return Err(ObfuscationError::InvalidLength(length));
            }
            if self.recv_buf.len() < length {
                break;
            }

            if crc32fast::hash(&self.recv_buf[..length]) != CRC_RESIDUE {
                self.recv_buf.clear();
                return Err(ObfuscationError::ChecksumMismatch);
            }

            let pos = self.recv_buf[2] as usize;
            if 2 + pos > length - 4 {
                self.recv_buf.clear();
                return Err(ObfuscationError::InvalidLength(pos));
            }
            out.put_slice(&self.recv_buf[2 + pos..length - 4]);
            self.recv_buf.advance(length);
        }

        Ok(out.freeze())
    }

    fn overhead(&self) -> usize {
        2 + 16 + 4
    }

    fn is_keep_alive(&self) -> bool {
        true
    }
}

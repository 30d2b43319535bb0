//! `random_head` obfuscation: a random opener, then raw cipher bytes
//!
//! The first packet is random noise with a complemented CRC-32 tail. Real
//! data is held back until the server answers the opener; the answer is
//! discarded and asks the tunnel to send back the held data immediately.

use super::{ObfsPlugin, ObfuscationError, Padding};
use bytes::{BufMut, Bytes, BytesMut};

/// `random_head` obfuscation plugin
pub struct RandomHead {
    padding: Padding,
    sent_head: bool,
    raw_sent: bool,
    raw_recv: bool,
    send_buf: BytesMut,
}

impl RandomHead {
    pub fn new() -> Self {
        Self {
            padding: Padding::new(4, 99),
            sent_head: false,
            raw_sent: false,
            raw_recv: false,
            send_buf: BytesMut::new(),
        }
    }
}

impl Default for RandomHead {
    fn default() -> Self {
        Self::new()
    }
}

impl ObfsPlugin for RandomHead {
    fn name(&self) -> &'static str {
        "random_head"
    }

    fn client_encode(&mut self, data: &[u8]) -> Result<Bytes, ObfuscationError> {
        if self.raw_sent {
            return Ok(Bytes::copy_from_slice(data));
        }

        self.send_buf.extend_from_slice(data);

        if !self.sent_head {
            self.sent_head = true;
            let noise = self.padding.generate(self.padding.pick_len());
            let mut out = BytesMut::with_capacity(noise.len() + 4);
            out.put_slice(&noise);
            out.put_u32_le(!crc32fast::hash(&noise));
            return Ok(out.freeze());
        }

        if self.raw_recv {
            self.raw_sent = true;
            return Ok(self.send_buf.split().freeze());
        }

        Ok(Bytes::new())
    }

    fn client_decode(&mut self, data: &[u8]) -> Result<(Bytes, bool), ObfuscationError> {
        if self.raw_recv {
            return Ok((Bytes::copy_from_slice(data), false));
        }
        self.raw_recv = true;
        Ok((Bytes::new(), true))
    }

    fn overhead(&self) -> usize {
        0
    }

    fn is_always_sendback(&self) -> bool {
        self.sent_head && !self.raw_sent
    }
}

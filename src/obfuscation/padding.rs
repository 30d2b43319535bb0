//! Random padding for anti-fingerprinting

use crate::crypto::random_bytes;

/// Random padding length generator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Padding {
    /// Minimum padding length
    pub min: usize,
    /// Maximum padding length (inclusive)
    pub max: usize,
}

impl Padding {
    pub const fn new(min: usize, max: usize) -> Self {
        Self { min, max }
    }

    /// Pick a length in `min..=max`
    pub fn pick_len(&self) -> usize {
        if self.max <= self.min {
            return self.min;
        }
        let mut buf = [0u8; 4];
        random_bytes(&mut buf);
        let span = (self.max - self.min + 1) as u32;
        self.min + (u32::from_le_bytes(buf) % span) as usize
    }

    /// Generate random padding bytes
    pub fn generate(&self, len: usize) -> Vec<u8> {
        let mut padding = vec![0u8; len];
        random_bytes(&mut padding);
        padding
    }
}

//! Capability sets exchanged during the link handshake.
//!
//! Each side advertises two lists of 32-bit words: common capabilities,
//! understood by every channel type, and channel-specific ones. Bit `n`
//! lives in word `n / 32`. The sets are fixed for the connection's life.

/// Capabilities shared by every channel type.
pub mod common {
    pub const AUTH_SELECTION: u32 = 0;
    pub const AUTH_SPICE: u32 = 1;
    pub const AUTH_SASL: u32 = 2;
    /// Use the 6-byte header without serial or sub-list.
    pub const MINI_HEADER: u32 = 3;
}

/// Display channel capabilities.
pub mod display {
    /// Peer keeps a shared pixmap cache and understands cache references.
    pub const PIXMAP_CACHE: u32 = 0;
    /// Peer keeps a palette cache.
    pub const PALETTE_CACHE: u32 = 1;
}

/// Cursor channel capabilities.
pub mod cursor {
    /// Peer keeps a cursor shape cache.
    pub const CURSOR_CACHE: u32 = 0;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    common: Vec<u32>,
    channel: Vec<u32>,
}

impl Capabilities {
    pub fn new(common: Vec<u32>, channel: Vec<u32>) -> Self {
        Self { common, channel }
    }

    /// Build a set from bit numbers rather than raw words.
    pub fn from_bits(common: &[u32], channel: &[u32]) -> Self {
        let mut caps = Self::default();
        for &bit in common {
            set_bit(&mut caps.common, bit);
        }
        for &bit in channel {
            set_bit(&mut caps.channel, bit);
        }
        caps
    }

    pub fn has_common(&self, bit: u32) -> bool {
        test_bit(&self.common, bit)
    }

    pub fn has_capability(&self, bit: u32) -> bool {
        test_bit(&self.channel, bit)
    }

    pub fn common_words(&self) -> &[u32] {
        &self.common
    }

    pub fn channel_words(&self) -> &[u32] {
        &self.channel
    }
}

pub fn test_bit(words: &[u32], bit: u32) -> bool {
    let word = (bit / 32) as usize;
    words
        .get(word)
        .map(|w| w & (1 << (bit % 32)) != 0)
        .unwrap_or(false)
}

pub fn set_bit(words: &mut Vec<u32>, bit: u32) {
    let word = (bit / 32) as usize;
    if words.len() <= word {
        words.resize(word + 1, 0);
    }
    words[word] |= 1 << (bit % 32);
}

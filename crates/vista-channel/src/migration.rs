//! Live-migration building blocks shared by every channel type.
//!
//! Source side: MIGRATE carries the channel's flags. With NEED_FLUSH the
//! source waits for the peer's flush mark before producing migrate data.
//! Destination side: with NEED_DATA_TRANSFER the client waits for exactly
//! one migrate-data message, whose envelope must match the channel type.

use bytes::{Buf, BufMut, BytesMut};

use vista_core::wire::{
    read_struct, Le32, MigrateDataHeader, MIGRATE_NEED_DATA_TRANSFER, MIGRATE_NEED_FLUSH,
};
use zerocopy::AsBytes;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MigrateFlags {
    pub need_flush: bool,
    pub need_data_transfer: bool,
}

impl MigrateFlags {
    pub const NONE: MigrateFlags = MigrateFlags {
        need_flush: false,
        need_data_transfer: false,
    };

    pub const FULL: MigrateFlags = MigrateFlags {
        need_flush: true,
        need_data_transfer: true,
    };

    pub fn bits(self) -> u32 {
        let mut bits = 0;
        if self.need_flush {
            bits |= MIGRATE_NEED_FLUSH;
        }
        if self.need_data_transfer {
            bits |= MIGRATE_NEED_DATA_TRANSFER;
        }
        bits
    }

    pub fn from_bits(bits: u32) -> Self {
        Self {
            need_flush: bits & MIGRATE_NEED_FLUSH != 0,
            need_data_transfer: bits & MIGRATE_NEED_DATA_TRANSFER != 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationState {
    Normal,
    WaitFlushMark,
    WaitMigrateData,
}

/// Per-client migration progress.
#[derive(Debug, Default)]
pub struct MigrationTracker {
    wait_flush_mark: bool,
    wait_migrate_data: bool,
}

impl MigrationTracker {
    pub fn state(&self) -> MigrationState {
        if self.wait_migrate_data {
            MigrationState::WaitMigrateData
        } else if self.wait_flush_mark {
            MigrationState::WaitFlushMark
        } else {
            MigrationState::Normal
        }
    }

    /// Source: the MIGRATE message went out.
    pub fn migrate_sent(&mut self, flags: MigrateFlags) {
        if flags.need_flush {
            self.wait_flush_mark = true;
        }
    }

    /// Source: a flush mark arrived. Errors if none was expected.
    pub fn flush_mark_received(&mut self) -> Result<(), MigrationError> {
        if !self.wait_flush_mark {
            return Err(MigrationError::Unexpected("flush mark"));
        }
        self.wait_flush_mark = false;
        Ok(())
    }

    /// Destination: expect migrate data. Returns whether waiting began.
    pub fn expect_data(&mut self, flags: MigrateFlags) -> bool {
        if flags.need_data_transfer {
            self.wait_migrate_data = true;
        }
        self.wait_migrate_data
    }

    pub fn is_waiting_for_data(&self) -> bool {
        self.wait_migrate_data
    }

    pub fn data_restored(&mut self) {
        self.wait_migrate_data = false;
    }
}

// ── Envelope ─────────────────────────────────────────────────────────────────

pub fn write_envelope(buf: &mut BytesMut, magic: u32, version: u32) {
    let header = MigrateDataHeader {
        magic: Le32::new(magic),
        version: Le32::new(version),
    };
    buf.put_slice(header.as_bytes());
}

/// Validate the envelope and return the channel payload behind it.
pub fn open_envelope(body: &[u8], magic: u32, version: u32) -> Result<&[u8], MigrationError> {
    let header: MigrateDataHeader = read_struct(body).map_err(|_| MigrationError::Truncated)?;
    let (got_magic, got_version) = (header.magic.get(), header.version.get());
    if got_magic != magic {
        return Err(MigrationError::BadMagic {
            expected: magic,
            got: got_magic,
        });
    }
    if got_version != version {
        return Err(MigrationError::BadVersion {
            expected: version,
            got: got_version,
        });
    }
    Ok(&body[std::mem::size_of::<MigrateDataHeader>()..])
}

// ── Cache snapshots ──────────────────────────────────────────────────────────

/// Cache contents as carried in migrate data: capacity plus (id, size)
/// pairs from most to least recently used.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CacheSnapshot {
    pub capacity: i64,
    pub items: Vec<(u64, i64)>,
}

impl CacheSnapshot {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_i64_le(self.capacity);
        buf.put_u32_le(self.items.len() as u32);
        for (id, size) in &self.items {
            buf.put_u64_le(*id);
            buf.put_i64_le(*size);
        }
    }

    /// Decode from the front of `buf`, advancing it.
    pub fn decode(buf: &mut &[u8]) -> Result<Self, MigrationError> {
        if buf.remaining() < 12 {
            return Err(MigrationError::Truncated);
        }
        let capacity = buf.get_i64_le();
        if capacity < 0 {
            return Err(MigrationError::NegativeSize(capacity));
        }
        let count = buf.get_u32_le() as usize;
        if buf.remaining() < count.saturating_mul(16) {
            return Err(MigrationError::Truncated);
        }
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            let id = buf.get_u64_le();
            let size = buf.get_i64_le();
            if size < 0 {
                return Err(MigrationError::NegativeSize(size));
            }
            items.push((id, size));
        }
        Ok(Self { capacity, items })
    }
}

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MigrationError {
    #[error("migrate data magic mismatch: expected 0x{expected:08x}, got 0x{got:08x}")]
    BadMagic { expected: u32, got: u32 },

    #[error("migrate data version mismatch: expected {expected}, got {got}")]
    BadVersion { expected: u32, got: u32 },

    #[error("migrate data truncated")]
    Truncated,

    #[error("unexpected {0}")]
    Unexpected(&'static str),

    #[error("negative cache size {0} in migrate data")]
    NegativeSize(i64),

    #[error("migrate data serial {0} leaves no room for the next message")]
    SerialOverflow(u64),

    #[error("channel id {0} out of pixmap cache range")]
    ChannelOutOfRange(u8),

    #[error("channel rejected migrate data")]
    Rejected,
}

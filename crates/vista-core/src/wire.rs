//! Vista wire format — on-wire types for every channel connection.
//!
//! These types ARE the protocol. Every field and every size is part of the
//! wire format and must stay bit-compatible with deployed viewers.
//!
//! All multi-byte fields are little endian. Structs are #[repr(C, packed)]
//! built from zerocopy's byte-order integer types, so serialization is a
//! plain byte view with no unsafe code in this module.

use static_assertions::assert_eq_size;
use zerocopy::byteorder::{LittleEndian, U16, U32, U64};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

pub type Le16 = U16<LittleEndian>;
pub type Le32 = U32<LittleEndian>;
pub type Le64 = U64<LittleEndian>;

// ── Message headers ──────────────────────────────────────────────────────────

/// Full data header. Carries the message serial and a sub-list offset.
///
/// Wire size: 18 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct DataHeader {
    /// Monotonic per-connection serial, starting at 1.
    pub serial: Le64,
    pub msg_type: Le16,
    /// Body length in bytes, not including this header.
    pub size: Le32,
    /// Offset of the optional sub-message list inside the body. 0 = none.
    pub sub_list: Le32,
}

assert_eq_size!(DataHeader, [u8; 18]);

/// Mini data header, negotiated through the `MINI_HEADER` common capability.
/// The serial is implicit on this shape.
///
/// Wire size: 6 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct MiniDataHeader {
    pub msg_type: Le16,
    pub size: Le32,
}

assert_eq_size!(MiniDataHeader, [u8; 6]);

pub const FULL_HEADER_SIZE: usize = 18;
pub const MINI_HEADER_SIZE: usize = 6;

/// Serial reported for headers decoded from the mini shape.
pub const MINI_HEADER_SERIAL: u64 = 0;

/// A decoded header, independent of the shape it travelled in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MessageHeader {
    pub msg_type: u16,
    pub size: u32,
    pub serial: u64,
    pub sub_list: u32,
}

/// Header shape, chosen once per connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderKind {
    Full,
    Mini,
}

impl HeaderKind {
    pub fn size(self) -> usize {
        match self {
            HeaderKind::Full => FULL_HEADER_SIZE,
            HeaderKind::Mini => MINI_HEADER_SIZE,
        }
    }

    pub fn has_serial(self) -> bool {
        matches!(self, HeaderKind::Full)
    }

    /// Write `header` into the front of `out`. Returns the number of bytes
    /// written. `out` must hold at least `self.size()` bytes.
    pub fn write(self, header: &MessageHeader, out: &mut [u8]) -> Result<usize, WireError> {
        let need = self.size();
        if out.len() < need {
            return Err(WireError::Truncated { need, got: out.len() });
        }
        match self {
            HeaderKind::Full => {
                let wire = DataHeader {
                    serial: Le64::new(header.serial),
                    msg_type: Le16::new(header.msg_type),
                    size: Le32::new(header.size),
                    sub_list: Le32::new(header.sub_list),
                };
                out[..need].copy_from_slice(wire.as_bytes());
            }
            HeaderKind::Mini => {
                if header.sub_list != 0 {
                    return Err(WireError::SubListOnMiniHeader);
                }
                let wire = MiniDataHeader {
                    msg_type: Le16::new(header.msg_type),
                    size: Le32::new(header.size),
                };
                out[..need].copy_from_slice(wire.as_bytes());
            }
        }
        Ok(need)
    }

    /// Decode a header from the front of `buf`.
    pub fn read(self, buf: &[u8]) -> Result<MessageHeader, WireError> {
        match self {
            HeaderKind::Full => {
                let wire: DataHeader = read_struct(buf)?;
                Ok(MessageHeader {
                    msg_type: wire.msg_type.get(),
                    size: wire.size.get(),
                    serial: wire.serial.get(),
                    sub_list: wire.sub_list.get(),
                })
            }
            HeaderKind::Mini => {
                let wire: MiniDataHeader = read_struct(buf)?;
                Ok(MessageHeader {
                    msg_type: wire.msg_type.get(),
                    size: wire.size.get(),
                    serial: MINI_HEADER_SERIAL,
                    sub_list: 0,
                })
            }
        }
    }
}

// ── Control bodies ───────────────────────────────────────────────────────────

/// Server → peer: start a new ack generation with the given window.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct SetAck {
    pub generation: Le32,
    pub window: Le32,
}

assert_eq_size!(SetAck, [u8; 8]);

/// Peer → server: acknowledges which ack generation it is counting against.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct AckSync {
    pub generation: Le32,
}

assert_eq_size!(AckSync, [u8; 4]);

/// Ping and pong share one layout. Pings may carry trailing padding.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct Ping {
    pub id: Le32,
    /// Sender's monotonic clock in microseconds, echoed back in the pong.
    pub timestamp: Le64,
}

assert_eq_size!(Ping, [u8; 12]);

#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct Migrate {
    pub flags: Le32,
}

assert_eq_size!(Migrate, [u8; 4]);

/// Leading bytes of every migrate-data payload.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct MigrateDataHeader {
    pub magic: Le32,
    pub version: Le32,
}

assert_eq_size!(MigrateDataHeader, [u8; 8]);

/// One entry of a wait-for-channels list. The list body is a u8 count
/// followed by `count` entries.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct WaitForChannel {
    pub channel_type: u8,
    pub channel_id: u8,
    pub message_serial: Le64,
}

assert_eq_size!(WaitForChannel, [u8; 10]);

#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct Disconnecting {
    pub time_stamp: Le64,
    pub reason: Le32,
}

assert_eq_size!(Disconnecting, [u8; 12]);

// ── Link handshake ───────────────────────────────────────────────────────────

/// Precedes both the link request and the link reply.
///
/// Wire size: 16 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct LinkHeader {
    pub magic: Le32,
    pub major_version: Le32,
    pub minor_version: Le32,
    /// Size of the body that follows, capability words included.
    pub size: Le32,
}

assert_eq_size!(LinkHeader, [u8; 16]);

/// Link request. Capability words follow at `caps_offset` from the start
/// of this struct: `num_common_caps` words, then `num_channel_caps` words.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct LinkMess {
    pub connection_id: Le32,
    pub channel_type: u8,
    pub channel_id: u8,
    /// `LINK_FLAG_*` bits.
    pub flags: u8,
    pub reserved: u8,
    pub num_common_caps: Le32,
    pub num_channel_caps: Le32,
    pub caps_offset: Le32,
}

assert_eq_size!(LinkMess, [u8; 20]);

#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct LinkReply {
    /// `LINK_ERR_*` code.
    pub error: Le32,
    pub num_common_caps: Le32,
    pub num_channel_caps: Le32,
    pub caps_offset: Le32,
}

assert_eq_size!(LinkReply, [u8; 16]);

pub const LINK_MAGIC: u32 = u32::from_le_bytes(*b"VSTA");
pub const LINK_VERSION_MAJOR: u32 = 2;
pub const LINK_VERSION_MINOR: u32 = 2;
/// Upper bound on a link request body, capability words included.
pub const LINK_MAX_SIZE: u32 = 4096;

/// The connecting peer is the destination of a live migration.
pub const LINK_FLAG_MIGRATION_TARGET: u8 = 0x01;
/// The migration is seamless: channel state follows in a migrate-data message.
pub const LINK_FLAG_SEAMLESS: u8 = 0x02;

pub const LINK_ERR_OK: u32 = 0;
pub const LINK_ERR_ERROR: u32 = 1;
pub const LINK_ERR_INVALID_MAGIC: u32 = 2;
pub const LINK_ERR_INVALID_DATA: u32 = 3;
pub const LINK_ERR_VERSION_MISMATCH: u32 = 4;
pub const LINK_ERR_CHANNEL_NOT_AVAILABLE: u32 = 6;

// ── Message types ────────────────────────────────────────────────────────────

/// Server → peer message types shared by every channel.
pub mod msg {
    pub const MIGRATE: u16 = 1;
    pub const MIGRATE_DATA: u16 = 2;
    pub const SET_ACK: u16 = 3;
    pub const PING: u16 = 4;
    pub const WAIT_FOR_CHANNELS: u16 = 5;
    pub const DISCONNECTING: u16 = 6;
    pub const NOTIFY: u16 = 7;
    pub const LIST: u16 = 8;
    /// First channel-specific message type.
    pub const FIRST_AVAIL: u16 = 101;
}

/// Peer → server message types shared by every channel.
pub mod msgc {
    pub const ACK_SYNC: u16 = 1;
    pub const ACK: u16 = 2;
    pub const PONG: u16 = 3;
    pub const MIGRATE_FLUSH_MARK: u16 = 4;
    pub const MIGRATE_DATA: u16 = 5;
    pub const DISCONNECTING: u16 = 6;
    pub const FIRST_AVAIL: u16 = 101;
}

/// Migrate message flags.
pub const MIGRATE_NEED_FLUSH: u32 = 1 << 0;
pub const MIGRATE_NEED_DATA_TRANSFER: u32 = 1 << 1;

// ── Channel kinds ────────────────────────────────────────────────────────────

/// Logical channel type carried in the link request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ChannelKind {
    Main = 1,
    Display = 2,
    Inputs = 3,
    Cursor = 4,
    Playback = 5,
    Record = 6,
}

impl TryFrom<u8> for ChannelKind {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(ChannelKind::Main),
            2 => Ok(ChannelKind::Display),
            3 => Ok(ChannelKind::Inputs),
            4 => Ok(ChannelKind::Cursor),
            5 => Ok(ChannelKind::Playback),
            6 => Ok(ChannelKind::Record),
            other => Err(WireError::UnknownChannel(other)),
        }
    }
}

impl From<ChannelKind> for u8 {
    fn from(k: ChannelKind) -> u8 {
        k as u8
    }
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ChannelKind::Main => "main",
            ChannelKind::Display => "display",
            ChannelKind::Inputs => "inputs",
            ChannelKind::Cursor => "cursor",
            ChannelKind::Playback => "playback",
            ChannelKind::Record => "record",
        };
        f.write_str(name)
    }
}

// ── Content ids ──────────────────────────────────────────────────────────────

/// Cache key for a piece of content: the first 8 bytes of its BLAKE3 hash.
pub fn content_id(data: &[u8]) -> u64 {
    let hash = blake3::hash(data);
    let mut id = [0u8; 8];
    id.copy_from_slice(&hash.as_bytes()[..8]);
    u64::from_le_bytes(id)
}

// ── Helpers ──────────────────────────────────────────────────────────────────

/// Copy a wire struct out of the front of `buf`.
pub fn read_struct<T: FromBytes>(buf: &[u8]) -> Result<T, WireError> {
    T::read_from_prefix(buf).ok_or(WireError::Truncated {
        need: std::mem::size_of::<T>(),
        got: buf.len(),
    })
}

// ── Errors ───────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("truncated message: need {need} bytes, got {got}")]
    Truncated { need: usize, got: usize },

    #[error("unknown channel type: {0}")]
    UnknownChannel(u8),

    #[error("sub-list offset is not representable in a mini header")]
    SubListOnMiniHeader,

    #[error("bad link magic: 0x{0:08x}")]
    BadLinkMagic(u32),
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_header_round_trip() {
        let header = MessageHeader {
            msg_type: msg::SET_ACK,
            size: 8,
            serial: 0x0102_0304_0506_0708,
            sub_list: 12,
        };
        let mut buf = [0u8; FULL_HEADER_SIZE];
        assert_eq!(HeaderKind::Full.write(&header, &mut buf).unwrap(), 18);
        assert_eq!(HeaderKind::Full.read(&buf).unwrap(), header);
        // serial leads, little endian
        assert_eq!(buf[0], 0x08);
        assert_eq!(&buf[8..10], &[msg::SET_ACK as u8, 0]);
    }

    #[test]
    fn mini_header_round_trip_reports_fixed_serial() {
        let header = MessageHeader {
            msg_type: 104,
            size: 4096,
            serial: 99,
            sub_list: 0,
        };
        let mut buf = [0u8; MINI_HEADER_SIZE];
        HeaderKind::Mini.write(&header, &mut buf).unwrap();
        let decoded = HeaderKind::Mini.read(&buf).unwrap();
        assert_eq!(decoded.msg_type, 104);
        assert_eq!(decoded.size, 4096);
        assert_eq!(decoded.serial, MINI_HEADER_SERIAL);
    }

    #[test]
    fn mini_header_rejects_sub_list() {
        let header = MessageHeader {
            msg_type: 104,
            size: 16,
            serial: 1,
            sub_list: 8,
        };
        let mut buf = [0u8; MINI_HEADER_SIZE];
        assert_eq!(
            HeaderKind::Mini.write(&header, &mut buf),
            Err(WireError::SubListOnMiniHeader)
        );
    }

    #[test]
    fn short_buffer_is_truncated() {
        let err = HeaderKind::Full.read(&[0u8; 10]).unwrap_err();
        assert_eq!(err, WireError::Truncated { need: 18, got: 10 });
    }

    #[test]
    fn ping_layout() {
        let ping = Ping {
            id: Le32::new(7),
            timestamp: Le64::new(1_000_000),
        };
        let bytes = ping.as_bytes();
        assert_eq!(bytes.len(), 12);
        let back: Ping = read_struct(bytes).unwrap();
        assert_eq!(back.id.get(), 7);
        assert_eq!(back.timestamp.get(), 1_000_000);
    }

    #[test]
    fn channel_kind_round_trip() {
        assert_eq!(ChannelKind::try_from(2).unwrap(), ChannelKind::Display);
        assert_eq!(u8::from(ChannelKind::Cursor), 4);
        assert!(ChannelKind::try_from(0).is_err());
        assert!(ChannelKind::try_from(0xff).is_err());
    }

    #[test]
    fn content_ids_are_deterministic() {
        assert_eq!(content_id(b"cursor"), content_id(b"cursor"));
        assert_ne!(content_id(b"cursor"), content_id(b"pointer"));
    }

    #[test]
    fn link_magic_spells_vsta() {
        assert_eq!(&LINK_MAGIC.to_le_bytes(), b"VSTA");
    }
}

//! Why a channel client went away.

use std::io;

use vista_core::wire::WireError;

use crate::migration::MigrationError;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FramingError {
    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("message of {size} bytes exceeds limit of {max}")]
    TooLarge { size: u32, max: u32 },

    #[error("outgoing body of {0} bytes does not fit a message header")]
    BodyTooLarge(usize),

    #[error("no receive buffer for message type {msg_type} ({size} bytes)")]
    BufferRefused { msg_type: u16, size: u32 },

    #[error("unhandled message type {0}")]
    UnknownMessage(u16),
}

/// Every fault converges on one disconnect, tagged with one of these.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DisconnectReason {
    #[error("peer closed the connection")]
    PeerClosed,

    #[error("i/o error: {0:?}")]
    Io(io::ErrorKind),

    #[error("protocol error: {0}")]
    Protocol(#[from] FramingError),

    #[error("peer unresponsive")]
    Liveness,

    #[error("migration failed: {0}")]
    Migration(#[from] MigrationError),

    #[error("pending output not drained in time")]
    Timeout,

    #[error("closed locally")]
    Local,
}

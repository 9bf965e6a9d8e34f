//! vista-channel — the channel-client protocol engine.
//!
//! One `ChannelClient` per connected peer and channel: framing, the outgoing
//! pipe, the ack window, liveness probing and the migration handshake, with
//! the channel-specific half plugged in through `ChannelHandler`. The cursor
//! and display handlers mirror the peer's content caches.

pub mod ack;
pub mod cache;
pub mod channel;
pub mod client;
pub mod cursor;
pub mod display;
pub mod driver;
pub mod error;
pub mod framing;
pub mod liveness;
pub mod memory;
pub mod migration;
pub mod pipe;
pub mod reactor;
pub mod shared_cache;
pub mod transport;

pub use cache::BoundedCache;
pub use channel::{Channel, SharedClient};
pub use client::{ChannelClient, ChannelHandler, ChannelInfo, ClientCore, ClientId, ClientSettings};
pub use error::{DisconnectReason, FramingError};
pub use pipe::{PipeItem, Position};
pub use shared_cache::{PixmapCacheRegistry, SharedPixmapCache};

//! vista-core — wire format, capability sets and configuration.
//! All other Vista crates depend on this one.

pub mod caps;
pub mod config;
pub mod wire;

pub use caps::Capabilities;
pub use config::VistaConfig;
pub use wire::{ChannelKind, HeaderKind, MessageHeader, WireError};

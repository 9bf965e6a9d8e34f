//! Vista integration test harness.
//!
//! Tests here drive whole channel clients through the library: cursor and
//! display channels over the in-memory transport, and the tokio driver over
//! TCP loopback. Nothing needs root or a running daemon:
//!
//!   cargo test --test integration
//!
//! Timer-driven tests run with a paused tokio clock and step it by hand.

use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;

use vista_channel::cursor::{CursorChannel, CursorHandler};
use vista_channel::display::{self, DisplayChannel, DisplayHandler, DrawCopy, Image, Rect};
use vista_channel::memory::{self, MemoryPeer};
use vista_channel::{ChannelClient, ClientSettings, SharedClient};
use vista_core::caps;
use vista_core::wire::{msg, msgc, HeaderKind, MessageHeader};
use vista_core::Capabilities;

mod ack;
mod cache_sync;
mod framing;
mod liveness;
mod migration;
mod tcp;

// ── Harness ───────────────────────────────────────────────────────────────────

/// Peer session id used by every display client in these tests.
pub const CONNECTION_ID: u32 = 4242;

pub fn common_caps(kind: HeaderKind) -> &'static [u32] {
    match kind {
        HeaderKind::Mini => &[caps::common::MINI_HEADER],
        HeaderKind::Full => &[],
    }
}

pub fn join_cursor(
    channel: &mut CursorChannel,
    kind: HeaderKind,
    settings: ClientSettings,
) -> (SharedClient<CursorHandler>, MemoryPeer) {
    let (transport, peer) = memory::pair(kind);
    let client = ChannelClient::new(
        channel.channel().info().clone(),
        Capabilities::from_bits(common_caps(kind), &[caps::cursor::CURSOR_CACHE]),
        Box::new(transport),
        settings,
        CursorHandler::default(),
    );
    let shared = channel.add_client(client);
    (shared, peer)
}

pub fn join_display(
    channel: &mut DisplayChannel,
    kind: HeaderKind,
    settings: ClientSettings,
) -> (SharedClient<DisplayHandler>, MemoryPeer) {
    let (transport, peer) = memory::pair(kind);
    let client = ChannelClient::new(
        channel.channel().info().clone(),
        Capabilities::from_bits(
            common_caps(kind),
            &[caps::display::PIXMAP_CACHE, caps::display::PALETTE_CACHE],
        ),
        Box::new(transport),
        settings,
        channel.handler(CONNECTION_ID),
    );
    let shared = channel.add_client(client);
    (shared, peer)
}

/// Peer announces pixmap cache 0 of `size` units.
pub fn display_init(client: &SharedClient<DisplayHandler>, peer: &mut MemoryPeer, size: i64) {
    let mut body = vec![0u8];
    body.extend_from_slice(&size.to_le_bytes());
    peer.send(display::msgc::INIT, &body);
    client.borrow_mut().receive();
}

pub fn square(tag: u8, side: u32) -> DrawCopy {
    DrawCopy {
        surface_id: 0,
        bbox: Rect::default(),
        image: Image::bitmap(side, side, Bytes::from(vec![tag; (side * side) as usize])),
    }
}

pub fn types(msgs: &[(MessageHeader, Vec<u8>)]) -> Vec<u16> {
    msgs.iter().map(|(h, _)| h.msg_type).collect()
}

/// Answer every PING in `msgs` with the matching PONG.
pub fn answer_pings(peer: &mut MemoryPeer, msgs: &[(MessageHeader, Vec<u8>)]) -> usize {
    let mut answered = 0;
    for (header, body) in msgs {
        if header.msg_type == msg::PING {
            peer.send(msgc::PONG, &body[..12]);
            answered += 1;
        }
    }
    answered
}

/// Acknowledge the current ack generation: ACK_SYNC followed by ACK.
pub fn ack(peer: &mut MemoryPeer, generation: u32) {
    peer.send(msgc::ACK_SYNC, &generation.to_le_bytes());
    peer.send(msgc::ACK, &[]);
}

/// Move the paused clock forward and run whatever timers came due.
pub async fn advance<H: vista_channel::ChannelHandler>(client: &SharedClient<H>, by: Duration) {
    tokio::time::advance(by).await;
    let mut c = client.borrow_mut();
    c.fire_expired_timers(Instant::now());
    c.push();
}

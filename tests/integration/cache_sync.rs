use crate::*;

use std::sync::Arc;

use vista_channel::cursor::{self, CursorCommand, CursorShape, Point};
use vista_channel::display::{image_flags, image_kind, ImageDescriptor};
use vista_channel::PixmapCacheRegistry;
use vista_core::wire::{read_struct, ChannelKind};

fn image_of(body: &[u8]) -> ImageDescriptor {
    read_struct(&body[20..]).unwrap()
}

fn only<'a>(msgs: &'a [(MessageHeader, Vec<u8>)], msg_type: u16) -> Vec<&'a [u8]> {
    msgs.iter()
        .filter(|(h, _)| h.msg_type == msg_type)
        .map(|(_, b)| b.as_slice())
        .collect()
}

/// Two display channels of one peer, each with a client attached to the
/// same shared pixmap cache.
fn two_displays() -> (
    (DisplayChannel, SharedClient<DisplayHandler>, MemoryPeer),
    (DisplayChannel, SharedClient<DisplayHandler>, MemoryPeer),
) {
    let registry = PixmapCacheRegistry::new();
    let mut first = DisplayChannel::new(0, registry.clone(), 16);
    let mut second = DisplayChannel::new(1, registry, 16);
    let (a, mut peer_a) = join_display(&mut first, HeaderKind::Full, ClientSettings::default());
    let (b, mut peer_b) = join_display(&mut second, HeaderKind::Full, ClientSettings::default());
    display_init(&a, &mut peer_a, 10_000);
    display_init(&b, &mut peer_b, 10_000);
    ((first, a, peer_a), (second, b, peer_b))
}

#[test]
fn sibling_channels_share_one_pixmap_cache() {
    let ((first, a, mut peer_a), (second, b, mut peer_b)) = two_displays();
    let cache = a.borrow().handler().pixmap_cache().cloned().unwrap();
    assert!(Arc::ptr_eq(&cache, b.borrow().handler().pixmap_cache().unwrap()));

    first.draw(square(1, 10));
    a.borrow_mut().push();
    let sent = peer_a.recv();
    let draws = only(&sent, display::msg::DRAW_COPY);
    assert_eq!(image_of(draws[0]).flags & image_flags::CACHE_ME, image_flags::CACHE_ME);
    assert_eq!(cache.available(), 10_000 - 100);

    // The other channel finds the image its sibling cached.
    second.draw(square(1, 10));
    b.borrow_mut().push();
    let sent = peer_b.recv();
    let draws = only(&sent, display::msg::DRAW_COPY);
    assert_eq!(image_of(draws[0]).kind, image_kind::FROM_CACHE_LOSSLESS);
}

/// A reset on one channel starts a new cache generation. The sibling draws
/// uncached once, tells its peer which reset to wait for, then caches again.
#[test]
fn reset_on_one_channel_resyncs_the_other() {
    let ((first, a, mut peer_a), (second, b, mut peer_b)) = two_displays();
    first.draw(square(1, 10));
    a.borrow_mut().push();
    peer_a.recv();
    second.draw(square(1, 10));
    b.borrow_mut().push();
    let b_hit_serial = peer_b.recv().last().map(|(h, _)| h.serial).unwrap();

    first.reset_caches();
    a.borrow_mut().push();
    let sent = peer_a.recv();
    assert_eq!(
        types(&sent),
        vec![display::msg::INVAL_ALL_PALETTES, display::msg::INVAL_ALL_PIXMAPS]
    );
    let reset_serial = sent[1].0.serial;
    // The initiator waits for the sibling's last use of the old generation.
    let wait = &sent[1].1;
    assert_eq!(wait[0], 1);
    assert_eq!(wait[1], u8::from(ChannelKind::Display));
    assert_eq!(wait[2], 1);
    assert_eq!(u64::from_le_bytes(wait[3..11].try_into().unwrap()), b_hit_serial);

    second.draw(square(2, 10));
    b.borrow_mut().push();
    let sent = peer_b.recv();
    assert_eq!(types(&sent), vec![display::msg::DRAW_COPY, msg::WAIT_FOR_CHANNELS]);
    let uncached = image_of(&sent[0].1);
    assert_eq!(uncached.kind, image_kind::BITMAP);
    assert_eq!(uncached.flags & image_flags::CACHE_ME, 0);
    let sync = &sent[1].1;
    assert_eq!(sync.len(), 1 + 10);
    assert_eq!(sync[0], 1);
    assert_eq!(sync[2], 0);
    assert_eq!(u64::from_le_bytes(sync[3..11].try_into().unwrap()), reset_serial);

    second.draw(square(2, 10));
    b.borrow_mut().push();
    let sent = peer_b.recv();
    let draws = only(&sent, display::msg::DRAW_COPY);
    assert_eq!(image_of(draws[0]).flags & image_flags::CACHE_ME, image_flags::CACHE_ME);
    assert_eq!(b.borrow().handler().generation(), a.borrow().handler().generation());
}

#[test]
fn last_display_to_leave_frees_the_shared_cache() {
    let ((mut first, a, peer_a), (mut second, b, peer_b)) = two_displays();
    // Only the clients hold the cache; the registry keeps a weak entry.
    let registry = first.registry().clone();
    assert_eq!(registry.len(), 1);

    peer_a.close();
    a.borrow_mut().receive();
    assert_eq!(first.reap(), 1);
    drop(a);
    assert_eq!(registry.len(), 1);

    peer_b.close();
    b.borrow_mut().receive();
    drop(b);
    assert_eq!(second.reap(), 1);
    assert!(registry.is_empty());
}

fn pointer(tag: u8) -> CursorCommand {
    CursorCommand::Set {
        position: Point { x: 1, y: 1 },
        visible: true,
        shape: Arc::new(CursorShape::new(4, 4, 0, 0, Bytes::from(vec![tag; 64]))),
    }
}

fn cursor_flags(body: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([body[at], body[at + 1]])
}

/// A reconnecting peer starts with an empty cursor cache, so the current
/// shape is sent in full again.
#[test]
fn reconnected_cursor_client_starts_with_a_fresh_cache() {
    let mut channel = CursorChannel::new(0);
    let (first, mut peer) = join_cursor(&mut channel, HeaderKind::Full, ClientSettings::default());
    channel.process_cmd(pointer(9));
    first.borrow_mut().push();
    let sent = peer.recv();
    let set = only(&sent, cursor::msg::SET);
    assert_eq!(cursor_flags(set[0], 5), cursor::flags::CACHE_ME);

    peer.close();
    first.borrow_mut().receive();
    assert_eq!(channel.channel_mut().reap(), 1);

    let (second, mut peer) = join_cursor(&mut channel, HeaderKind::Full, ClientSettings::default());
    second.borrow_mut().push();
    let sent = peer.recv();
    assert_eq!(types(&sent), vec![msg::SET_ACK, cursor::msg::INIT]);
    // position, trail length and frequency, visible
    assert_eq!(cursor_flags(&sent[1].1, 9), cursor::flags::CACHE_ME);

    channel.process_cmd(pointer(9));
    second.borrow_mut().push();
    let sent = peer.recv();
    assert_eq!(cursor_flags(only(&sent, cursor::msg::SET)[0], 5), cursor::flags::FROM_CACHE);
}

use crate::*;

use vista_channel::cursor::{self, CursorCommand, Point};
use vista_channel::display::{image_kind, ImageDescriptor};
use vista_channel::migration::MigrationState;
use vista_channel::PixmapCacheRegistry;
use vista_core::wire::read_struct;

/// Drive a display client through MIGRATE and the flush mark, returning the
/// MIGRATE_DATA message it answers with.
fn migrate_source(client: &SharedClient<DisplayHandler>, peer: &mut MemoryPeer) -> (MessageHeader, Vec<u8>) {
    client.borrow_mut().migrate();
    client.borrow_mut().push();
    let sent = peer.recv();
    assert_eq!(types(&sent), vec![msg::MIGRATE]);
    assert_eq!(client.borrow().core().migration_state(), MigrationState::WaitFlushMark);

    peer.send(msgc::MIGRATE_FLUSH_MARK, &[]);
    client.borrow_mut().receive();
    client.borrow_mut().push();
    let mut sent = peer.recv();
    assert_eq!(types(&sent), vec![msg::MIGRATE_DATA]);
    sent.remove(0)
}

fn target_settings() -> ClientSettings {
    ClientSettings {
        migration_target: true,
        ..ClientSettings::default()
    }
}

/// The destination rebuilds the pixmap cache from the source's migrate data
/// and keeps counting serials where the source left off.
#[test]
fn display_cache_survives_seamless_migration() {
    let mut source = DisplayChannel::new(0, PixmapCacheRegistry::new(), 16);
    let (src, mut src_peer) = join_display(&mut source, HeaderKind::Full, ClientSettings::default());
    display_init(&src, &mut src_peer, 100);
    source.draw(square(1, 6));
    src.borrow_mut().push();
    src_peer.recv();

    let (data_header, data) = migrate_source(&src, &mut src_peer);

    let mut dest = DisplayChannel::new(0, PixmapCacheRegistry::new(), 16);
    let (dst, mut dst_peer) = join_display(&mut dest, HeaderKind::Full, target_settings());
    assert!(dst.borrow().core().is_migration_target());
    assert!(dst.borrow_mut().set_migration_seamless());
    assert!(dst.borrow().is_waiting_for_migrate_data());

    dst_peer.send(msgc::MIGRATE_DATA, &data);
    dst.borrow_mut().receive();
    {
        let d = dst.borrow();
        assert!(d.is_connected());
        assert!(!d.is_waiting_for_migrate_data());
        let cache = d.handler().pixmap_cache().unwrap();
        assert_eq!(cache.size(), 100);
        assert!(cache.contains(square(1, 6).image.id));
        assert_eq!(cache.available(), 100 - 36);
    }

    dest.draw(square(1, 6));
    dst.borrow_mut().push();
    let sent = dst_peer.recv();
    assert_eq!(types(&sent), vec![msg::SET_ACK, display::msg::DRAW_COPY]);
    assert_eq!(sent[0].0.serial, data_header.serial + 1);
    let image: ImageDescriptor = read_struct(&sent[1].1[20..]).unwrap();
    assert_eq!(image.kind, image_kind::FROM_CACHE_LOSSLESS);
}

#[test]
fn corrupted_migrate_data_disconnects_the_destination() {
    let mut source = DisplayChannel::new(0, PixmapCacheRegistry::new(), 16);
    let (src, mut src_peer) = join_display(&mut source, HeaderKind::Full, ClientSettings::default());
    display_init(&src, &mut src_peer, 100);
    src.borrow_mut().push();
    src_peer.recv();
    let (_, mut data) = migrate_source(&src, &mut src_peer);
    data[0] ^= 0xff;

    let mut dest = DisplayChannel::new(0, PixmapCacheRegistry::new(), 16);
    let (dst, mut dst_peer) = join_display(&mut dest, HeaderKind::Full, target_settings());
    dst.borrow_mut().set_migration_seamless();
    dst_peer.send(msgc::MIGRATE_DATA, &data);
    dst.borrow_mut().receive();

    assert!(!dst.borrow().is_connected());
    assert!(dst_peer.is_shutdown());
    assert!(dst.borrow().handler().pixmap_cache().is_none());
}

/// The serial in migrate data comes from the peer; one that cannot be
/// followed by another message is refused instead of wrapping to zero.
#[test]
fn migrate_data_with_exhausted_serial_disconnects_the_destination() {
    let mut source = DisplayChannel::new(0, PixmapCacheRegistry::new(), 16);
    let (src, mut src_peer) = join_display(&mut source, HeaderKind::Full, ClientSettings::default());
    display_init(&src, &mut src_peer, 100);
    src.borrow_mut().push();
    src_peer.recv();
    let (_, mut data) = migrate_source(&src, &mut src_peer);
    // magic and version, then the display payload led by the serial
    data[8..16].copy_from_slice(&u64::MAX.to_le_bytes());

    let mut dest = DisplayChannel::new(0, PixmapCacheRegistry::new(), 16);
    let (dst, mut dst_peer) = join_display(&mut dest, HeaderKind::Full, target_settings());
    dst.borrow_mut().set_migration_seamless();
    dst_peer.send(msgc::MIGRATE_DATA, &data);
    dst.borrow_mut().receive();

    assert!(!dst.borrow().is_connected());
    assert!(dst_peer.is_shutdown());
    assert!(dst.borrow().handler().pixmap_cache().is_none());
}

#[test]
fn migrate_data_out_of_the_blue_is_a_protocol_fault() {
    let mut channel = DisplayChannel::new(0, PixmapCacheRegistry::new(), 16);
    let (client, mut peer) = join_display(&mut channel, HeaderKind::Full, ClientSettings::default());
    peer.send(msgc::MIGRATE_DATA, &[0u8; 32]);
    client.borrow_mut().receive();
    assert!(!client.borrow().is_connected());
}

#[test]
fn flush_mark_without_migrate_is_a_protocol_fault() {
    let mut channel = DisplayChannel::new(0, PixmapCacheRegistry::new(), 16);
    let (client, mut peer) = join_display(&mut channel, HeaderKind::Full, ClientSettings::default());
    peer.send(msgc::MIGRATE_FLUSH_MARK, &[]);
    client.borrow_mut().receive();
    assert!(!client.borrow().is_connected());
}

/// The cursor channel carries no migrate data: the source clears the peer's
/// cache before MIGRATE, and the destination runs as soon as the peer is back.
#[test]
fn cursor_migration_clears_the_cache_and_needs_no_data() {
    let mut source = CursorChannel::new(0);
    let (src, mut src_peer) = join_cursor(&mut source, HeaderKind::Full, ClientSettings::default());
    src.borrow_mut().push();
    src_peer.recv();

    src.borrow_mut().migrate();
    src.borrow_mut().push();
    let sent = src_peer.recv();
    assert_eq!(types(&sent), vec![cursor::msg::INVAL_ALL, msg::MIGRATE]);
    assert_eq!(sent[1].1, 0u32.to_le_bytes());
    assert_eq!(src.borrow().core().migration_state(), MigrationState::Normal);

    let mut dest = CursorChannel::new(0);
    dest.set_during_target_migrate(true);
    let (dst, mut dst_peer) = join_cursor(&mut dest, HeaderKind::Full, target_settings());
    assert!(!dst.borrow_mut().set_migration_seamless());
    dest.set_during_target_migrate(false);

    dest.process_cmd(CursorCommand::Move(Point { x: 5, y: 5 }));
    dst.borrow_mut().push();
    // No INIT for a migrated client: the peer kept its cursor state.
    assert_eq!(types(&dst_peer.recv()), vec![msg::SET_ACK, cursor::msg::MOVE]);
}

use crate::*;

use std::sync::Arc;

use vista_channel::cursor::{self, CursorCommand, CursorShape, Point};

fn shape(tag: u8) -> Arc<CursorShape> {
    Arc::new(CursorShape::new(4, 4, 1, 1, Bytes::from(vec![tag; 64])))
}

fn set(tag: u8) -> CursorCommand {
    CursorCommand::Set {
        position: Point { x: 3, y: 4 },
        visible: true,
        shape: shape(tag),
    }
}

/// A transport that takes a few bytes at a time still delivers every
/// message whole and in order.
#[test]
fn trickling_transport_delivers_whole_messages() {
    let mut channel = CursorChannel::new(0);
    let (client, mut peer) = join_cursor(&mut channel, HeaderKind::Full, ClientSettings::default());
    channel.process_cmd(set(1));
    channel.process_cmd(CursorCommand::Hide);

    peer.set_write_budget(Some(7));
    client.borrow_mut().push();
    assert!(peer.recv().is_empty());
    assert!(client.borrow().is_blocked());

    let mut msgs = Vec::new();
    for _ in 0..200 {
        peer.set_write_budget(Some(7));
        client.borrow_mut().push();
        msgs.extend(peer.recv());
        if client.borrow().pipe_len() == 0 && !client.borrow().is_blocked() {
            break;
        }
    }
    peer.set_write_budget(None);
    client.borrow_mut().push();
    msgs.extend(peer.recv());

    assert_eq!(
        types(&msgs),
        vec![msg::SET_ACK, cursor::msg::INIT, cursor::msg::SET, cursor::msg::HIDE]
    );
    let serials: Vec<u64> = msgs.iter().map(|(h, _)| h.serial).collect();
    assert_eq!(serials, vec![1, 2, 3, 4]);
}

#[test]
fn mini_headers_hide_serials_but_the_client_counts() {
    let mut channel = CursorChannel::new(0);
    let (client, mut peer) = join_cursor(&mut channel, HeaderKind::Mini, ClientSettings::default());
    channel.process_cmd(set(2));
    client.borrow_mut().push();

    let msgs = peer.recv();
    assert_eq!(msgs.len(), 3);
    assert!(msgs.iter().all(|(h, _)| h.serial == vista_core::wire::MINI_HEADER_SERIAL));
    assert_eq!(client.borrow().core().last_sent_serial(), 3);
}

#[test]
fn oversized_incoming_message_disconnects() {
    let mut channel = CursorChannel::new(0);
    let settings = ClientSettings {
        max_message_size: 64,
        ..ClientSettings::default()
    };
    let (client, mut peer) = join_cursor(&mut channel, HeaderKind::Full, settings);
    peer.send(150, &[0u8; 65]);
    client.borrow_mut().receive();
    assert!(!client.borrow().is_connected());
    assert!(peer.is_shutdown());
}

#[test]
fn cursor_channel_rejects_unknown_peer_messages() {
    let mut channel = CursorChannel::new(0);
    let (client, mut peer) = join_cursor(&mut channel, HeaderKind::Full, ClientSettings::default());
    peer.send(150, b"??");
    client.borrow_mut().receive();
    assert!(!client.borrow().is_connected());
    assert_eq!(channel.channel_mut().reap(), 1);
    assert!(channel.channel().is_empty());
}

#[test]
fn peer_close_drops_the_queue_and_the_cache() {
    let mut channel = CursorChannel::new(0);
    let (client, mut peer) = join_cursor(&mut channel, HeaderKind::Full, ClientSettings::default());
    channel.process_cmd(set(3));
    client.borrow_mut().push();
    peer.recv();
    assert_eq!(client.borrow().handler().cache().len(), 1);

    channel.process_cmd(set(4));
    peer.close();
    client.borrow_mut().receive();
    let c = client.borrow();
    assert!(!c.is_connected());
    assert_eq!(c.pipe_len(), 0);
    assert!(c.handler().cache().is_empty());
}

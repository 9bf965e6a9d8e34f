use crate::*;

use vista_channel::cursor::{self, CursorCommand, Point};

fn settings(window: u32) -> ClientSettings {
    ClientSettings {
        ack_window: window,
        ..ClientSettings::default()
    }
}

fn move_to(x: i16) -> CursorCommand {
    CursorCommand::Move(Point { x, y: 0 })
}

/// Sending stops once more than twice the window is unacknowledged and
/// resumes on an ack for the announced generation.
#[test]
fn cursor_moves_stall_until_acked() {
    let mut channel = CursorChannel::new(0);
    let (client, mut peer) = join_cursor(&mut channel, HeaderKind::Full, settings(2));
    for x in 0..10 {
        channel.process_cmd(move_to(x));
    }
    client.borrow_mut().push();

    let first = peer.recv();
    assert_eq!(
        types(&first),
        vec![msg::SET_ACK, cursor::msg::INIT, cursor::msg::MOVE, cursor::msg::MOVE, cursor::msg::MOVE]
    );
    let set_ack = &first[0].1;
    let generation = u32::from_le_bytes([set_ack[0], set_ack[1], set_ack[2], set_ack[3]]);
    let window = u32::from_le_bytes([set_ack[4], set_ack[5], set_ack[6], set_ack[7]]);
    assert_eq!((generation, window), (1, 2));
    assert!(client.borrow().core().is_waiting_for_ack());
    assert_eq!(client.borrow().pipe_len(), 7);

    // An ack for a generation we never announced does not count.
    ack(&mut peer, generation + 5);
    client.borrow_mut().receive();
    assert!(peer.recv().is_empty());

    ack(&mut peer, generation);
    client.borrow_mut().receive();
    let second = peer.recv();
    assert_eq!(second.len(), 5);
    assert!(second.iter().all(|(h, _)| h.msg_type == cursor::msg::MOVE));
    assert_eq!(client.borrow().pipe_len(), 2);
    assert!(client.borrow().is_connected());
}

#[test]
fn serials_keep_counting_across_ack_stalls() {
    let mut channel = CursorChannel::new(0);
    let (client, mut peer) = join_cursor(&mut channel, HeaderKind::Full, settings(1));
    for x in 0..6 {
        channel.process_cmd(move_to(x));
    }
    client.borrow_mut().push();
    let mut serials: Vec<u64> = peer.recv().iter().map(|(h, _)| h.serial).collect();

    ack(&mut peer, 1);
    client.borrow_mut().receive();
    serials.extend(peer.recv().iter().map(|(h, _)| h.serial));

    let expected: Vec<u64> = (1..=serials.len() as u64).collect();
    assert_eq!(serials, expected);
    assert_eq!(client.borrow().core().last_sent_serial(), serials.len() as u64);
}

/// Attaching runs the connect sequence; a repeated hook call from the link
/// layer must not open a second ack generation or greet twice.
#[test]
fn attached_client_announces_one_ack_generation() {
    let mut channel = CursorChannel::new(0);
    let (client, mut peer) = join_cursor(&mut channel, HeaderKind::Full, settings(2));
    client.borrow_mut().on_connect();
    client.borrow_mut().push();

    let sent = peer.recv();
    assert_eq!(types(&sent), vec![msg::SET_ACK, cursor::msg::INIT]);
    assert_eq!(u32::from_le_bytes(sent[0].1[..4].try_into().unwrap()), 1);
}

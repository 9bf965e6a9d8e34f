use crate::*;

use vista_channel::liveness::{PingState, PING_TEST_IDLE_NET_TIMEOUT, PING_TEST_LONG_TIMEOUT};

const WATCHDOG: Duration = Duration::from_secs(10);

fn watched() -> ClientSettings {
    ClientSettings {
        connectivity_timeout: Some(WATCHDOG),
        ..ClientSettings::default()
    }
}

/// Drain the greeting so the ping timer counts from an idle pipe.
fn greet<H: vista_channel::ChannelHandler>(client: &SharedClient<H>, peer: &mut MemoryPeer) {
    client.borrow_mut().push();
    peer.recv();
}

#[tokio::test(start_paused = true)]
async fn idle_client_is_probed_and_measured() {
    let mut channel = CursorChannel::new(0);
    let (client, mut peer) = join_cursor(&mut channel, HeaderKind::Full, ClientSettings::default());
    greet(&client, &mut peer);
    assert_eq!(client.borrow().core().ping_state(), PingState::TimerArmed);

    advance(&client, PING_TEST_LONG_TIMEOUT + PING_TEST_IDLE_NET_TIMEOUT).await;
    let pings = peer.recv();
    assert_eq!(types(&pings), vec![msg::PING, msg::PING]);
    // The first ping is padded to push through slow start.
    assert!(pings[0].1.len() > pings[1].1.len());
    assert_eq!(pings[1].1.len(), 12);

    // Warmup answer, then the measured one 30 ms later.
    peer.send(msgc::PONG, &pings[0].1[..12]);
    client.borrow_mut().receive();
    assert_eq!(client.borrow().roundtrip(), None);
    tokio::time::advance(Duration::from_millis(30)).await;
    peer.send(msgc::PONG, &pings[1].1[..12]);
    client.borrow_mut().receive();

    let c = client.borrow();
    assert_eq!(c.roundtrip(), Some(Duration::from_millis(30)));
    assert_eq!(c.core().ping_state(), PingState::TimerArmed);
    assert!(c.is_connected());
}

#[tokio::test(start_paused = true)]
async fn latency_monitoring_probes_sooner() {
    let mut channel = CursorChannel::new(0);
    let (client, mut peer) = join_cursor(&mut channel, HeaderKind::Full, ClientSettings::default());
    client.borrow_mut().monitor_latency(true);
    greet(&client, &mut peer);

    advance(&client, Duration::from_secs(16)).await;
    assert_eq!(types(&peer.recv()), vec![msg::PING, msg::PING]);
}

/// No application traffic for several watchdog periods, but every probe is
/// answered: the client stays up.
#[tokio::test(start_paused = true)]
async fn quiet_but_answering_peer_is_never_declared_dead() {
    let mut channel = CursorChannel::new(0);
    let (client, mut peer) = join_cursor(&mut channel, HeaderKind::Full, watched());
    greet(&client, &mut peer);

    let mut answered = 0;
    for _ in 0..60 {
        advance(&client, Duration::from_secs(1)).await;
        let msgs = peer.recv();
        answered += answer_pings(&mut peer, &msgs);
        client.borrow_mut().receive();
    }
    assert!(answered >= 4);
    assert!(client.borrow().is_connected());
}

/// Probes go out but never come back: two watchdog periods later the
/// client is gone.
#[tokio::test(start_paused = true)]
async fn silent_peer_is_disconnected() {
    let mut channel = CursorChannel::new(0);
    let (client, mut peer) = join_cursor(&mut channel, HeaderKind::Full, watched());
    greet(&client, &mut peer);

    let mut elapsed = Duration::ZERO;
    while client.borrow().is_connected() && elapsed < Duration::from_secs(120) {
        advance(&client, Duration::from_secs(1)).await;
        elapsed += Duration::from_secs(1);
    }
    assert!(!client.borrow().is_connected());
    assert!(peer.is_shutdown());
    // The watchdog probes right away; pending at one tick, dead at the next.
    assert!(elapsed <= Duration::from_secs(15) + 3 * WATCHDOG, "took {elapsed:?}");
}

/// Turning latency monitoring off must not stretch the probe interval back
/// to minutes while the watchdog needs pongs.
#[tokio::test(start_paused = true)]
async fn watchdog_keeps_probing_with_latency_monitoring_off() {
    let mut channel = CursorChannel::new(0);
    let (client, mut peer) = join_cursor(&mut channel, HeaderKind::Full, watched());
    client.borrow_mut().monitor_latency(false);
    greet(&client, &mut peer);

    advance(&client, Duration::from_secs(16)).await;
    assert_eq!(types(&peer.recv()), vec![msg::PING, msg::PING]);

    let mut elapsed = Duration::from_secs(16);
    while client.borrow().is_connected() && elapsed < Duration::from_secs(120) {
        advance(&client, Duration::from_secs(1)).await;
        elapsed += Duration::from_secs(1);
    }
    assert!(elapsed <= Duration::from_secs(15) + 3 * WATCHDOG, "took {elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn unsent_bytes_delay_the_probe() {
    let mut channel = CursorChannel::new(0);
    let (client, mut peer) = join_cursor(&mut channel, HeaderKind::Full, ClientSettings::default());
    greet(&client, &mut peer);

    peer.set_unsent(100);
    advance(&client, PING_TEST_LONG_TIMEOUT + PING_TEST_IDLE_NET_TIMEOUT).await;
    assert!(peer.recv().is_empty());

    peer.set_unsent(0);
    advance(&client, PING_TEST_IDLE_NET_TIMEOUT).await;
    assert_eq!(types(&peer.recv()), vec![msg::PING, msg::PING]);
}

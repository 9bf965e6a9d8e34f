//! Liveness watchdogs: latency probing and connectivity checking.
//!
//! Both are plain state machines. The channel client owns the timers and
//! the socket; it feeds events in with the current time and acts on what
//! comes back.

use std::time::Duration;

use tokio::time::Instant;

/// Probe interval while latency monitoring is requested.
pub const PING_TEST_TIMEOUT: Duration = Duration::from_secs(15);
/// Probe interval otherwise.
pub const PING_TEST_LONG_TIMEOUT: Duration = Duration::from_secs(5 * 60);
/// Retry interval while the socket still has unacknowledged bytes.
pub const PING_TEST_IDLE_NET_TIMEOUT: Duration = Duration::from_millis(100);
/// Padding carried by the warm-up probe.
pub const PING_WARMUP_PADDING: usize = 16 * 1024;

// ── Latency ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingState {
    Idle,
    TimerArmed,
    /// Two probes queued, waiting for the warm-up pong.
    WarmupSent,
    /// Warm-up pong seen, waiting for the measured pong.
    Measuring,
}

/// What to put on the wire for the next queued probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Probe {
    pub id: u32,
    pub padding: usize,
    /// Turn TCP_NODELAY on before writing this probe.
    pub force_nodelay: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PongOutcome {
    /// Id does not match the probe in flight.
    Stale,
    /// No probe in flight.
    Unexpected,
    Warmup,
    Measured {
        roundtrip: Duration,
        /// Value to restore TCP_NODELAY to, if it was forced.
        restore_nodelay: Option<bool>,
    },
}

#[derive(Debug)]
pub struct LatencyMonitor {
    state: PingState,
    id: u32,
    timeout: Duration,
    idle_net_timeout: Duration,
    last_pong: Instant,
    roundtrip: Option<Duration>,
    warmup_written: bool,
    saved_nodelay: Option<bool>,
}

impl LatencyMonitor {
    pub fn new(timeout: Duration, idle_net_timeout: Duration, now: Instant) -> Self {
        Self {
            state: PingState::Idle,
            id: 0,
            timeout,
            idle_net_timeout,
            last_pong: now,
            roundtrip: None,
            warmup_written: false,
            saved_nodelay: None,
        }
    }

    pub fn state(&self) -> PingState {
        self.state
    }

    /// Minimum observed round trip. None until the first measurement.
    pub fn roundtrip(&self) -> Option<Duration> {
        self.roundtrip
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn idle_net_timeout(&self) -> Duration {
        self.idle_net_timeout
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn is_awaiting_pong(&self) -> bool {
        matches!(self.state, PingState::WarmupSent | PingState::Measuring)
    }

    /// Idle → TimerArmed. Returns false if a probe is in flight or the
    /// timer is already armed.
    pub fn arm(&mut self) -> bool {
        if self.state != PingState::Idle {
            return false;
        }
        self.state = PingState::TimerArmed;
        true
    }

    /// TimerArmed → Idle. Returns true if there was a timer to cancel.
    pub fn cancel(&mut self) -> bool {
        if self.state != PingState::TimerArmed {
            return false;
        }
        self.state = PingState::Idle;
        true
    }

    /// Delay before the next probe once traffic has gone quiet: the time
    /// left until `timeout` since the last pong, plus the idle-net slack.
    pub fn restart_delay(&self, now: Instant) -> Duration {
        let passed = now.saturating_duration_since(self.last_pong);
        self.idle_net_timeout + self.timeout.saturating_sub(passed)
    }

    /// Start a probe round. The caller queues two pings.
    pub fn begin_probe(&mut self, id: u32) {
        self.state = PingState::WarmupSent;
        self.id = id;
        self.warmup_written = false;
    }

    /// Called when a queued ping is being written.
    pub fn next_probe(&mut self, current_nodelay: Option<bool>) -> Probe {
        if self.warmup_written {
            return Probe {
                id: self.id,
                padding: 0,
                force_nodelay: false,
            };
        }
        self.warmup_written = true;
        self.saved_nodelay = current_nodelay;
        Probe {
            id: self.id,
            padding: PING_WARMUP_PADDING,
            force_nodelay: current_nodelay == Some(false),
        }
    }

    pub fn on_pong(&mut self, id: u32, sent_us: u64, now_us: u64, now: Instant) -> PongOutcome {
        if id != self.id {
            return PongOutcome::Stale;
        }
        match self.state {
            PingState::WarmupSent => {
                self.state = PingState::Measuring;
                PongOutcome::Warmup
            }
            PingState::Measuring => {
                let roundtrip = Duration::from_micros(now_us.saturating_sub(sent_us));
                self.roundtrip = Some(match self.roundtrip {
                    Some(best) => best.min(roundtrip),
                    None => roundtrip,
                });
                self.last_pong = now;
                self.state = PingState::Idle;
                let restore_nodelay = match self.saved_nodelay.take() {
                    Some(false) => Some(false),
                    _ => None,
                };
                PongOutcome::Measured {
                    roundtrip,
                    restore_nodelay,
                }
            }
            PingState::Idle | PingState::TimerArmed => PongOutcome::Unexpected,
        }
    }
}

// ── Connectivity ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    Connected,
    Blocked,
    AwaitingPong,
    Dead,
}

#[derive(Debug)]
pub struct ConnectivityMonitor {
    state: Connectivity,
    sent_bytes: bool,
    received_bytes: bool,
    timeout: Duration,
}

impl ConnectivityMonitor {
    pub fn new(timeout: Duration) -> Self {
        Self {
            state: Connectivity::Connected,
            sent_bytes: false,
            received_bytes: false,
            timeout,
        }
    }

    pub fn state(&self) -> Connectivity {
        self.state
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn note_sent(&mut self) {
        self.sent_bytes = true;
    }

    pub fn note_received(&mut self) {
        self.received_bytes = true;
    }

    /// One watchdog period elapsed. `stalled` is true while the client is
    /// send-blocked or waiting for an ack. Returns false once dead.
    pub fn tick(&mut self, stalled: bool, awaiting_pong: bool) -> bool {
        let alive = match self.state {
            Connectivity::Blocked => self.sent_bytes || self.received_bytes,
            Connectivity::AwaitingPong => self.received_bytes,
            Connectivity::Connected => true,
            Connectivity::Dead => false,
        };
        if !alive {
            self.state = Connectivity::Dead;
            return false;
        }
        self.sent_bytes = false;
        self.received_bytes = false;
        self.state = if stalled {
            Connectivity::Blocked
        } else if awaiting_pong {
            Connectivity::AwaitingPong
        } else {
            Connectivity::Connected
        };
        true
    }
}

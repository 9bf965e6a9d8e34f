//! Per-client reactor registrations: readiness interest and one-shot timers.
//!
//! The engine never blocks and never spawns. It records here what it wants
//! to be woken for, and the driver task turns that into tokio waits. Every
//! change pokes a `Notify` so a driver parked on stale interest re-reads it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u32);

/// Readiness interest for the client's stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WatchMask {
    pub read: bool,
    pub write: bool,
}

impl WatchMask {
    pub const READ: WatchMask = WatchMask { read: true, write: false };
    pub const READ_WRITE: WatchMask = WatchMask { read: true, write: true };
}

#[derive(Debug)]
pub struct EventLoop {
    next_timer: u32,
    /// Registered timers and their deadline when armed.
    timers: HashMap<TimerId, Option<Instant>>,
    watch: Option<WatchMask>,
    /// Reads are held off; READ is masked out of the reported interest.
    read_paused: bool,
    wake: Arc<Notify>,
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLoop {
    pub fn new() -> Self {
        Self {
            next_timer: 1,
            timers: HashMap::new(),
            watch: None,
            read_paused: false,
            wake: Arc::new(Notify::new()),
        }
    }

    // ── Readiness ────────────────────────────────────────────────────────────

    pub fn register_watch(&mut self, mask: WatchMask) {
        self.watch = Some(mask);
        self.wake.notify_one();
    }

    /// Change interest on an existing watch. No-op once the watch is removed.
    pub fn update_watch(&mut self, mask: WatchMask) {
        if let Some(current) = self.watch.as_mut() {
            if *current != mask {
                *current = mask;
                self.wake.notify_one();
            }
        }
    }

    pub fn remove_watch(&mut self) {
        self.watch = None;
        self.wake.notify_one();
    }

    pub fn watch(&self) -> Option<WatchMask> {
        self.watch.map(|mask| WatchMask {
            read: mask.read && !self.read_paused,
            ..mask
        })
    }

    /// Stop or resume read interest without touching the registered mask.
    pub fn pause_read(&mut self, paused: bool) {
        if self.read_paused != paused {
            self.read_paused = paused;
            self.wake.notify_one();
        }
    }

    // ── Timers ───────────────────────────────────────────────────────────────

    pub fn create_timer(&mut self) -> TimerId {
        let id = TimerId(self.next_timer);
        self.next_timer += 1;
        self.timers.insert(id, None);
        id
    }

    /// Arm (or re-arm) a timer to fire once after `timeout`.
    pub fn arm(&mut self, id: TimerId, timeout: Duration) {
        if let Some(deadline) = self.timers.get_mut(&id) {
            *deadline = Some(Instant::now() + timeout);
            self.wake.notify_one();
        }
    }

    pub fn cancel(&mut self, id: TimerId) {
        if let Some(deadline) = self.timers.get_mut(&id) {
            *deadline = None;
        }
    }

    pub fn remove_timer(&mut self, id: TimerId) {
        self.timers.remove(&id);
    }

    pub fn is_armed(&self, id: TimerId) -> bool {
        matches!(self.timers.get(&id), Some(Some(_)))
    }

    pub fn deadline(&self, id: TimerId) -> Option<Instant> {
        self.timers.get(&id).copied().flatten()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.values().filter_map(|d| *d).min()
    }

    /// Disarm and return every timer whose deadline has passed, earliest first.
    pub fn take_expired(&mut self, now: Instant) -> Vec<TimerId> {
        let mut due: Vec<(Instant, TimerId)> = self
            .timers
            .iter()
            .filter_map(|(id, d)| (*d).filter(|at| *at <= now).map(|at| (at, *id)))
            .collect();
        due.sort();
        for (_, id) in &due {
            self.cancel(*id);
        }
        due.into_iter().map(|(_, id)| id).collect()
    }

    pub fn waker(&self) -> Arc<Notify> {
        self.wake.clone()
    }
}

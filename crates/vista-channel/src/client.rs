//! Channel client: one connected peer on one channel.
//!
//! `ClientCore` holds everything generic (transport, framing, pipe, ack
//! window, liveness, migration state). `ChannelClient` pairs it with the
//! channel-specific `ChannelHandler` and runs the receive and send loops.
//!
//! Nothing in here blocks or spawns. Readiness interest and timer deadlines
//! are recorded in the client's `EventLoop`; a driver (see `driver.rs`, or a
//! test) calls `receive`, `push` and `fire_expired_timers` when woken.
//!
//! Faults never tear the client down mid-operation. They are recorded with
//! `request_disconnect` and acted on once the outermost call returns, so a
//! handler may ask for a disconnect from inside any callback.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use tokio::sync::Notify;
use tokio::time::Instant;
use zerocopy::AsBytes;

use vista_core::caps::{self, Capabilities};
use vista_core::config::VistaConfig;
use vista_core::wire::{
    self, msg, msgc, AckSync, ChannelKind, HeaderKind, Le32, Le64, Migrate, Ping, SetAck,
};

use crate::ack::{AckWindow, CLIENT_ACK_WINDOW};
use crate::error::{DisconnectReason, FramingError};
use crate::framing::{IncomingBuffer, Marshaller, OutgoingBuffer, PendingMessage};
use crate::liveness::{
    Connectivity, ConnectivityMonitor, LatencyMonitor, PingState, PongOutcome,
    PING_TEST_IDLE_NET_TIMEOUT, PING_TEST_LONG_TIMEOUT, PING_TEST_TIMEOUT,
};
use crate::migration::{open_envelope, MigrateFlags, MigrationError, MigrationState, MigrationTracker};
use crate::pipe::{Pipe, PipeItem, Position};
use crate::reactor::{EventLoop, TimerId, WatchMask};
use crate::transport::{Transport, TransportKind};

/// Sleep between receive/push rounds in the blocking wait helpers.
pub const CHANNEL_BLOCKED_SLEEP: Duration = Duration::from_millis(10);

pub const DEFAULT_MAX_MESSAGE_SIZE: u32 = 16 * 1024 * 1024;

/// Process-unique client id, used in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(u64);

impl ClientId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ClientId(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0.to_be_bytes()))
    }
}

/// Static description of a channel type.
#[derive(Debug, Clone)]
pub struct ChannelInfo {
    pub kind: ChannelKind,
    pub id: u8,
    pub migration: MigrateFlags,
    /// Whether clients take part in SET_ACK / ACK flow control.
    pub handle_acks: bool,
    pub migrate_magic: u32,
    pub migrate_version: u32,
}

#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub ack_window: u32,
    pub max_message_size: u32,
    /// Probe interval once a measurement completes.
    pub ping_interval: Duration,
    pub idle_net_timeout: Duration,
    pub connectivity_timeout: Option<Duration>,
    /// Created on the destination of a migration: timers wait until the
    /// migration completes.
    pub migration_target: bool,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            ack_window: CLIENT_ACK_WINDOW,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            ping_interval: PING_TEST_LONG_TIMEOUT,
            idle_net_timeout: PING_TEST_IDLE_NET_TIMEOUT,
            connectivity_timeout: None,
            migration_target: false,
        }
    }
}

impl ClientSettings {
    pub fn from_config(config: &VistaConfig) -> Self {
        Self {
            ack_window: config.channels.ack_window,
            max_message_size: config.channels.max_message_size,
            ping_interval: config.liveness.ping_interval(),
            idle_net_timeout: config.liveness.idle_net_timeout(),
            connectivity_timeout: config.channels.connectivity_timeout(),
            migration_target: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientStats {
    pub messages_sent: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// The channel-specific half of a client.
///
/// Handlers receive the generic `ClientCore` so they can enqueue items,
/// marshal messages and query capabilities. A handler that wants the client
/// gone calls `core.request_disconnect`.
pub trait ChannelHandler {
    type Item;

    /// Buffer for an incoming body of `size` bytes. `None` refuses it, which
    /// is fatal unless reads are blocked.
    fn alloc_receive_buffer(&mut self, _msg_type: u16, size: u32) -> Option<BytesMut> {
        Some(BytesMut::zeroed(size as usize))
    }

    fn release_receive_buffer(&mut self, _msg_type: u16, _buf: BytesMut) {}

    fn on_connect(&mut self, _core: &mut ClientCore<Self::Item>) {}

    /// Handle a channel-specific message. False is a protocol fault.
    fn handle_message(&mut self, core: &mut ClientCore<Self::Item>, msg_type: u16, body: &[u8])
        -> bool;

    /// Build the message for `item` with `core.init_send_data` and
    /// `core.body()`. Producing nothing is allowed.
    fn marshal_item(&mut self, core: &mut ClientCore<Self::Item>, item: &Self::Item);

    fn on_disconnect(&mut self, _core: &mut ClientCore<Self::Item>) {}

    /// Source side, right before MIGRATE is queued.
    fn on_migrate(&mut self, _core: &mut ClientCore<Self::Item>) {}

    /// Source side: the peer flushed, queue the migrate data now.
    fn on_migrate_flush_mark(&mut self, _core: &mut ClientCore<Self::Item>) {}

    /// Serial for the next outgoing message, if the migrate-data payload
    /// carries one.
    fn migrate_data_serial(&self, _payload: &[u8]) -> Result<Option<u64>, MigrationError> {
        Ok(None)
    }

    /// Destination side: restore from the migrate-data payload.
    fn on_migrate_data(&mut self, _core: &mut ClientCore<Self::Item>, _payload: &[u8]) -> bool {
        false
    }
}

// ── Core ─────────────────────────────────────────────────────────────────────

pub struct ClientCore<I> {
    id: ClientId,
    info: ChannelInfo,
    caps: Capabilities,
    header_kind: HeaderKind,
    settings: ClientSettings,
    stream: Box<dyn Transport>,
    events: EventLoop,
    epoch: Instant,

    ack: AckWindow,
    marshaller: Marshaller,
    outgoing: Option<OutgoingBuffer>,
    send_item: Option<Arc<PipeItem<I>>>,
    last_sent_serial: u64,
    send_blocked: bool,
    during_send: bool,

    incoming: IncomingBuffer,
    block_read: bool,

    pipe: Pipe<Arc<PipeItem<I>>>,

    latency: LatencyMonitor,
    connectivity: Option<ConnectivityMonitor>,
    ping_timer: Option<TimerId>,
    connectivity_timer: Option<TimerId>,

    migration: MigrationTracker,
    at_migration_target: bool,

    connected: bool,
    greeted: bool,
    pending_disconnect: Option<DisconnectReason>,
    stats: ClientStats,
}

impl<I> ClientCore<I> {
    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn info(&self) -> &ChannelInfo {
        &self.info
    }

    pub fn kind(&self) -> ChannelKind {
        self.info.kind
    }

    pub fn channel_id(&self) -> u8 {
        self.info.id
    }

    pub fn caps(&self) -> &Capabilities {
        &self.caps
    }

    pub fn has_capability(&self, bit: u32) -> bool {
        self.caps.has_capability(bit)
    }

    pub fn has_common_capability(&self, bit: u32) -> bool {
        self.caps.has_common(bit)
    }

    pub fn header_kind(&self) -> HeaderKind {
        self.header_kind
    }

    pub fn peer(&self) -> String {
        self.stream.peer()
    }

    pub fn stats(&self) -> ClientStats {
        self.stats
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    fn is_alive(&self) -> bool {
        self.connected && self.pending_disconnect.is_none()
    }

    /// Ask for a disconnect once the current operation unwinds. The first
    /// reason wins.
    pub fn request_disconnect(&mut self, reason: DisconnectReason) {
        if self.connected && self.pending_disconnect.is_none() {
            self.pending_disconnect = Some(reason);
        }
    }

    // ── Pipe ─────────────────────────────────────────────────────────────────

    /// Items queued after disconnect are dropped.
    fn prepare_pipe_add(&mut self) -> bool {
        if !self.connected {
            return false;
        }
        if self.pipe.is_empty() {
            self.events.update_watch(WatchMask::READ_WRITE);
        }
        true
    }

    /// Queue at the back.
    pub fn pipe_add(&mut self, item: I) -> Option<Position> {
        self.pipe_add_shared(Arc::new(PipeItem::Channel(item)))
    }

    /// Queue an already shared item at the back.
    pub fn pipe_add_shared(&mut self, item: Arc<PipeItem<I>>) -> Option<Position> {
        self.prepare_pipe_add().then(|| self.pipe.push_back(item))
    }

    /// Queue as the next item to send.
    pub fn pipe_add_front(&mut self, item: I) -> Option<Position> {
        self.pipe_add_front_shared(Arc::new(PipeItem::Channel(item)))
    }

    pub fn pipe_add_front_shared(&mut self, item: Arc<PipeItem<I>>) -> Option<Position> {
        self.prepare_pipe_add().then(|| self.pipe.push_front(item))
    }

    pub fn pipe_add_after(&mut self, pos: Position, item: I) -> Option<Position> {
        if !self.prepare_pipe_add() {
            return None;
        }
        self.pipe.insert_after(pos, Arc::new(PipeItem::Channel(item)))
    }

    pub fn pipe_add_before(&mut self, pos: Position, item: I) -> Option<Position> {
        if !self.prepare_pipe_add() {
            return None;
        }
        self.pipe.insert_before(pos, Arc::new(PipeItem::Channel(item)))
    }

    /// Queue a control item at the back.
    pub fn pipe_add_type(&mut self, item: PipeItem<I>) -> Option<Position> {
        self.pipe_add_shared(Arc::new(item))
    }

    pub fn pipe_add_empty_msg(&mut self, msg_type: u16) -> Option<Position> {
        self.pipe_add_type(PipeItem::EmptyMsg(msg_type))
    }

    /// Remove a queued item by identity. False if it is not queued.
    pub fn pipe_remove(&mut self, item: &Arc<PipeItem<I>>) -> bool {
        self.pipe.remove_item(item)
    }

    pub fn pipe_contains(&self, item: &Arc<PipeItem<I>>) -> bool {
        self.pipe.contains(item)
    }

    pub fn pipe_len(&self) -> usize {
        self.pipe.len()
    }

    pub fn pipe_is_empty(&self) -> bool {
        self.pipe.is_empty()
    }

    /// True if `pos` still refers to a queued item.
    pub fn pipe_holds(&self, pos: Position) -> bool {
        self.pipe.contains_position(pos)
    }

    // ── Marshalling ──────────────────────────────────────────────────────────

    /// Start the message being built with type `msg_type`.
    pub fn init_send_data(&mut self, msg_type: u16) {
        self.marshaller.init(msg_type);
    }

    /// Body of the message being built.
    pub fn body(&mut self) -> &mut BytesMut {
        self.marshaller.body()
    }

    /// Build a second message that goes out before the current one.
    pub fn switch_to_urgent_sender(&mut self) {
        self.marshaller.switch_to_urgent();
    }

    pub fn is_urgent_pending(&self) -> bool {
        self.marshaller.has_urgent()
    }

    pub fn set_header_sub_list(&mut self, offset: u32) -> Result<(), FramingError> {
        self.marshaller.set_sub_list(offset).map_err(FramingError::from)
    }

    /// Serial the main message being built will carry.
    pub fn message_serial(&self) -> u64 {
        let detour = u64::from(self.marshaller.has_urgent());
        self.last_sent_serial + 1 + detour
    }

    /// The next message sent gets `serial`.
    pub fn set_message_serial(&mut self, serial: u64) {
        self.last_sent_serial = serial.saturating_sub(1);
    }

    pub fn last_sent_serial(&self) -> u64 {
        self.last_sent_serial
    }

    // ── Flow control ─────────────────────────────────────────────────────────

    pub fn block_read(&mut self) {
        self.block_read = true;
        self.events.pause_read(true);
    }

    pub fn unblock_read(&mut self) {
        self.block_read = false;
        self.events.pause_read(false);
    }

    pub fn is_read_blocked(&self) -> bool {
        self.block_read
    }

    /// The transport refused part of the current message.
    pub fn is_blocked(&self) -> bool {
        self.send_blocked
    }

    pub fn is_waiting_for_ack(&self) -> bool {
        self.info.handle_acks && self.ack.is_waiting()
    }

    pub fn ack_window(&self) -> &AckWindow {
        &self.ack
    }

    /// Nothing in flight and nothing queued.
    pub fn no_item_being_sent(&self) -> bool {
        self.outgoing.is_none() && self.send_item.is_none()
    }

    // ── Liveness and migration queries ───────────────────────────────────────

    pub fn roundtrip(&self) -> Option<Duration> {
        self.latency.roundtrip()
    }

    pub fn ping_state(&self) -> PingState {
        self.latency.state()
    }

    pub fn connectivity_state(&self) -> Option<Connectivity> {
        self.connectivity.as_ref().map(ConnectivityMonitor::state)
    }

    pub fn migration_state(&self) -> MigrationState {
        self.migration.state()
    }

    pub fn is_migration_target(&self) -> bool {
        self.at_migration_target
    }

    // ── Sending ──────────────────────────────────────────────────────────────

    fn next_item(&mut self) -> Option<Arc<PipeItem<I>>> {
        if self.send_blocked || self.is_waiting_for_ack() {
            return None;
        }
        self.pipe.pop_front()
    }

    /// Encode the marshalled message(s) and start streaming them.
    fn begin_send_message(&mut self) {
        let Some(message) = self.marshaller.take_next() else {
            return;
        };
        self.stage(message);
        self.cancel_ping_timer();
        self.send();
    }

    fn stage(&mut self, mut message: PendingMessage) {
        self.last_sent_serial += 1;
        message.header.serial = self.last_sent_serial;
        self.ack.on_sent();
        match OutgoingBuffer::new(self.header_kind, message) {
            Ok(out) => self.outgoing = Some(out),
            Err(e) => self.request_disconnect(e.into()),
        }
    }

    /// Write as much of the outgoing message as the transport takes.
    fn send(&mut self) {
        loop {
            let Some(out) = self.outgoing.as_mut() else {
                return;
            };
            let result = self.stream.write_vectored(&out.remaining());
            match result {
                Ok(0) => {
                    self.request_disconnect(DisconnectReason::Io(io::ErrorKind::WriteZero));
                    return;
                }
                Ok(n) => {
                    out.advance(n);
                    let complete = out.is_complete();
                    self.stats.bytes_sent += n as u64;
                    if let Some(monitor) = self.connectivity.as_mut() {
                        monitor.note_sent();
                    }
                    if complete {
                        self.outgoing = None;
                        self.message_sent();
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if !self.send_blocked {
                        self.send_blocked = true;
                        self.events.update_watch(WatchMask::READ_WRITE);
                    }
                    return;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::debug!(client = %self.id, error = %e, "write failed");
                    self.request_disconnect(DisconnectReason::Io(e.kind()));
                    return;
                }
            }
        }
    }

    fn message_sent(&mut self) {
        self.stats.messages_sent += 1;
        self.send_blocked = false;
        // The urgent message went first; the main one follows.
        if let Some(next) = self.marshaller.take_next() {
            self.stage(next);
            return;
        }
        self.send_item = None;
        self.marshaller.reset();
        if self.pipe.is_empty() {
            self.restart_ping_timer();
        }
    }

    fn marshal_set_ack(&mut self) {
        let (generation, window) = self.ack.start_generation();
        let body = SetAck {
            generation: Le32::new(generation),
            window: Le32::new(window),
        };
        self.init_send_data(msg::SET_ACK);
        self.body().put_slice(body.as_bytes());
    }

    fn marshal_migrate(&mut self) {
        let flags = self.info.migration;
        self.init_send_data(msg::MIGRATE);
        let body = Migrate {
            flags: Le32::new(flags.bits()),
        };
        self.body().put_slice(body.as_bytes());
        self.migration.migrate_sent(flags);
    }

    fn marshal_ping(&mut self) {
        let probe = self.latency.next_probe(self.stream.nodelay());
        if probe.force_nodelay {
            if let Err(e) = self.stream.set_nodelay(true) {
                tracing::warn!(client = %self.id, error = %e, "failed to enable TCP_NODELAY");
            }
        }
        let body = Ping {
            id: Le32::new(probe.id),
            timestamp: Le64::new(self.now_us()),
        };
        self.init_send_data(msg::PING);
        let out = self.body();
        out.put_slice(body.as_bytes());
        out.put_bytes(0, probe.padding);
    }

    // ── Timers ───────────────────────────────────────────────────────────────

    fn now_us(&self) -> u64 {
        Instant::now().saturating_duration_since(self.epoch).as_micros() as u64
    }

    fn start_ping_timer(&mut self, timeout: Duration) {
        let Some(timer) = self.ping_timer else {
            return;
        };
        if self.latency.arm() {
            self.events.arm(timer, timeout);
        }
    }

    fn cancel_ping_timer(&mut self) {
        let Some(timer) = self.ping_timer else {
            return;
        };
        if self.latency.cancel() {
            self.events.cancel(timer);
        }
    }

    /// Rearm once the pipe drains, counting from the last pong.
    fn restart_ping_timer(&mut self) {
        if self.ping_timer.is_none() || self.at_migration_target {
            return;
        }
        let delay = self.latency.restart_delay(Instant::now());
        self.start_ping_timer(delay);
    }

    fn ping_timer_fired(&mut self) {
        self.latency.cancel();
        // Probing behind a full send queue measures the queue, not the link.
        if self.stream.unsent_bytes().is_some_and(|n| n > 0) {
            tracing::trace!(client = %self.id, "unsent bytes pending, delaying ping");
            let idle = self.settings.idle_net_timeout;
            self.start_ping_timer(idle);
            return;
        }
        self.push_ping();
    }

    fn push_ping(&mut self) {
        let id = rand::random::<u32>();
        self.latency.begin_probe(id);
        self.pipe_add_type(PipeItem::Ping);
        self.pipe_add_type(PipeItem::Ping);
    }

    fn connectivity_timer_fired(&mut self) {
        let stalled = self.send_blocked || self.is_waiting_for_ack();
        let awaiting_pong = self.latency.is_awaiting_pong();
        let Some(monitor) = self.connectivity.as_mut() else {
            return;
        };
        let timeout = monitor.timeout();
        if monitor.tick(stalled, awaiting_pong) {
            if let Some(timer) = self.connectivity_timer {
                self.events.arm(timer, timeout);
            }
            return;
        }
        tracing::warn!(
            client = %self.id,
            channel = ?self.info.kind,
            timeout_ms = timeout.as_millis() as u64,
            "connectivity lost, peer unresponsive"
        );
        self.request_disconnect(DisconnectReason::Liveness);
    }

    fn start_timers(&mut self) {
        let idle = self.settings.idle_net_timeout;
        self.start_ping_timer(idle);
        if let (Some(timer), Some(monitor)) = (self.connectivity_timer, self.connectivity.as_ref()) {
            let timeout = monitor.timeout();
            self.events.arm(timer, timeout);
        }
    }

    fn remove_timers(&mut self) {
        if let Some(timer) = self.ping_timer.take() {
            self.events.remove_timer(timer);
        }
        if let Some(timer) = self.connectivity_timer.take() {
            self.events.remove_timer(timer);
        }
        self.latency.cancel();
    }

    // ── Receive helpers ──────────────────────────────────────────────────────

    /// Bytes read, or None to stop reading for now.
    fn read_result(&mut self, result: io::Result<usize>) -> Option<usize> {
        match result {
            Ok(0) => {
                self.request_disconnect(DisconnectReason::PeerClosed);
                None
            }
            Ok(n) => {
                self.stats.bytes_received += n as u64;
                if let Some(monitor) = self.connectivity.as_mut() {
                    monitor.note_received();
                }
                Some(n)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => None,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Some(0),
            Err(e) => {
                tracing::debug!(client = %self.id, error = %e, "read failed");
                self.request_disconnect(DisconnectReason::Io(e.kind()));
                None
            }
        }
    }

    fn protocol_fault(&mut self, error: impl Into<DisconnectReason>) {
        let reason = error.into();
        tracing::warn!(client = %self.id, channel = ?self.info.kind, %reason, "protocol fault");
        self.request_disconnect(reason);
    }

    fn handle_pong(&mut self, body: &[u8]) {
        let ping: Ping = match wire::read_struct(body) {
            Ok(p) => p,
            Err(e) => {
                self.protocol_fault(FramingError::from(e));
                return;
            }
        };
        let now_us = self.now_us();
        match self
            .latency
            .on_pong(ping.id.get(), ping.timestamp.get(), now_us, Instant::now())
        {
            PongOutcome::Stale => {
                tracing::warn!(client = %self.id, id = ping.id.get(), "pong id mismatch, ignored");
            }
            PongOutcome::Unexpected => {
                tracing::warn!(client = %self.id, "unexpected pong");
            }
            PongOutcome::Warmup => {}
            PongOutcome::Measured {
                roundtrip,
                restore_nodelay,
            } => {
                if let Some(on) = restore_nodelay {
                    if let Err(e) = self.stream.set_nodelay(on) {
                        tracing::warn!(client = %self.id, error = %e, "failed to restore TCP_NODELAY");
                    }
                }
                tracing::debug!(
                    client = %self.id,
                    roundtrip_us = roundtrip.as_micros() as u64,
                    "latency measured"
                );
                let timeout = self.latency.timeout();
                self.start_ping_timer(timeout);
            }
        }
    }

    fn seamless_migration_done(&mut self) {
        self.migration.data_restored();
        self.at_migration_target = false;
        self.start_timers();
        tracing::info!(client = %self.id, channel = ?self.info.kind, "migrate data restored");
    }
}

// ── Client ───────────────────────────────────────────────────────────────────

pub struct ChannelClient<H: ChannelHandler> {
    core: ClientCore<H::Item>,
    handler: H,
}

impl<H: ChannelHandler> ChannelClient<H> {
    pub fn new(
        info: ChannelInfo,
        caps: Capabilities,
        stream: Box<dyn Transport>,
        settings: ClientSettings,
        handler: H,
    ) -> Self {
        let header_kind = if caps.has_common(caps::common::MINI_HEADER) {
            HeaderKind::Mini
        } else {
            HeaderKind::Full
        };
        let now = Instant::now();
        let mut events = EventLoop::new();
        events.register_watch(WatchMask::READ);
        let transport_kind = stream.kind();

        let mut core = ClientCore {
            id: ClientId::next(),
            header_kind,
            ack: AckWindow::new(settings.ack_window),
            marshaller: Marshaller::new(header_kind),
            outgoing: None,
            send_item: None,
            last_sent_serial: 0,
            send_blocked: false,
            during_send: false,
            incoming: IncomingBuffer::new(header_kind),
            block_read: false,
            pipe: Pipe::new(),
            latency: LatencyMonitor::new(settings.ping_interval, settings.idle_net_timeout, now),
            connectivity: None,
            ping_timer: None,
            connectivity_timer: None,
            migration: MigrationTracker::default(),
            at_migration_target: settings.migration_target,
            connected: true,
            greeted: false,
            pending_disconnect: None,
            stats: ClientStats::default(),
            epoch: now,
            info,
            caps,
            settings,
            stream,
            events,
        };

        // Unix sockets are local; latency probing only starts if connectivity
        // monitoring is requested explicitly.
        if transport_kind != TransportKind::Unix {
            core.ping_timer = Some(core.events.create_timer());
            if !core.at_migration_target {
                let idle = core.settings.idle_net_timeout;
                core.start_ping_timer(idle);
            }
        }

        tracing::debug!(
            client = %core.id,
            channel = ?core.info.kind,
            channel_id = core.info.id,
            peer = %core.stream.peer(),
            header = ?header_kind,
            "channel client created"
        );
        Self { core, handler }
    }

    pub fn id(&self) -> ClientId {
        self.core.id
    }

    pub fn core(&self) -> &ClientCore<H::Item> {
        &self.core
    }

    pub fn core_mut(&mut self) -> &mut ClientCore<H::Item> {
        &mut self.core
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    /// Run a handler callback with the core, then settle pending faults.
    pub fn with_handler<R>(&mut self, f: impl FnOnce(&mut H, &mut ClientCore<H::Item>) -> R) -> R {
        let result = f(&mut self.handler, &mut self.core);
        self.finish_pending();
        result
    }

    pub fn is_connected(&self) -> bool {
        self.core.connected
    }

    pub fn has_capability(&self, bit: u32) -> bool {
        self.core.has_capability(bit)
    }

    pub fn watch(&self) -> Option<WatchMask> {
        self.core.events.watch()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.core.events.next_deadline()
    }

    pub fn waker(&self) -> Arc<Notify> {
        self.core.events.waker()
    }

    pub fn pipe_len(&self) -> usize {
        self.core.pipe.len()
    }

    pub fn is_blocked(&self) -> bool {
        self.core.send_blocked
    }

    pub fn roundtrip(&self) -> Option<Duration> {
        self.core.roundtrip()
    }

    pub fn stats(&self) -> ClientStats {
        self.core.stats
    }

    /// The link handshake finished: open the ack window, start connectivity
    /// monitoring if configured, and let the handler queue its greeting.
    /// Runs once; later calls are ignored.
    pub fn on_connect(&mut self) {
        if self.core.greeted {
            return;
        }
        self.core.greeted = true;
        if self.core.info.handle_acks {
            self.core.ack.reset();
            self.core.pipe_add_front_shared(Arc::new(PipeItem::SetAck));
        }
        if let Some(timeout) = self.core.settings.connectivity_timeout {
            self.start_connectivity_monitoring(timeout);
        }
        self.handler.on_connect(&mut self.core);
        self.finish_pending();
    }

    fn finish_pending(&mut self) {
        if let Some(reason) = self.core.pending_disconnect.take() {
            self.disconnect(reason);
        }
    }

    // ── Receive ──────────────────────────────────────────────────────────────

    /// Read and dispatch until the transport would block.
    pub fn receive(&mut self) {
        while self.core.is_alive() {
            let core = &mut self.core;
            if !core.incoming.header_complete() {
                let result = core.stream.read(core.incoming.header_remaining());
                match core.read_result(result) {
                    Some(n) => core.incoming.advance_header(n),
                    None => break,
                }
                continue;
            }

            if !core.incoming.has_body() {
                let header = match core.incoming.parse_header() {
                    Ok(h) => h,
                    Err(e) => {
                        core.protocol_fault(FramingError::from(e));
                        break;
                    }
                };
                let max = core.settings.max_message_size;
                if header.size > max {
                    core.protocol_fault(FramingError::TooLarge {
                        size: header.size,
                        max,
                    });
                    break;
                }
                match self.handler.alloc_receive_buffer(header.msg_type, header.size) {
                    Some(mut buf) => {
                        buf.resize(header.size as usize, 0);
                        self.core.incoming.set_body(buf);
                    }
                    None if self.core.block_read => break,
                    None => {
                        self.core.protocol_fault(FramingError::BufferRefused {
                            msg_type: header.msg_type,
                            size: header.size,
                        });
                        break;
                    }
                }
                continue;
            }

            if !core.incoming.body_complete() {
                let Some(buf) = core.incoming.body_remaining() else {
                    break;
                };
                let result = core.stream.read(buf);
                match core.read_result(result) {
                    Some(n) => core.incoming.advance_body(n),
                    None => break,
                }
                continue;
            }

            if let Some((header, body)) = core.incoming.take_message() {
                tracing::trace!(
                    client = %core.id,
                    msg_type = header.msg_type,
                    size = header.size,
                    "message received"
                );
                self.dispatch(header.msg_type, &body);
                self.handler.release_receive_buffer(header.msg_type, body);
            }
        }
        self.finish_pending();
    }

    fn dispatch(&mut self, msg_type: u16, body: &[u8]) {
        match msg_type {
            msgc::ACK_SYNC => match wire::read_struct::<AckSync>(body) {
                Ok(sync) => self.core.ack.on_ack_sync(sync.generation.get()),
                Err(e) => self.core.protocol_fault(FramingError::from(e)),
            },
            msgc::ACK => {
                if self.core.ack.on_ack() {
                    self.push();
                }
            }
            msgc::PONG => self.core.handle_pong(body),
            msgc::MIGRATE_FLUSH_MARK => match self.core.migration.flush_mark_received() {
                Ok(()) => {
                    tracing::info!(client = %self.core.id, "migrate flush mark received");
                    self.handler.on_migrate_flush_mark(&mut self.core);
                }
                Err(e) => self.core.protocol_fault(e),
            },
            msgc::MIGRATE_DATA => self.handle_migrate_data(body),
            msgc::DISCONNECTING => {
                tracing::debug!(client = %self.core.id, "peer announced disconnect");
            }
            other => {
                if !self.handler.handle_message(&mut self.core, other, body) {
                    self.core.protocol_fault(FramingError::UnknownMessage(other));
                }
            }
        }
    }

    fn handle_migrate_data(&mut self, body: &[u8]) {
        let core = &mut self.core;
        if !core.info.migration.need_data_transfer {
            tracing::warn!(client = %core.id, "migrate data on a channel without data transfer");
            return;
        }
        if !core.migration.is_waiting_for_data() {
            core.protocol_fault(MigrationError::Unexpected("migrate data"));
            return;
        }
        let payload = match open_envelope(body, core.info.migrate_magic, core.info.migrate_version) {
            Ok(p) => p,
            Err(e) => {
                core.protocol_fault(e);
                return;
            }
        };
        match self.handler.migrate_data_serial(payload) {
            Ok(Some(serial)) => self.core.set_message_serial(serial),
            Ok(None) => {}
            Err(e) => {
                self.core.protocol_fault(e);
                return;
            }
        }
        if !self.handler.on_migrate_data(&mut self.core, payload) {
            self.core.protocol_fault(MigrationError::Rejected);
            return;
        }
        self.core.seamless_migration_done();
    }

    // ── Send ─────────────────────────────────────────────────────────────────

    /// Send queued items until the pipe empties, the transport blocks or the
    /// ack window closes. Reentrant calls are ignored.
    pub fn push(&mut self) {
        if self.core.during_send || !self.core.is_alive() {
            return;
        }
        self.core.during_send = true;

        if self.core.send_blocked {
            self.core.send();
        }
        while self.core.is_alive() && self.core.outgoing.is_none() {
            let Some(item) = self.core.next_item() else {
                break;
            };
            self.send_any_item(item);
        }

        let core = &mut self.core;
        if core.is_alive() && core.outgoing.is_none() && (core.pipe.is_empty() || core.is_waiting_for_ack()) {
            core.events.update_watch(WatchMask::READ);
        }
        core.during_send = false;
        self.finish_pending();
    }

    fn send_any_item(&mut self, item: Arc<PipeItem<H::Item>>) {
        self.core.send_item = Some(item.clone());
        match &*item {
            PipeItem::SetAck => self.core.marshal_set_ack(),
            PipeItem::Migrate => self.core.marshal_migrate(),
            PipeItem::EmptyMsg(msg_type) => self.core.init_send_data(*msg_type),
            PipeItem::Ping => self.core.marshal_ping(),
            PipeItem::Marker(_) => item.mark_reached(),
            PipeItem::Channel(inner) => self.handler.marshal_item(&mut self.core, inner),
        }
        if self.core.marshaller.is_pending() {
            self.core.begin_send_message();
        } else {
            self.core.send_item = None;
            self.core.marshaller.reset();
        }
    }

    // ── Timers ───────────────────────────────────────────────────────────────

    pub fn fire_expired_timers(&mut self, now: Instant) {
        for timer in self.core.events.take_expired(now) {
            self.on_timer(timer);
        }
        self.finish_pending();
    }

    fn on_timer(&mut self, timer: TimerId) {
        if Some(timer) == self.core.ping_timer {
            self.core.ping_timer_fired();
        } else if Some(timer) == self.core.connectivity_timer {
            self.core.connectivity_timer_fired();
        }
    }

    /// Start the connectivity watchdog with period `timeout`. Latency
    /// probing switches to the short interval and restarts from idle, so the
    /// watchdog always has fresh pongs to judge by.
    pub fn start_connectivity_monitoring(&mut self, timeout: Duration) {
        let core = &mut self.core;
        if !core.connected {
            return;
        }
        if core.ping_timer.is_none() {
            core.ping_timer = Some(core.events.create_timer());
        }
        core.cancel_ping_timer();
        core.latency.set_timeout(PING_TEST_TIMEOUT);
        if !core.at_migration_target {
            let idle = core.settings.idle_net_timeout;
            core.start_ping_timer(idle);
        }
        if core.connectivity_timer.is_none() {
            let timer = core.events.create_timer();
            core.connectivity_timer = Some(timer);
            core.connectivity = Some(ConnectivityMonitor::new(timeout));
            if !core.at_migration_target {
                core.events.arm(timer, timeout);
            }
            tracing::debug!(
                client = %core.id,
                timeout_ms = timeout.as_millis() as u64,
                "connectivity monitoring started"
            );
        }
    }

    /// Probe every 15 s while enabled, every 5 min otherwise. A running
    /// connectivity watchdog keeps the short interval.
    pub fn monitor_latency(&mut self, enabled: bool) {
        let enabled = enabled || self.core.connectivity_timer.is_some();
        let timeout = if enabled {
            PING_TEST_TIMEOUT
        } else {
            PING_TEST_LONG_TIMEOUT
        };
        self.core.latency.set_timeout(timeout);
        if enabled && self.core.latency.state() == PingState::TimerArmed {
            if let Some(timer) = self.core.ping_timer {
                self.core.events.arm(timer, timeout);
            }
        }
    }

    // ── Migration ────────────────────────────────────────────────────────────

    /// Source side: stop the watchdogs and queue MIGRATE.
    pub fn migrate(&mut self) {
        if !self.core.is_alive() {
            return;
        }
        self.core.remove_timers();
        self.handler.on_migrate(&mut self.core);
        self.core.pipe_add_type(PipeItem::Migrate);
        tracing::info!(client = %self.core.id, channel = ?self.core.info.kind, "migration started");
        self.finish_pending();
    }

    /// Destination side of a seamless migration. Returns whether the client
    /// now waits for migrate data.
    pub fn set_migration_seamless(&mut self) -> bool {
        let flags = self.core.info.migration;
        self.core.at_migration_target = true;
        let waiting = self.core.migration.expect_data(flags);
        if !waiting {
            self.core.at_migration_target = false;
            self.core.start_timers();
        }
        waiting
    }

    pub fn is_waiting_for_migrate_data(&self) -> bool {
        self.core.migration.is_waiting_for_data()
    }

    /// Destination side of a semi-seamless migration: the peer reconnected,
    /// start the timers that were held back.
    pub fn semi_seamless_migration_complete(&mut self) {
        if !self.core.at_migration_target {
            return;
        }
        self.core.at_migration_target = false;
        self.core.start_timers();
    }

    // ── Disconnect ───────────────────────────────────────────────────────────

    /// Tear the client down. Idempotent.
    pub fn disconnect(&mut self, reason: DisconnectReason) {
        let core = &mut self.core;
        core.pending_disconnect = None;
        if !core.connected {
            return;
        }
        match &reason {
            DisconnectReason::Liveness => tracing::warn!(
                client = %core.id,
                channel = ?core.info.kind,
                "peer unresponsive, disconnecting"
            ),
            DisconnectReason::Protocol(_) | DisconnectReason::Migration(_) => tracing::warn!(
                client = %core.id,
                channel = ?core.info.kind,
                %reason,
                "disconnecting"
            ),
            _ => tracing::info!(client = %core.id, channel = ?core.info.kind, %reason, "disconnecting"),
        }
        core.connected = false;
        core.remove_timers();
        core.events.remove_watch();
        let dropped = core.pipe.drain().len();
        core.outgoing = None;
        core.send_item = None;
        core.marshaller.reset();
        core.send_blocked = false;
        core.stream.shutdown();
        tracing::debug!(client = %core.id, dropped, "pipe cleared");
        self.handler.on_disconnect(&mut self.core);
        self.core.pending_disconnect = None;
    }

    // ── Blocking waits ───────────────────────────────────────────────────────

    /// Block until the item at `pos` has been sent. Not for use from a
    /// reactor callback.
    pub fn wait_pipe_item_sent(&mut self, pos: Position, timeout: Duration) -> bool {
        let marker = PipeItem::marker();
        if self.core.pipe.insert_after(pos, marker.clone()).is_none() {
            // Already popped: at most it is still being written.
            return self.wait_outgoing_item(timeout);
        }
        let deadline = std::time::Instant::now() + timeout;
        loop {
            self.receive();
            self.push();
            if marker.marker_reached() || !self.core.connected {
                break;
            }
            if std::time::Instant::now() >= deadline {
                break;
            }
            std::thread::sleep(CHANNEL_BLOCKED_SLEEP);
        }
        let reached = marker.marker_reached();
        if !reached {
            self.core.pipe.remove_item(&marker);
        }
        reached
    }

    /// Block until the message currently being written has gone out.
    pub fn wait_outgoing_item(&mut self, timeout: Duration) -> bool {
        if !self.core.send_blocked {
            return true;
        }
        let deadline = std::time::Instant::now() + timeout;
        loop {
            std::thread::sleep(CHANNEL_BLOCKED_SLEEP);
            self.receive();
            self.push();
            if !self.core.send_blocked || !self.core.connected {
                break;
            }
            if std::time::Instant::now() >= deadline {
                break;
            }
        }
        !self.core.send_blocked && self.core.connected
    }
}

impl<H: ChannelHandler> fmt::Debug for ChannelClient<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelClient")
            .field("id", &self.core.id)
            .field("kind", &self.core.info.kind)
            .field("channel_id", &self.core.info.id)
            .field("connected", &self.core.connected)
            .field("pipe", &self.core.pipe.len())
            .finish()
    }
}

//! Cursor channel: pointer shape, position and visibility.
//!
//! Each client mirrors the peer's cursor-shape cache (256 entries, one unit
//! per shape). A shape already cached goes out as a reference; a new one is
//! sent with CACHE_ME. Shapes evicted to make room are invalidated on the
//! peer with INVAL_ONE, queued next.

use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, Bytes};
use static_assertions::assert_eq_size;
use zerocopy::byteorder::{LittleEndian, I16};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use vista_core::caps;
use vista_core::wire::{content_id, ChannelKind, Le16, Le32, Le64};

use crate::cache::BoundedCache;
use crate::channel::{Channel, SharedClient};
use crate::client::{ChannelClient, ChannelHandler, ChannelInfo, ClientCore};
use crate::migration::MigrateFlags;
use crate::pipe::PipeItem;

pub const CLIENT_CURSOR_CACHE_SIZE: i64 = 256;

/// How long `reset` waits for clients to drain.
pub const COMMON_CLIENT_TIMEOUT: Duration = Duration::from_secs(30);

pub mod msg {
    pub const INIT: u16 = 101;
    pub const RESET: u16 = 102;
    pub const SET: u16 = 103;
    pub const MOVE: u16 = 104;
    pub const HIDE: u16 = 105;
    pub const TRAIL: u16 = 106;
    pub const INVAL_ONE: u16 = 107;
    pub const INVAL_ALL: u16 = 108;
}

pub mod flags {
    pub const NONE: u16 = 1 << 0;
    pub const CACHE_ME: u16 = 1 << 1;
    pub const FROM_CACHE: u16 = 1 << 2;
}

type LeI16 = I16<LittleEndian>;

/// Shape descriptor preceding the pixel data. With FROM_CACHE only `unique`
/// is meaningful and no data follows.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct CursorDescriptor {
    pub flags: Le16,
    pub unique: Le64,
    pub width: Le16,
    pub height: Le16,
    pub hot_x: Le16,
    pub hot_y: Le16,
    pub data_size: Le32,
}

assert_eq_size!(CursorDescriptor, [u8; 22]);

#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
struct WirePoint {
    x: LeI16,
    y: LeI16,
}

assert_eq_size!(WirePoint, [u8; 4]);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Point {
    pub x: i16,
    pub y: i16,
}

impl Point {
    fn wire(self) -> WirePoint {
        WirePoint {
            x: LeI16::new(self.x),
            y: LeI16::new(self.y),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorShape {
    /// Cache key. Zero marks a shape that must not be cached.
    pub unique: u64,
    pub width: u16,
    pub height: u16,
    pub hot_x: u16,
    pub hot_y: u16,
    pub data: Bytes,
}

impl CursorShape {
    /// A cacheable shape keyed by its content.
    pub fn new(width: u16, height: u16, hot_x: u16, hot_y: u16, data: Bytes) -> Self {
        Self {
            unique: content_id(&data),
            width,
            height,
            hot_x,
            hot_y,
            data,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CursorCommand {
    Set {
        position: Point,
        visible: bool,
        shape: Arc<CursorShape>,
    },
    Move(Point),
    Hide,
    Trail {
        length: u16,
        frequency: u16,
    },
}

/// Channel-wide cursor state, replayed to clients on INIT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorState {
    pub visible: bool,
    pub position: Point,
    pub trail_length: u16,
    pub trail_frequency: u16,
    pub shape: Option<Arc<CursorShape>>,
}

impl Default for CursorState {
    fn default() -> Self {
        Self {
            visible: true,
            position: Point::default(),
            trail_length: 0,
            trail_frequency: 0,
            shape: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CursorItem {
    Init(CursorState),
    Command(CursorCommand),
    InvalOne(u64),
    InvalAll,
}

// ── Per-client handler ───────────────────────────────────────────────────────

#[derive(Debug)]
pub struct CursorHandler {
    cache: BoundedCache,
    cache_size: i64,
}

impl Default for CursorHandler {
    fn default() -> Self {
        Self::new(CLIENT_CURSOR_CACHE_SIZE)
    }
}

impl CursorHandler {
    pub fn new(cache_size: i64) -> Self {
        Self {
            cache: BoundedCache::new(cache_size),
            cache_size,
        }
    }

    pub fn cache(&self) -> &BoundedCache {
        &self.cache
    }

    fn reset_cache(&mut self) {
        self.cache.reset(self.cache_size);
    }

    /// Append the shape descriptor, consulting and updating the cache.
    fn fill(&mut self, core: &mut ClientCore<CursorItem>, shape: Option<&CursorShape>) {
        let Some(shape) = shape else {
            let none = CursorDescriptor {
                flags: Le16::new(flags::NONE),
                ..CursorDescriptor::new_zeroed()
            };
            core.body().put_slice(none.as_bytes());
            return;
        };

        let mut desc_flags = 0;
        let mut send_data = true;
        if shape.unique != 0 && core.has_capability(caps::cursor::CURSOR_CACHE) {
            if self.cache.lookup(shape.unique).is_some() {
                desc_flags |= flags::FROM_CACHE;
                send_data = false;
            } else {
                let mut evicted = Vec::new();
                if self.cache.add(shape.unique, 1, (), |id, _| evicted.push(id)) {
                    desc_flags |= flags::CACHE_ME;
                }
                for id in evicted {
                    core.pipe_add_front(CursorItem::InvalOne(id));
                }
            }
        }

        let data_size = if send_data { shape.data.len() } else { 0 };
        let desc = CursorDescriptor {
            flags: Le16::new(desc_flags),
            unique: Le64::new(shape.unique),
            width: Le16::new(shape.width),
            height: Le16::new(shape.height),
            hot_x: Le16::new(shape.hot_x),
            hot_y: Le16::new(shape.hot_y),
            data_size: Le32::new(data_size as u32),
        };
        let body = core.body();
        body.put_slice(desc.as_bytes());
        if send_data {
            body.put_slice(&shape.data);
        }
    }
}

impl ChannelHandler for CursorHandler {
    type Item = CursorItem;

    fn handle_message(&mut self, core: &mut ClientCore<CursorItem>, msg_type: u16, _body: &[u8]) -> bool {
        tracing::warn!(client = %core.id(), msg_type, "unexpected cursor channel message");
        false
    }

    fn marshal_item(&mut self, core: &mut ClientCore<CursorItem>, item: &CursorItem) {
        match item {
            CursorItem::Init(state) => {
                self.reset_cache();
                core.init_send_data(msg::INIT);
                let body = core.body();
                body.put_slice(state.position.wire().as_bytes());
                body.put_u16_le(state.trail_length);
                body.put_u16_le(state.trail_frequency);
                body.put_u8(u8::from(state.visible));
                self.fill(core, state.shape.as_deref());
            }
            CursorItem::Command(CursorCommand::Set {
                position,
                visible,
                shape,
            }) => {
                core.init_send_data(msg::SET);
                let body = core.body();
                body.put_slice(position.wire().as_bytes());
                body.put_u8(u8::from(*visible));
                self.fill(core, Some(shape));
            }
            CursorItem::Command(CursorCommand::Move(position)) => {
                core.init_send_data(msg::MOVE);
                core.body().put_slice(position.wire().as_bytes());
            }
            CursorItem::Command(CursorCommand::Hide) => core.init_send_data(msg::HIDE),
            CursorItem::Command(CursorCommand::Trail { length, frequency }) => {
                core.init_send_data(msg::TRAIL);
                let body = core.body();
                body.put_u16_le(*length);
                body.put_u16_le(*frequency);
            }
            CursorItem::InvalOne(id) => {
                core.init_send_data(msg::INVAL_ONE);
                core.body().put_u64_le(*id);
            }
            CursorItem::InvalAll => {
                self.reset_cache();
                core.init_send_data(msg::INVAL_ALL);
            }
        }
    }

    fn on_disconnect(&mut self, _core: &mut ClientCore<CursorItem>) {
        self.reset_cache();
    }

    fn on_migrate(&mut self, core: &mut ClientCore<CursorItem>) {
        // The destination starts with an empty cache.
        core.pipe_add(CursorItem::InvalAll);
    }
}

// ── Channel ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MouseMode {
    #[default]
    Server,
    Client,
}

pub fn cursor_channel_info(id: u8) -> ChannelInfo {
    ChannelInfo {
        kind: ChannelKind::Cursor,
        id,
        migration: MigrateFlags::NONE,
        handle_acks: true,
        migrate_magic: 0,
        migrate_version: 0,
    }
}

pub struct CursorChannel {
    channel: Channel<CursorHandler>,
    state: CursorState,
    /// The last SET, shared by every pipe it is queued on.
    current: Option<Arc<PipeItem<CursorItem>>>,
    mouse_mode: MouseMode,
    during_target_migrate: bool,
}

impl CursorChannel {
    pub fn new(id: u8) -> Self {
        Self {
            channel: Channel::new(cursor_channel_info(id)),
            state: CursorState::default(),
            current: None,
            mouse_mode: MouseMode::default(),
            during_target_migrate: false,
        }
    }

    pub fn channel(&self) -> &Channel<CursorHandler> {
        &self.channel
    }

    pub fn channel_mut(&mut self) -> &mut Channel<CursorHandler> {
        &mut self.channel
    }

    pub fn state(&self) -> &CursorState {
        &self.state
    }

    pub fn set_mouse_mode(&mut self, mode: MouseMode) {
        self.mouse_mode = mode;
    }

    pub fn set_during_target_migrate(&mut self, during: bool) {
        self.during_target_migrate = during;
    }

    /// Adopt a client and, outside of migration, send it the current state.
    pub fn add_client(&mut self, client: ChannelClient<CursorHandler>) -> SharedClient<CursorHandler> {
        let migrating = self.during_target_migrate || client.core().is_migration_target();
        let shared = self.channel.add_client(client);
        if !migrating {
            shared
                .borrow_mut()
                .core_mut()
                .pipe_add(CursorItem::Init(self.state.clone()));
        }
        shared
    }

    /// Apply a guest cursor command and forward it to the clients.
    pub fn process_cmd(&mut self, cmd: CursorCommand) {
        let mut show = false;
        match &cmd {
            CursorCommand::Set { visible, shape, .. } => {
                self.state.visible = *visible;
                self.state.shape = Some(shape.clone());
            }
            CursorCommand::Move(position) => {
                show = !self.state.visible;
                self.state.visible = true;
                self.state.position = *position;
            }
            CursorCommand::Hide => self.state.visible = false,
            CursorCommand::Trail { length, frequency } => {
                self.state.trail_length = *length;
                self.state.trail_frequency = *frequency;
            }
        }

        let is_move = matches!(cmd, CursorCommand::Move(_));
        let is_set = matches!(cmd, CursorCommand::Set { .. });
        let item = Arc::new(PipeItem::Channel(CursorItem::Command(cmd)));
        if is_set {
            self.current = Some(item.clone());
        }
        // In client mouse mode the peer draws moves itself.
        if self.mouse_mode == MouseMode::Server || !is_move || show {
            self.channel.pipes_add_shared(item);
        }
    }

    /// Re-queue the current shape on clients that do not have it pending.
    pub fn resend_current(&self) -> usize {
        let Some(current) = self.current.as_ref() else {
            return 0;
        };
        let mut added = 0;
        for client in self.channel.clients() {
            let mut client = client.borrow_mut();
            let core = client.core_mut();
            if !core.pipe_contains(current) && core.pipe_add_shared(current.clone()).is_some() {
                added += 1;
            }
        }
        added
    }

    /// Forget all cursor state and clear the peers' caches.
    pub fn reset(&mut self) {
        self.state = CursorState::default();
        self.current = None;
        if !self.channel.is_connected() {
            return;
        }
        self.channel.pipes_add(CursorItem::InvalAll);
        if !self.during_target_migrate {
            self.channel.pipes_add_empty_msg(msg::RESET);
        }
        self.channel.wait_all_sent(COMMON_CLIENT_TIMEOUT);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientSettings;
    use crate::memory::{self, MemoryPeer};
    use vista_core::wire::{read_struct, HeaderKind};
    use vista_core::Capabilities;

    fn join(channel: &mut CursorChannel, cache_size: i64) -> (SharedClient<CursorHandler>, MemoryPeer) {
        let (transport, peer) = memory::pair(HeaderKind::Full);
        let client = ChannelClient::new(
            channel.channel().info().clone(),
            Capabilities::from_bits(&[], &[caps::cursor::CURSOR_CACHE]),
            Box::new(transport),
            ClientSettings::default(),
            CursorHandler::new(cache_size),
        );
        (channel.add_client(client), peer)
    }

    fn shape(tag: u8) -> Arc<CursorShape> {
        Arc::new(CursorShape::new(2, 2, 0, 0, Bytes::from(vec![tag; 16])))
    }

    fn set(tag: u8) -> CursorCommand {
        CursorCommand::Set {
            position: Point { x: 1, y: 2 },
            visible: true,
            shape: shape(tag),
        }
    }

    /// Descriptor flags of a SET body.
    fn set_flags(body: &[u8]) -> u16 {
        let desc: CursorDescriptor = read_struct(&body[5..]).unwrap();
        desc.flags.get()
    }

    #[test]
    fn second_set_of_same_shape_comes_from_cache() {
        let mut channel = CursorChannel::new(0);
        let (client, mut peer) = join(&mut channel, 8);
        channel.process_cmd(set(1));
        channel.process_cmd(set(1));
        client.borrow_mut().push();

        let sets: Vec<_> = peer
            .recv()
            .into_iter()
            .filter(|(h, _)| h.msg_type == msg::SET)
            .collect();
        assert_eq!(sets.len(), 2);
        assert_eq!(set_flags(&sets[0].1), flags::CACHE_ME);
        assert_eq!(set_flags(&sets[1].1), flags::FROM_CACHE);
        assert_eq!(sets[1].1.len(), 5 + 22);
    }

    #[test]
    fn eviction_queues_invalidation_next() {
        let mut channel = CursorChannel::new(0);
        let (client, mut peer) = join(&mut channel, 1);
        channel.process_cmd(set(1));
        channel.process_cmd(set(2));
        client.borrow_mut().push();

        let types: Vec<u16> = peer.recv().iter().map(|(h, _)| h.msg_type).collect();
        let second_set = types.iter().rposition(|t| *t == msg::SET).unwrap();
        assert_eq!(types[second_set + 1], msg::INVAL_ONE);
        assert_eq!(client.borrow().handler().cache().len(), 1);
    }

    #[test]
    fn client_mouse_mode_drops_moves_unless_showing() {
        let mut channel = CursorChannel::new(0);
        let (client, _peer) = join(&mut channel, 8);
        channel.set_mouse_mode(MouseMode::Client);
        let before = client.borrow().pipe_len();
        channel.process_cmd(CursorCommand::Move(Point { x: 5, y: 5 }));
        assert_eq!(client.borrow().pipe_len(), before);

        channel.process_cmd(CursorCommand::Hide);
        channel.process_cmd(CursorCommand::Move(Point { x: 6, y: 6 }));
        assert_eq!(client.borrow().pipe_len(), before + 2);
        assert!(channel.state().visible);
    }

    #[test]
    fn migrate_invalidates_cache_before_migrate_message() {
        let mut channel = CursorChannel::new(0);
        let (client, mut peer) = join(&mut channel, 8);
        client.borrow_mut().push();
        peer.recv();

        client.borrow_mut().migrate();
        client.borrow_mut().push();
        let types: Vec<u16> = peer.recv().iter().map(|(h, _)| h.msg_type).collect();
        assert_eq!(types, vec![msg::INVAL_ALL, vista_core::wire::msg::MIGRATE]);
    }

    #[test]
    fn resend_current_shares_the_set_item() {
        let mut channel = CursorChannel::new(0);
        let (client, _peer) = join(&mut channel, 8);
        channel.process_cmd(set(3));
        assert_eq!(channel.resend_current(), 0);
        client.borrow_mut().push();
        assert_eq!(channel.resend_current(), 1);
    }
}

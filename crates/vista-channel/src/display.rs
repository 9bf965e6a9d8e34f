//! Display channel: drawing commands and the peer's image caches.
//!
//! Two caches are mirrored per client. The palette cache is private to the
//! client, counted in entries. The pixmap cache is shared by every display
//! channel of one peer (see `shared_cache`); the peer names it in its INIT
//! message and all its display channels resolve to the same instance.
//!
//! Adding an image to the shared cache can evict items another channel
//! referenced recently. The ids go out in an INVAL_LIST that the peer must
//! process before the message that caused the eviction, together with a
//! wait-for-channels list naming the other channels' serials. With full
//! headers both ride as sub-messages of the drawing message; with mini
//! headers they are sent through the urgent path.

use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use static_assertions::assert_eq_size;
use zerocopy::byteorder::{LittleEndian, I32, I64};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use vista_core::caps;
use vista_core::wire::{self, read_struct, ChannelKind, HeaderKind, Le16, Le32, Le64, WaitForChannel};

use crate::cache::BoundedCache;
use crate::channel::{Channel, SharedClient};
use crate::client::{ChannelClient, ChannelHandler, ChannelInfo, ClientCore};
use crate::error::DisconnectReason;
use crate::migration::{write_envelope, CacheSnapshot, MigrateFlags, MigrationError};
use crate::shared_cache::{FreeList, PixmapCacheRegistry, SharedPixmapCache, MAX_CACHE_CLIENTS};

pub const DISPLAY_MIGRATE_MAGIC: u32 = u32::from_le_bytes(*b"VDSP");
pub const DISPLAY_MIGRATE_VERSION: u32 = 1;

/// Pixmap cache size for peers whose INIT does not announce one.
pub const DEFAULT_PIXMAP_CACHE_SIZE: i64 = 32 * 1024 * 1024;

pub mod msg {
    pub const INVAL_LIST: u16 = 105;
    pub const INVAL_ALL_PIXMAPS: u16 = 106;
    pub const INVAL_PALETTE: u16 = 107;
    pub const INVAL_ALL_PALETTES: u16 = 108;
    pub const DRAW_COPY: u16 = 304;
}

pub mod msgc {
    pub const INIT: u16 = 101;
}

/// Resource type of INVAL_LIST entries.
pub const RES_TYPE_PIXMAP: u8 = 1;

pub mod image_kind {
    pub const BITMAP: u8 = 0;
    pub const FROM_CACHE: u8 = 1;
    pub const FROM_CACHE_LOSSLESS: u8 = 2;
}

pub mod image_flags {
    pub const CACHE_ME: u8 = 1 << 0;
    pub const HIGH_BITS: u8 = 1 << 1;
    pub const CACHE_REPLACE_ME: u8 = 1 << 2;
}

pub mod palette_flags {
    pub const FROM_CACHE: u8 = 1 << 0;
    pub const CACHE_ME: u8 = 1 << 1;
}

type LeI32 = I32<LittleEndian>;
type LeI64 = I64<LittleEndian>;

// ── Wire ─────────────────────────────────────────────────────────────────────

/// Peer → server: which pixmap cache this channel uses.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct DisplayInit {
    pub pixmap_cache_id: u8,
    pub pixmap_cache_size: LeI64,
}

assert_eq_size!(DisplayInit, [u8; 9]);

#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct DrawBase {
    pub surface_id: Le32,
    pub left: LeI32,
    pub top: LeI32,
    pub right: LeI32,
    pub bottom: LeI32,
}

assert_eq_size!(DrawBase, [u8; 20]);

#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct ImageDescriptor {
    pub id: Le64,
    pub kind: u8,
    pub flags: u8,
    pub width: Le32,
    pub height: Le32,
}

assert_eq_size!(ImageDescriptor, [u8; 18]);

/// Follows a BITMAP descriptor. Palette entries (u32 each) come next unless
/// the palette is absent or FROM_CACHE, then `data_size` bytes of pixels.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct BitmapDescriptor {
    pub palette_flags: u8,
    pub palette_id: Le64,
    pub palette_entries: Le16,
    pub data_size: Le32,
}

assert_eq_size!(BitmapDescriptor, [u8; 15]);

#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct ResourceId {
    pub kind: u8,
    pub id: Le64,
}

assert_eq_size!(ResourceId, [u8; 9]);

/// Leading part of the display migrate-data payload. The pixmap and
/// palette cache snapshots follow.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct DisplayMigrateData {
    pub message_serial: Le64,
    pub pixmap_cache_id: u8,
    /// 0 when no pixmap cache was attached.
    pub pixmap_cache_size: LeI64,
    pub pixmap_cache_clients: [Le64; MAX_CACHE_CLIENTS],
}

assert_eq_size!(DisplayMigrateData, [u8; 49]);

// ── Drawing model ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Palette {
    /// Cache key. Zero disables caching.
    pub unique: u64,
    pub entries: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    pub id: u64,
    pub width: u32,
    pub height: u32,
    pub cacheable: bool,
    /// This rendition is lossy.
    pub lossy: bool,
    /// A lossy cached copy may stand in for this image.
    pub lossy_allowed: bool,
    pub high_bits: bool,
    pub palette: Option<Arc<Palette>>,
    pub data: Bytes,
}

impl Image {
    /// A lossless, cacheable bitmap keyed by its pixels.
    pub fn bitmap(width: u32, height: u32, data: Bytes) -> Self {
        Self {
            id: wire::content_id(&data),
            width,
            height,
            cacheable: true,
            lossy: false,
            lossy_allowed: true,
            high_bits: false,
            palette: None,
            data,
        }
    }

    /// Pixmap cache charge.
    pub fn cache_size(&self) -> i64 {
        i64::from(self.width) * i64::from(self.height)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrawCopy {
    pub surface_id: u32,
    pub bbox: Rect,
    pub image: Image,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisplayItem {
    Draw(Arc<DrawCopy>),
    InvalPalette(u64),
    InvalAllPalettes,
    /// Clear the shared pixmap cache and start a new generation.
    ResetPixmapCache,
    /// Catch up with a generation another channel started.
    PixmapSync,
    MigrateData,
}

// ── Per-client handler ───────────────────────────────────────────────────────

#[derive(Debug)]
pub struct DisplayHandler {
    registry: PixmapCacheRegistry,
    connection_id: u32,
    pixmap_cache: Option<Arc<SharedPixmapCache>>,
    /// Shared-cache generation this client's peer is known to be on.
    generation: u32,
    pending_sync: bool,
    expect_init: bool,
    palette_cache: BoundedCache,
    palette_cache_size: i64,
    default_pixmap_size: i64,
    /// Evictions caused by the message being built.
    free: FreeList,
    /// Pixmaps the message being built references.
    referenced: Vec<u64>,
}

impl DisplayHandler {
    pub fn new(registry: PixmapCacheRegistry, connection_id: u32, palette_cache_size: i64) -> Self {
        Self {
            registry,
            connection_id,
            pixmap_cache: None,
            generation: 0,
            pending_sync: false,
            expect_init: true,
            palette_cache: BoundedCache::new(palette_cache_size),
            palette_cache_size,
            default_pixmap_size: DEFAULT_PIXMAP_CACHE_SIZE,
            free: FreeList::default(),
            referenced: Vec::new(),
        }
    }

    pub fn with_default_pixmap_size(mut self, size: i64) -> Self {
        self.default_pixmap_size = size;
        self
    }

    pub fn pixmap_cache(&self) -> Option<&Arc<SharedPixmapCache>> {
        self.pixmap_cache.as_ref()
    }

    pub fn palette_cache(&self) -> &BoundedCache {
        &self.palette_cache
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    fn handle_init(&mut self, core: &mut ClientCore<DisplayItem>, body: &[u8]) -> bool {
        let init: DisplayInit = match read_struct(body) {
            Ok(init) => init,
            Err(e) => {
                tracing::warn!(client = %core.id(), error = %e, "bad display init");
                return false;
            }
        };
        if !self.expect_init || self.pixmap_cache.is_some() {
            tracing::warn!(client = %core.id(), "unexpected display init");
            return false;
        }
        if usize::from(core.channel_id()) >= MAX_CACHE_CLIENTS {
            tracing::warn!(
                client = %core.id(),
                channel_id = core.channel_id(),
                "display channel id out of pixmap cache range"
            );
            return false;
        }
        self.expect_init = false;
        let size = match init.pixmap_cache_size.get() {
            size if size > 0 => size,
            _ => self.default_pixmap_size,
        };
        let cache = self
            .registry
            .get_or_create(self.connection_id, init.pixmap_cache_id, size);
        self.generation = cache.generation();
        tracing::debug!(
            client = %core.id(),
            cache_id = init.pixmap_cache_id,
            size = cache.size(),
            "pixmap cache attached"
        );
        self.pixmap_cache = Some(cache);
        true
    }

    // ── Marshalling ──────────────────────────────────────────────────────────

    fn marshal_draw(&mut self, core: &mut ClientCore<DisplayItem>, draw: &DrawCopy) {
        self.free.clear();
        self.referenced.clear();
        core.init_send_data(msg::DRAW_COPY);
        let base = DrawBase {
            surface_id: Le32::new(draw.surface_id),
            left: LeI32::new(draw.bbox.left),
            top: LeI32::new(draw.bbox.top),
            right: LeI32::new(draw.bbox.right),
            bottom: LeI32::new(draw.bbox.bottom),
        };
        core.body().put_slice(base.as_bytes());
        self.fill_image(core, &draw.image);
        if !self.free.is_empty() {
            self.send_free_list(core);
        }
    }

    fn fill_image(&mut self, core: &mut ClientCore<DisplayItem>, image: &Image) {
        let mut kind = image_kind::BITMAP;
        let mut flags = if image.high_bits {
            image_flags::HIGH_BITS
        } else {
            0
        };

        if let (true, Some(cache)) = (image.cacheable, self.pixmap_cache.clone()) {
            let index = usize::from(core.channel_id());
            let serial = core.message_serial();
            if cache.generation() != self.generation {
                // Uncached until the peer catches up with the new generation.
                if !self.pending_sync {
                    core.pipe_add(DisplayItem::PixmapSync);
                    self.pending_sync = true;
                }
            } else {
                match cache.hit(index, image.id, serial) {
                    Some(cached_lossy) if image.lossy_allowed || !cached_lossy => {
                        kind = if cached_lossy {
                            image_kind::FROM_CACHE
                        } else {
                            image_kind::FROM_CACHE_LOSSLESS
                        };
                        self.referenced.push(image.id);
                    }
                    Some(_) => {
                        cache.set_lossy(image.id, image.lossy);
                        flags |= image_flags::CACHE_REPLACE_ME;
                        self.referenced.push(image.id);
                    }
                    None => {
                        if cache.add(index, image.id, image.cache_size(), image.lossy, serial, &mut self.free) {
                            flags |= image_flags::CACHE_ME;
                            self.referenced.push(image.id);
                        }
                    }
                }
            }
        }

        let desc = ImageDescriptor {
            id: Le64::new(image.id),
            kind,
            flags,
            width: Le32::new(image.width),
            height: Le32::new(image.height),
        };
        core.body().put_slice(desc.as_bytes());
        if kind == image_kind::BITMAP {
            self.fill_bitmap(core, image);
        }
    }

    fn fill_bitmap(&mut self, core: &mut ClientCore<DisplayItem>, image: &Image) {
        let mut pal_flags = 0;
        let mut pal_id = 0;
        let mut entries: &[u32] = &[];
        if let Some(palette) = image.palette.as_deref() {
            pal_id = palette.unique;
            entries = &palette.entries;
            if palette.unique != 0 && core.has_capability(caps::display::PALETTE_CACHE) {
                if self.palette_cache.lookup(palette.unique).is_some() {
                    pal_flags |= palette_flags::FROM_CACHE;
                    entries = &[];
                } else {
                    let mut evicted = Vec::new();
                    if self.palette_cache.add(palette.unique, 1, (), |id, _| evicted.push(id)) {
                        pal_flags |= palette_flags::CACHE_ME;
                    }
                    for id in evicted {
                        core.pipe_add_front(DisplayItem::InvalPalette(id));
                    }
                }
            }
        }

        let bitmap = BitmapDescriptor {
            palette_flags: pal_flags,
            palette_id: Le64::new(pal_id),
            palette_entries: Le16::new(entries.len() as u16),
            data_size: Le32::new(image.data.len() as u32),
        };
        let body = core.body();
        body.put_slice(bitmap.as_bytes());
        for entry in entries {
            body.put_u32_le(*entry);
        }
        body.put_slice(&image.data);
    }

    /// Tell the peer about the pixmaps evicted while building this message,
    /// ahead of the message itself.
    fn send_free_list(&mut self, core: &mut ClientCore<DisplayItem>) {
        let own = usize::from(core.channel_id());
        let inval = encode_inval_list(&self.free.ids);
        let wait = self.free.wait_list(own);
        let wait = (!wait.is_empty()).then(|| encode_wait_list(&wait));
        tracing::trace!(
            client = %core.id(),
            evicted = self.free.ids.len(),
            wait = wait.is_some(),
            "sending pixmap free list"
        );

        match core.header_kind() {
            HeaderKind::Full => {
                let body = core.body();
                let mut offsets = Vec::with_capacity(2);
                if let Some(wait) = &wait {
                    offsets.push(body.len() as u32);
                    put_sub_message(body, wire::msg::WAIT_FOR_CHANNELS, wait);
                }
                offsets.push(body.len() as u32);
                put_sub_message(body, msg::INVAL_LIST, &inval);
                let table = body.len() as u32;
                body.put_u16_le(offsets.len() as u16);
                for offset in offsets {
                    body.put_u32_le(offset);
                }
                if let Err(e) = core.set_header_sub_list(table) {
                    core.request_disconnect(DisconnectReason::Protocol(e));
                }
            }
            HeaderKind::Mini => {
                core.switch_to_urgent_sender();
                // The drawing message now goes out one serial later.
                if let Some(cache) = &self.pixmap_cache {
                    let serial = core.message_serial();
                    for id in &self.referenced {
                        cache.hit(own, *id, serial);
                    }
                }
                match wait {
                    None => {
                        core.init_send_data(msg::INVAL_LIST);
                        core.body().put_slice(&inval);
                    }
                    Some(wait) => {
                        core.init_send_data(wire::msg::LIST);
                        let body = core.body();
                        let table_len = 2 + 2 * 4;
                        let wait_at = table_len as u32;
                        let inval_at = wait_at + 6 + wait.len() as u32;
                        body.put_u16_le(2);
                        body.put_u32_le(wait_at);
                        body.put_u32_le(inval_at);
                        put_sub_message(body, wire::msg::WAIT_FOR_CHANNELS, &wait);
                        put_sub_message(body, msg::INVAL_LIST, &inval);
                    }
                }
            }
        }
        self.free.clear();
    }

    fn marshal_reset_pixmap_cache(&mut self, core: &mut ClientCore<DisplayItem>) {
        let Some(cache) = self.pixmap_cache.clone() else {
            return;
        };
        let own = usize::from(core.channel_id());
        let reset = cache.clear_and_regenerate(own, core.message_serial());
        self.generation = reset.generation;
        self.pending_sync = false;
        core.init_send_data(msg::INVAL_ALL_PIXMAPS);
        core.body().put_slice(&encode_wait_list(&reset.wait));
        tracing::debug!(
            client = %core.id(),
            generation = reset.generation,
            waiting = reset.wait.len(),
            "pixmap cache reset"
        );
    }

    fn marshal_pixmap_sync(&mut self, core: &mut ClientCore<DisplayItem>) {
        let Some(cache) = self.pixmap_cache.as_ref() else {
            return;
        };
        let (generation, initiator) = cache.generation_point();
        self.generation = generation;
        self.pending_sync = false;
        core.init_send_data(wire::msg::WAIT_FOR_CHANNELS);
        core.body().put_slice(&encode_wait_list(&[initiator]));
    }

    fn marshal_migrate_data(&mut self, core: &mut ClientCore<DisplayItem>) {
        let serial = core.message_serial();
        core.init_send_data(wire::msg::MIGRATE_DATA);
        let (cache_id, cache_size, clients, pixmaps) = match &self.pixmap_cache {
            Some(cache) => (cache.id(), cache.size(), cache.sync_serials(), cache.snapshot()),
            None => (0, 0, [0; MAX_CACHE_CLIENTS], CacheSnapshot::default()),
        };
        let header = DisplayMigrateData {
            message_serial: Le64::new(serial),
            pixmap_cache_id: cache_id,
            pixmap_cache_size: LeI64::new(cache_size),
            pixmap_cache_clients: clients.map(Le64::new),
        };
        let body = core.body();
        write_envelope(body, DISPLAY_MIGRATE_MAGIC, DISPLAY_MIGRATE_VERSION);
        body.put_slice(header.as_bytes());
        pixmaps.encode(body);
        self.palette_cache.snapshot().encode(body);
        tracing::info!(
            client = %core.id(),
            serial,
            pixmaps = pixmaps.items.len(),
            palettes = self.palette_cache.len(),
            "display migrate data sent"
        );
    }

    fn restore(&mut self, core: &mut ClientCore<DisplayItem>, payload: &[u8]) -> Result<(), MigrationError> {
        let header: DisplayMigrateData = read_struct(payload).map_err(|_| MigrationError::Truncated)?;
        let mut rest = &payload[std::mem::size_of::<DisplayMigrateData>()..];
        let pixmaps = CacheSnapshot::decode(&mut rest)?;
        let palettes = CacheSnapshot::decode(&mut rest)?;

        let size = header.pixmap_cache_size.get();
        if size > 0 {
            if usize::from(core.channel_id()) >= MAX_CACHE_CLIENTS {
                return Err(MigrationError::ChannelOutOfRange(core.channel_id()));
            }
            let cache = self
                .registry
                .get_or_create(self.connection_id, header.pixmap_cache_id, size);
            if !cache.restore_if_empty(&pixmaps) {
                tracing::debug!(client = %core.id(), "pixmap cache already restored by a sibling channel");
            }
            cache.merge_sync(&header.pixmap_cache_clients.map(|s| s.get()));
            self.generation = cache.generation();
            self.pixmap_cache = Some(cache);
            self.expect_init = false;
        }
        self.palette_cache.restore(&palettes);
        Ok(())
    }
}

impl ChannelHandler for DisplayHandler {
    type Item = DisplayItem;

    fn handle_message(&mut self, core: &mut ClientCore<DisplayItem>, msg_type: u16, body: &[u8]) -> bool {
        match msg_type {
            msgc::INIT => self.handle_init(core, body),
            other => {
                tracing::warn!(client = %core.id(), msg_type = other, "unexpected display channel message");
                false
            }
        }
    }

    fn marshal_item(&mut self, core: &mut ClientCore<DisplayItem>, item: &DisplayItem) {
        match item {
            DisplayItem::Draw(draw) => self.marshal_draw(core, draw),
            DisplayItem::InvalPalette(id) => {
                core.init_send_data(msg::INVAL_PALETTE);
                core.body().put_u64_le(*id);
            }
            DisplayItem::InvalAllPalettes => {
                self.palette_cache.reset(self.palette_cache_size);
                core.init_send_data(msg::INVAL_ALL_PALETTES);
            }
            DisplayItem::ResetPixmapCache => self.marshal_reset_pixmap_cache(core),
            DisplayItem::PixmapSync => self.marshal_pixmap_sync(core),
            DisplayItem::MigrateData => self.marshal_migrate_data(core),
        }
    }

    fn on_disconnect(&mut self, _core: &mut ClientCore<DisplayItem>) {
        self.pixmap_cache = None;
        self.palette_cache.reset(self.palette_cache_size);
        self.free.clear();
        self.referenced.clear();
    }

    fn on_migrate_flush_mark(&mut self, core: &mut ClientCore<DisplayItem>) {
        core.pipe_add(DisplayItem::MigrateData);
    }

    fn migrate_data_serial(&self, payload: &[u8]) -> Result<Option<u64>, MigrationError> {
        // The payload carries the serial of the migrate-data message itself.
        let header: DisplayMigrateData = read_struct(payload).map_err(|_| MigrationError::Truncated)?;
        let serial = header.message_serial.get();
        serial
            .checked_add(1)
            .map(Some)
            .ok_or(MigrationError::SerialOverflow(serial))
    }

    fn on_migrate_data(&mut self, core: &mut ClientCore<DisplayItem>, payload: &[u8]) -> bool {
        match self.restore(core, payload) {
            Ok(()) => {
                tracing::info!(client = %core.id(), "display state restored from migrate data");
                true
            }
            Err(e) => {
                tracing::warn!(client = %core.id(), error = %e, "bad display migrate data");
                false
            }
        }
    }
}

fn put_sub_message(body: &mut BytesMut, msg_type: u16, data: &[u8]) {
    body.put_u16_le(msg_type);
    body.put_u32_le(data.len() as u32);
    body.put_slice(data);
}

fn encode_inval_list(ids: &[u64]) -> BytesMut {
    let mut out = BytesMut::with_capacity(2 + ids.len() * 9);
    out.put_u16_le(ids.len() as u16);
    for id in ids {
        let res = ResourceId {
            kind: RES_TYPE_PIXMAP,
            id: Le64::new(*id),
        };
        out.put_slice(res.as_bytes());
    }
    out
}

fn encode_wait_list(wait: &[(usize, u64)]) -> BytesMut {
    let mut out = BytesMut::with_capacity(1 + wait.len() * 10);
    out.put_u8(wait.len() as u8);
    for &(index, serial) in wait {
        let entry = WaitForChannel {
            channel_type: ChannelKind::Display.into(),
            channel_id: index as u8,
            message_serial: Le64::new(serial),
        };
        out.put_slice(entry.as_bytes());
    }
    out
}

// ── Channel ──────────────────────────────────────────────────────────────────

pub fn display_channel_info(id: u8) -> ChannelInfo {
    ChannelInfo {
        kind: ChannelKind::Display,
        id,
        migration: MigrateFlags::FULL,
        handle_acks: true,
        migrate_magic: DISPLAY_MIGRATE_MAGIC,
        migrate_version: DISPLAY_MIGRATE_VERSION,
    }
}

pub struct DisplayChannel {
    channel: Channel<DisplayHandler>,
    registry: PixmapCacheRegistry,
    palette_cache_size: i64,
    default_pixmap_size: i64,
}

impl DisplayChannel {
    pub fn new(id: u8, registry: PixmapCacheRegistry, palette_cache_size: i64) -> Self {
        Self {
            channel: Channel::new(display_channel_info(id)),
            registry,
            palette_cache_size,
            default_pixmap_size: DEFAULT_PIXMAP_CACHE_SIZE,
        }
    }

    pub fn set_default_pixmap_cache_size(&mut self, size: i64) {
        self.default_pixmap_size = size;
    }

    pub fn channel(&self) -> &Channel<DisplayHandler> {
        &self.channel
    }

    pub fn channel_mut(&mut self) -> &mut Channel<DisplayHandler> {
        &mut self.channel
    }

    pub fn registry(&self) -> &PixmapCacheRegistry {
        &self.registry
    }

    /// Handler for a new client of peer connection `connection_id`.
    pub fn handler(&self, connection_id: u32) -> DisplayHandler {
        DisplayHandler::new(self.registry.clone(), connection_id, self.palette_cache_size)
            .with_default_pixmap_size(self.default_pixmap_size)
    }

    pub fn add_client(&mut self, client: ChannelClient<DisplayHandler>) -> SharedClient<DisplayHandler> {
        self.channel.add_client(client)
    }

    /// Queue a drawing on every client.
    pub fn draw(&self, draw: DrawCopy) -> usize {
        self.channel.pipes_add(DisplayItem::Draw(Arc::new(draw)))
    }

    /// Drop every client's palette and pixmap cache.
    pub fn reset_caches(&self) {
        self.channel.pipes_add(DisplayItem::InvalAllPalettes);
        self.channel
            .pipes_new_add(|core| core.has_capability(caps::display::PIXMAP_CACHE).then_some(DisplayItem::ResetPixmapCache));
    }

    /// Forget disconnected clients and the caches nobody holds any more.
    pub fn reap(&mut self) -> usize {
        let gone = self.channel.reap();
        if gone > 0 {
            self.registry.prune();
        }
        gone
    }
}

//! Worker threads.
//!
//! Each worker is an OS thread running a current-thread tokio runtime with a
//! `LocalSet`. It owns the cursor and display channels routed to it and every
//! client on them; nothing outside the thread touches a client. The control
//! thread talks to it through `WorkerCommand`s.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::LocalSet;

use vista_channel::cursor::{CursorChannel, CursorHandler};
use vista_channel::display::{DisplayChannel, DisplayHandler};
use vista_channel::driver::drive;
use vista_channel::transport::{self, IoHandle, Transport};
use vista_channel::{ChannelClient, ChannelHandler, ClientSettings, PixmapCacheRegistry, SharedClient};
use vista_core::config::CacheConfig;
use vista_core::{ChannelKind, VistaConfig};

use crate::link::LinkRequest;
use crate::registry::{ConnectionKey, ConnectionMeta, ConnectionTable};

/// A handshaken stream on its way to a worker. Carried as a std socket so it
/// can be re-registered with the worker's own runtime.
#[derive(Debug)]
pub enum AcceptedStream {
    Tcp(std::net::TcpStream),
    Unix(std::os::unix::net::UnixStream),
}

impl AcceptedStream {
    fn into_transport(self) -> io::Result<(Box<dyn Transport>, IoHandle)> {
        match self {
            AcceptedStream::Tcp(s) => {
                s.set_nonblocking(true)?;
                Ok(transport::tcp(tokio::net::TcpStream::from_std(s)?))
            }
            AcceptedStream::Unix(s) => {
                s.set_nonblocking(true)?;
                Ok(transport::unix(tokio::net::UnixStream::from_std(s)?))
            }
        }
    }
}

#[derive(Debug)]
pub enum WorkerCommand {
    /// Adopt a stream whose link handshake succeeded.
    Attach {
        stream: AcceptedStream,
        link: LinkRequest,
        reply: oneshot::Sender<io::Result<ConnectionKey>>,
    },
    /// Start migrating every client of peer session `connection_id`.
    Migrate {
        connection_id: u32,
        reply: oneshot::Sender<Vec<ChannelOutcome>>,
    },
}

/// Result of asking one channel client to migrate.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ChannelOutcome {
    pub channel: String,
    pub channel_id: u8,
    pub worker: usize,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ChannelOutcome {
    pub fn failed(channel: String, channel_id: u8, worker: usize, error: impl Into<String>) -> Self {
        Self {
            channel,
            channel_id,
            worker,
            ok: false,
            error: Some(error.into()),
        }
    }
}

enum AttachedClient {
    Cursor(SharedClient<CursorHandler>),
    Display(SharedClient<DisplayHandler>),
}

struct Attached {
    connection_id: u32,
    channel_id: u8,
    client: AttachedClient,
}

fn next_key() -> ConnectionKey {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

pub struct Worker {
    index: usize,
    settings: ClientSettings,
    cache: CacheConfig,
    monitor_latency: bool,
    registry: PixmapCacheRegistry,
    connections: ConnectionTable,
    cursors: HashMap<u8, CursorChannel>,
    displays: HashMap<u8, DisplayChannel>,
    attached: HashMap<ConnectionKey, Attached>,
    shutdown: broadcast::Sender<()>,
    closed_tx: mpsc::UnboundedSender<ConnectionKey>,
    closed_rx: mpsc::UnboundedReceiver<ConnectionKey>,
}

impl Worker {
    pub fn new(
        index: usize,
        config: &VistaConfig,
        registry: PixmapCacheRegistry,
        connections: ConnectionTable,
        shutdown: broadcast::Sender<()>,
    ) -> Self {
        let (closed_tx, closed_rx) = mpsc::unbounded_channel();
        Self {
            index,
            settings: ClientSettings::from_config(config),
            cache: config.cache.clone(),
            monitor_latency: config.liveness.monitor_latency,
            registry,
            connections,
            cursors: HashMap::new(),
            displays: HashMap::new(),
            attached: HashMap::new(),
            shutdown,
            closed_tx,
            closed_rx,
        }
    }

    /// Start worker `index` on its own thread. The worker is built there,
    /// since its clients never leave it; the returned sender is the only way
    /// in.
    pub fn spawn(
        index: usize,
        config: VistaConfig,
        registry: PixmapCacheRegistry,
        connections: ConnectionTable,
        shutdown: broadcast::Sender<()>,
    ) -> io::Result<(mpsc::UnboundedSender<WorkerCommand>, thread::JoinHandle<()>)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = thread::Builder::new()
            .name(format!("vista-worker-{index}"))
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                    Ok(rt) => rt,
                    Err(e) => {
                        tracing::error!(worker = index, error = %e, "failed to build worker runtime");
                        return;
                    }
                };
                let worker = Worker::new(index, &config, registry, connections, shutdown);
                let local = LocalSet::new();
                local.block_on(&rt, worker.run(rx));
            })?;
        Ok((tx, handle))
    }

    /// Serve commands until the control side goes away or shutdown fires.
    pub async fn run(mut self, mut commands: mpsc::UnboundedReceiver<WorkerCommand>) {
        let mut shutdown = self.shutdown.subscribe();
        tracing::info!(worker = self.index, "worker started");
        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(cmd) => self.handle(cmd),
                    None => break,
                },
                Some(key) = self.closed_rx.recv() => self.on_closed(key),
                _ = shutdown.recv() => break,
            }
        }

        // Drivers see the same shutdown signal; give them a turn to say
        // goodbye before the LocalSet drops them.
        tokio::task::yield_now().await;
        for key in self.attached.keys() {
            self.connections.remove(key);
        }
        tracing::info!(worker = self.index, clients = self.client_count(), "worker stopped");
    }

    fn handle(&mut self, cmd: WorkerCommand) {
        match cmd {
            WorkerCommand::Attach { stream, link, reply } => {
                let result = self.attach(stream, &link);
                if let Err(e) = &result {
                    tracing::warn!(worker = self.index, channel = ?link.kind, error = %e, "attach failed");
                }
                let _ = reply.send(result);
            }
            WorkerCommand::Migrate { connection_id, reply } => {
                let _ = reply.send(self.migrate(connection_id));
            }
        }
    }

    fn settings_for(&self, link: &LinkRequest) -> ClientSettings {
        let mut settings = self.settings.clone();
        settings.migration_target = link.is_migration_target();
        settings
    }

    pub fn attach(&mut self, stream: AcceptedStream, link: &LinkRequest) -> io::Result<ConnectionKey> {
        let (transport, io) = stream.into_transport()?;
        let settings = self.settings_for(link);
        let id = link.channel_id;

        let (client, shared_peer) = match link.kind {
            ChannelKind::Cursor => {
                let channel = self.cursors.entry(id).or_insert_with(|| CursorChannel::new(id));
                let client = ChannelClient::new(
                    channel.channel().info().clone(),
                    link.caps.clone(),
                    transport,
                    settings,
                    CursorHandler::new(self.cache.cursor_cache_size),
                );
                let shared = channel.add_client(client);
                let peer = shared.borrow().core().peer();
                (AttachedClient::Cursor(shared), peer)
            }
            ChannelKind::Display => {
                let registry = self.registry.clone();
                let cache = &self.cache;
                let channel = self.displays.entry(id).or_insert_with(|| {
                    let mut channel = DisplayChannel::new(id, registry, cache.palette_cache_size);
                    channel.set_default_pixmap_cache_size(cache.pixmap_cache_size);
                    channel
                });
                let client = ChannelClient::new(
                    channel.channel().info().clone(),
                    link.caps.clone(),
                    transport,
                    settings,
                    channel.handler(link.connection_id),
                );
                let shared = channel.add_client(client);
                let peer = shared.borrow().core().peer();
                (AttachedClient::Display(shared), peer)
            }
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    format!("no handler for {other} channels"),
                ))
            }
        };

        let key = next_key();
        let client_id = match &client {
            AttachedClient::Cursor(c) => self.start(c, io, link, key),
            AttachedClient::Display(c) => self.start(c, io, link, key),
        };
        self.connections.insert(
            key,
            ConnectionMeta::new(
                link.connection_id,
                shared_peer.clone(),
                link.kind,
                id,
                self.index,
                client_id,
                link.is_migration_target(),
            ),
        );
        self.attached.insert(
            key,
            Attached {
                connection_id: link.connection_id,
                channel_id: id,
                client,
            },
        );
        tracing::info!(
            worker = self.index,
            channel = ?link.kind,
            channel_id = id,
            connection_id = link.connection_id,
            peer = %shared_peer,
            "client attached"
        );
        Ok(key)
    }

    /// Finish the handshake side of a new client and hand it to a driver.
    fn start<H: ChannelHandler + 'static>(
        &self,
        shared: &SharedClient<H>,
        io: IoHandle,
        link: &LinkRequest,
        key: ConnectionKey,
    ) -> String {
        let client_id = {
            let mut client = shared.borrow_mut();
            client.monitor_latency(self.monitor_latency);
            if link.is_migration_target() {
                if link.is_seamless() {
                    client.set_migration_seamless();
                } else {
                    client.semi_seamless_migration_complete();
                }
            }
            client.id().to_string()
        };

        let shared = shared.clone();
        let shutdown = self.shutdown.subscribe();
        let closed = self.closed_tx.clone();
        tokio::task::spawn_local(async move {
            drive(shared, io, shutdown).await;
            let _ = closed.send(key);
        });
        client_id
    }

    fn on_closed(&mut self, key: ConnectionKey) {
        self.connections.remove(&key);
        let Some(gone) = self.attached.remove(&key) else {
            return;
        };
        match gone.client {
            AttachedClient::Cursor(_) => {
                if let Some(channel) = self.cursors.get_mut(&gone.channel_id) {
                    channel.channel_mut().reap();
                }
            }
            AttachedClient::Display(_) => {
                if let Some(channel) = self.displays.get_mut(&gone.channel_id) {
                    channel.reap();
                }
            }
        }
        tracing::debug!(worker = self.index, key, connection_id = gone.connection_id, "client reaped");
    }

    /// Ask every client of `connection_id` on this worker to migrate.
    pub fn migrate(&mut self, connection_id: u32) -> Vec<ChannelOutcome> {
        let mut outcomes: Vec<ChannelOutcome> = self
            .attached
            .values()
            .filter(|a| a.connection_id == connection_id)
            .map(|a| match &a.client {
                AttachedClient::Cursor(c) => migrate_one(c, ChannelKind::Cursor, a.channel_id, self.index),
                AttachedClient::Display(c) => migrate_one(c, ChannelKind::Display, a.channel_id, self.index),
            })
            .collect();
        outcomes.sort_by(|a, b| (a.channel.as_str(), a.channel_id).cmp(&(b.channel.as_str(), b.channel_id)));
        outcomes
    }

    pub fn client_count(&self) -> usize {
        self.attached.len()
    }
}

fn migrate_one<H: ChannelHandler>(
    client: &SharedClient<H>,
    kind: ChannelKind,
    channel_id: u8,
    worker: usize,
) -> ChannelOutcome {
    let mut client = client.borrow_mut();
    if !client.is_connected() {
        return ChannelOutcome::failed(kind.to_string(), channel_id, worker, "client is disconnected");
    }
    client.migrate();
    // A fault while queueing the migrate message disconnects the client.
    if !client.is_connected() {
        return ChannelOutcome::failed(kind.to_string(), channel_id, worker, "client disconnected while migrating");
    }
    ChannelOutcome {
        channel: kind.to_string(),
        channel_id,
        worker,
        ok: true,
        error: None,
    }
}

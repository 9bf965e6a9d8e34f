//! A channel: every client of one channel type and id on one worker.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use crate::client::{ChannelClient, ChannelHandler, ChannelInfo, ClientCore, ClientId, CHANNEL_BLOCKED_SLEEP};
use crate::error::DisconnectReason;
use crate::pipe::PipeItem;

/// A client shared between its channel and its driver task.
pub type SharedClient<H> = Rc<RefCell<ChannelClient<H>>>;

pub struct Channel<H: ChannelHandler> {
    info: ChannelInfo,
    clients: Vec<SharedClient<H>>,
}

impl<H: ChannelHandler> Channel<H> {
    pub fn new(info: ChannelInfo) -> Self {
        Self {
            info,
            clients: Vec::new(),
        }
    }

    pub fn info(&self) -> &ChannelInfo {
        &self.info
    }

    pub fn clients(&self) -> &[SharedClient<H>] {
        &self.clients
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn is_connected(&self) -> bool {
        self.clients.iter().any(|c| c.borrow().is_connected())
    }

    /// Adopt a freshly linked client and run its connect sequence.
    pub fn add_client(&mut self, client: ChannelClient<H>) -> SharedClient<H> {
        let shared = Rc::new(RefCell::new(client));
        shared.borrow_mut().on_connect();
        tracing::debug!(
            client = %shared.borrow().id(),
            channel = ?self.info.kind,
            channel_id = self.info.id,
            clients = self.clients.len() + 1,
            "client added"
        );
        self.clients.push(shared.clone());
        shared
    }

    pub fn find(&self, id: ClientId) -> Option<SharedClient<H>> {
        self.clients.iter().find(|c| c.borrow().id() == id).cloned()
    }

    pub fn remove_client(&mut self, id: ClientId) -> Option<SharedClient<H>> {
        let index = self.clients.iter().position(|c| c.borrow().id() == id)?;
        Some(self.clients.remove(index))
    }

    /// Drop clients that have disconnected. Returns how many went.
    pub fn reap(&mut self) -> usize {
        let before = self.clients.len();
        self.clients.retain(|c| c.borrow().is_connected());
        before - self.clients.len()
    }

    // ── Broadcast ────────────────────────────────────────────────────────────

    /// Queue one shared item on every client. Returns how many took it.
    pub fn pipes_add(&self, item: H::Item) -> usize {
        self.pipes_add_shared(Arc::new(PipeItem::Channel(item)))
    }

    pub fn pipes_add_shared(&self, item: Arc<PipeItem<H::Item>>) -> usize {
        self.clients
            .iter()
            .filter(|c| c.borrow_mut().core_mut().pipe_add_shared(item.clone()).is_some())
            .count()
    }

    pub fn pipes_add_empty_msg(&self, msg_type: u16) -> usize {
        let item = Arc::new(PipeItem::EmptyMsg(msg_type));
        self.pipes_add_shared(item)
    }

    /// Queue a per-client item built by `creator`; `None` skips the client.
    pub fn pipes_new_add(&self, mut creator: impl FnMut(&ClientCore<H::Item>) -> Option<H::Item>) -> usize {
        let mut added = 0;
        for client in &self.clients {
            let mut client = client.borrow_mut();
            let Some(item) = creator(client.core()) else {
                continue;
            };
            if client.core_mut().pipe_add(item).is_some() {
                added += 1;
            }
        }
        added
    }

    pub fn push_all(&self) {
        for client in &self.clients {
            client.borrow_mut().push();
        }
    }

    pub fn receive_all(&self) {
        for client in &self.clients {
            client.borrow_mut().receive();
        }
    }

    // ── Queue statistics ─────────────────────────────────────────────────────

    pub fn max_pipe_size(&self) -> usize {
        self.clients
            .iter()
            .map(|c| c.borrow().pipe_len())
            .max()
            .unwrap_or(0)
    }

    pub fn sum_pipes_size(&self) -> usize {
        self.clients.iter().map(|c| c.borrow().pipe_len()).sum()
    }

    /// True if there is at least one client and every client is send-blocked.
    pub fn all_blocked(&self) -> bool {
        !self.clients.is_empty() && self.clients.iter().all(|c| c.borrow().is_blocked())
    }

    pub fn any_blocked(&self) -> bool {
        self.clients.iter().any(|c| c.borrow().is_blocked())
    }

    /// Every client advertises channel capability `bit`.
    pub fn test_remote_cap(&self, bit: u32) -> bool {
        self.clients.iter().all(|c| c.borrow().has_capability(bit))
    }

    pub fn is_waiting_for_migrate_data(&self) -> bool {
        self.clients
            .iter()
            .any(|c| c.borrow().is_waiting_for_migrate_data())
    }

    // ── Blocking ─────────────────────────────────────────────────────────────

    /// Spin receive/push until every pipe is drained. On timeout, clients
    /// still holding output are disconnected and false is returned.
    pub fn wait_all_sent(&self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            self.push_all();
            self.receive_all();
            if self.clients.iter().all(|c| !has_pending_output(&c.borrow())) {
                return true;
            }
            if std::time::Instant::now() >= deadline {
                break;
            }
            std::thread::sleep(CHANNEL_BLOCKED_SLEEP);
        }
        for client in &self.clients {
            let pending = has_pending_output(&client.borrow());
            if pending {
                tracing::warn!(
                    client = %client.borrow().id(),
                    channel = ?self.info.kind,
                    "output not drained in time"
                );
                client.borrow_mut().disconnect(DisconnectReason::Timeout);
            }
        }
        false
    }

    // ── Lifecycle ────────────────────────────────────────────────────────────

    pub fn disconnect_all(&self, reason: DisconnectReason) {
        for client in &self.clients {
            client.borrow_mut().disconnect(reason.clone());
        }
    }

    pub fn migrate_all(&self) {
        for client in &self.clients {
            client.borrow_mut().migrate();
        }
    }
}

fn has_pending_output<H: ChannelHandler>(client: &ChannelClient<H>) -> bool {
    client.is_connected() && (client.pipe_len() > 0 || !client.core().no_item_being_sent())
}

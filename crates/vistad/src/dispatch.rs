//! Routes handshaken streams and control requests to worker threads.

use std::io;
use std::sync::Mutex;
use std::thread;

use tokio::sync::{broadcast, mpsc, oneshot};

use vista_channel::PixmapCacheRegistry;
use vista_core::VistaConfig;

use crate::link::LinkRequest;
use crate::registry::{ConnectionKey, ConnectionTable};
use crate::worker::{AcceptedStream, ChannelOutcome, Worker, WorkerCommand};

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("worker {0} is gone")]
    WorkerGone(usize),

    #[error("worker {worker} refused the client: {source}")]
    Attach { worker: usize, source: io::Error },
}

/// Control-side handle to one worker.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    index: usize,
    tx: mpsc::UnboundedSender<WorkerCommand>,
}

impl WorkerHandle {
    pub fn new(index: usize, tx: mpsc::UnboundedSender<WorkerCommand>) -> Self {
        Self { index, tx }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub async fn attach(&self, stream: AcceptedStream, link: LinkRequest) -> Result<ConnectionKey, DispatchError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(WorkerCommand::Attach { stream, link, reply })
            .map_err(|_| DispatchError::WorkerGone(self.index))?;
        rx.await
            .map_err(|_| DispatchError::WorkerGone(self.index))?
            .map_err(|source| DispatchError::Attach {
                worker: self.index,
                source,
            })
    }

    pub async fn migrate(&self, connection_id: u32) -> Result<Vec<ChannelOutcome>, DispatchError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(WorkerCommand::Migrate { connection_id, reply })
            .map_err(|_| DispatchError::WorkerGone(self.index))?;
        rx.await.map_err(|_| DispatchError::WorkerGone(self.index))
    }
}

/// The set of worker threads. A display adapter (channel id) always lands on
/// the same worker.
pub struct WorkerPool {
    workers: Vec<WorkerHandle>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn start(
        config: &VistaConfig,
        registry: PixmapCacheRegistry,
        connections: ConnectionTable,
        shutdown: broadcast::Sender<()>,
    ) -> io::Result<Self> {
        let count = config.workers.count.max(1);
        let mut workers = Vec::with_capacity(count);
        let mut threads = Vec::with_capacity(count);
        for index in 0..count {
            let (tx, thread) = Worker::spawn(
                index,
                config.clone(),
                registry.clone(),
                connections.clone(),
                shutdown.clone(),
            )?;
            workers.push(WorkerHandle::new(index, tx));
            threads.push(thread);
        }
        tracing::info!(workers = count, "worker pool started");
        Ok(Self {
            workers,
            threads: Mutex::new(threads),
        })
    }

    pub fn from_handles(workers: Vec<WorkerHandle>) -> Self {
        Self {
            workers,
            threads: Mutex::new(Vec::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn handles(&self) -> &[WorkerHandle] {
        &self.workers
    }

    pub fn route(&self, channel_id: u8) -> Option<&WorkerHandle> {
        if self.workers.is_empty() {
            return None;
        }
        self.workers.get(usize::from(channel_id) % self.workers.len())
    }

    pub async fn attach(&self, stream: AcceptedStream, link: LinkRequest) -> Result<ConnectionKey, DispatchError> {
        let worker = self.route(link.channel_id).ok_or(DispatchError::WorkerGone(0))?;
        tracing::trace!(worker = worker.index(), channel_id = link.channel_id, "routing connection");
        worker.attach(stream, link).await
    }

    /// Wait for the worker threads after shutdown has been signalled.
    pub fn join(&self) {
        let threads = match self.threads.lock() {
            Ok(mut threads) => std::mem::take(&mut *threads),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for thread in threads {
            if thread.join().is_err() {
                tracing::error!("worker thread panicked");
            }
        }
    }
}

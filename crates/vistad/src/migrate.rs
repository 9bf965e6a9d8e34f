//! Process-level migration: start migrating every channel of one peer
//! session, wherever its clients live.

use std::sync::Arc;

use serde::Serialize;

use crate::dispatch::WorkerPool;
use crate::registry::{self, ConnectionTable};
use crate::worker::ChannelOutcome;

#[derive(Debug, Clone, Serialize)]
pub struct MigrationReport {
    pub connection_id: u32,
    pub channels: Vec<ChannelOutcome>,
    /// Every channel started migrating.
    pub complete: bool,
}

#[derive(Clone)]
pub struct MigrationCoordinator {
    pool: Arc<WorkerPool>,
    connections: ConnectionTable,
}

impl MigrationCoordinator {
    pub fn new(pool: Arc<WorkerPool>, connections: ConnectionTable) -> Self {
        Self { pool, connections }
    }

    /// Fan `Migrate` out to the workers holding clients of `connection_id`.
    /// A worker that fails to answer shows up as failed entries for the
    /// channels the registry says it holds; the others proceed.
    pub async fn migrate(&self, connection_id: u32) -> MigrationReport {
        let known = registry::for_session(&self.connections, connection_id);
        let mut workers: Vec<usize> = known.iter().map(|c| c.worker).collect();
        workers.sort_unstable();
        workers.dedup();

        let mut channels = Vec::new();
        for index in workers {
            let Some(handle) = self.pool.handles().get(index) else {
                continue;
            };
            match handle.migrate(connection_id).await {
                Ok(outcomes) => channels.extend(outcomes),
                Err(e) => {
                    tracing::warn!(worker = index, connection_id, error = %e, "migrate request failed");
                    channels.extend(
                        known
                            .iter()
                            .filter(|c| c.worker == index)
                            .map(|c| ChannelOutcome::failed(c.channel.clone(), c.channel_id, index, e.to_string())),
                    );
                }
            }
        }

        let complete = !channels.is_empty() && channels.iter().all(|c| c.ok);
        tracing::info!(connection_id, channels = channels.len(), complete, "migration requested");
        MigrationReport {
            connection_id,
            channels,
            complete,
        }
    }
}

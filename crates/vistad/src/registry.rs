//! Process-wide table of live channel connections, read by the API.

use std::sync::Arc;
use std::time::SystemTime;

use dashmap::DashMap;
use serde::Serialize;

use vista_core::ChannelKind;

/// Registry key, unique for the life of the process.
pub type ConnectionKey = u64;

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionMeta {
    /// Peer session id from the link message; shared by all channels of one
    /// peer.
    pub connection_id: u32,
    pub peer: String,
    pub channel: String,
    pub channel_id: u8,
    pub worker: usize,
    pub client: String,
    pub migration_target: bool,
    /// Seconds since the Unix epoch.
    pub established_at: u64,
}

impl ConnectionMeta {
    pub fn new(
        connection_id: u32,
        peer: String,
        kind: ChannelKind,
        channel_id: u8,
        worker: usize,
        client: String,
        migration_target: bool,
    ) -> Self {
        let established_at = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self {
            connection_id,
            peer,
            channel: kind.to_string(),
            channel_id,
            worker,
            client,
            migration_target,
            established_at,
        }
    }
}

pub type ConnectionTable = Arc<DashMap<ConnectionKey, ConnectionMeta>>;

pub fn new_connection_table() -> ConnectionTable {
    Arc::new(DashMap::new())
}

/// Connections belonging to peer session `connection_id`.
pub fn for_session(table: &ConnectionTable, connection_id: u32) -> Vec<ConnectionMeta> {
    let mut out: Vec<ConnectionMeta> = table
        .iter()
        .filter(|e| e.value().connection_id == connection_id)
        .map(|e| e.value().clone())
        .collect();
    out.sort_by(|a, b| (a.channel.as_str(), a.channel_id).cmp(&(b.channel.as_str(), b.channel_id)));
    out
}

//! Accept loops for the TCP and unix-socket listeners.
//!
//! Each accepted stream gets its own short-lived task for the link
//! handshake, then is handed to the worker that owns its channel id.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use socket2::SockRef;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::broadcast;

use crate::dispatch::WorkerPool;
use crate::link::{self, LinkRequest};
use crate::worker::AcceptedStream;

/// Time a peer gets to complete the link handshake.
pub const LINK_TIMEOUT: Duration = Duration::from_secs(10);

async fn handshake<S: AsyncRead + AsyncWrite + Unpin>(stream: &mut S) -> Result<LinkRequest> {
    tokio::time::timeout(LINK_TIMEOUT, link::accept(stream))
        .await
        .context("link handshake timed out")?
        .context("link handshake failed")
}

pub struct ChannelListener {
    pool: Arc<WorkerPool>,
    shutdown: broadcast::Receiver<()>,
}

impl ChannelListener {
    pub fn new(pool: Arc<WorkerPool>, shutdown: broadcast::Receiver<()>) -> Self {
        Self { pool, shutdown }
    }

    pub async fn run_tcp(mut self, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, addr) = tokio::select! {
                accepted = listener.accept() => accepted.context("tcp accept failed")?,
                _ = self.shutdown.recv() => return Ok(()),
            };
            let pool = self.pool.clone();
            tokio::spawn(async move {
                let mut stream = stream;
                if let Err(e) = stream.set_nodelay(true) {
                    tracing::debug!(peer = %addr, error = %e, "failed to set TCP_NODELAY");
                }
                if let Err(e) = SockRef::from(&stream).set_keepalive(true) {
                    tracing::debug!(peer = %addr, error = %e, "failed to enable keepalive");
                }
                let link = match handshake(&mut stream).await {
                    Ok(link) => link,
                    Err(e) => {
                        tracing::warn!(peer = %addr, error = %format!("{e:#}"), "rejected connection");
                        return;
                    }
                };
                let stream = match stream.into_std() {
                    Ok(stream) => AcceptedStream::Tcp(stream),
                    Err(e) => {
                        tracing::warn!(peer = %addr, error = %e, "failed to detach stream");
                        return;
                    }
                };
                route(&pool, stream, link, addr.to_string()).await;
            });
        }
    }

    pub async fn run_unix(mut self, listener: UnixListener) -> Result<()> {
        loop {
            let (stream, _) = tokio::select! {
                accepted = listener.accept() => accepted.context("unix accept failed")?,
                _ = self.shutdown.recv() => return Ok(()),
            };
            let pool = self.pool.clone();
            tokio::spawn(async move {
                let mut stream = stream;
                let link = match handshake(&mut stream).await {
                    Ok(link) => link,
                    Err(e) => {
                        tracing::warn!(error = %format!("{e:#}"), "rejected local connection");
                        return;
                    }
                };
                let stream = match stream.into_std() {
                    Ok(stream) => AcceptedStream::Unix(stream),
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to detach stream");
                        return;
                    }
                };
                route(&pool, stream, link, "local".to_string()).await;
            });
        }
    }
}

async fn route(pool: &WorkerPool, stream: AcceptedStream, link: LinkRequest, peer: String) {
    let kind = link.kind;
    let channel_id = link.channel_id;
    match pool.attach(stream, link).await {
        Ok(key) => tracing::debug!(peer, channel = ?kind, channel_id, key, "connection routed"),
        Err(e) => tracing::warn!(peer, channel = ?kind, channel_id, error = %e, "failed to route connection"),
    }
}

//! In-memory duplex transport.
//!
//! The server end plugs into a `ChannelClient`; the `MemoryPeer` end plays
//! the remote viewer. The peer can throttle how many bytes the server may
//! write, fake unsent socket bytes, and frame or parse whole messages.

use std::collections::VecDeque;
use std::io::{self, IoSlice};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use vista_core::wire::{HeaderKind, MessageHeader};

use crate::transport::{Transport, TransportKind};

#[derive(Debug, Default)]
struct Shared {
    to_server: VecDeque<u8>,
    to_peer: Vec<u8>,
    /// Remaining bytes the server may write. None = unlimited.
    write_budget: Option<usize>,
    peer_closed: bool,
    server_shutdown: bool,
    unsent: usize,
    nodelay: bool,
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct MemoryTransport {
    shared: Arc<Mutex<Shared>>,
}

#[derive(Clone)]
pub struct MemoryPeer {
    shared: Arc<Mutex<Shared>>,
    kind: HeaderKind,
    serial: u64,
    parsed: usize,
}

/// Create a connected server/peer pair framing with `kind` headers.
pub fn pair(kind: HeaderKind) -> (MemoryTransport, MemoryPeer) {
    let shared = Arc::new(Mutex::new(Shared::default()));
    (
        MemoryTransport { shared: shared.clone() },
        MemoryPeer {
            shared,
            kind,
            serial: 0,
            parsed: 0,
        },
    )
}

impl Transport for MemoryTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut s = lock(&self.shared);
        if s.to_server.is_empty() {
            return if s.peer_closed {
                Ok(0)
            } else {
                Err(io::ErrorKind::WouldBlock.into())
            };
        }
        let n = buf.len().min(s.to_server.len());
        for (dst, src) in buf.iter_mut().zip(s.to_server.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }

    fn write_vectored(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        let mut s = lock(&self.shared);
        if s.server_shutdown || s.peer_closed {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        let mut allowed = s.write_budget.unwrap_or(usize::MAX);
        if allowed == 0 {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let mut written = 0;
        for buf in bufs {
            let n = buf.len().min(allowed);
            s.to_peer.extend_from_slice(&buf[..n]);
            written += n;
            allowed -= n;
            if allowed == 0 {
                break;
            }
        }
        if let Some(budget) = s.write_budget.as_mut() {
            *budget -= written;
        }
        Ok(written)
    }

    fn shutdown(&mut self) {
        lock(&self.shared).server_shutdown = true;
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Memory
    }

    fn unsent_bytes(&self) -> Option<usize> {
        Some(lock(&self.shared).unsent)
    }

    fn nodelay(&self) -> Option<bool> {
        Some(lock(&self.shared).nodelay)
    }

    fn set_nodelay(&mut self, on: bool) -> io::Result<()> {
        lock(&self.shared).nodelay = on;
        Ok(())
    }

    fn peer(&self) -> String {
        "memory".to_string()
    }
}

impl MemoryPeer {
    /// Queue raw bytes for the server to read.
    pub fn send_raw(&self, bytes: &[u8]) {
        lock(&self.shared).to_server.extend(bytes.iter().copied());
    }

    /// Frame and queue one message.
    pub fn send(&mut self, msg_type: u16, body: &[u8]) {
        self.serial += 1;
        let header = MessageHeader {
            msg_type,
            size: body.len() as u32,
            serial: self.serial,
            sub_list: 0,
        };
        let mut buf = vec![0u8; self.kind.size()];
        // The buffer is sized for the header shape and sub_list is zero.
        if self.kind.write(&header, &mut buf).is_ok() {
            buf.extend_from_slice(body);
            self.send_raw(&buf);
        }
    }

    pub fn close(&self) {
        lock(&self.shared).peer_closed = true;
    }

    /// Limit further server writes to `budget` bytes. None lifts the limit.
    pub fn set_write_budget(&self, budget: Option<usize>) {
        lock(&self.shared).write_budget = budget;
    }

    /// Pretend the socket holds `n` unacknowledged bytes.
    pub fn set_unsent(&self, n: usize) {
        lock(&self.shared).unsent = n;
    }

    pub fn nodelay(&self) -> bool {
        lock(&self.shared).nodelay
    }

    pub fn set_nodelay(&self, on: bool) {
        lock(&self.shared).nodelay = on;
    }

    pub fn is_shutdown(&self) -> bool {
        lock(&self.shared).server_shutdown
    }

    /// Raw bytes written by the server so far.
    pub fn written(&self) -> Vec<u8> {
        lock(&self.shared).to_peer.clone()
    }

    /// Parse every complete message written since the last call.
    pub fn recv(&mut self) -> Vec<(MessageHeader, Vec<u8>)> {
        let data = self.written();
        let mut out = Vec::new();
        let header_size = self.kind.size();
        loop {
            let rest = &data[self.parsed..];
            let Ok(header) = self.kind.read(rest) else {
                break;
            };
            let end = header_size + header.size as usize;
            if rest.len() < end {
                break;
            }
            out.push((header, rest[header_size..end].to_vec()));
            self.parsed += end;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_budget_produces_partial_writes() {
        let (mut server, peer) = pair(HeaderKind::Full);
        peer.set_write_budget(Some(3));
        let n = server.write_vectored(&[IoSlice::new(b"ab"), IoSlice::new(b"cd")]).unwrap();
        assert_eq!(n, 3);
        let err = server.write_vectored(&[IoSlice::new(b"d")]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
        assert_eq!(peer.written(), b"abc");
    }

    #[test]
    fn read_reports_eof_only_after_close() {
        let (mut server, peer) = pair(HeaderKind::Mini);
        let mut buf = [0u8; 4];
        assert_eq!(server.read(&mut buf).unwrap_err().kind(), io::ErrorKind::WouldBlock);
        peer.send_raw(b"xy");
        peer.close();
        assert_eq!(server.read(&mut buf).unwrap(), 2);
        assert_eq!(server.read(&mut buf).unwrap(), 0);
    }
}

//! Byte-stream transports under a channel client.
//!
//! All calls are non-blocking: `WouldBlock` means "try again when the
//! reactor says the stream is ready". Partial reads and writes are normal.

use std::io::{self, IoSlice};
use std::net::Shutdown;
use std::sync::Arc;

use tokio::net::{TcpStream, UnixStream};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Tcp,
    Unix,
    Memory,
}

pub trait Transport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn write_vectored(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize>;

    /// Shut down both directions. Errors are ignored; the stream is going away.
    fn shutdown(&mut self);

    fn kind(&self) -> TransportKind;

    /// Bytes written but not yet acknowledged by the peer, when the platform
    /// can tell.
    fn unsent_bytes(&self) -> Option<usize> {
        None
    }

    fn nodelay(&self) -> Option<bool> {
        None
    }

    fn set_nodelay(&mut self, _on: bool) -> io::Result<()> {
        Ok(())
    }

    fn peer(&self) -> String;
}

// ── TCP ──────────────────────────────────────────────────────────────────────

pub struct TcpTransport {
    stream: Arc<TcpStream>,
    peer: String,
}

impl TcpTransport {
    pub fn new(stream: Arc<TcpStream>) -> Self {
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        Self { stream, peer }
    }
}

impl Transport for TcpTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.try_read(buf)
    }

    fn write_vectored(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        self.stream.try_write_vectored(bufs)
    }

    fn shutdown(&mut self) {
        let _ = socket2::SockRef::from(&*self.stream).shutdown(Shutdown::Both);
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Tcp
    }

    fn unsent_bytes(&self) -> Option<usize> {
        outq_len(&self.stream)
    }

    fn nodelay(&self) -> Option<bool> {
        self.stream.nodelay().ok()
    }

    fn set_nodelay(&mut self, on: bool) -> io::Result<()> {
        self.stream.set_nodelay(on)
    }

    fn peer(&self) -> String {
        self.peer.clone()
    }
}

#[cfg(target_os = "linux")]
fn outq_len(stream: &TcpStream) -> Option<usize> {
    use std::os::fd::AsRawFd;

    let mut pending: libc::c_int = 0;
    // SIOCOUTQ shares its request number with TIOCOUTQ.
    // Safety: the fd is owned by `stream` for the duration of the call and
    // `pending` is a valid c_int out-parameter.
    let rc = unsafe { libc::ioctl(stream.as_raw_fd(), libc::TIOCOUTQ, &mut pending) };
    if rc < 0 || pending < 0 {
        None
    } else {
        Some(pending as usize)
    }
}

#[cfg(not(target_os = "linux"))]
fn outq_len(_stream: &TcpStream) -> Option<usize> {
    None
}

// ── Unix ─────────────────────────────────────────────────────────────────────

pub struct UnixTransport {
    stream: Arc<UnixStream>,
}

impl UnixTransport {
    pub fn new(stream: Arc<UnixStream>) -> Self {
        Self { stream }
    }
}

impl Transport for UnixTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.try_read(buf)
    }

    fn write_vectored(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        self.stream.try_write_vectored(bufs)
    }

    fn shutdown(&mut self) {
        let _ = socket2::SockRef::from(&*self.stream).shutdown(Shutdown::Both);
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Unix
    }

    fn peer(&self) -> String {
        "unix".to_string()
    }
}

// ── Readiness ────────────────────────────────────────────────────────────────

/// Async readiness side of a stream, held by the driver task while the
/// transport itself lives inside the client.
#[derive(Clone)]
pub enum IoHandle {
    Tcp(Arc<TcpStream>),
    Unix(Arc<UnixStream>),
}

impl IoHandle {
    pub async fn readable(&self) -> io::Result<()> {
        match self {
            IoHandle::Tcp(s) => s.readable().await,
            IoHandle::Unix(s) => s.readable().await,
        }
    }

    pub async fn writable(&self) -> io::Result<()> {
        match self {
            IoHandle::Tcp(s) => s.writable().await,
            IoHandle::Unix(s) => s.writable().await,
        }
    }
}

/// Split a connected TCP stream into the client's transport and the
/// driver's readiness handle.
pub fn tcp(stream: TcpStream) -> (Box<dyn Transport>, IoHandle) {
    let stream = Arc::new(stream);
    (Box::new(TcpTransport::new(stream.clone())), IoHandle::Tcp(stream))
}

pub fn unix(stream: UnixStream) -> (Box<dyn Transport>, IoHandle) {
    let stream = Arc::new(stream);
    (Box::new(UnixTransport::new(stream.clone())), IoHandle::Unix(stream))
}

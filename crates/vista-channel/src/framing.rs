//! Message framing on top of a non-blocking stream.
//!
//! Receive side: header bytes accumulate until complete, then a body buffer
//! is allocated and filled, then the message is handed out. Any read may
//! stop at any byte boundary.
//!
//! Send side: a `Marshaller` builds the message under construction (and an
//! optional urgent message that overtakes it), and an `OutgoingBuffer`
//! streams one encoded message with a tracked offset.

use std::io::IoSlice;

use bytes::{Bytes, BytesMut};

use vista_core::wire::{HeaderKind, MessageHeader, WireError, FULL_HEADER_SIZE};

use crate::error::FramingError;

// ── Receive ──────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct IncomingBuffer {
    kind: HeaderKind,
    header: [u8; FULL_HEADER_SIZE],
    header_pos: usize,
    current: Option<MessageHeader>,
    body: Option<BytesMut>,
    body_pos: usize,
}

impl IncomingBuffer {
    pub fn new(kind: HeaderKind) -> Self {
        Self {
            kind,
            header: [0u8; FULL_HEADER_SIZE],
            header_pos: 0,
            current: None,
            body: None,
            body_pos: 0,
        }
    }

    pub fn header_complete(&self) -> bool {
        self.header_pos == self.kind.size()
    }

    /// Unfilled tail of the header.
    pub fn header_remaining(&mut self) -> &mut [u8] {
        let end = self.kind.size();
        &mut self.header[self.header_pos..end]
    }

    pub fn advance_header(&mut self, n: usize) {
        self.header_pos = (self.header_pos + n).min(self.kind.size());
    }

    /// Decode the completed header. Cached, so repeated calls while waiting
    /// for a receive buffer are cheap.
    pub fn parse_header(&mut self) -> Result<MessageHeader, WireError> {
        if let Some(h) = self.current {
            return Ok(h);
        }
        let h = self.kind.read(&self.header[..self.kind.size()])?;
        self.current = Some(h);
        Ok(h)
    }

    pub fn has_body(&self) -> bool {
        self.body.is_some()
    }

    pub fn set_body(&mut self, body: BytesMut) {
        self.body = Some(body);
        self.body_pos = 0;
    }

    pub fn body_complete(&self) -> bool {
        self.body
            .as_ref()
            .map(|b| self.body_pos == b.len())
            .unwrap_or(false)
    }

    pub fn body_remaining(&mut self) -> Option<&mut [u8]> {
        let pos = self.body_pos;
        self.body.as_mut().map(|b| &mut b[pos..])
    }

    pub fn advance_body(&mut self, n: usize) {
        if let Some(b) = self.body.as_ref() {
            self.body_pos = (self.body_pos + n).min(b.len());
        }
    }

    /// Hand out the completed message and rearm for the next header.
    pub fn take_message(&mut self) -> Option<(MessageHeader, BytesMut)> {
        if !self.body_complete() {
            return None;
        }
        let header = self.current.take()?;
        let body = self.body.take()?;
        self.header_pos = 0;
        self.body_pos = 0;
        Some((header, body))
    }
}

// ── Send ─────────────────────────────────────────────────────────────────────

/// A message under construction. The header is an owned value so it
/// survives an urgent detour.
#[derive(Debug, Default)]
pub struct PendingMessage {
    pub header: MessageHeader,
    pub body: BytesMut,
    initialized: bool,
}

impl PendingMessage {
    fn init(&mut self, msg_type: u16) {
        self.header = MessageHeader {
            msg_type,
            ..MessageHeader::default()
        };
        self.body.clear();
        self.initialized = true;
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }
}

/// Builds the main message and, on request, one urgent message that is
/// sent ahead of it.
#[derive(Debug)]
pub struct Marshaller {
    kind: HeaderKind,
    main: PendingMessage,
    urgent: Option<PendingMessage>,
}

impl Marshaller {
    pub fn new(kind: HeaderKind) -> Self {
        Self {
            kind,
            main: PendingMessage::default(),
            urgent: None,
        }
    }

    fn active(&mut self) -> &mut PendingMessage {
        match self.urgent.as_mut() {
            Some(u) => u,
            None => &mut self.main,
        }
    }

    /// Start the active message with `msg_type`.
    pub fn init(&mut self, msg_type: u16) {
        self.active().init(msg_type);
    }

    /// Body of the active message.
    pub fn body(&mut self) -> &mut BytesMut {
        &mut self.active().body
    }

    /// Route further writes to a second message that goes out first.
    pub fn switch_to_urgent(&mut self) {
        if self.urgent.is_none() {
            self.urgent = Some(PendingMessage::default());
        }
    }

    pub fn has_urgent(&self) -> bool {
        self.urgent.is_some()
    }

    pub fn is_pending(&self) -> bool {
        self.main.initialized || self.urgent.as_ref().map(|u| u.initialized).unwrap_or(false)
    }

    /// Sub-list offset of the active message. Full headers only.
    pub fn set_sub_list(&mut self, offset: u32) -> Result<(), WireError> {
        if !self.kind.has_serial() {
            return Err(WireError::SubListOnMiniHeader);
        }
        self.active().header.sub_list = offset;
        Ok(())
    }

    /// Take the next message to stream: the urgent one if present, else main.
    pub fn take_next(&mut self) -> Option<PendingMessage> {
        if let Some(urgent) = self.urgent.take() {
            if urgent.initialized {
                return Some(urgent);
            }
        }
        if self.main.initialized {
            return Some(std::mem::take(&mut self.main));
        }
        None
    }

    pub fn reset(&mut self) {
        self.main = PendingMessage::default();
        self.urgent = None;
    }
}

/// One encoded message being written out.
#[derive(Debug)]
pub struct OutgoingBuffer {
    header: [u8; FULL_HEADER_SIZE],
    header_len: usize,
    body: Bytes,
    pos: usize,
}

fn body_size(len: usize) -> Result<u32, FramingError> {
    u32::try_from(len).map_err(|_| FramingError::BodyTooLarge(len))
}

impl OutgoingBuffer {
    pub fn new(kind: HeaderKind, message: PendingMessage) -> Result<Self, FramingError> {
        let mut header = [0u8; FULL_HEADER_SIZE];
        let mut h = message.header;
        h.size = body_size(message.body.len())?;
        let header_len = kind.write(&h, &mut header)?;
        Ok(Self {
            header,
            header_len,
            body: message.body.freeze(),
            pos: 0,
        })
    }

    pub fn total(&self) -> usize {
        self.header_len + self.body.len()
    }

    pub fn is_complete(&self) -> bool {
        self.pos == self.total()
    }

    /// Unwritten remainder as at most two slices.
    pub fn remaining(&self) -> Vec<IoSlice<'_>> {
        let mut out = Vec::with_capacity(2);
        if self.pos < self.header_len {
            out.push(IoSlice::new(&self.header[self.pos..self.header_len]));
            if !self.body.is_empty() {
                out.push(IoSlice::new(&self.body));
            }
        } else {
            let off = self.pos - self.header_len;
            if off < self.body.len() {
                out.push(IoSlice::new(&self.body[off..]));
            }
        }
        out
    }

    pub fn advance(&mut self, n: usize) {
        self.pos = (self.pos + n).min(self.total());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;

    #[test]
    fn header_assembles_across_partial_reads() {
        let mut incoming = IncomingBuffer::new(HeaderKind::Mini);
        let header = MessageHeader {
            msg_type: 2,
            size: 3,
            serial: 0,
            sub_list: 0,
        };
        let mut raw = [0u8; 6];
        HeaderKind::Mini.write(&header, &mut raw).unwrap();

        incoming.header_remaining()[..4].copy_from_slice(&raw[..4]);
        incoming.advance_header(4);
        assert!(!incoming.header_complete());
        incoming.header_remaining().copy_from_slice(&raw[4..]);
        incoming.advance_header(2);
        assert!(incoming.header_complete());
        assert_eq!(incoming.parse_header().unwrap().size, 3);

        incoming.set_body(BytesMut::zeroed(3));
        incoming.body_remaining().unwrap().copy_from_slice(b"abc");
        incoming.advance_body(3);
        let (h, body) = incoming.take_message().unwrap();
        assert_eq!(h.msg_type, 2);
        assert_eq!(&body[..], b"abc");
        assert!(!incoming.header_complete());
    }

    #[test]
    fn urgent_message_goes_first_and_main_header_survives() {
        let mut m = Marshaller::new(HeaderKind::Full);
        m.init(304);
        m.body().put_u32_le(7);
        m.switch_to_urgent();
        m.init(105);
        m.body().put_u16_le(1);

        let first = m.take_next().unwrap();
        assert_eq!(first.header.msg_type, 105);
        let second = m.take_next().unwrap();
        assert_eq!(second.header.msg_type, 304);
        assert_eq!(&second.body[..], &7u32.to_le_bytes());
        assert!(m.take_next().is_none());
    }

    #[test]
    fn sub_list_requires_full_header() {
        let mut m = Marshaller::new(HeaderKind::Mini);
        m.init(8);
        assert_eq!(m.set_sub_list(6), Err(WireError::SubListOnMiniHeader));
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn body_size_must_fit_the_header_field() {
        assert_eq!(body_size(5), Ok(5));
        assert_eq!(body_size(u32::MAX as usize), Ok(u32::MAX));
        let over = u32::MAX as usize + 1;
        assert_eq!(body_size(over), Err(FramingError::BodyTooLarge(over)));
    }

    #[test]
    fn outgoing_buffer_tracks_partial_writes() {
        let mut m = Marshaller::new(HeaderKind::Mini);
        m.init(4);
        m.body().put_slice(b"hello");
        let mut out = OutgoingBuffer::new(HeaderKind::Mini, m.take_next().unwrap()).unwrap();
        assert_eq!(out.total(), 11);
        out.advance(4);
        let rest: usize = out.remaining().iter().map(|s| s.len()).sum();
        assert_eq!(rest, 7);
        out.advance(7);
        assert!(out.is_complete());
        assert!(out.remaining().is_empty());
    }
}

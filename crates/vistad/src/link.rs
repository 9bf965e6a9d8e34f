//! Link handshake: the first exchange on every channel connection.
//!
//! The peer sends a `LinkHeader` and a `LinkMess` naming the channel it
//! wants plus its capability words. We answer with a `LinkReply` carrying
//! an error code and our own capability words. Once the reply is out the
//! stream belongs to a channel client.

use std::io;

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use zerocopy::AsBytes;

use vista_core::caps::{self, Capabilities};
use vista_core::wire::{
    read_struct, ChannelKind, Le32, LinkHeader, LinkMess, LinkReply, WireError, LINK_ERR_CHANNEL_NOT_AVAILABLE,
    LINK_ERR_ERROR, LINK_ERR_INVALID_DATA, LINK_ERR_INVALID_MAGIC, LINK_ERR_OK, LINK_ERR_VERSION_MISMATCH,
    LINK_FLAG_MIGRATION_TARGET, LINK_FLAG_SEAMLESS, LINK_MAGIC, LINK_MAX_SIZE, LINK_VERSION_MAJOR,
    LINK_VERSION_MINOR,
};

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("i/o error during link: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("unsupported protocol version {0}")]
    VersionMismatch(u32),

    #[error("link message of {0} bytes is too large")]
    TooLarge(u32),

    #[error("malformed link message: {0}")]
    InvalidData(&'static str),

    #[error("channel {0} is not served")]
    ChannelNotAvailable(ChannelKind),
}

impl LinkError {
    /// Error code sent back in the link reply.
    pub fn code(&self) -> u32 {
        match self {
            LinkError::Wire(WireError::BadLinkMagic(_)) => LINK_ERR_INVALID_MAGIC,
            LinkError::Wire(_) | LinkError::InvalidData(_) | LinkError::TooLarge(_) => LINK_ERR_INVALID_DATA,
            LinkError::VersionMismatch(_) => LINK_ERR_VERSION_MISMATCH,
            LinkError::ChannelNotAvailable(_) => LINK_ERR_CHANNEL_NOT_AVAILABLE,
            LinkError::Io(_) => LINK_ERR_ERROR,
        }
    }
}

/// A validated link request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkRequest {
    pub connection_id: u32,
    pub kind: ChannelKind,
    pub channel_id: u8,
    pub flags: u8,
    pub caps: Capabilities,
}

impl LinkRequest {
    pub fn is_migration_target(&self) -> bool {
        self.flags & LINK_FLAG_MIGRATION_TARGET != 0
    }

    pub fn is_seamless(&self) -> bool {
        self.flags & LINK_FLAG_SEAMLESS != 0
    }
}

/// Channel types this daemon has handlers for.
pub fn is_served(kind: ChannelKind) -> bool {
    matches!(kind, ChannelKind::Cursor | ChannelKind::Display)
}

/// Capabilities we advertise for `kind`.
pub fn server_capabilities(kind: ChannelKind) -> Capabilities {
    let channel: &[u32] = match kind {
        ChannelKind::Cursor => &[caps::cursor::CURSOR_CACHE],
        ChannelKind::Display => &[caps::display::PIXMAP_CACHE, caps::display::PALETTE_CACHE],
        _ => &[],
    };
    Capabilities::from_bits(&[caps::common::MINI_HEADER], channel)
}

/// Read and validate the peer's link request.
pub async fn read_request<S: AsyncRead + Unpin>(stream: &mut S) -> Result<LinkRequest, LinkError> {
    let mut header_buf = [0u8; std::mem::size_of::<LinkHeader>()];
    stream.read_exact(&mut header_buf).await?;
    let header: LinkHeader = read_struct(&header_buf)?;
    let magic = header.magic.get();
    if magic != LINK_MAGIC {
        return Err(WireError::BadLinkMagic(magic).into());
    }
    let major = header.major_version.get();
    if major != LINK_VERSION_MAJOR {
        return Err(LinkError::VersionMismatch(major));
    }
    let size = header.size.get();
    if size > LINK_MAX_SIZE {
        return Err(LinkError::TooLarge(size));
    }

    let mut body = vec![0u8; size as usize];
    stream.read_exact(&mut body).await?;
    parse_body(&body)
}

fn parse_body(body: &[u8]) -> Result<LinkRequest, LinkError> {
    let mess: LinkMess = read_struct(body)?;
    let num_common = mess.num_common_caps.get() as usize;
    let num_channel = mess.num_channel_caps.get() as usize;
    let offset = mess.caps_offset.get() as usize;
    let end = num_common
        .checked_add(num_channel)
        .and_then(|n| n.checked_mul(4))
        .and_then(|n| n.checked_add(offset))
        .ok_or(LinkError::InvalidData("capability count overflow"))?;
    if offset < std::mem::size_of::<LinkMess>() || end > body.len() {
        return Err(LinkError::InvalidData("capabilities out of bounds"));
    }

    let words: Vec<u32> = body[offset..end]
        .chunks_exact(4)
        .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
        .collect();
    let (common, channel) = words.split_at(num_common);
    let kind = ChannelKind::try_from(mess.channel_type)?;

    Ok(LinkRequest {
        connection_id: mess.connection_id.get(),
        kind,
        channel_id: mess.channel_id,
        flags: mess.flags,
        caps: Capabilities::new(common.to_vec(), channel.to_vec()),
    })
}

/// Send the link reply. `caps` is ignored unless `error` is `LINK_ERR_OK`.
pub async fn write_reply<S: AsyncWrite + Unpin>(stream: &mut S, error: u32, caps: &Capabilities) -> Result<(), LinkError> {
    let (common, channel) = if error == LINK_ERR_OK {
        (caps.common_words(), caps.channel_words())
    } else {
        (&[][..], &[][..])
    };
    let reply_size = std::mem::size_of::<LinkReply>();
    let size = reply_size + (common.len() + channel.len()) * 4;

    let header = LinkHeader {
        magic: Le32::new(LINK_MAGIC),
        major_version: Le32::new(LINK_VERSION_MAJOR),
        minor_version: Le32::new(LINK_VERSION_MINOR),
        size: Le32::new(size as u32),
    };
    let reply = LinkReply {
        error: Le32::new(error),
        num_common_caps: Le32::new(common.len() as u32),
        num_channel_caps: Le32::new(channel.len() as u32),
        caps_offset: Le32::new(reply_size as u32),
    };

    let mut out = BytesMut::with_capacity(std::mem::size_of::<LinkHeader>() + size);
    out.put_slice(header.as_bytes());
    out.put_slice(reply.as_bytes());
    for word in common.iter().chain(channel) {
        out.put_u32_le(*word);
    }
    stream.write_all(&out).await?;
    stream.flush().await?;
    Ok(())
}

/// Run the server side of the handshake. On failure the peer has been told
/// why, as far as the stream still allows.
pub async fn accept<S: AsyncRead + AsyncWrite + Unpin>(stream: &mut S) -> Result<LinkRequest, LinkError> {
    let result = match read_request(stream).await {
        Ok(req) if !is_served(req.kind) => Err(LinkError::ChannelNotAvailable(req.kind)),
        other => other,
    };
    match result {
        Ok(req) => {
            write_reply(stream, LINK_ERR_OK, &server_capabilities(req.kind)).await?;
            Ok(req)
        }
        Err(LinkError::Io(e)) => Err(LinkError::Io(e)),
        Err(e) => {
            // Best effort: the link already failed.
            let _ = write_reply(stream, e.code(), &Capabilities::default()).await;
            Err(e)
        }
    }
}

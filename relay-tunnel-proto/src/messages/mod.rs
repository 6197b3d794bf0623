//! The messages exchanged by the two ends of a relay session.
//!
//! After the [`Hello`] exchange, everything on the transport is a sequence of frames. A frame is
//! an [`u32`] indicating the length of the body, followed by the body itself, which starts with a
//! [`MessageType`] byte followed by that message's fields. The message numbers follow the SSH
//! connection protocol, which this protocol is a trimmed-down version of.

use std::io::{self, Error, ErrorKind};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::serialize::{read_u8_repr, ByteRead, ByteWrite, U8ReprEnum};

mod channel;
mod global;
mod handshake;

pub use channel::*;
pub use global::*;
pub use handshake::*;

/// The maximum amount of user data carried by a single [`SessionMessage::ChannelData`].
pub const MAX_CHANNEL_DATA_LENGTH: usize = 32 * 1024;

/// The maximum length of a frame body. Anything bigger is treated as a protocol violation.
pub const MAX_FRAME_LENGTH: usize = crate::serialize::MAX_BLOB_LENGTH + 64;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    GlobalRequest = 80,
    RequestSuccess = 81,
    RequestFailure = 82,
    ChannelOpen = 90,
    ChannelOpenConfirmation = 91,
    ChannelOpenFailure = 92,
    ChannelData = 94,
    ChannelEof = 96,
    ChannelClose = 97,
}

impl U8ReprEnum for MessageType {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            80 => Some(Self::GlobalRequest),
            81 => Some(Self::RequestSuccess),
            82 => Some(Self::RequestFailure),
            90 => Some(Self::ChannelOpen),
            91 => Some(Self::ChannelOpenConfirmation),
            92 => Some(Self::ChannelOpenFailure),
            94 => Some(Self::ChannelData),
            96 => Some(Self::ChannelEof),
            97 => Some(Self::ChannelClose),
            _ => None,
        }
    }

    fn into_u8(self) -> u8 {
        self as u8
    }
}

/// A single frame of the session protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionMessage {
    GlobalRequest {
        name: String,
        want_reply: bool,
        payload: Vec<u8>,
    },
    RequestSuccess {
        payload: Vec<u8>,
    },
    RequestFailure,
    ChannelOpen {
        channel_type: String,
        channel_id: ChannelId,
        payload: Vec<u8>,
    },
    ChannelOpenConfirmation {
        channel_id: ChannelId,
    },
    ChannelOpenFailure {
        channel_id: ChannelId,
        reason: OpenFailureReason,
        description: String,
    },
    ChannelData {
        channel_id: ChannelId,
        data: Vec<u8>,
    },
    ChannelEof {
        channel_id: ChannelId,
    },
    ChannelClose {
        channel_id: ChannelId,
    },
}

impl SessionMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::GlobalRequest { .. } => MessageType::GlobalRequest,
            Self::RequestSuccess { .. } => MessageType::RequestSuccess,
            Self::RequestFailure => MessageType::RequestFailure,
            Self::ChannelOpen { .. } => MessageType::ChannelOpen,
            Self::ChannelOpenConfirmation { .. } => MessageType::ChannelOpenConfirmation,
            Self::ChannelOpenFailure { .. } => MessageType::ChannelOpenFailure,
            Self::ChannelData { .. } => MessageType::ChannelData,
            Self::ChannelEof { .. } => MessageType::ChannelEof,
            Self::ChannelClose { .. } => MessageType::ChannelClose,
        }
    }

    /// Gets the channel this message refers to, or `None` for session-level messages.
    pub fn channel_id(&self) -> Option<ChannelId> {
        match self {
            Self::ChannelOpen { channel_id, .. }
            | Self::ChannelOpenConfirmation { channel_id }
            | Self::ChannelOpenFailure { channel_id, .. }
            | Self::ChannelData { channel_id, .. }
            | Self::ChannelEof { channel_id }
            | Self::ChannelClose { channel_id } => Some(*channel_id),
            _ => None,
        }
    }

    async fn write_body<W: AsyncWrite + Unpin + ?Sized>(&self, writer: &mut W) -> io::Result<()> {
        self.message_type().into_u8().write(writer).await?;

        match self {
            Self::GlobalRequest {
                name,
                want_reply,
                payload,
            } => (name, *want_reply, payload).write(writer).await,
            Self::RequestSuccess { payload } => payload.write(writer).await,
            Self::RequestFailure => Ok(()),
            Self::ChannelOpen {
                channel_type,
                channel_id,
                payload,
            } => (channel_type, *channel_id, payload).write(writer).await,
            Self::ChannelOpenFailure {
                channel_id,
                reason,
                description,
            } => (*channel_id, *reason, description).write(writer).await,
            Self::ChannelData { channel_id, data } => (*channel_id, data).write(writer).await,
            Self::ChannelOpenConfirmation { channel_id } | Self::ChannelEof { channel_id } | Self::ChannelClose { channel_id } => {
                channel_id.write(writer).await
            }
        }
    }

    async fn read_body<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> io::Result<Self> {
        let message = match read_u8_repr::<MessageType, _>(reader).await? {
            MessageType::GlobalRequest => {
                let (name, want_reply, payload) = <(String, bool, Vec<u8>)>::read(reader).await?;
                Self::GlobalRequest {
                    name,
                    want_reply,
                    payload,
                }
            }
            MessageType::RequestSuccess => Self::RequestSuccess {
                payload: Vec::<u8>::read(reader).await?,
            },
            MessageType::RequestFailure => Self::RequestFailure,
            MessageType::ChannelOpen => {
                let (channel_type, channel_id, payload) = <(String, ChannelId, Vec<u8>)>::read(reader).await?;
                Self::ChannelOpen {
                    channel_type,
                    channel_id,
                    payload,
                }
            }
            MessageType::ChannelOpenConfirmation => Self::ChannelOpenConfirmation {
                channel_id: ChannelId::read(reader).await?,
            },
            MessageType::ChannelOpenFailure => {
                let (channel_id, reason, description) = <(ChannelId, OpenFailureReason, String)>::read(reader).await?;
                Self::ChannelOpenFailure {
                    channel_id,
                    reason,
                    description,
                }
            }
            MessageType::ChannelData => {
                let (channel_id, data) = <(ChannelId, Vec<u8>)>::read(reader).await?;
                Self::ChannelData { channel_id, data }
            }
            MessageType::ChannelEof => Self::ChannelEof {
                channel_id: ChannelId::read(reader).await?,
            },
            MessageType::ChannelClose => Self::ChannelClose {
                channel_id: ChannelId::read(reader).await?,
            },
        };

        Ok(message)
    }
}

impl ByteWrite for SessionMessage {
    /// Writes this message as a whole frame with a single call to `write_all`, so a
    /// message-oriented transport carries each frame in one message.
    async fn write<W: AsyncWrite + Unpin + ?Sized>(&self, writer: &mut W) -> io::Result<()> {
        let mut frame = vec![0u8; 4];
        self.write_body(&mut frame).await?;

        let body_len = frame.len() - 4;
        if body_len > MAX_FRAME_LENGTH {
            return Err(Error::new(ErrorKind::InvalidData, format!("Frame is too long ({body_len} bytes)")));
        }

        frame[..4].copy_from_slice(&(body_len as u32).to_be_bytes());
        writer.write_all(&frame).await
    }
}

impl ByteRead for SessionMessage {
    async fn read<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> io::Result<Self> {
        let body_len = reader.read_u32().await? as usize;
        if body_len > MAX_FRAME_LENGTH {
            return Err(Error::new(ErrorKind::InvalidData, format!("Frame is too long ({body_len} bytes)")));
        }

        let mut body = vec![0u8; body_len];
        reader.read_exact(&mut body).await?;

        let mut remaining = body.as_slice();
        let message = Self::read_body(&mut remaining).await.map_err(|error| match error.kind() {
            ErrorKind::UnexpectedEof => Error::new(ErrorKind::InvalidData, "Frame body is truncated"),
            _ => error,
        })?;

        if !remaining.is_empty() {
            let msg = format!("{:?} frame has {} trailing bytes", message.message_type(), remaining.len());
            return Err(Error::new(ErrorKind::InvalidData, msg));
        }

        Ok(message)
    }
}

use std::{
    fmt,
    io::{self, Error, ErrorKind},
};

use tokio::io::{AsyncRead, AsyncWrite};

use crate::serialize::{ByteRead, ByteWrite};

/// The client opens a byte stream towards one of the ports the host advertised.
pub const DIRECT_TCPIP: &str = "direct-tcpip";

/// Reserved for host-initiated streams. Not implemented; offers of this type are rejected.
pub const FORWARDED_TCPIP: &str = "forwarded-tcpip";

/// A number that identifies a channel within a session.
///
/// Channel IDs are picked by whoever opens the channel and are never reused within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub u32);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl ByteRead for ChannelId {
    async fn read<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> io::Result<Self> {
        Ok(Self(u32::read(reader).await?))
    }
}

impl ByteWrite for ChannelId {
    async fn write<W: AsyncWrite + Unpin + ?Sized>(&self, writer: &mut W) -> io::Result<()> {
        self.0.write(writer).await
    }
}

/// The type of a channel, parsed from the type name carried by a channel-open message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelKind {
    DirectTcpip,
    ForwardedTcpip,
    Unknown(String),
}

impl ChannelKind {
    pub fn from_name(name: &str) -> Self {
        match name {
            DIRECT_TCPIP => Self::DirectTcpip,
            FORWARDED_TCPIP => Self::ForwardedTcpip,
            other => Self::Unknown(other.to_string()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::DirectTcpip => DIRECT_TCPIP,
            Self::ForwardedTcpip => FORWARDED_TCPIP,
            Self::Unknown(name) => name,
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The payload of a `direct-tcpip` channel-open message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortForwardChannelOpen {
    /// Must match the channel ID of the channel-open message carrying this payload.
    pub channel_id: ChannelId,

    /// The address of whoever connected to the client's local listener.
    pub originator_address: String,

    /// The advertised port this channel should reach on the host.
    pub port: u32,

    /// The address the host should connect to. Informational; the host always connects to the
    /// service it has configured for `port`.
    pub remote_address: String,

    /// The port of the originator's connection.
    pub remote_port: u32,
}

impl ByteWrite for PortForwardChannelOpen {
    async fn write<W: AsyncWrite + Unpin + ?Sized>(&self, writer: &mut W) -> io::Result<()> {
        (
            self.channel_id,
            self.originator_address.as_str(),
            self.port,
            self.remote_address.as_str(),
            self.remote_port,
        )
            .write(writer)
            .await
    }
}

impl ByteRead for PortForwardChannelOpen {
    async fn read<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> io::Result<Self> {
        let (channel_id, originator_address, port, remote_address, remote_port) =
            <(ChannelId, String, u32, String, u32)>::read(reader).await?;

        Ok(Self {
            channel_id,
            originator_address,
            port,
            remote_address,
            remote_port,
        })
    }
}

/// The reason carried by a channel-open failure.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenFailureReason {
    /// The host does not forward the requested port.
    AdministrativelyProhibited = 1,
    ConnectFailed = 2,
    UnknownChannelType = 3,
    ResourceShortage = 4,
    /// The channel-open payload couldn't be parsed.
    Malformed = 5,
}

impl OpenFailureReason {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(Self::AdministrativelyProhibited),
            2 => Some(Self::ConnectFailed),
            3 => Some(Self::UnknownChannelType),
            4 => Some(Self::ResourceShortage),
            5 => Some(Self::Malformed),
            _ => None,
        }
    }
}

impl fmt::Display for OpenFailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AdministrativelyProhibited => write!(f, "administratively prohibited"),
            Self::ConnectFailed => write!(f, "connect failed"),
            Self::UnknownChannelType => write!(f, "unknown channel type"),
            Self::ResourceShortage => write!(f, "resource shortage"),
            Self::Malformed => write!(f, "malformed"),
        }
    }
}

impl ByteWrite for OpenFailureReason {
    async fn write<W: AsyncWrite + Unpin + ?Sized>(&self, writer: &mut W) -> io::Result<()> {
        (*self as u32).write(writer).await
    }
}

impl ByteRead for OpenFailureReason {
    async fn read<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> io::Result<Self> {
        let value = u32::read(reader).await?;
        Self::from_u32(value)
            .ok_or_else(|| Error::new(ErrorKind::InvalidData, format!("Invalid OpenFailureReason code: {value}")))
    }
}

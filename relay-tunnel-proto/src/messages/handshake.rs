use std::{
    fmt,
    io::{self, Error, ErrorKind},
};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::serialize::{read_u8_repr, ByteRead, ByteWrite, U8ReprEnum};

/// The version of the session protocol. Both peers must speak the same version.
///
/// Note: This is currently the only version of the protocol.
pub const PROTOCOL_VERSION: u16 = 1;

/// The bytes every session starts with, in both directions.
pub const HANDSHAKE_MAGIC: [u8; 4] = *b"TRLY";

/// The role a peer plays in a relay session.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionRole {
    /// Accepts channels and advertises the ports it can forward to.
    Host = 0,

    /// Opens channels towards the ports the host advertised.
    Client = 1,
}

impl SessionRole {
    /// Gets the role the other end of a session must have.
    pub const fn peer(self) -> Self {
        match self {
            Self::Host => Self::Client,
            Self::Client => Self::Host,
        }
    }
}

impl fmt::Display for SessionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Host => write!(f, "host"),
            Self::Client => write!(f, "client"),
        }
    }
}

impl U8ReprEnum for SessionRole {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Host),
            1 => Some(Self::Client),
            _ => None,
        }
    }

    fn into_u8(self) -> u8 {
        self as u8
    }
}

impl ByteWrite for SessionRole {
    async fn write<W: AsyncWrite + Unpin + ?Sized>(&self, writer: &mut W) -> io::Result<()> {
        self.into_u8().write(writer).await
    }
}

impl ByteRead for SessionRole {
    async fn read<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> io::Result<Self> {
        read_u8_repr(reader).await
    }
}

/// The first thing each peer sends on a freshly established transport.
///
/// Each side writes its own hello and then reads the other's. Trust was already established when
/// the transport was dialed with the access token, so no credentials are exchanged here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hello {
    pub version: u16,
    pub role: SessionRole,
}

impl Hello {
    pub const fn new(role: SessionRole) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            role,
        }
    }
}

impl ByteWrite for Hello {
    async fn write<W: AsyncWrite + Unpin + ?Sized>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&HANDSHAKE_MAGIC).await?;
        (self.version, self.role).write(writer).await
    }
}

impl ByteRead for Hello {
    async fn read<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> io::Result<Self> {
        let mut magic = [0u8; HANDSHAKE_MAGIC.len()];
        reader.read_exact(&mut magic).await?;
        if magic != HANDSHAKE_MAGIC {
            return Err(Error::new(ErrorKind::InvalidData, "Peer did not start with the relay session magic"));
        }

        let (version, role) = <(u16, SessionRole)>::read(reader).await?;
        Ok(Self { version, role })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serialize::{from_bytes, to_bytes};

    #[tokio::test]
    async fn hello_layout() {
        let bytes = to_bytes(&Hello::new(SessionRole::Client)).await.unwrap();
        assert_eq!(bytes, [b'T', b'R', b'L', b'Y', 0, 1, 1]);
    }

    #[tokio::test]
    async fn hello_with_bad_magic_is_rejected() {
        let error = from_bytes::<Hello>(b"SSH-2\x00\x01").await.unwrap_err();
        assert_eq!(error.kind(), ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn hello_with_unknown_role_is_rejected() {
        let error = from_bytes::<Hello>(b"TRLY\x00\x01\x07").await.unwrap_err();
        assert_eq!(error.kind(), ErrorKind::InvalidData);
    }
}

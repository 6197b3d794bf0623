//! Session-level (not per-channel) requests.

use std::io::{self, Error, ErrorKind};

use tokio::io::{AsyncRead, AsyncWrite};

use crate::serialize::{from_bytes, ByteRead, ByteWrite};

/// The host advertises a port as forwardable.
pub const TCPIP_FORWARD: &str = "tcpip-forward";

/// The host retracts a port advertisement.
pub const CANCEL_TCPIP_FORWARD: &str = "cancel-tcpip-forward";

/// The payload of a `tcpip-forward` or `cancel-tcpip-forward` request, and of the success reply
/// to either, which echoes the port back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortForwardRequest {
    pub port: u32,
}

impl PortForwardRequest {
    pub const fn new(port: u32) -> Self {
        Self { port }
    }
}

impl ByteWrite for PortForwardRequest {
    async fn write<W: AsyncWrite + Unpin + ?Sized>(&self, writer: &mut W) -> io::Result<()> {
        self.port.write(writer).await
    }
}

impl ByteRead for PortForwardRequest {
    async fn read<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> io::Result<Self> {
        Ok(Self::new(u32::read(reader).await?))
    }
}

/// A global request, parsed by name into one of the kinds this protocol knows about.
///
/// Requests with any other name parse as [`GlobalRequest::Unknown`] rather than failing, so they
/// can be answered with a failure reply instead of being dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GlobalRequest {
    PortForward(PortForwardRequest),
    CancelPortForward(PortForwardRequest),
    Unknown(String),
}

impl GlobalRequest {
    /// Parses a global request from its name and payload.
    ///
    /// Fails with [`ErrorKind::InvalidData`] if the name is known but the payload is malformed.
    pub async fn parse(name: &str, payload: &[u8]) -> io::Result<Self> {
        let parsed = match name {
            TCPIP_FORWARD => Self::PortForward(from_bytes(payload).await?),
            CANCEL_TCPIP_FORWARD => Self::CancelPortForward(from_bytes(payload).await?),
            other => Self::Unknown(other.to_string()),
        };

        Ok(parsed)
    }

    /// Gets the name this request travels under.
    pub fn name(&self) -> &str {
        match self {
            Self::PortForward(_) => TCPIP_FORWARD,
            Self::CancelPortForward(_) => CANCEL_TCPIP_FORWARD,
            Self::Unknown(name) => name,
        }
    }
}

/// Parses the payload of a success reply to a port forward request, checking that it echoes the
/// requested port.
pub async fn parse_port_forward_reply(requested_port: u32, payload: &[u8]) -> io::Result<PortForwardRequest> {
    let reply: PortForwardRequest = from_bytes(payload).await?;
    if reply.port != requested_port {
        let msg = format!("Port forward reply echoed port {} instead of {requested_port}", reply.port);
        return Err(Error::new(ErrorKind::InvalidData, msg));
    }

    Ok(reply)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serialize::to_bytes;

    #[tokio::test]
    async fn parses_known_requests() {
        let payload = to_bytes(&PortForwardRequest::new(8001)).await.unwrap();
        assert_eq!(
            GlobalRequest::parse(TCPIP_FORWARD, &payload).await.unwrap(),
            GlobalRequest::PortForward(PortForwardRequest::new(8001))
        );
        assert_eq!(
            GlobalRequest::parse(CANCEL_TCPIP_FORWARD, &payload).await.unwrap(),
            GlobalRequest::CancelPortForward(PortForwardRequest::new(8001))
        );
    }

    #[tokio::test]
    async fn unknown_names_are_not_errors() {
        let parsed = GlobalRequest::parse("keepalive@openssh.com", &[]).await.unwrap();
        assert_eq!(parsed, GlobalRequest::Unknown("keepalive@openssh.com".to_string()));
        assert_eq!(parsed.name(), "keepalive@openssh.com");
    }

    #[tokio::test]
    async fn short_port_payload_is_malformed() {
        assert!(GlobalRequest::parse(TCPIP_FORWARD, &[0, 0]).await.is_err());
    }

    #[tokio::test]
    async fn reply_must_echo_the_port() {
        let payload = to_bytes(&PortForwardRequest::new(8002)).await.unwrap();
        assert!(parse_port_forward_reply(8001, &payload).await.is_err());
        assert_eq!(parse_port_forward_reply(8002, &payload).await.unwrap().port, 8002);
    }
}

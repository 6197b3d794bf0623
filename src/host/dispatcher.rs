use relay_tunnel_proto::messages::{ChannelKind, OpenFailureReason};
use tokio::{net::TcpStream, sync::mpsc::UnboundedReceiver};
use tracing::{debug, info, info_span, warn, Instrument};

use super::TunnelPorts;
use crate::{
    bridge::{bridge, BridgeStats},
    error::RelayError,
    session::{ChannelOffer, RelaySession},
    utils::wire_port,
};

/// Serves every channel the client opens, each in its own task, until the session closes.
pub(super) async fn dispatch_channels(session: RelaySession, ports: TunnelPorts, mut offers: UnboundedReceiver<ChannelOffer>) {
    while let Some(offer) = offers.recv().await {
        let session = session.clone();
        let ports = ports.clone();
        let span = info_span!("channel", channel_id = %offer.channel_id());

        tokio::spawn(
            async move {
                match dispatch_channel(&session, &ports, offer).await {
                    Ok(stats) => debug!(sent = stats.sent, received = stats.received, "Channel finished"),
                    Err(RelayError::Cancelled) => debug!("Channel cut off by session close"),
                    Err(error @ (RelayError::PortRejected(_) | RelayError::Protocol(_) | RelayError::ChannelRejected { .. })) => {
                        warn!("Channel refused: {error}")
                    }
                    Err(error) => warn!("Channel finished with error: {error}"),
                }
            }
            .instrument(span),
        );
    }

    debug!("Channel dispatch loop finished");
}

/// Validates a channel offer against the tunnel's ports and, if it names one, accepts it and
/// bridges it to that port's local service.
///
/// An offer that's refused is rejected before this returns, and the reason is returned as the
/// error. If the local service can't be reached after accepting, the channel is closed.
pub async fn dispatch_channel(session: &RelaySession, ports: &TunnelPorts, offer: ChannelOffer) -> Result<BridgeStats, RelayError> {
    let refusal = match offer.kind() {
        ChannelKind::DirectTcpip => None,
        ChannelKind::ForwardedTcpip => Some("not implemented"),
        ChannelKind::Unknown(_) => Some("unknown channel type"),
    };

    if let Some(description) = refusal {
        let reason = OpenFailureReason::UnknownChannelType;
        offer.reject(reason, description);
        return Err(RelayError::ChannelRejected {
            reason,
            description: description.to_string(),
        });
    }

    let open = match offer.port_forward_open().await {
        Ok(open) => open,
        Err(error) => {
            offer.reject(OpenFailureReason::Malformed, "malformed channel open");
            return Err(RelayError::Protocol(format!("malformed channel open: {error}")));
        }
    };

    let Some(target) = wire_port(open.port).and_then(|port| ports.target(port)) else {
        offer.reject(OpenFailureReason::AdministrativelyProhibited, "prohibited port");
        return Err(RelayError::PortRejected(open.port));
    };

    let channel = offer.accept()?;
    info!(port = open.port, %target, originator = %open.originator_address, "Channel accepted");

    // A connect still pending when the session closes is abandoned.
    let cancel = session.shutdown_token().child_token();
    let connected = tokio::select! {
        connected = TcpStream::connect(target) => connected,
        _ = cancel.cancelled() => return Err(RelayError::Cancelled),
    };

    let stream = match connected {
        Ok(stream) => stream,
        Err(error) => {
            warn!(%target, "Failed to connect to local service: {error}");
            drop(channel);
            return Err(RelayError::Io(error));
        }
    };

    bridge(stream, channel, &cancel).await
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, time::Duration};

    use relay_tunnel_proto::{
        messages::{ChannelId, Hello, PortForwardChannelOpen, SessionMessage, SessionRole, DIRECT_TCPIP, FORWARDED_TCPIP},
        serialize::{to_bytes, ByteRead},
    };
    use tokio::{
        io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream},
        net::{TcpListener, TcpSocket},
    };

    use super::*;
    use crate::{
        config::HostPort,
        session::{Lifecycle, SessionIncoming},
    };

    const STEP: Duration = Duration::from_secs(5);

    /// Starts a host session whose client end is driven by hand.
    async fn host_with_raw_client() -> ((RelaySession, SessionIncoming), DuplexStream) {
        let (a, b) = duplex(256 * 1024);
        let timeout = Some(STEP);
        let (host, raw) = tokio::join!(RelaySession::establish(a, SessionRole::Host, Lifecycle::new(), timeout), async move {
            let mut raw = b;
            raw.write_all(&to_bytes(&Hello::new(SessionRole::Client)).await.unwrap()).await.unwrap();
            let mut hello = [0u8; 7];
            raw.read_exact(&mut hello).await.unwrap();
            raw
        });

        (host.unwrap(), raw)
    }

    /// Starts a host session that dispatches channels to `ports`.
    async fn dispatching_host(ports: &[HostPort]) -> (RelaySession, DuplexStream) {
        let ((host, incoming), raw) = host_with_raw_client().await;
        tokio::spawn(dispatch_channels(host.clone(), TunnelPorts::new(ports), incoming.offers));
        (host, raw)
    }

    async fn open_frame(channel_type: &str, channel_id: u32, payload: Vec<u8>) -> Vec<u8> {
        let open = SessionMessage::ChannelOpen {
            channel_type: channel_type.to_string(),
            channel_id: ChannelId(channel_id),
            payload,
        };
        to_bytes(&open).await.unwrap()
    }

    async fn port_forward_payload(channel_id: u32, port: u32) -> Vec<u8> {
        let open = PortForwardChannelOpen {
            channel_id: ChannelId(channel_id),
            originator_address: "127.0.0.1".to_string(),
            port,
            remote_address: "localhost".to_string(),
            remote_port: 50000,
        };
        to_bytes(&open).await.unwrap()
    }

    /// Reads `count` frames, keyed by the channel they refer to.
    async fn replies(raw: &mut DuplexStream, count: usize) -> HashMap<u32, SessionMessage> {
        let mut replies = HashMap::new();
        for _ in 0..count {
            let message = tokio::time::timeout(STEP, SessionMessage::read(raw)).await.unwrap().unwrap();
            replies.insert(message.channel_id().unwrap().0, message);
        }
        replies
    }

    fn failure(channel_id: u32, reason: OpenFailureReason, description: &str) -> SessionMessage {
        SessionMessage::ChannelOpenFailure {
            channel_id: ChannelId(channel_id),
            reason,
            description: description.to_string(),
        }
    }

    #[tokio::test]
    async fn unsupported_channel_types_are_refused() {
        let (_host, mut raw) = dispatching_host(&[HostPort::new(8001, "127.0.0.1:1")]).await;

        raw.write_all(&open_frame(FORWARDED_TCPIP, 1, Vec::new()).await).await.unwrap();
        raw.write_all(&open_frame("x11", 2, Vec::new()).await).await.unwrap();

        let replies = replies(&mut raw, 2).await;
        assert_eq!(replies[&1], failure(1, OpenFailureReason::UnknownChannelType, "not implemented"));
        assert_eq!(replies[&2], failure(2, OpenFailureReason::UnknownChannelType, "unknown channel type"));
    }

    #[tokio::test]
    async fn malformed_opens_are_refused_and_the_session_carries_on() {
        let service = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = service.local_addr().unwrap().to_string();
        let (_host, mut raw) = dispatching_host(&[HostPort::new(8001, target)]).await;

        raw.write_all(&open_frame(DIRECT_TCPIP, 1, vec![0xde, 0xad]).await).await.unwrap();
        let mismatched = port_forward_payload(9, 8001).await;
        raw.write_all(&open_frame(DIRECT_TCPIP, 2, mismatched).await).await.unwrap();

        let replies = replies(&mut raw, 2).await;
        assert_eq!(replies[&1], failure(1, OpenFailureReason::Malformed, "malformed channel open"));
        assert_eq!(replies[&2], failure(2, OpenFailureReason::Malformed, "malformed channel open"));

        let valid = port_forward_payload(3, 8001).await;
        raw.write_all(&open_frame(DIRECT_TCPIP, 3, valid).await).await.unwrap();
        let reply = tokio::time::timeout(STEP, SessionMessage::read(&mut raw)).await.unwrap().unwrap();
        assert_eq!(reply, SessionMessage::ChannelOpenConfirmation { channel_id: ChannelId(3) });
        tokio::time::timeout(STEP, service.accept()).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn unreachable_service_closes_the_accepted_channel() {
        let target = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().to_string()
        };
        let (_host, mut raw) = dispatching_host(&[HostPort::new(8001, target)]).await;

        let payload = port_forward_payload(5, 8001).await;
        raw.write_all(&open_frame(DIRECT_TCPIP, 5, payload).await).await.unwrap();

        let confirmation = tokio::time::timeout(STEP, SessionMessage::read(&mut raw)).await.unwrap().unwrap();
        assert_eq!(confirmation, SessionMessage::ChannelOpenConfirmation { channel_id: ChannelId(5) });
        let close = tokio::time::timeout(STEP, SessionMessage::read(&mut raw)).await.unwrap().unwrap();
        assert_eq!(close, SessionMessage::ChannelClose { channel_id: ChannelId(5) });
    }

    #[tokio::test]
    async fn closing_the_session_abandons_a_pending_connect() {
        let socket = TcpSocket::new_v4().unwrap();
        socket.bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let service = socket.listen(1).unwrap();
        let target = service.local_addr().unwrap();

        // Fill the accept queue so the next connect hangs.
        let mut fillers = Vec::new();
        while let Ok(filler) = tokio::time::timeout(Duration::from_millis(300), TcpStream::connect(target)).await {
            fillers.push(filler.unwrap());
            assert!(fillers.len() < 16, "accept queue never filled up");
        }

        let ((host, mut incoming), mut raw) = host_with_raw_client().await;
        let payload = port_forward_payload(1, 8001).await;
        raw.write_all(&open_frame(DIRECT_TCPIP, 1, payload).await).await.unwrap();
        let offer = incoming.offers.recv().await.unwrap();

        let ports = TunnelPorts::new(&[HostPort::new(8001, target.to_string())]);
        let session = host.clone();
        let dispatch = tokio::spawn(async move { dispatch_channel(&session, &ports, offer).await });

        let reply = tokio::time::timeout(STEP, SessionMessage::read(&mut raw)).await.unwrap().unwrap();
        assert_eq!(reply, SessionMessage::ChannelOpenConfirmation { channel_id: ChannelId(1) });

        host.close();
        let result = tokio::time::timeout(STEP, dispatch).await.unwrap().unwrap();
        assert!(matches!(result, Err(RelayError::Cancelled)));

        for _ in 0..fillers.len() {
            tokio::time::timeout(STEP, service.accept()).await.unwrap().unwrap();
        }
        assert!(tokio::time::timeout(Duration::from_secs(3), service.accept()).await.is_err());
    }
}

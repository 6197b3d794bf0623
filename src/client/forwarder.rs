//! Local listeners whose accepted connections are carried across the relay, one channel each.

use std::{
    io::{self, Error, ErrorKind},
    iter,
    net::{IpAddr, SocketAddr},
};

use relay_tunnel_proto::messages::OpenFailureReason;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::{
    bridge::{bridge, BridgeStats},
    config::{ClientConfig, DEFAULT_BIND_ADDRESS},
    error::RelayError,
    session::{Channel, RelaySession},
};

/// An automatically managed set of local listeners for one forwarded port.
///
/// Stops accepting when stopped or dropped. Connections already being bridged are left to finish
/// on their own, or until the session closes.
#[derive(Debug)]
pub struct LocalForwarder {
    port: u16,
    addresses: Vec<SocketAddr>,
    cancel: CancellationToken,
}

impl LocalForwarder {
    /// Binds listeners for `port` at the configured addresses and starts accepting on them.
    pub async fn start(session: &RelaySession, port: u16, config: &ClientConfig) -> Result<Self, RelayError> {
        let listeners = bind_with_fallback(port, &config.bind_addresses, config.bind_fallback_range)
            .await
            .map_err(|source| RelayError::Bind { port, source })?;

        let addresses: Vec<SocketAddr> = listeners.iter().filter_map(|listener| listener.local_addr().ok()).collect();
        let cancel = session.shutdown_token().child_token();
        info!(port, ?addresses, "Local forwarder listening");

        for listener in listeners {
            let session = session.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                if let Err(error) = serve_listener(session, listener, port, cancel).await {
                    debug!(port, "Local forwarder stopped: {error}");
                }
            });
        }

        Ok(Self { port, addresses, cancel })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// The local addresses the forwarder is listening at.
    pub fn addresses(&self) -> &[SocketAddr] {
        &self.addresses
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for LocalForwarder {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Binds a listener at the first address, trying `port`, then each of the next `fallback_range`
/// ports, then an ephemeral port. The remaining addresses are bound to whichever port the first
/// one got; failing to bind any of those is only logged.
pub async fn bind_with_fallback(port: u16, addresses: &[IpAddr], fallback_range: u16) -> io::Result<Vec<TcpListener>> {
    let (first, rest) = addresses.split_first().unwrap_or((&DEFAULT_BIND_ADDRESS, &[][..]));

    let candidates = (0..=fallback_range)
        .filter_map(|offset| port.checked_add(offset))
        .chain(iter::once(0));

    let mut primary = None;
    let mut last_error = None;
    for candidate in candidates {
        match TcpListener::bind((*first, candidate)).await {
            Ok(listener) => {
                primary = Some(listener);
                break;
            }
            Err(error) => {
                debug!(port, candidate, "Could not bind local listener: {error}");
                last_error = Some(error);
            }
        }
    }

    let primary = match primary {
        Some(listener) => listener,
        None => return Err(last_error.unwrap_or_else(|| Error::new(ErrorKind::AddrNotAvailable, "no port could be bound"))),
    };

    let bound_port = primary.local_addr()?.port();
    if bound_port != port {
        warn!(port, bound_port, "Requested port was unavailable, listening on another one");
    }

    let mut listeners = vec![primary];
    for address in rest {
        match TcpListener::bind((*address, bound_port)).await {
            Ok(listener) => listeners.push(listener),
            Err(error) => warn!(port, %address, bound_port, "Failed to bind additional listener: {error}"),
        }
    }

    Ok(listeners)
}

/// Accepts connections on `listener` and forwards each one to `port` on the host, until `cancel`
/// fires. Fails with [`RelayError::SessionClosed`] if it stopped because the session closed.
pub async fn serve_listener(
    session: RelaySession,
    listener: TcpListener,
    port: u16,
    cancel: CancellationToken,
) -> Result<(), RelayError> {
    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = cancel.cancelled() => break,
        };

        let (stream, from) = match accepted {
            Ok(accepted) => accepted,
            Err(error) => {
                warn!(port, "Error accepting local connection: {error}");
                continue;
            }
        };

        debug!(port, %from, "Accepted local connection");
        let session = session.clone();
        let span = info_span!("connection", port, %from);
        tokio::spawn(
            async move {
                match forward_connection(&session, stream, from, port).await {
                    Ok(stats) => debug!(sent = stats.sent, received = stats.received, "Connection finished"),
                    Err(RelayError::Cancelled) => debug!("Connection cut off by session close"),
                    Err(error) => warn!("Connection finished with error: {error}"),
                }
            }
            .instrument(span),
        );
    }

    match session.is_closed() {
        true => Err(RelayError::SessionClosed),
        false => Ok(()),
    }
}

/// Opens a channel to `port` on behalf of a connection from `from`, then bridges the two until
/// both are done or the session closes.
pub async fn forward_connection(
    session: &RelaySession,
    stream: TcpStream,
    from: SocketAddr,
    port: u16,
) -> Result<BridgeStats, RelayError> {
    let channel = open_channel(session, port, from).await?;
    debug!(channel_id = %channel.id(), "Channel opened, bridging");

    let cancel = session.shutdown_token().child_token();
    bridge(stream, channel, &cancel).await
}

/// Opens a port forward channel, reporting a refused port as [`RelayError::PortRejected`].
pub(crate) async fn open_channel(
    session: &RelaySession,
    port: u16,
    from: SocketAddr,
) -> Result<Channel, RelayError> {
    session
        .open_port_forward_channel(u32::from(port), from)
        .await
        .map_err(|error| match error {
            RelayError::ChannelRejected {
                reason: OpenFailureReason::AdministrativelyProhibited,
                ..
            } => RelayError::PortRejected(u32::from(port)),
            other => other,
        })
}

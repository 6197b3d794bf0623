//! The host side of a tunnel: advertises the tunnel's ports and serves the channels the client
//! opens to them.

use std::{
    fmt,
    sync::{Arc, OnceLock},
};

use relay_tunnel_proto::{
    messages::{parse_port_forward_reply, PortForwardRequest, SessionRole, CANCEL_TCPIP_FORWARD, TCPIP_FORWARD},
    serialize::to_bytes,
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::mpsc::UnboundedReceiver,
};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::{
    config::{HostConfig, HostPort},
    endpoint::RelayEndpoint,
    error::RelayError,
    session::{GlobalReply, IncomingGlobalRequest, Lifecycle, RelaySession, SessionState},
    transport,
};

mod dispatcher;

pub use dispatcher::dispatch_channel;

/// An immutable snapshot of the tunnel's ports and the local services behind them.
///
/// Cloning is cheap and yields the same snapshot.
#[derive(Clone, PartialEq, Eq)]
pub struct TunnelPorts {
    ports: Arc<[HostPort]>,
}

impl TunnelPorts {
    /// Takes a snapshot of `ports`. If a port is listed more than once, the first entry wins.
    pub fn new(ports: &[HostPort]) -> Self {
        let mut unique: Vec<HostPort> = Vec::with_capacity(ports.len());
        for port in ports {
            if unique.iter().any(|p| p.port == port.port) {
                warn!(port = port.port, target = %port.target, "Ignoring duplicate tunnel port");
                continue;
            }
            unique.push(port.clone());
        }

        Self { ports: unique.into() }
    }

    /// The local service address behind `port`, if it's one of the tunnel's ports.
    pub fn target(&self, port: u16) -> Option<&str> {
        self.ports.iter().find(|p| p.port == port).map(|p| p.target.as_str())
    }

    pub fn contains(&self, port: u16) -> bool {
        self.target(port).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &HostPort> {
        self.ports.iter()
    }

    pub fn len(&self) -> usize {
        self.ports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }
}

impl fmt::Debug for TunnelPorts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.ports.iter().map(|p| p.to_string())).finish()
    }
}

/// A host's session with a relay. Dropping it closes the session.
pub struct HostSession {
    endpoint: RelayEndpoint,
    config: HostConfig,
    ports: TunnelPorts,
    lifecycle: Lifecycle,
    session: OnceLock<RelaySession>,
}

impl HostSession {
    pub fn new(endpoint: RelayEndpoint, config: HostConfig) -> Self {
        let ports = TunnelPorts::new(&config.ports);
        Self {
            endpoint,
            config,
            ports,
            lifecycle: Lifecycle::new(),
            session: OnceLock::new(),
        }
    }

    pub fn endpoint(&self) -> &RelayEndpoint {
        &self.endpoint
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// The ports this session serves, as frozen when it was created.
    pub fn ports(&self) -> &TunnelPorts {
        &self.ports
    }

    /// Dials the relay, runs the session handshake and advertises every tunnel port. A session
    /// can only be connected once.
    pub async fn connect(&self) -> Result<(), RelayError> {
        self.begin_connecting()?;

        let stream = match transport::connect(&self.endpoint, self.config.connect_timeout).await {
            Ok(stream) => stream,
            Err(error) => {
                self.lifecycle.set_closed(Some(error.to_string()));
                return Err(error.into());
            }
        };

        self.start(stream).await
    }

    /// Like [`HostSession::connect`], over an already established byte stream instead of a dial.
    pub async fn connect_stream<S>(&self, stream: S) -> Result<(), RelayError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        self.begin_connecting()?;
        self.start(stream).await
    }

    fn begin_connecting(&self) -> Result<(), RelayError> {
        match self.lifecycle.begin_connecting() {
            true => Ok(()),
            false => Err(RelayError::InvalidState("host session was already connected")),
        }
    }

    async fn start<S>(&self, stream: S) -> Result<(), RelayError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (session, incoming) = RelaySession::establish(stream, SessionRole::Host, self.lifecycle.clone(), self.config.handshake_timeout).await?;

        if self.lifecycle.state() == SessionState::Closed || self.session.set(session.clone()).is_err() {
            session.close();
            return Err(RelayError::SessionClosed);
        }

        let span = info_span!("host");
        tokio::spawn(refuse_global_requests(incoming.requests).instrument(span.clone()));
        tokio::spawn(dispatcher::dispatch_channels(session.clone(), self.ports.clone(), incoming.offers).instrument(span.clone()));

        async {
            for entry in self.ports.iter() {
                match advertise(&session, TCPIP_FORWARD, entry.port).await {
                    Ok(()) => info!(port = entry.port, target = %entry.target, "Port advertised"),
                    Err(RelayError::SessionClosed) => return Err(RelayError::SessionClosed),
                    Err(error) => warn!(port = entry.port, "Port advertisement failed: {error}"),
                }
            }

            Ok(())
        }
        .instrument(span)
        .await
    }

    fn session(&self) -> Result<&RelaySession, RelayError> {
        match self.session.get() {
            Some(session) if !session.is_closed() => Ok(session),
            Some(_) => Err(RelayError::SessionClosed),
            None if self.lifecycle.state() == SessionState::Closed => Err(RelayError::SessionClosed),
            None => Err(RelayError::InvalidState("host session is not connected")),
        }
    }

    /// Tells the client `port` is no longer forwarded.
    ///
    /// The tunnel's ports are not changed, so channels the client still opens to the port are
    /// served as before.
    pub async fn retract_port(&self, port: u16) -> Result<(), RelayError> {
        advertise(self.session()?, CANCEL_TCPIP_FORWARD, port).await?;
        info!(port, "Port retracted");
        Ok(())
    }

    pub fn state(&self) -> SessionState {
        self.lifecycle.state()
    }

    /// The error that closed the session, if it didn't close cleanly.
    pub fn close_reason(&self) -> Option<String> {
        self.lifecycle.close_reason()
    }

    pub async fn closed(&self) {
        self.lifecycle.closed().await
    }

    /// Closes the session and every channel. Calling this more than once is harmless.
    pub fn close(&self) {
        match self.session.get() {
            Some(session) => session.close(),
            None => self.lifecycle.set_closed(None),
        }
    }
}

impl Drop for HostSession {
    fn drop(&mut self) {
        self.close();
    }
}

/// Sends a `tcpip-forward` or `cancel-tcpip-forward` request for `port` and checks the reply
/// echoes it back.
async fn advertise(session: &RelaySession, request: &str, port: u16) -> Result<(), RelayError> {
    let payload = to_bytes(&PortForwardRequest::new(u32::from(port))).await?;
    match session.send_global_request(request, payload, true).await? {
        GlobalReply::Success(reply) => {
            parse_port_forward_reply(u32::from(port), &reply)
                .await
                .map_err(|error| RelayError::Protocol(error.to_string()))?;
            Ok(())
        }
        GlobalReply::Failure => Err(RelayError::PortRejected(u32::from(port))),
    }
}

async fn refuse_global_requests(mut requests: UnboundedReceiver<IncomingGlobalRequest>) {
    while let Some(request) = requests.recv().await {
        debug!(name = request.name(), "Refusing global request from client");
        request.reply_failure();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_keeps_the_first_of_duplicate_ports() {
        let ports = TunnelPorts::new(&[
            HostPort::local(8001),
            HostPort::new(8002, "10.0.0.2:80"),
            HostPort::new(8001, "10.0.0.1:9000"),
        ]);

        assert_eq!(ports.len(), 2);
        assert_eq!(ports.target(8001), Some("127.0.0.1:8001"));
        assert_eq!(ports.target(8002), Some("10.0.0.2:80"));
        assert!(!ports.contains(8003));
        assert_eq!(ports.iter().map(|p| p.port).collect::<Vec<_>>(), vec![8001, 8002]);
    }

    #[tokio::test]
    async fn retracting_needs_a_session() {
        let host = HostSession::new(RelayEndpoint::host("ws://relay.invalid/", "token"), HostConfig::new(vec![HostPort::local(8001)]));
        assert!(matches!(host.retract_port(8001).await, Err(RelayError::InvalidState(_))));

        host.close();
        assert!(matches!(host.retract_port(8001).await, Err(RelayError::SessionClosed)));
    }
}

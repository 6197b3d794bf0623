//! The client side of a tunnel: learns which ports the host forwards, and carries local
//! connections to them across the relay.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError},
    time::Duration,
};

use relay_tunnel_proto::messages::SessionRole;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpListener,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, Instrument};

use crate::{
    bridge::{bridge, BridgeStats},
    config::ClientConfig,
    endpoint::RelayEndpoint,
    error::RelayError,
    registry::ForwardedPortSet,
    session::{Lifecycle, RelaySession, SessionState},
    transport,
    utils::linked_token,
};

mod forwarder;
mod requests;

pub use forwarder::{bind_with_fallback, LocalForwarder};

struct ClientShared {
    endpoint: RelayEndpoint,
    config: ClientConfig,
    lifecycle: Lifecycle,
    registry: ForwardedPortSet,
    session: OnceLock<RelaySession>,
    forwarders: Mutex<HashMap<u16, LocalForwarder>>,
}

impl ClientShared {
    fn forwarders(&self) -> MutexGuard<'_, HashMap<u16, LocalForwarder>> {
        self.forwarders.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn session(&self) -> Result<RelaySession, RelayError> {
        match self.session.get() {
            Some(session) if !session.is_closed() => Ok(session.clone()),
            Some(_) => Err(RelayError::SessionClosed),
            None if self.lifecycle.state() == SessionState::Closed => Err(RelayError::SessionClosed),
            None => Err(RelayError::InvalidState("client session is not connected")),
        }
    }

    /// Starts forwarding `port` from a local listener, unless it already is. Returns the local
    /// addresses it's listening at.
    async fn start_forwarder(&self, session: &RelaySession, port: u16) -> Result<Vec<SocketAddr>, RelayError> {
        if let Some(existing) = self.forwarders().get(&port) {
            return Ok(existing.addresses().to_vec());
        }

        let forwarder = LocalForwarder::start(session, port, &self.config).await?;

        let mut forwarders = self.forwarders();
        // Someone else may have started one for this port while this one was binding.
        let forwarder = forwarders.entry(port).or_insert(forwarder);
        Ok(forwarder.addresses().to_vec())
    }

    fn stop_forwarder(&self, port: u16) -> bool {
        let removed = self.forwarders().remove(&port);
        match removed {
            Some(forwarder) => {
                forwarder.stop();
                info!(port, "Local forwarder stopped");
                true
            }
            None => false,
        }
    }

    fn shut_down(&self) {
        self.registry.close();
        let forwarders = std::mem::take(&mut *self.forwarders());
        for forwarder in forwarders.values() {
            forwarder.stop();
        }
    }
}

/// A client's session with a relay.
///
/// Every port the host advertises is recorded in [`ClientSession::forwarded_ports`] and, with
/// automatic binding enabled, gets a [`LocalForwarder`]. Dropping the session closes it.
pub struct ClientSession {
    shared: Arc<ClientShared>,
}

impl ClientSession {
    pub fn new(endpoint: RelayEndpoint, config: ClientConfig) -> Self {
        Self {
            shared: Arc::new(ClientShared {
                endpoint,
                config,
                lifecycle: Lifecycle::new(),
                registry: ForwardedPortSet::new(),
                session: OnceLock::new(),
                forwarders: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn endpoint(&self) -> &RelayEndpoint {
        &self.shared.endpoint
    }

    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    /// Dials the relay and runs the session handshake. A session can only be connected once.
    pub async fn connect(&self) -> Result<(), RelayError> {
        self.begin_connecting()?;

        let shared = &self.shared;
        let stream = match transport::connect(&shared.endpoint, shared.config.connect_timeout).await {
            Ok(stream) => stream,
            Err(error) => {
                shared.lifecycle.set_closed(Some(error.to_string()));
                shared.shut_down();
                return Err(error.into());
            }
        };

        self.start(stream).await
    }

    /// Runs the session over an already established byte stream instead of dialing the relay.
    pub async fn connect_stream<S>(&self, stream: S) -> Result<(), RelayError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        self.begin_connecting()?;
        self.start(stream).await
    }

    fn begin_connecting(&self) -> Result<(), RelayError> {
        match self.shared.lifecycle.begin_connecting() {
            true => Ok(()),
            false => Err(RelayError::InvalidState("client session was already connected")),
        }
    }

    async fn start<S>(&self, stream: S) -> Result<(), RelayError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let shared = &self.shared;
        let handshake_timeout = Some(shared.config.handshake_timeout);
        let (session, incoming) = match RelaySession::establish(stream, SessionRole::Client, shared.lifecycle.clone(), handshake_timeout).await {
            Ok(established) => established,
            Err(error) => {
                shared.shut_down();
                return Err(error.into());
            }
        };

        // Closed while the handshake was running.
        if shared.lifecycle.state() == SessionState::Closed || shared.session.set(session.clone()).is_err() {
            session.close();
            shared.shut_down();
            return Err(RelayError::SessionClosed);
        }

        let span = info_span!("client");
        tokio::spawn(requests::handle_global_requests(Arc::clone(shared), session.clone(), incoming.requests).instrument(span.clone()));
        tokio::spawn(requests::reject_channel_offers(incoming.offers).instrument(span.clone()));

        let watched = Arc::clone(shared);
        tokio::spawn(
            async move {
                session.closed().await;
                watched.shut_down();
                debug!("Client session resources released");
            }
            .instrument(span),
        );

        Ok(())
    }

    pub fn state(&self) -> SessionState {
        self.shared.lifecycle.state()
    }

    /// The error that closed the session, if it didn't close cleanly.
    pub fn close_reason(&self) -> Option<String> {
        self.shared.lifecycle.close_reason()
    }

    pub async fn closed(&self) {
        self.shared.lifecycle.closed().await
    }

    /// Closes the session, its channels and its forwarders. Calling this more than once is
    /// harmless.
    pub fn close(&self) {
        match self.shared.session.get() {
            Some(session) => session.close(),
            None => self.shared.lifecycle.set_closed(None),
        }

        self.shared.shut_down();
    }

    /// The ports the host currently forwards.
    pub fn forwarded_ports(&self) -> &ForwardedPortSet {
        &self.shared.registry
    }

    pub fn is_port_forwarded(&self, port: u16) -> bool {
        self.shared.registry.is_forwarded(port)
    }

    /// Waits until the host forwards `port`.
    ///
    /// Fails with [`RelayError::Timeout`] once `timeout` elapses, [`RelayError::Cancelled`] if
    /// `cancel` fires first, or [`RelayError::SessionClosed`] if the session closes first.
    pub async fn wait_for_forwarded_port(&self, port: u16, cancel: &CancellationToken, timeout: Option<Duration>) -> Result<(), RelayError> {
        self.shared.registry.wait_for_port(port, cancel, timeout).await
    }

    /// Waits for `port` to be forwarded, then carries a single caller-supplied connection to it
    /// until both ends are done.
    ///
    /// Cancelling `cancel` stops the wait, the open, or the bridge, whichever is in progress.
    pub async fn relay_connection<S>(&self, stream: S, port: u16, cancel: &CancellationToken) -> Result<BridgeStats, RelayError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.wait_for_forwarded_port(port, cancel, None).await?;
        let session = self.shared.session()?;

        let originator = SocketAddr::from(([0, 0, 0, 0], 0));
        let channel = tokio::select! {
            channel = forwarder::open_channel(&session, port, originator) => channel?,
            _ = cancel.cancelled() => return Err(RelayError::Cancelled),
        };

        debug!(port, channel_id = %channel.id(), "Relaying connection");
        let (bridge_cancel, _guard) = linked_token(&session.shutdown_token(), cancel);
        bridge(stream, channel, &bridge_cancel).await
    }

    /// Waits for `port` to be forwarded, then forwards every connection accepted on `listener` to
    /// it, until `cancel` fires or the session closes.
    pub async fn connect_listener_to_forwarded_port(&self, listener: TcpListener, port: u16, cancel: &CancellationToken) -> Result<(), RelayError> {
        self.wait_for_forwarded_port(port, cancel, None).await?;
        let session = self.shared.session()?;

        let (serve_cancel, _guard) = linked_token(&session.shutdown_token(), cancel);
        forwarder::serve_listener(session, listener, port, serve_cancel).await
    }

    /// Starts forwarding `port` from a local listener, returning the addresses it listens at. If
    /// one is already running for the port, returns its addresses instead.
    pub async fn start_local_forwarder(&self, port: u16) -> Result<Vec<SocketAddr>, RelayError> {
        let session = self.shared.session()?;
        self.shared.start_forwarder(&session, port).await
    }

    /// Stops the local forwarder for `port`. Returns false if there wasn't one.
    pub fn stop_local_forwarder(&self, port: u16) -> bool {
        self.shared.stop_forwarder(port)
    }

    /// The addresses the local forwarder for `port` listens at, if there is one.
    pub fn local_forwarder_addresses(&self, port: u16) -> Option<Vec<SocketAddr>> {
        self.shared.forwarders().get(&port).map(|forwarder| forwarder.addresses().to_vec())
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::duplex;

    use super::*;

    fn client(auto_bind: bool) -> ClientSession {
        let config = ClientConfig {
            auto_bind,
            handshake_timeout: Duration::from_secs(5),
            ..Default::default()
        };

        ClientSession::new(RelayEndpoint::client("ws://relay.invalid/", None), config)
    }

    #[tokio::test]
    async fn connecting_twice_is_invalid() {
        let client = client(false);
        let (a, b) = duplex(1024);
        drop(b);

        assert!(client.connect_stream(a).await.is_err());
        let (a, _b) = duplex(1024);
        assert!(matches!(client.connect_stream(a).await, Err(RelayError::InvalidState(_))));
    }

    #[tokio::test]
    async fn forwarder_apis_need_a_session() {
        let client = client(true);
        assert!(matches!(client.start_local_forwarder(8001).await, Err(RelayError::InvalidState(_))));
        assert!(!client.stop_local_forwarder(8001));
        assert_eq!(client.local_forwarder_addresses(8001), None);
    }

    #[tokio::test]
    async fn failed_handshake_wakes_port_waiters() {
        let client = client(false);
        let (a, b) = duplex(1024);
        drop(b);

        let cancel = CancellationToken::new();
        let (connected, waited) = tokio::join!(client.connect_stream(a), client.wait_for_forwarded_port(8001, &cancel, Some(Duration::from_secs(5))));
        assert!(connected.is_err());
        assert!(matches!(waited, Err(RelayError::SessionClosed)));
        assert_eq!(client.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn close_before_connecting_prevents_it() {
        let client = client(false);
        client.close();
        client.close();
        assert_eq!(client.state(), SessionState::Closed);

        let (a, _b) = duplex(1024);
        assert!(matches!(client.connect_stream(a).await, Err(RelayError::InvalidState(_))));
    }
}

//! The relay session: multiplexes global requests and any number of channels over one
//! transport.
//!
//! A session is role-agnostic. [`RelaySession::establish`] runs the hello exchange on a duplex
//! byte stream, then spawns two tasks that live as long as the session does:
//!
//! - A reader task, which decodes frames and dispatches them. Replies are matched to pending
//!   requests and opens, channel traffic goes to the channel it names, and incoming global
//!   requests and channel offers are queued in arrival order on [`SessionIncoming`].
//! - A writer task, which drains a queue of outgoing frames into the transport. Anything that
//!   wants to send a frame (channels, replies, opens) only enqueues it. Channel data also takes
//!   room in a send window shared by the whole session, which is only given back once the writer
//!   has handed the frame to the transport, so a backed-up transport stalls channel writes.
//!
//! A failure in either task is fatal to the session. Terminating the session closes the
//! transport, fails every pending request and open, and cuts off every channel.

use std::{
    collections::{HashMap, VecDeque},
    io::{self, ErrorKind},
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use bytes::Bytes;
use relay_tunnel_proto::{
    messages::{
        ChannelId, ChannelKind, Hello, OpenFailureReason, PortForwardChannelOpen, SessionMessage, SessionRole,
        PROTOCOL_VERSION,
    },
    serialize::{to_bytes, ByteRead, ByteWrite},
};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    sync::{mpsc, oneshot, OwnedSemaphorePermit, Semaphore},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, trace, warn, Instrument};

use crate::error::{ConnectError, RelayError};

mod channel;
mod requests;
mod state;

pub use channel::{Channel, ChannelOffer};
pub use requests::{GlobalReply, IncomingGlobalRequest};
pub use state::{Lifecycle, SessionState};

/// How long a closing session keeps trying to flush frames that were queued before it closed.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// How many bytes of channel data may be queued for the transport at once, across all channels.
pub const SEND_WINDOW_BYTES: usize = 1024 * 1024;

/// The address put in the informational target field of outgoing port forward opens.
const DEFAULT_REMOTE_ADDRESS: &str = "127.0.0.1";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Traffic for a channel, as handed from the reader task to the channel.
enum Inbound {
    Data(Bytes),
    Eof,
}

struct ChannelSlot {
    inbound: mpsc::UnboundedSender<Inbound>,
    remote_closed: Arc<AtomicBool>,
}

impl ChannelSlot {
    fn new() -> (Self, mpsc::UnboundedReceiver<Inbound>, Arc<AtomicBool>) {
        let (inbound, receiver) = mpsc::unbounded_channel();
        let remote_closed = Arc::new(AtomicBool::new(false));
        let slot = Self {
            inbound,
            remote_closed: Arc::clone(&remote_closed),
        };

        (slot, receiver, remote_closed)
    }
}

type OpenResult = Result<(), (OpenFailureReason, String)>;

/// A frame waiting for the writer task, holding its share of the send window if it carries
/// channel data.
struct Outbound {
    message: SessionMessage,
    window: Option<OwnedSemaphorePermit>,
}

struct SessionShared {
    role: SessionRole,
    outbound: mpsc::UnboundedSender<Outbound>,
    send_window: Arc<Semaphore>,
    channels: Mutex<HashMap<ChannelId, ChannelSlot>>,
    pending_opens: Mutex<HashMap<ChannelId, oneshot::Sender<OpenResult>>>,
    pending_requests: Mutex<VecDeque<oneshot::Sender<GlobalReply>>>,
    next_channel_id: AtomicU32,
    terminated: AtomicBool,
    lifecycle: Lifecycle,
    shutdown: CancellationToken,
}

impl SessionShared {
    fn send(&self, message: SessionMessage) -> Result<(), RelayError> {
        self.enqueue(Outbound { message, window: None })
    }

    /// Queues a channel data frame along with the send window it took.
    fn send_data(&self, message: SessionMessage, window: OwnedSemaphorePermit) -> Result<(), RelayError> {
        self.enqueue(Outbound {
            message,
            window: Some(window),
        })
    }

    fn enqueue(&self, outbound: Outbound) -> Result<(), RelayError> {
        if self.shutdown.is_cancelled() {
            return Err(RelayError::SessionClosed);
        }

        self.outbound.send(outbound).map_err(|_| RelayError::SessionClosed)
    }

    fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    fn remove_channel(&self, channel_id: ChannelId) -> Option<ChannelSlot> {
        lock(&self.channels).remove(&channel_id)
    }

    fn allocate_channel_id(&self) -> Result<ChannelId, RelayError> {
        self.next_channel_id
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |id| id.checked_add(1))
            .map(ChannelId)
            .map_err(|_| RelayError::InvalidState("channel IDs exhausted for this session"))
    }

    /// Closes the session. Only the first call has any effect.
    fn terminate(&self, reason: Option<String>) {
        if self.terminated.swap(true, Ordering::AcqRel) {
            return;
        }

        self.shutdown.cancel();
        self.send_window.close();
        let channel_count = {
            let mut channels = lock(&self.channels);
            let count = channels.len();
            channels.clear();
            count
        };
        lock(&self.pending_opens).clear();
        lock(&self.pending_requests).clear();

        match &reason {
            Some(reason) => warn!(role = %self.role, channel_count, %reason, "Session closed with error"),
            None => info!(role = %self.role, channel_count, "Session closed"),
        }

        self.lifecycle.set_closed(reason);
    }

    /// Handles one incoming frame. Errors are protocol violations that are fatal to the session.
    fn dispatch(self: &Arc<Self>, message: SessionMessage, incoming: &IncomingSenders) -> Result<(), String> {
        match message {
            SessionMessage::GlobalRequest {
                name,
                want_reply,
                payload,
            } => {
                debug!(%name, want_reply, "Incoming global request");
                let request = IncomingGlobalRequest::new(Arc::clone(self), name, want_reply, payload);
                // If nobody is taking requests, dropping it answers with a failure.
                let _ = incoming.requests.send(request);
            }
            SessionMessage::RequestSuccess { payload } => {
                self.complete_request(GlobalReply::Success(payload))?;
            }
            SessionMessage::RequestFailure => {
                self.complete_request(GlobalReply::Failure)?;
            }
            SessionMessage::ChannelOpen {
                channel_type,
                channel_id,
                payload,
            } => {
                let receiver_and_flag = {
                    let mut channels = lock(&self.channels);
                    match channels.contains_key(&channel_id) {
                        true => None,
                        false => {
                            let (slot, receiver, remote_closed) = ChannelSlot::new();
                            channels.insert(channel_id, slot);
                            Some((receiver, remote_closed))
                        }
                    }
                };

                let Some((receiver, remote_closed)) = receiver_and_flag else {
                    warn!(%channel_id, "Peer opened a channel with an ID already in use");
                    let _ = self.send(SessionMessage::ChannelOpenFailure {
                        channel_id,
                        reason: OpenFailureReason::ResourceShortage,
                        description: "channel ID already in use".to_string(),
                    });
                    return Ok(());
                };

                let kind = ChannelKind::from_name(&channel_type);
                debug!(%channel_id, %kind, "Incoming channel offer");
                let offer = ChannelOffer::new(Arc::clone(self), channel_id, kind, payload, receiver, remote_closed);
                // If nobody is taking offers, dropping it rejects it.
                let _ = incoming.offers.send(offer);
            }
            SessionMessage::ChannelOpenConfirmation { channel_id } => {
                let pending = lock(&self.pending_opens).remove(&channel_id);
                match pending {
                    Some(sender) => {
                        if sender.send(Ok(())).is_err() {
                            debug!(%channel_id, "Channel confirmed after its opener gave up, closing it");
                            self.remove_channel(channel_id);
                            let _ = self.send(SessionMessage::ChannelClose { channel_id });
                        }
                    }
                    None => debug!(%channel_id, "Ignoring confirmation for a channel that isn't being opened"),
                }
            }
            SessionMessage::ChannelOpenFailure {
                channel_id,
                reason,
                description,
            } => {
                let pending = lock(&self.pending_opens).remove(&channel_id);
                match pending {
                    Some(sender) => {
                        self.remove_channel(channel_id);
                        let _ = sender.send(Err((reason, description)));
                    }
                    None => debug!(%channel_id, "Ignoring open failure for a channel that isn't being opened"),
                }
            }
            SessionMessage::ChannelData { channel_id, data } => match lock(&self.channels).get(&channel_id) {
                Some(slot) => {
                    let _ = slot.inbound.send(Inbound::Data(Bytes::from(data)));
                }
                None => trace!(%channel_id, len = data.len(), "Dropping data for a closed channel"),
            },
            SessionMessage::ChannelEof { channel_id } => {
                if let Some(slot) = lock(&self.channels).get(&channel_id) {
                    let _ = slot.inbound.send(Inbound::Eof);
                }
            }
            SessionMessage::ChannelClose { channel_id } => {
                if let Some(slot) = self.remove_channel(channel_id) {
                    trace!(%channel_id, "Channel closed by peer");
                    slot.remote_closed.store(true, Ordering::Release);
                    let _ = slot.inbound.send(Inbound::Eof);
                }
            }
        }

        Ok(())
    }

    fn complete_request(&self, reply: GlobalReply) -> Result<(), String> {
        let pending = lock(&self.pending_requests).pop_front();
        match pending {
            Some(sender) => {
                let _ = sender.send(reply);
                Ok(())
            }
            None => Err("received a global request reply with no request outstanding".to_string()),
        }
    }
}

/// The senders behind [`SessionIncoming`], owned by the reader task. When the reader task ends,
/// they're dropped and the queues end.
struct IncomingSenders {
    requests: mpsc::UnboundedSender<IncomingGlobalRequest>,
    offers: mpsc::UnboundedSender<ChannelOffer>,
}

/// The queues of things the peer initiated, in arrival order. Both end once the session closes.
pub struct SessionIncoming {
    pub requests: mpsc::UnboundedReceiver<IncomingGlobalRequest>,
    pub offers: mpsc::UnboundedReceiver<ChannelOffer>,
}

/// A handle to an established relay session. Cloning yields another handle to the same session.
#[derive(Clone)]
pub struct RelaySession {
    shared: Arc<SessionShared>,
}

impl RelaySession {
    /// Runs the hello exchange over a duplex stream and starts the session's tasks.
    ///
    /// The lifecycle is moved to `Connecting` if it wasn't already there, then to `Established`
    /// on success or to `Closed` on failure. `handshake_timeout` bounds the wait for the peer's
    /// hello; `None` waits indefinitely.
    pub async fn establish<S>(
        stream: S,
        role: SessionRole,
        lifecycle: Lifecycle,
        handshake_timeout: Option<Duration>,
    ) -> Result<(Self, SessionIncoming), ConnectError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        lifecycle.begin_connecting();
        let (mut reader, mut writer) = tokio::io::split(stream);

        let result = handshake(&mut reader, &mut writer, role, handshake_timeout).await;
        if let Err(error) = result {
            lifecycle.set_closed(Some(error.to_string()));
            return Err(error);
        }

        let (outbound, outbound_receiver) = mpsc::unbounded_channel();
        let shared = Arc::new(SessionShared {
            role,
            outbound,
            send_window: Arc::new(Semaphore::new(SEND_WINDOW_BYTES)),
            channels: Mutex::new(HashMap::new()),
            pending_opens: Mutex::new(HashMap::new()),
            pending_requests: Mutex::new(VecDeque::new()),
            next_channel_id: AtomicU32::new(0),
            terminated: AtomicBool::new(false),
            lifecycle: lifecycle.clone(),
            shutdown: CancellationToken::new(),
        });

        let (requests_sender, requests) = mpsc::unbounded_channel();
        let (offers_sender, offers) = mpsc::unbounded_channel();
        let senders = IncomingSenders {
            requests: requests_sender,
            offers: offers_sender,
        };

        lifecycle.set_established();
        info!(%role, "Session established");

        let span = info_span!("session", %role);
        tokio::spawn(read_loop(Arc::clone(&shared), reader, senders).instrument(span.clone()));
        tokio::spawn(write_loop(Arc::clone(&shared), writer, outbound_receiver).instrument(span));

        Ok((Self { shared }, SessionIncoming { requests, offers }))
    }

    pub fn role(&self) -> SessionRole {
        self.shared.role
    }

    pub fn state(&self) -> SessionState {
        self.shared.lifecycle.state()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// A token cancelled when the session closes. Tasks serving the session should run under
    /// a child of it.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shared.shutdown.clone()
    }

    /// Waits until the session is closed, for whatever reason.
    pub async fn closed(&self) {
        self.shared.shutdown.cancelled().await
    }

    /// Closes the transport and every channel. Calling this more than once is harmless.
    pub fn close(&self) {
        self.shared.terminate(None);
    }

    /// Sends a global request. With `want_reply`, waits for the peer's reply; replies are
    /// matched to requests in the order the requests were sent. Without it, returns
    /// [`GlobalReply::Success`] with an empty payload as soon as the request is queued.
    pub async fn send_global_request(&self, name: &str, payload: Vec<u8>, want_reply: bool) -> Result<GlobalReply, RelayError> {
        let message = SessionMessage::GlobalRequest {
            name: name.to_string(),
            want_reply,
            payload,
        };

        if !want_reply {
            self.shared.send(message)?;
            return Ok(GlobalReply::Success(Vec::new()));
        }

        let receiver = {
            // Queueing the reply slot and the request under the same lock keeps them in the same
            // order when requests are sent concurrently.
            let mut pending = lock(&self.shared.pending_requests);
            self.shared.send(message)?;
            let (sender, receiver) = oneshot::channel();
            pending.push_back(sender);
            receiver
        };

        tokio::select! {
            reply = receiver => reply.map_err(|_| RelayError::SessionClosed),
            _ = self.shared.shutdown.cancelled() => Err(RelayError::SessionClosed),
        }
    }

    /// Opens a `direct-tcpip` channel towards one of the peer's advertised ports, on behalf of a
    /// connection coming from `originator`.
    pub async fn open_port_forward_channel(&self, port: u32, originator: SocketAddr) -> Result<Channel, RelayError> {
        let channel_id = self.shared.allocate_channel_id()?;
        let open = PortForwardChannelOpen {
            channel_id,
            originator_address: originator.ip().to_string(),
            port,
            remote_address: DEFAULT_REMOTE_ADDRESS.to_string(),
            remote_port: originator.port() as u32,
        };

        let payload = to_bytes(&open).await?;
        self.open_channel(ChannelKind::DirectTcpip, channel_id, payload).await
    }

    async fn open_channel(&self, kind: ChannelKind, channel_id: ChannelId, payload: Vec<u8>) -> Result<Channel, RelayError> {
        let (receiver, remote_closed) = {
            let mut channels = lock(&self.shared.channels);
            if channels.contains_key(&channel_id) {
                return Err(RelayError::InvalidState("channel ID already in use"));
            }

            let (slot, receiver, remote_closed) = ChannelSlot::new();
            channels.insert(channel_id, slot);
            (receiver, remote_closed)
        };

        let (sender, confirmation) = oneshot::channel();
        lock(&self.shared.pending_opens).insert(channel_id, sender);
        let mut guard = PendingOpenGuard {
            shared: &self.shared,
            channel_id,
            armed: true,
        };

        debug!(%channel_id, %kind, "Opening channel");
        self.shared.send(SessionMessage::ChannelOpen {
            channel_type: kind.name().to_string(),
            channel_id,
            payload,
        })?;

        let result = tokio::select! {
            result = confirmation => result.map_err(|_| RelayError::SessionClosed)?,
            _ = self.shared.shutdown.cancelled() => return Err(RelayError::SessionClosed),
        };

        match result {
            Ok(()) => {
                guard.armed = false;
                Ok(Channel::new(Arc::clone(&self.shared), channel_id, receiver, remote_closed))
            }
            Err((reason, description)) => {
                debug!(%channel_id, %reason, %description, "Channel open rejected");
                Err(RelayError::ChannelRejected { reason, description })
            }
        }
    }

    #[cfg(test)]
    fn set_next_channel_id(&self, id: u32) {
        self.shared.next_channel_id.store(id, Ordering::Relaxed);
    }
}

/// Undoes the bookkeeping of a channel open that didn't complete, including one whose future
/// was dropped while waiting for the peer.
struct PendingOpenGuard<'a> {
    shared: &'a Arc<SessionShared>,
    channel_id: ChannelId,
    armed: bool,
}

impl Drop for PendingOpenGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            lock(&self.shared.pending_opens).remove(&self.channel_id);
            self.shared.remove_channel(self.channel_id);
        }
    }
}

async fn handshake<R, W>(reader: &mut R, writer: &mut W, role: SessionRole, timeout: Option<Duration>) -> Result<(), ConnectError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let exchange = async {
        let hello = to_bytes(&Hello::new(role)).await?;
        writer.write_all(&hello).await?;
        writer.flush().await?;
        Hello::read(reader).await
    };

    let result = match timeout {
        Some(timeout) => tokio::time::timeout(timeout, exchange).await.map_err(|_| ConnectError::Timeout)?,
        None => exchange.await,
    };

    let peer_hello = result.map_err(|error| match error.kind() {
        ErrorKind::InvalidData => ConnectError::Handshake(error.to_string()),
        ErrorKind::UnexpectedEof => ConnectError::Handshake("connection closed during the handshake".to_string()),
        _ => ConnectError::Io(error),
    })?;

    if peer_hello.version != PROTOCOL_VERSION {
        let msg = format!("peer speaks protocol version {}, expected {PROTOCOL_VERSION}", peer_hello.version);
        return Err(ConnectError::Handshake(msg));
    }

    if peer_hello.role != role.peer() {
        return Err(ConnectError::RoleMismatch {
            expected: role.peer(),
            peer: peer_hello.role,
        });
    }

    Ok(())
}

async fn read_loop<R: AsyncRead + Unpin>(shared: Arc<SessionShared>, mut reader: R, incoming: IncomingSenders) {
    let reason = loop {
        let result = tokio::select! {
            biased;
            _ = shared.shutdown.cancelled() => break None,
            result = SessionMessage::read(&mut reader) => result,
        };

        match result {
            Ok(message) => {
                trace!(message_type = ?message.message_type(), channel_id = ?message.channel_id(), "Frame received");
                if let Err(reason) = shared.dispatch(message, &incoming) {
                    break Some(reason);
                }
            }
            Err(error) if error.kind() == ErrorKind::UnexpectedEof => {
                debug!("Peer closed the transport");
                break None;
            }
            Err(error) => break Some(format!("read failed: {error}")),
        }
    };

    shared.terminate(reason);
}

async fn write_loop<W: AsyncWrite + Unpin>(
    shared: Arc<SessionShared>,
    mut writer: W,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
) {
    let run = async {
        while let Some(next) = outbound.recv().await {
            next.message.write(&mut writer).await?;
            drop(next.window);
            while let Ok(next) = outbound.try_recv() {
                next.message.write(&mut writer).await?;
                drop(next.window);
            }
            writer.flush().await?;
        }

        Ok::<(), io::Error>(())
    };

    let result = tokio::select! {
        result = run => result,
        _ = shared.shutdown.cancelled() => Ok(()),
    };

    match result {
        Ok(()) => {
            let drain = async {
                while let Ok(next) = outbound.try_recv() {
                    next.message.write(&mut writer).await?;
                }
                writer.flush().await?;
                writer.shutdown().await
            };

            if let Ok(Err(error)) = tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, drain).await {
                debug!("Error while closing the transport: {error}");
            }
        }
        Err(error) => shared.terminate(Some(format!("write failed: {error}"))),
    }
}

use std::{
    fmt,
    io::{self, Error, ErrorKind},
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    task::{ready, Context, Poll},
};

use bytes::Bytes;
use relay_tunnel_proto::{
    messages::{ChannelId, ChannelKind, OpenFailureReason, PortForwardChannelOpen, SessionMessage, MAX_CHANNEL_DATA_LENGTH},
    serialize::from_bytes,
};
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    sync::mpsc,
};
use tokio_util::sync::PollSemaphore;
use tracing::trace;

use super::{Inbound, SessionShared};
use crate::error::RelayError;

/// One multiplexed byte stream within a session.
///
/// Reading yields what the peer sent until the peer sends EOF or closes the channel, after which
/// reads return 0. Shutting down the write side sends EOF to the peer, and dropping the channel
/// (or calling [`Channel::close`]) closes it.
///
/// Writes wait while the session's send window is full, that is, while the transport hasn't taken
/// the data already queued by this or other channels.
///
/// Once the session closes, reads fail with [`ErrorKind::ConnectionAborted`] and writes with
/// [`ErrorKind::BrokenPipe`].
pub struct Channel {
    id: ChannelId,
    session: Arc<SessionShared>,
    send_window: PollSemaphore,
    inbound: mpsc::UnboundedReceiver<Inbound>,
    read_buf: Bytes,
    read_eof: bool,
    remote_closed: Arc<AtomicBool>,
    write_shutdown: bool,
    closed: bool,
}

impl Channel {
    pub(super) fn new(
        session: Arc<SessionShared>,
        id: ChannelId,
        inbound: mpsc::UnboundedReceiver<Inbound>,
        remote_closed: Arc<AtomicBool>,
    ) -> Self {
        let send_window = PollSemaphore::new(Arc::clone(&session.send_window));
        Self {
            id,
            session,
            send_window,
            inbound,
            read_buf: Bytes::new(),
            read_eof: false,
            remote_closed,
            write_shutdown: false,
            closed: false,
        }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Closes the channel, telling the peer unless the session is already gone. Calling this
    /// more than once is harmless.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }

        self.closed = true;
        self.session.remove_channel(self.id);
        if !self.session.is_closed() && !self.remote_closed.load(Ordering::Acquire) {
            trace!(channel_id = %self.id, "Closing channel");
            let _ = self.session.send(SessionMessage::ChannelClose { channel_id: self.id });
        }
    }

    fn write_error(&self) -> Option<Error> {
        if self.closed {
            Some(Error::new(ErrorKind::NotConnected, "channel is closed"))
        } else if self.session.is_closed() {
            Some(Error::new(ErrorKind::BrokenPipe, "relay session is closed"))
        } else if self.write_shutdown {
            Some(Error::new(ErrorKind::BrokenPipe, "channel write side was shut down"))
        } else if self.remote_closed.load(Ordering::Acquire) {
            Some(Error::new(ErrorKind::BrokenPipe, "channel was closed by the peer"))
        } else {
            None
        }
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel").field("id", &self.id).field("closed", &self.closed).finish()
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.close();
    }
}

impl AsyncRead for Channel {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        loop {
            if !this.read_buf.is_empty() {
                let to_copy = this.read_buf.len().min(buf.remaining());
                buf.put_slice(&this.read_buf[..to_copy]);
                this.read_buf = this.read_buf.slice(to_copy..);
                return Poll::Ready(Ok(()));
            }

            if this.read_eof {
                return Poll::Ready(Ok(()));
            }

            if this.closed {
                return Poll::Ready(Err(Error::new(ErrorKind::NotConnected, "channel is closed")));
            }

            match this.inbound.poll_recv(cx) {
                Poll::Ready(Some(Inbound::Data(data))) => this.read_buf = data,
                Poll::Ready(Some(Inbound::Eof)) => this.read_eof = true,
                Poll::Ready(None) => {
                    return Poll::Ready(Err(Error::new(ErrorKind::ConnectionAborted, "relay session is closed")));
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl AsyncWrite for Channel {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, data: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if let Some(error) = this.write_error() {
            return Poll::Ready(Err(error));
        }

        if data.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let len = data.len().min(MAX_CHANNEL_DATA_LENGTH);
        let Some(window) = ready!(this.send_window.poll_acquire_many(cx, len as u32)) else {
            return Poll::Ready(Err(Error::new(ErrorKind::BrokenPipe, "relay session is closed")));
        };

        let message = SessionMessage::ChannelData {
            channel_id: this.id,
            data: data[..len].to_vec(),
        };

        match this.session.send_data(message, window) {
            Ok(()) => Poll::Ready(Ok(len)),
            Err(_) => Poll::Ready(Err(Error::new(ErrorKind::BrokenPipe, "relay session is closed"))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.write_shutdown || this.closed || this.remote_closed.load(Ordering::Acquire) {
            this.write_shutdown = true;
            return Poll::Ready(Ok(()));
        }

        this.write_shutdown = true;
        match this.session.send(SessionMessage::ChannelEof { channel_id: this.id }) {
            Ok(()) => Poll::Ready(Ok(())),
            Err(_) => Poll::Ready(Err(Error::new(ErrorKind::BrokenPipe, "relay session is closed"))),
        }
    }
}

/// A channel the peer wants to open, waiting to be accepted or rejected.
///
/// Dropping an offer without answering it rejects it.
pub struct ChannelOffer {
    session: Arc<SessionShared>,
    channel_id: ChannelId,
    kind: ChannelKind,
    payload: Vec<u8>,
    parts: Option<(mpsc::UnboundedReceiver<Inbound>, Arc<AtomicBool>)>,
}

impl ChannelOffer {
    pub(super) fn new(
        session: Arc<SessionShared>,
        channel_id: ChannelId,
        kind: ChannelKind,
        payload: Vec<u8>,
        inbound: mpsc::UnboundedReceiver<Inbound>,
        remote_closed: Arc<AtomicBool>,
    ) -> Self {
        Self {
            session,
            channel_id,
            kind,
            payload,
            parts: Some((inbound, remote_closed)),
        }
    }

    pub fn channel_id(&self) -> ChannelId {
        self.channel_id
    }

    pub fn kind(&self) -> &ChannelKind {
        &self.kind
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Parses the payload as a `direct-tcpip` open.
    ///
    /// Fails with [`ErrorKind::InvalidData`] if the payload is malformed or names a different
    /// channel than the one being offered.
    pub async fn port_forward_open(&self) -> io::Result<PortForwardChannelOpen> {
        let open: PortForwardChannelOpen = from_bytes(&self.payload).await?;
        if open.channel_id != self.channel_id {
            let msg = format!("payload names channel {} but channel {} was offered", open.channel_id, self.channel_id);
            return Err(Error::new(ErrorKind::InvalidData, msg));
        }

        Ok(open)
    }

    pub fn accept(mut self) -> Result<Channel, RelayError> {
        let (inbound, remote_closed) = self.parts.take().ok_or(RelayError::InvalidState("channel offer already answered"))?;
        self.session.send(SessionMessage::ChannelOpenConfirmation {
            channel_id: self.channel_id,
        })?;

        trace!(channel_id = %self.channel_id, "Channel accepted");
        Ok(Channel::new(Arc::clone(&self.session), self.channel_id, inbound, remote_closed))
    }

    pub fn reject(mut self, reason: OpenFailureReason, description: impl Into<String>) {
        self.reject_inner(reason, description.into());
    }

    fn reject_inner(&mut self, reason: OpenFailureReason, description: String) {
        if self.parts.take().is_none() {
            return;
        }

        trace!(channel_id = %self.channel_id, %reason, %description, "Channel rejected");
        self.session.remove_channel(self.channel_id);
        let _ = self.session.send(SessionMessage::ChannelOpenFailure {
            channel_id: self.channel_id,
            reason,
            description,
        });
    }
}

impl fmt::Debug for ChannelOffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelOffer")
            .field("channel_id", &self.channel_id)
            .field("kind", &self.kind)
            .finish()
    }
}

impl Drop for ChannelOffer {
    fn drop(&mut self) {
        self.reject_inner(OpenFailureReason::AdministrativelyProhibited, "channel offer was not handled".to_string());
    }
}

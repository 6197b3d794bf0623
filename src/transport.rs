//! The transport adapter: a relay connection exposed as a byte stream.
//!
//! The relay speaks WebSocket. [`connect`] dials it with the sub-protocol and credentials of the
//! endpoint's role, and [`RelayStream`] turns the resulting message stream into an
//! [`AsyncRead`] + [`AsyncWrite`] duplex, so the session protocol can be layered on top without
//! knowing about message boundaries.

use std::{
    future::Future,
    io::{self, Error, ErrorKind},
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use bytes::Bytes;
use futures_util::{Sink, Stream};
use relay_tunnel_proto::messages::SessionRole;
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::TcpStream,
    time::{Instant, Sleep},
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        error::{Error as WsError, ProtocolError},
        handshake::client::Request,
        http::{header, HeaderValue},
        Message,
    },
    MaybeTlsStream, WebSocketStream,
};
use tracing::debug;

use crate::{
    endpoint::{RelayEndpoint, AUTHORIZATION_SCHEME},
    error::ConnectError,
};

/// A relay connection as a byte stream.
///
/// - Reads drain binary (and text) messages as one continuous stream of bytes. A read that
///   exhausts a message transparently waits for the next one.
/// - A close message from the peer is a clean EOF. Any other failure of the connection is an
///   I/O error.
/// - Each write is sent as one binary message. Writes are only guaranteed to be on the wire
///   after a flush.
/// - Shutting down sends a close message.
///
/// Pings are answered by the WebSocket layer itself while reading.
pub struct RelayStream<S> {
    ws: WebSocketStream<S>,
    read_buf: Bytes,
    read_closed: bool,
    read_deadline: Option<Pin<Box<Sleep>>>,
    write_deadline: Option<Pin<Box<Sleep>>>,
}

impl<S> RelayStream<S> {
    pub fn new(ws: WebSocketStream<S>) -> Self {
        Self {
            ws,
            read_buf: Bytes::new(),
            read_closed: false,
            read_deadline: None,
            write_deadline: None,
        }
    }

    pub fn into_inner(self) -> WebSocketStream<S> {
        self.ws
    }

    /// Sets the instant after which reads fail with [`ErrorKind::TimedOut`], or `None` to
    /// remove the deadline. Affects reads already in progress.
    pub fn set_read_deadline(&mut self, deadline: Option<Instant>) {
        set_deadline(&mut self.read_deadline, deadline);
    }

    /// Sets the instant after which writes and flushes fail with [`ErrorKind::TimedOut`], or
    /// `None` to remove the deadline. Affects writes already in progress.
    pub fn set_write_deadline(&mut self, deadline: Option<Instant>) {
        set_deadline(&mut self.write_deadline, deadline);
    }

    fn drain_read_buf(&mut self, buf: &mut ReadBuf<'_>) {
        let to_copy = self.read_buf.len().min(buf.remaining());
        buf.put_slice(&self.read_buf[..to_copy]);
        self.read_buf = self.read_buf.slice(to_copy..);
    }
}

fn set_deadline(slot: &mut Option<Pin<Box<Sleep>>>, deadline: Option<Instant>) {
    match (slot.as_mut(), deadline) {
        (Some(sleep), Some(deadline)) => sleep.as_mut().reset(deadline),
        (None, Some(deadline)) => *slot = Some(Box::pin(tokio::time::sleep_until(deadline))),
        (_, None) => *slot = None,
    }
}

fn poll_deadline(deadline: &mut Option<Pin<Box<Sleep>>>, cx: &mut Context<'_>, what: &str) -> Poll<io::Result<()>> {
    match deadline {
        Some(sleep) => match sleep.as_mut().poll(cx) {
            Poll::Ready(()) => Poll::Ready(Err(Error::new(ErrorKind::TimedOut, format!("{what} deadline exceeded")))),
            Poll::Pending => Poll::Pending,
        },
        None => Poll::Pending,
    }
}

impl<S> AsyncRead for RelayStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if let Poll::Ready(Err(error)) = poll_deadline(&mut this.read_deadline, cx, "read") {
            return Poll::Ready(Err(error));
        }

        if !this.read_buf.is_empty() {
            this.drain_read_buf(buf);
            return Poll::Ready(Ok(()));
        }

        if this.read_closed {
            return Poll::Ready(Ok(()));
        }

        loop {
            match Pin::new(&mut this.ws).poll_next(cx) {
                Poll::Ready(Some(Ok(msg))) => match msg {
                    Message::Binary(data) => {
                        if data.is_empty() {
                            continue;
                        }
                        this.read_buf = Bytes::from(data);
                        this.drain_read_buf(buf);
                        return Poll::Ready(Ok(()));
                    }
                    Message::Text(text) => {
                        if text.is_empty() {
                            continue;
                        }
                        this.read_buf = Bytes::from(text.into_bytes());
                        this.drain_read_buf(buf);
                        return Poll::Ready(Ok(()));
                    }
                    Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
                    Message::Close(frame) => {
                        debug!(?frame, "Relay connection closed by peer");
                        this.read_closed = true;
                        return Poll::Ready(Ok(()));
                    }
                },
                Poll::Ready(Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed))) | Poll::Ready(None) => {
                    this.read_closed = true;
                    return Poll::Ready(Ok(()));
                }
                Poll::Ready(Some(Err(error))) => return Poll::Ready(Err(ws_to_io_error(error))),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl<S> AsyncWrite for RelayStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, data: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        if let Poll::Ready(Err(error)) = poll_deadline(&mut this.write_deadline, cx, "write") {
            return Poll::Ready(Err(error));
        }

        if data.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let mut ws = Pin::new(&mut this.ws);
        match ws.as_mut().poll_ready(cx) {
            Poll::Ready(Ok(())) => match ws.start_send(Message::Binary(data.to_vec())) {
                Ok(()) => Poll::Ready(Ok(data.len())),
                Err(error) => Poll::Ready(Err(ws_to_io_error(error))),
            },
            Poll::Ready(Err(error)) => Poll::Ready(Err(ws_to_io_error(error))),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if let Poll::Ready(Err(error)) = poll_deadline(&mut this.write_deadline, cx, "write") {
            return Poll::Ready(Err(error));
        }

        Pin::new(&mut this.ws).poll_flush(cx).map_err(ws_to_io_error)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match Pin::new(&mut this.ws).poll_close(cx) {
            Poll::Ready(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => Poll::Ready(Ok(())),
            other => other.map_err(ws_to_io_error),
        }
    }
}

fn ws_to_io_error(error: WsError) -> Error {
    match error {
        WsError::Io(error) => error,
        WsError::ConnectionClosed | WsError::AlreadyClosed => Error::new(ErrorKind::BrokenPipe, error),
        WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => Error::new(ErrorKind::ConnectionReset, error),
        other => Error::other(other),
    }
}

/// The stream type of a relay connection dialed with [`connect`].
pub type RelayConnection = RelayStream<MaybeTlsStream<TcpStream>>;

/// Dials the relay at the endpoint's URI and negotiates the endpoint's role sub-protocol.
///
/// A host presents its access token in an `Authorization: tunnel <token>` header. A client
/// offers it as a second sub-protocol value after its role's.
pub async fn connect(endpoint: &RelayEndpoint, timeout: Duration) -> Result<RelayConnection, ConnectError> {
    let request = build_request(endpoint)?;
    debug!(uri = %endpoint.uri, role = %endpoint.role, "Dialing relay");

    let (ws, response) = match tokio::time::timeout(timeout, connect_async(request)).await {
        Ok(Ok(t)) => t,
        Ok(Err(error)) => return Err(map_dial_error(endpoint, error)),
        Err(_) => return Err(ConnectError::Timeout),
    };

    let selected = response
        .headers()
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string());

    if selected.as_deref() != Some(endpoint.subprotocol()) {
        return Err(ConnectError::SubprotocolMismatch {
            expected: endpoint.subprotocol().to_string(),
            selected,
        });
    }

    debug!(uri = %endpoint.uri, status = %response.status(), "Relay connection upgraded");
    Ok(RelayStream::new(ws))
}

fn build_request(endpoint: &RelayEndpoint) -> Result<Request, ConnectError> {
    let mut request = endpoint
        .uri
        .as_str()
        .into_client_request()
        .map_err(|error| ConnectError::InvalidUri(format!("{}: {error}", endpoint.uri)))?;

    let subprotocols = match (endpoint.role, endpoint.access_token.as_deref()) {
        (SessionRole::Client, Some(token)) => format!("{}, {token}", endpoint.subprotocol()),
        _ => endpoint.subprotocol().to_string(),
    };

    let headers = request.headers_mut();
    headers.insert(header::SEC_WEBSOCKET_PROTOCOL, header_value(subprotocols)?);

    if endpoint.role == SessionRole::Host {
        if let Some(token) = endpoint.access_token.as_deref() {
            headers.insert(header::AUTHORIZATION, header_value(format!("{AUTHORIZATION_SCHEME} {token}"))?);
        }
    }

    Ok(request)
}

fn header_value(value: String) -> Result<HeaderValue, ConnectError> {
    HeaderValue::from_str(&value).map_err(|_| ConnectError::InvalidUri("access token is not a valid header value".to_string()))
}

fn map_dial_error(endpoint: &RelayEndpoint, error: WsError) -> ConnectError {
    match error {
        WsError::Http(response) => ConnectError::UpgradeRejected(response.status()),
        WsError::Url(error) => ConnectError::InvalidUri(format!("{}: {error}", endpoint.uri)),
        WsError::Io(error) => ConnectError::Io(error),
        other => ConnectError::Dial(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use futures_util::{SinkExt, StreamExt};
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio_tungstenite::tungstenite::protocol::Role;

    use super::*;

    async fn ws_pair() -> (RelayStream<DuplexStream>, WebSocketStream<DuplexStream>) {
        let (a, b) = duplex(64 * 1024);
        let client = WebSocketStream::from_raw_socket(a, Role::Client, None).await;
        let server = WebSocketStream::from_raw_socket(b, Role::Server, None).await;
        (RelayStream::new(client), server)
    }

    #[tokio::test]
    async fn reads_resume_across_messages() {
        let (mut stream, mut peer) = ws_pair().await;
        peer.send(Message::Binary(b"hel".to_vec())).await.unwrap();
        peer.send(Message::Binary(b"lo wor".to_vec())).await.unwrap();
        peer.send(Message::Binary(b"ld".to_vec())).await.unwrap();

        let mut buf = [0u8; 11];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello world");
    }

    #[tokio::test]
    async fn close_message_is_clean_eof() {
        let (mut stream, mut peer) = ws_pair().await;
        peer.send(Message::Binary(b"last".to_vec())).await.unwrap();
        peer.close(None).await.unwrap();

        let mut received = Vec::new();
        stream.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"last");
        assert_eq!(stream.read(&mut [0u8; 8]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn each_write_is_one_binary_message() {
        let (mut stream, mut peer) = ws_pair().await;
        stream.write_all(b"frame").await.unwrap();
        stream.flush().await.unwrap();

        match peer.next().await {
            Some(Ok(Message::Binary(data))) => assert_eq!(data, b"frame"),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn read_deadline_fails_until_cleared() {
        let (mut stream, mut peer) = ws_pair().await;
        stream.set_read_deadline(Some(Instant::now() + Duration::from_millis(20)));

        let error = stream.read(&mut [0u8; 8]).await.unwrap_err();
        assert_eq!(error.kind(), ErrorKind::TimedOut);
        let error = stream.read(&mut [0u8; 8]).await.unwrap_err();
        assert_eq!(error.kind(), ErrorKind::TimedOut);

        stream.set_read_deadline(None);
        peer.send(Message::Binary(b"ok".to_vec())).await.unwrap();
        let mut buf = [0u8; 2];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ok");
    }

    #[test]
    fn host_request_carries_authorization() {
        let endpoint = RelayEndpoint::host("ws://relay.example/connect", "tok");
        let request = build_request(&endpoint).unwrap();
        assert_eq!(request.headers()[header::SEC_WEBSOCKET_PROTOCOL], "tunnel-relay-host");
        assert_eq!(request.headers()[header::AUTHORIZATION], "tunnel tok");
    }

    #[test]
    fn client_request_carries_token_as_subprotocol() {
        let endpoint = RelayEndpoint::client("ws://relay.example/connect", Some("tok".to_string()));
        let request = build_request(&endpoint).unwrap();
        assert_eq!(request.headers()[header::SEC_WEBSOCKET_PROTOCOL], "tunnel-relay-client, tok");
        assert!(request.headers().get(header::AUTHORIZATION).is_none());
    }

    #[test]
    fn invalid_uri_is_reported() {
        let endpoint = RelayEndpoint::client("not a uri", None);
        assert!(matches!(build_request(&endpoint), Err(ConnectError::InvalidUri(_))));
    }
}

//! Host and client sessions talking over an in-memory transport.

use std::{net::SocketAddr, time::Duration};

use relay_tunnel::{
    config::{ClientConfig, HostConfig, HostPort},
    endpoint::RelayEndpoint,
    error::RelayError,
    registry::{PortEvent, PortEventKind},
    session::{Lifecycle, RelaySession, SessionState},
    ClientSession, HostSession,
};
use relay_tunnel_proto::{
    messages::{GlobalRequest, OpenFailureReason, SessionRole},
    serialize::to_bytes,
};
use tokio::{
    io::{duplex, AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    time::timeout,
};
use tokio_util::sync::CancellationToken;

const STEP: Duration = Duration::from_secs(5);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .with_test_writer()
        .try_init();
}

fn host_session(ports: Vec<HostPort>) -> HostSession {
    let config = HostConfig {
        handshake_timeout: Some(STEP),
        ..HostConfig::new(ports)
    };

    HostSession::new(RelayEndpoint::host("ws://relay.invalid/host", "token"), config)
}

fn client_session(auto_bind: bool) -> ClientSession {
    let config = ClientConfig {
        auto_bind,
        handshake_timeout: STEP,
        ..Default::default()
    };

    ClientSession::new(RelayEndpoint::client("ws://relay.invalid/client", Some("token".to_string())), config)
}

async fn connect_pair(host: &HostSession, client: &ClientSession) {
    let (a, b) = duplex(256 * 1024);
    let (host_result, client_result) = tokio::join!(host.connect_stream(a), client.connect_stream(b));
    host_result.unwrap();
    client_result.unwrap();
}

/// A local service that echoes back everything it reads on each connection.
async fn echo_service() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };

            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });

    address
}

async fn forwarded_address(client: &ClientSession, port: u16) -> SocketAddr {
    client.local_forwarder_addresses(port).expect("port has a local forwarder")[0]
}

#[tokio::test]
async fn ping_reaches_the_host_service_and_the_reply_comes_back() {
    init_tracing();

    let service = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let service_address = service.local_addr().unwrap();
    let service_task = tokio::spawn(async move {
        let (mut stream, _) = service.accept().await.unwrap();
        let mut request = [0u8; 4];
        stream.read_exact(&mut request).await.unwrap();
        stream.write_all(b"pong").await.unwrap();
        request
    });

    let host = host_session(vec![HostPort::new(8001, service_address.to_string())]);
    let client = client_session(true);
    connect_pair(&host, &client).await;

    assert_eq!(host.state(), SessionState::Established);
    assert_eq!(client.state(), SessionState::Established);
    assert!(client.is_port_forwarded(8001));

    let mut local = TcpStream::connect(forwarded_address(&client, 8001).await).await.unwrap();
    local.write_all(b"ping").await.unwrap();

    let mut reply = [0u8; 4];
    timeout(STEP, local.read_exact(&mut reply)).await.unwrap().unwrap();
    assert_eq!(&reply, b"pong");
    assert_eq!(&timeout(STEP, service_task).await.unwrap().unwrap(), b"ping");
}

#[tokio::test]
async fn waiting_for_a_port_sees_the_advertisement() {
    init_tracing();
    let service = echo_service().await;

    let host = host_session(vec![HostPort::new(8001, service.to_string())]);
    let client = client_session(false);
    let cancel = CancellationToken::new();

    let (a, b) = duplex(64 * 1024);
    let (host_result, client_result, waited) = tokio::join!(
        host.connect_stream(a),
        client.connect_stream(b),
        client.wait_for_forwarded_port(8001, &cancel, Some(STEP)),
    );

    host_result.unwrap();
    client_result.unwrap();
    waited.unwrap();
    assert!(client.is_port_forwarded(8001));
    assert_eq!(client.local_forwarder_addresses(8001), None);

    let never = client.wait_for_forwarded_port(8002, &cancel, Some(Duration::from_millis(50))).await;
    assert!(matches!(never, Err(RelayError::Timeout)));
}

#[tokio::test]
async fn independent_connections_do_not_cross_talk() {
    init_tracing();
    let service = echo_service().await;

    let host = host_session(vec![HostPort::new(8001, service.to_string())]);
    let client = client_session(true);
    connect_pair(&host, &client).await;

    let address = forwarded_address(&client, 8001).await;
    let first = TcpStream::connect(address).await.unwrap();
    let second = TcpStream::connect(address).await.unwrap();

    let first_data: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
    let second_data: Vec<u8> = (0..70_000u32).map(|i| (i % 13) as u8 + 100).collect();

    let exchange = |mut stream: TcpStream, data: Vec<u8>| async move {
        let (mut reader, mut writer) = stream.split();
        let send = async {
            writer.write_all(&data).await.unwrap();
            writer.shutdown().await.unwrap();
        };
        let receive = async {
            let mut received = Vec::new();
            reader.read_to_end(&mut received).await.unwrap();
            received
        };

        let ((), received) = tokio::join!(send, receive);
        assert_eq!(received, data);
    };

    let both = async {
        tokio::join!(exchange(first, first_data.clone()), exchange(second, second_data.clone()));
    };
    timeout(STEP, both).await.unwrap();

    let mut third = TcpStream::connect(address).await.unwrap();
    third.write_all(b"again").await.unwrap();
    let mut buf = [0u8; 5];
    timeout(STEP, third.read_exact(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf, b"again");
}

#[tokio::test]
async fn prohibited_port_is_rejected_and_the_next_open_still_works() {
    init_tracing();
    let service = echo_service().await;
    let host = host_session(vec![HostPort::new(8001, service.to_string())]);

    // A bare client session, so channels can be opened to ports that were never advertised.
    let (a, b) = duplex(64 * 1024);
    let establish = RelaySession::establish(b, SessionRole::Client, Lifecycle::new(), Some(STEP));
    let (host_result, established) = tokio::join!(host.connect_stream(a), async {
        let (session, mut incoming) = establish.await.unwrap();
        let request = incoming.requests.recv().await.unwrap();
        let GlobalRequest::PortForward(forward) = request.parse().await.unwrap() else {
            panic!("expected a port forward request");
        };
        request.reply_success(to_bytes(&forward).await.unwrap());
        (session, incoming)
    });
    host_result.unwrap();
    let (client, _incoming) = established;

    let originator: SocketAddr = "127.0.0.1:40000".parse().unwrap();
    for _ in 0..3 {
        match client.open_port_forward_channel(9999, originator).await {
            Err(RelayError::ChannelRejected { reason, description }) => {
                assert_eq!(reason, OpenFailureReason::AdministrativelyProhibited);
                assert_eq!(description, "prohibited port");
            }
            other => panic!("unexpected result: {:?}", other.map(|channel| channel.id())),
        }
    }

    let mut channel = timeout(STEP, client.open_port_forward_channel(8001, originator)).await.unwrap().unwrap();
    channel.write_all(b"still serving").await.unwrap();
    channel.shutdown().await.unwrap();

    let mut echoed = Vec::new();
    timeout(STEP, channel.read_to_end(&mut echoed)).await.unwrap().unwrap();
    assert_eq!(echoed, b"still serving");
}

#[tokio::test]
async fn retracted_port_is_forgotten_by_the_client() {
    init_tracing();
    let service = echo_service().await;

    let host = host_session(vec![HostPort::new(8001, service.to_string()), HostPort::new(8002, service.to_string())]);
    let client = client_session(true);
    connect_pair(&host, &client).await;
    assert_eq!(client.forwarded_ports().ports(), vec![8001, 8002]);

    let mut events = client.forwarded_ports().subscribe();
    host.retract_port(8001).await.unwrap();

    assert_eq!(
        timeout(STEP, events.recv()).await.unwrap().unwrap(),
        PortEvent {
            port: 8001,
            kind: PortEventKind::Removed,
        }
    );
    assert!(!client.is_port_forwarded(8001));
    assert_eq!(client.local_forwarder_addresses(8001), None);
    assert!(client.is_port_forwarded(8002));
    assert!(client.local_forwarder_addresses(8002).is_some());
}

#[tokio::test]
async fn closing_the_session_tears_down_running_bridges() {
    init_tracing();

    let service = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let service_address = service.local_addr().unwrap();

    let host = host_session(vec![HostPort::new(8001, service_address.to_string())]);
    let client = client_session(true);
    connect_pair(&host, &client).await;

    let mut local = TcpStream::connect(forwarded_address(&client, 8001).await).await.unwrap();
    local.write_all(b"mid-copy").await.unwrap();

    let (mut served, _) = timeout(STEP, service.accept()).await.unwrap().unwrap();
    let mut buf = [0u8; 8];
    served.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"mid-copy");

    host.close();
    timeout(STEP, client.closed()).await.unwrap();
    assert_eq!(client.state(), SessionState::Closed);

    // Both ends of the bridge are released: each sees EOF or a reset, never a hang.
    let mut rest = Vec::new();
    let local_end = timeout(STEP, local.read_to_end(&mut rest)).await.unwrap();
    assert!(local_end.is_err() || local_end.unwrap() == 0);
    let served_end = timeout(STEP, served.read_to_end(&mut rest)).await.unwrap();
    assert!(served_end.is_err() || served_end.unwrap() == 0);

    let cancel = CancellationToken::new();
    let waited = client.wait_for_forwarded_port(8001, &cancel, Some(STEP)).await;
    assert!(waited.is_ok(), "the port was recorded before the session closed");
    let waited = client.wait_for_forwarded_port(8003, &cancel, Some(STEP)).await;
    assert!(matches!(waited, Err(RelayError::SessionClosed)));
}

#[tokio::test]
async fn relay_connection_carries_a_caller_supplied_stream() {
    init_tracing();
    let service = echo_service().await;

    let host = host_session(vec![HostPort::new(8001, service.to_string())]);
    let client = client_session(false);
    connect_pair(&host, &client).await;

    let (mut app, relayed) = duplex(4096);
    let cancel = CancellationToken::new();

    let app_side = async {
        app.write_all(b"through a pipe").await.unwrap();
        app.shutdown().await.unwrap();
        let mut echoed = Vec::new();
        app.read_to_end(&mut echoed).await.unwrap();
        echoed
    };

    let (stats, echoed) = timeout(STEP, async { tokio::join!(client.relay_connection(relayed, 8001, &cancel), app_side) })
        .await
        .unwrap();

    assert_eq!(echoed, b"through a pipe");
    let stats = stats.unwrap();
    assert_eq!(stats.sent, 14);
    assert_eq!(stats.received, 14);
}

#[tokio::test]
async fn cancelled_relay_connection_returns_promptly() {
    init_tracing();
    let host = host_session(vec![]);
    let client = client_session(false);
    connect_pair(&host, &client).await;

    let (_app, relayed) = duplex(1024);
    let cancel = CancellationToken::new();
    let canceller = {
        let cancel = cancel.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        }
    };

    let (result, ()) = timeout(Duration::from_secs(1), async { tokio::join!(client.relay_connection(relayed, 8001, &cancel), canceller) })
        .await
        .unwrap();
    assert!(matches!(result, Err(RelayError::Cancelled)));
    assert!(!client.is_port_forwarded(8001));
}

//! Loopback end-to-end tunnels: relay, host and client in one process,
//! echo services standing in for the forwarded application.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;

use wtt::config::{ClientConfig, HostConfig, Protocol, ServerConfig};
use wtt::relay::{self, RelayState};
use wtt::{client, host};

const ESTABLISH_TIMEOUT: Duration = Duration::from_secs(20);
const ECHO_TIMEOUT: Duration = Duration::from_secs(5);

struct TestRelay {
    addr: SocketAddr,
    state: Arc<RelayState>,
    shutdown: CancellationToken,
}

async fn spawn_relay_on(addr: SocketAddr) -> TestRelay {
    let shutdown = CancellationToken::new();
    let state = Arc::new(RelayState::new(&ServerConfig::default(), shutdown.clone()));
    let listener = TcpListener::bind(addr).await.expect("bind relay");
    let addr = listener.local_addr().expect("relay addr");
    let app = relay::router(state.clone());
    let server_shutdown = shutdown.clone();
    tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(server_shutdown.cancelled_owned())
            .await
            .ok();
    });
    TestRelay {
        addr,
        state,
        shutdown,
    }
}

async fn spawn_relay() -> TestRelay {
    spawn_relay_on("127.0.0.1:0".parse().expect("wildcard")).await
}

impl TestRelay {
    fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }
}

async fn spawn_tcp_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind echo");
    let addr = listener.local_addr().expect("echo addr");
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut read, mut write) = stream.split();
                let _ = tokio::io::copy(&mut read, &mut write).await;
            });
        }
    });
    addr
}

async fn spawn_udp_echo() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind echo");
    let addr = socket.local_addr().expect("echo addr");
    tokio::spawn(async move {
        let mut buf = vec![0u8; 2048];
        while let Ok((n, from)) = socket.recv_from(&mut buf).await {
            let _ = socket.send_to(&buf[..n], from).await;
        }
    });
    addr
}

fn free_tcp_addr() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("probe");
    listener.local_addr().expect("probe addr")
}

fn free_udp_addr() -> SocketAddr {
    let socket = std::net::UdpSocket::bind("127.0.0.1:0").expect("probe");
    socket.local_addr().expect("probe addr")
}

fn host_config(id: &str, relay: &TestRelay, remote: SocketAddr, protocol: Protocol) -> HostConfig {
    HostConfig {
        id: id.to_string(),
        signal: relay.url(),
        remote: remote.to_string(),
        protocol,
        stun_servers: Vec::new(),
        token: String::new(),
        timeout: 10,
    }
}

fn client_config(
    id: &str,
    relay: &TestRelay,
    local: SocketAddr,
    protocol: Protocol,
) -> ClientConfig {
    ClientConfig {
        id: id.to_string(),
        signal: relay.url(),
        local: local.to_string(),
        protocol,
        stun_servers: Vec::new(),
        token: String::new(),
        timeout: 10,
    }
}

fn spawn_host(cfg: HostConfig, shutdown: &CancellationToken) -> JoinHandle<anyhow::Result<()>> {
    let shutdown = shutdown.clone();
    tokio::spawn(async move { host::run(cfg, shutdown).await })
}

fn spawn_client(cfg: ClientConfig, shutdown: &CancellationToken) -> JoinHandle<anyhow::Result<()>> {
    let shutdown = shutdown.clone();
    tokio::spawn(async move { client::run(cfg, shutdown).await })
}

/// Dial the client-side listener until the tunnel is up.
async fn connect_when_ready(addr: SocketAddr) -> TcpStream {
    let deadline = Instant::now() + ESTABLISH_TIMEOUT;
    loop {
        if let Ok(stream) = TcpStream::connect(addr).await {
            return stream;
        }
        assert!(Instant::now() < deadline, "tunnel endpoint never opened");
        sleep(Duration::from_millis(200)).await;
    }
}

async fn expect_echo(stream: &mut TcpStream, message: &[u8]) {
    stream.write_all(message).await.expect("write");
    let mut buf = vec![0u8; message.len()];
    timeout(ECHO_TIMEOUT, stream.read_exact(&mut buf))
        .await
        .expect("echo timed out")
        .expect("read echo");
    assert_eq!(buf, message);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn tcp_echo_round_trips_through_the_tunnel() {
    let relay = spawn_relay().await;
    let echo = spawn_tcp_echo().await;
    let local = free_tcp_addr();
    let shutdown = CancellationToken::new();

    let host_task = spawn_host(
        host_config("h-tcp", &relay, echo, Protocol::Tcp),
        &shutdown,
    );
    let client_task = spawn_client(
        client_config("h-tcp", &relay, local, Protocol::Tcp),
        &shutdown,
    );

    let mut stream = connect_when_ready(local).await;
    expect_echo(&mut stream, b"hello wtt").await;
    drop(stream);

    shutdown.cancel();
    relay.shutdown.cancel();
    let host_result = timeout(Duration::from_secs(5), host_task)
        .await
        .expect("host shutdown")
        .expect("host task");
    assert!(host_result.is_ok(), "host failed: {host_result:?}");
    let client_result = timeout(Duration::from_secs(5), client_task)
        .await
        .expect("client shutdown")
        .expect("client task");
    assert!(client_result.is_ok(), "client failed: {client_result:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn udp_echo_round_trips_through_the_tunnel() {
    let relay = spawn_relay().await;
    let echo = spawn_udp_echo().await;
    let local = free_udp_addr();
    let shutdown = CancellationToken::new();

    spawn_host(host_config("h-udp", &relay, echo, Protocol::Udp), &shutdown);
    spawn_client(
        client_config("h-udp", &relay, local, Protocol::Udp),
        &shutdown,
    );

    let probe = UdpSocket::bind("127.0.0.1:0").await.expect("bind probe");
    let message = b"hello udp";
    let deadline = Instant::now() + ESTABLISH_TIMEOUT;
    let mut buf = vec![0u8; 64];
    loop {
        // Datagrams sent before the tunnel is up are dropped; keep probing.
        probe.send_to(message, local).await.expect("send probe");
        match timeout(Duration::from_millis(500), probe.recv_from(&mut buf)).await {
            Ok(Ok((n, _))) => {
                assert_eq!(&buf[..n], message);
                break;
            }
            _ => assert!(Instant::now() < deadline, "udp echo never arrived"),
        }
    }

    shutdown.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_tcp_tunnels_do_not_cross_traffic() {
    let relay = spawn_relay().await;
    let echo = spawn_tcp_echo().await;
    let local = free_tcp_addr();
    let shutdown = CancellationToken::new();

    spawn_host(
        host_config("h-multi", &relay, echo, Protocol::Tcp),
        &shutdown,
    );
    spawn_client(
        client_config("h-multi", &relay, local, Protocol::Tcp),
        &shutdown,
    );

    let mut first = connect_when_ready(local).await;
    let mut second = connect_when_ready(local).await;

    // Interleave traffic on both tunnels; each must see only its own.
    for round in 0..3 {
        let one = format!("tunnel-one-{round}");
        let two = format!("tunnel-two-{round}");
        expect_echo(&mut first, one.as_bytes()).await;
        expect_echo(&mut second, two.as_bytes()).await;
    }

    shutdown.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unknown_target_is_fatal_for_the_client() {
    let relay = spawn_relay().await;
    let local = free_tcp_addr();
    let shutdown = CancellationToken::new();

    let client_task = spawn_client(
        client_config("nonexistent", &relay, local, Protocol::Tcp),
        &shutdown,
    );

    // A local connection triggers the doomed handshake.
    let _stream = connect_when_ready(local).await;

    let result = timeout(ESTABLISH_TIMEOUT, client_task)
        .await
        .expect("client should exit")
        .expect("client task");
    let err = result.expect_err("unknown target must be fatal");
    assert!(err.to_string().contains("nonexistent"), "unexpected error: {err:#}");

    // The relay is still serving.
    assert!(!relay.state.registry.contains("nonexistent"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn host_reregisters_after_relay_restart() {
    let relay = spawn_relay().await;
    let relay_addr = relay.addr;
    let echo = spawn_tcp_echo().await;
    let shutdown = CancellationToken::new();

    spawn_host(
        host_config("h-restart", &relay, echo, Protocol::Tcp),
        &shutdown,
    );

    let deadline = Instant::now() + ESTABLISH_TIMEOUT;
    while !relay.state.registry.contains("h-restart") {
        assert!(Instant::now() < deadline, "host never registered");
        sleep(Duration::from_millis(50)).await;
    }

    // Restart the relay on the same endpoint.
    relay.shutdown.cancel();
    sleep(Duration::from_millis(200)).await;
    let restarted = spawn_relay_on(relay_addr).await;

    // The host reconnects with backoff and registers again.
    let deadline = Instant::now() + ESTABLISH_TIMEOUT;
    while !restarted.state.registry.contains("h-restart") {
        assert!(
            Instant::now() < deadline,
            "host never re-registered after restart"
        );
        sleep(Duration::from_millis(100)).await;
    }

    shutdown.cancel();
}

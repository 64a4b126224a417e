//! Relay behavior over real WebSocket connections.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::net::TcpListener;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;

use wtt::config::ServerConfig;
use wtt::protocol::{Envelope, EnvelopeKind};
use wtt::relay::{self, RelayState};
use wtt::signaling::{BrokerLink, SignalError};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

struct TestRelay {
    addr: SocketAddr,
    state: Arc<RelayState>,
    shutdown: CancellationToken,
}

impl TestRelay {
    async fn spawn(cfg: ServerConfig) -> Self {
        let shutdown = CancellationToken::new();
        let state = Arc::new(RelayState::new(&cfg, shutdown.clone()));
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let app = relay::router(state.clone());
        let server_shutdown = shutdown.clone();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(server_shutdown.cancelled_owned())
                .await
                .ok();
        });
        Self {
            addr,
            state,
            shutdown,
        }
    }

    fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    async fn connect(&self, token: &str) -> BrokerLink {
        BrokerLink::connect(&self.url(), token)
            .await
            .expect("connect to relay")
    }

    /// Wait until `id` shows up in the registry.
    async fn wait_registered(&self, id: &str) {
        let deadline = Instant::now() + RECV_TIMEOUT;
        while !self.state.registry.contains(id) {
            assert!(Instant::now() < deadline, "identity {id} never registered");
            sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Drop for TestRelay {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn recv_envelope(link: &mut BrokerLink) -> Envelope {
    timeout(RECV_TIMEOUT, link.recv())
        .await
        .expect("receive timed out")
        .expect("connection closed")
}

async fn assert_closed(link: &mut BrokerLink) {
    let closed = timeout(RECV_TIMEOUT, async {
        while link.recv().await.is_some() {}
    })
    .await;
    assert!(closed.is_ok(), "connection was not closed");
}

fn offer_envelope(sender: &str, target: &str) -> Envelope {
    Envelope {
        kind: EnvelopeKind::Offer,
        sender_id: sender.to_string(),
        target_id: target.to_string(),
        payload: json!({"sdp": {"type": "offer", "sdp": "v=0 stub"}, "future_field": [1, 2]}),
        message_id: Some("corr-1".to_string()),
    }
}

#[tokio::test]
async fn forwards_envelopes_byte_for_byte() {
    let relay = TestRelay::spawn(ServerConfig::default()).await;

    let mut host = relay.connect("").await;
    host.send(Envelope::register("h1")).expect("register");
    relay.wait_registered("h1").await;

    let mut client = relay.connect("").await;
    let sent = offer_envelope("c1", "h1");
    client.send(sent.clone()).expect("send offer");

    let received = recv_envelope(&mut host).await;
    assert_eq!(received.kind, EnvelopeKind::Offer);
    assert_eq!(received.sender_id, sent.sender_id);
    assert_eq!(received.target_id, sent.target_id);
    assert_eq!(received.payload, sent.payload);
    assert_eq!(received.message_id, sent.message_id);

    // And the reverse path, host -> client.
    let answer = Envelope {
        kind: EnvelopeKind::Answer,
        sender_id: "h1".to_string(),
        target_id: "c1".to_string(),
        payload: json!({"sdp": {"type": "answer", "sdp": "v=0 stub"}}),
        message_id: None,
    };
    host.send(answer.clone()).expect("send answer");
    let received = recv_envelope(&mut client).await;
    assert_eq!(received.kind, EnvelopeKind::Answer);
    assert_eq!(received.payload, answer.payload);
}

#[tokio::test]
async fn unknown_target_yields_error_reply() {
    let relay = TestRelay::spawn(ServerConfig::default()).await;

    let mut client = relay.connect("").await;
    client
        .send(offer_envelope("c1", "nonexistent"))
        .expect("send offer");

    let reply = recv_envelope(&mut client).await;
    assert_eq!(reply.kind, EnvelopeKind::Error);
    assert_eq!(reply.target_id, "c1");
    assert!(reply.error_message().contains("nonexistent"));
    assert_eq!(reply.message_id.as_deref(), Some("corr-1"));

    // The relay is unaffected and keeps serving fresh connections.
    let mut host = relay.connect("").await;
    host.send(Envelope::register("h1")).expect("register");
    relay.wait_registered("h1").await;
}

#[tokio::test]
async fn duplicate_register_is_rejected_and_incumbent_survives() {
    let relay = TestRelay::spawn(ServerConfig::default()).await;

    let mut incumbent = relay.connect("").await;
    incumbent.send(Envelope::register("h1")).expect("register");
    relay.wait_registered("h1").await;

    let mut usurper = relay.connect("").await;
    usurper.send(Envelope::register("h1")).expect("register");
    let reply = recv_envelope(&mut usurper).await;
    assert_eq!(reply.kind, EnvelopeKind::Error);
    assert!(reply.error_message().contains("already registered"));
    assert_closed(&mut usurper).await;

    // The incumbent still receives traffic.
    let mut client = relay.connect("").await;
    client.send(offer_envelope("c1", "h1")).expect("send offer");
    let received = recv_envelope(&mut incumbent).await;
    assert_eq!(received.sender_id, "c1");
}

#[tokio::test]
async fn oversized_envelope_closes_only_the_offender() {
    let relay = TestRelay::spawn(ServerConfig::default()).await;

    let mut host = relay.connect("").await;
    host.send(Envelope::register("h1")).expect("register");
    relay.wait_registered("h1").await;

    let mut offender = relay.connect("").await;
    offender
        .send(offer_envelope("c1", "h1"))
        .expect("first offer");
    let received = recv_envelope(&mut host).await;
    assert_eq!(received.sender_id, "c1");

    let oversized = Envelope {
        payload: json!({"sdp": "x".repeat(11 * 1024)}),
        ..offer_envelope("c1", "h1")
    };
    offender.send(oversized).expect("queue oversized envelope");
    assert_closed(&mut offender).await;

    // Other peers are unaffected.
    let mut client = relay.connect("").await;
    client.send(offer_envelope("c2", "h1")).expect("send offer");
    let received = recv_envelope(&mut host).await;
    assert_eq!(received.sender_id, "c2");
}

#[tokio::test]
async fn empty_target_yields_error_reply() {
    let relay = TestRelay::spawn(ServerConfig::default()).await;

    let mut client = relay.connect("").await;
    // First envelope claims the identity; the second has no target.
    client.send(offer_envelope("c1", "h1")).expect("send offer");
    let reply = recv_envelope(&mut client).await;
    assert_eq!(reply.kind, EnvelopeKind::Error);

    client
        .send(Envelope {
            target_id: String::new(),
            ..offer_envelope("c1", "h1")
        })
        .expect("send targetless envelope");
    let reply = recv_envelope(&mut client).await;
    assert_eq!(reply.kind, EnvelopeKind::Error);
    assert!(reply.error_message().contains("target_id"));
}

#[tokio::test]
async fn bearer_token_gates_the_handshake() {
    let relay = TestRelay::spawn(ServerConfig {
        valid_tokens: vec!["s3cret".to_string()],
        ..ServerConfig::default()
    })
    .await;

    for token in ["", "wrong"] {
        match BrokerLink::connect(&relay.url(), token).await {
            Err(SignalError::Unauthorized) => {}
            Err(err) => panic!("expected unauthorized, got {err}"),
            Ok(_) => panic!("expected unauthorized, got a connection"),
        }
    }

    let mut authorized = BrokerLink::connect(&relay.url(), "s3cret")
        .await
        .expect("authorized connect");
    authorized.send(Envelope::register("h1")).expect("register");
    relay.wait_registered("h1").await;
}

#[tokio::test]
async fn disallowed_origin_is_rejected() {
    let relay = TestRelay::spawn(ServerConfig {
        allowed_origins: vec!["https://allowed.example".to_string()],
        ..ServerConfig::default()
    })
    .await;

    // BrokerLink sends no Origin header, which is tolerated (non-browser
    // peers). Exercise the check with an explicit header.
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    let mut request = relay.url().into_client_request().expect("request");
    request.headers_mut().insert(
        "Origin",
        "https://evil.example".parse().expect("header value"),
    );
    let rejected = tokio_tungstenite::connect_async(request).await;
    assert!(rejected.is_err(), "disallowed origin must not upgrade");

    let mut request = relay.url().into_client_request().expect("request");
    request.headers_mut().insert(
        "Origin",
        "https://allowed.example".parse().expect("header value"),
    );
    tokio_tungstenite::connect_async(request)
        .await
        .expect("allowed origin upgrades");
}

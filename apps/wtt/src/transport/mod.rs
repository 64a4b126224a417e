use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::RTCPeerConnection;

use crate::config::Protocol;
use crate::protocol::Envelope;
use crate::signaling::{EnvelopeSender, SignalError};

pub mod answerer;
pub mod offerer;

pub use answerer::accept_tunnel;
pub use offerer::open_tunnel;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport setup failed: {0}")]
    Setup(String),
    #[error("handshake timed out")]
    HandshakeTimeout,
    #[error("peer unavailable: {0}")]
    PeerUnavailable(String),
    #[error("peer connection reached {0}")]
    Failed(RTCPeerConnectionState),
    #[error(transparent)]
    Signaling(#[from] SignalError),
}

/// Lifecycle of one peer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Init,
    Negotiating,
    Connected,
    Bridging,
    Closing,
    Terminated,
}

/// A negotiated peer path: the connection and its open data channel.
pub struct OpenTunnel {
    pub pc: Arc<RTCPeerConnection>,
    pub dc: Arc<RTCDataChannel>,
}

impl OpenTunnel {
    /// Release the peer connection (and with it the data channel).
    pub async fn close(&self) {
        if let Err(err) = self.pc.close().await {
            debug!(error = %err, "peer connection close failed");
        }
    }
}

pub(crate) fn to_setup_error(err: impl std::fmt::Display) -> TransportError {
    TransportError::Setup(err.to_string())
}

fn build_api() -> Result<API, TransportError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(to_setup_error)?;

    let mut registry = Registry::new();
    registry =
        register_default_interceptors(registry, &mut media_engine).map_err(to_setup_error)?;

    let mut setting = SettingEngine::default();
    setting.set_ice_timeouts(
        Some(Duration::from_secs(3)),
        Some(Duration::from_secs(10)),
        Some(Duration::from_millis(500)),
    );
    // Loopback candidates make same-machine tunnels negotiable.
    setting.set_include_loopback_candidate(true);

    Ok(APIBuilder::new()
        .with_setting_engine(setting)
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

/// Create a peer connection configured with the given STUN servers.
pub async fn new_peer_connection(
    stun_servers: &[String],
) -> Result<Arc<RTCPeerConnection>, TransportError> {
    if stun_servers.is_empty() {
        warn!("no STUN servers configured, relying on host candidates only");
    }
    let api = build_api()?;
    let config = RTCConfiguration {
        ice_servers: stun_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .collect(),
        ..Default::default()
    };
    let pc = api.new_peer_connection(config).await.map_err(to_setup_error)?;
    Ok(Arc::new(pc))
}

/// Data channel settings per tunneled protocol: TCP rides a reliable
/// ordered channel, UDP an unordered one with no retransmits.
pub fn channel_init(protocol: Protocol) -> Option<RTCDataChannelInit> {
    match protocol {
        Protocol::Tcp => None,
        Protocol::Udp => Some(RTCDataChannelInit {
            ordered: Some(false),
            max_retransmits: Some(0),
            ..Default::default()
        }),
    }
}

/// Mirror peer-connection state changes into a watch channel.
pub fn watch_connection_state(
    pc: &Arc<RTCPeerConnection>,
) -> watch::Receiver<RTCPeerConnectionState> {
    let (tx, rx) = watch::channel(RTCPeerConnectionState::New);
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        debug!(?state, "peer connection state changed");
        let _ = tx.send(state);
        Box::pin(async {})
    }));
    rx
}

/// Emit every non-terminal local ICE candidate as a `candidate` envelope
/// addressed to `target_id`.
pub fn emit_local_candidates(
    pc: &Arc<RTCPeerConnection>,
    outbound: EnvelopeSender,
    local_id: &str,
    target_id: &str,
) {
    let local_id = local_id.to_string();
    let target_id = target_id.to_string();
    pc.on_ice_candidate(Box::new(move |candidate| {
        let outbound = outbound.clone();
        let local_id = local_id.clone();
        let target_id = target_id.clone();
        Box::pin(async move {
            let Some(candidate) = candidate else {
                return;
            };
            match candidate.to_json() {
                Ok(init) => {
                    let envelope = Envelope::candidate(&local_id, &target_id, init);
                    if let Err(err) = outbound.send(envelope) {
                        warn!(error = %err, "failed to emit local candidate");
                    }
                }
                Err(err) => warn!(error = %err, "failed to serialize local candidate"),
            }
        })
    }));
}

/// Inbound candidates may arrive before the remote description is set, in
/// which case webrtc-rs rejects them. Hold them until the description
/// lands, then flush.
#[derive(Default)]
pub struct CandidateBuffer {
    pending: Vec<RTCIceCandidateInit>,
}

impl CandidateBuffer {
    pub async fn absorb(&mut self, pc: &Arc<RTCPeerConnection>, candidate: RTCIceCandidateInit) {
        if pc.remote_description().await.is_none() {
            self.pending.push(candidate);
            return;
        }
        apply_candidate(pc, candidate).await;
    }

    pub async fn flush(&mut self, pc: &Arc<RTCPeerConnection>) {
        for candidate in self.pending.drain(..) {
            apply_candidate(pc, candidate).await;
        }
    }
}

async fn apply_candidate(pc: &Arc<RTCPeerConnection>, candidate: RTCIceCandidateInit) {
    if let Err(err) = pc.add_ice_candidate(candidate).await {
        warn!(error = %err, "failed to add remote candidate");
    }
}

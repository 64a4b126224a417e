use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tokio::time::timeout;
use tracing::debug;
use uuid::Uuid;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::RTCPeerConnection;

use crate::config::Protocol;
use crate::protocol::{Envelope, EnvelopeKind};
use crate::signaling::{BrokerLink, SignalError};
use crate::transport::{
    channel_init, emit_local_candidates, new_peer_connection, to_setup_error,
    watch_connection_state, CandidateBuffer, OpenTunnel, SessionPhase, TransportError,
};

/// Parameters for one client-side tunnel.
pub struct TunnelRequest<'a> {
    /// This tunnel's own identity on the relay.
    pub local_id: &'a str,
    /// Host identity to negotiate with.
    pub target_id: &'a str,
    pub protocol: Protocol,
    pub stun_servers: &'a [String],
    pub handshake_timeout: Duration,
}

/// Run the offerer handshake over `link` and return the open tunnel.
///
/// The timeout bounds everything from data-channel creation to the open
/// callback. On any failure the peer connection is released.
pub async fn open_tunnel(
    link: &mut BrokerLink,
    request: TunnelRequest<'_>,
) -> Result<OpenTunnel, TransportError> {
    let pc = new_peer_connection(request.stun_servers).await?;
    let mut phase = SessionPhase::Init;

    match negotiate(link, &pc, &request, &mut phase).await {
        Ok(tunnel) => Ok(tunnel),
        Err(err) => {
            debug!(failed_in = ?phase, error = %err, "offerer session closing");
            if let Err(close_err) = pc.close().await {
                debug!(error = %close_err, "peer connection close failed");
            }
            Err(err)
        }
    }
}

async fn negotiate(
    link: &mut BrokerLink,
    pc: &Arc<RTCPeerConnection>,
    request: &TunnelRequest<'_>,
    phase: &mut SessionPhase,
) -> Result<OpenTunnel, TransportError> {
    let mut state_rx = watch_connection_state(pc);
    emit_local_candidates(pc, link.sender(), request.local_id, request.target_id);

    let label = Uuid::new_v4().to_string();
    let dc = pc
        .create_data_channel(&label, channel_init(request.protocol))
        .await
        .map_err(to_setup_error)?;

    let opened = Arc::new(Notify::new());
    let open_signal = opened.clone();
    dc.on_open(Box::new(move || {
        let open_signal = open_signal.clone();
        Box::pin(async move {
            open_signal.notify_one();
        })
    }));

    let offer = pc.create_offer(None).await.map_err(to_setup_error)?;
    // Queue the offer ahead of any trickled candidate: candidate emission
    // starts with set_local_description and the outbound channel is FIFO.
    link.send(Envelope::offer(
        request.local_id,
        request.target_id,
        offer.clone(),
    ))?;
    pc.set_local_description(offer)
        .await
        .map_err(to_setup_error)?;
    *phase = SessionPhase::Negotiating;
    debug!(
        target_id = request.target_id,
        label, "offer sent, awaiting answer"
    );

    timeout(
        request.handshake_timeout,
        drive_handshake(link, pc, &mut state_rx, &opened, phase),
    )
    .await
    .map_err(|_| TransportError::HandshakeTimeout)??;

    *phase = SessionPhase::Bridging;
    Ok(OpenTunnel { pc: pc.clone(), dc })
}

/// Absorb answer and candidates, watch connection state, then wait for the
/// data channel to open.
async fn drive_handshake(
    link: &mut BrokerLink,
    pc: &Arc<RTCPeerConnection>,
    state_rx: &mut watch::Receiver<RTCPeerConnectionState>,
    opened: &Notify,
    phase: &mut SessionPhase,
) -> Result<(), TransportError> {
    let mut candidates = CandidateBuffer::default();

    loop {
        let state = *state_rx.borrow();
        match state {
            RTCPeerConnectionState::Connected => break,
            RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed => {
                return Err(TransportError::Failed(state));
            }
            _ => {}
        }

        tokio::select! {
            changed = state_rx.changed() => {
                if changed.is_err() {
                    return Err(TransportError::Failed(RTCPeerConnectionState::Closed));
                }
            }
            inbound = link.recv() => {
                let Some(envelope) = inbound else {
                    return Err(SignalError::Closed.into());
                };
                match envelope.kind {
                    EnvelopeKind::Answer => {
                        let sdp = envelope.session_description().map_err(to_setup_error)?;
                        pc.set_remote_description(sdp).await.map_err(to_setup_error)?;
                        candidates.flush(pc).await;
                        debug!("answer applied");
                    }
                    EnvelopeKind::Candidate => {
                        let init = envelope.ice_candidate().map_err(to_setup_error)?;
                        candidates.absorb(pc, init).await;
                    }
                    EnvelopeKind::Error => {
                        return Err(TransportError::PeerUnavailable(envelope.error_message()));
                    }
                    other => debug!(kind = ?other, "ignoring unexpected envelope"),
                }
            }
        }
    }

    *phase = SessionPhase::Connected;
    opened.notified().await;
    Ok(())
}

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::debug;
use webrtc::data_channel::RTCDataChannel;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::RTCPeerConnection;

use crate::protocol::{Envelope, EnvelopeKind};
use crate::signaling::EnvelopeSender;
use crate::transport::{
    emit_local_candidates, new_peer_connection, to_setup_error, watch_connection_state,
    CandidateBuffer, OpenTunnel, SessionPhase, TransportError,
};

/// Parameters for one host-side session.
pub struct AcceptRequest<'a> {
    /// The host's registered identity.
    pub host_id: &'a str,
    /// Identity of the offering client; answer and candidates go here.
    pub client_id: &'a str,
    pub stun_servers: &'a [String],
    pub handshake_timeout: Duration,
}

/// Run the answerer handshake for one received offer. The data channel is
/// created by the remote side; its arrival is captured through a
/// single-slot channel and surfaced once open.
pub async fn accept_tunnel(
    outbound: EnvelopeSender,
    inbox: &mut mpsc::Receiver<Envelope>,
    offer: &Envelope,
    request: AcceptRequest<'_>,
) -> Result<OpenTunnel, TransportError> {
    let pc = new_peer_connection(request.stun_servers).await?;
    let mut phase = SessionPhase::Init;

    match negotiate(outbound, inbox, offer, &pc, &request, &mut phase).await {
        Ok(tunnel) => Ok(tunnel),
        Err(err) => {
            debug!(failed_in = ?phase, client_id = request.client_id, error = %err, "answerer session closing");
            if let Err(close_err) = pc.close().await {
                debug!(error = %close_err, "peer connection close failed");
            }
            Err(err)
        }
    }
}

async fn negotiate(
    outbound: EnvelopeSender,
    inbox: &mut mpsc::Receiver<Envelope>,
    offer: &Envelope,
    pc: &Arc<RTCPeerConnection>,
    request: &AcceptRequest<'_>,
    phase: &mut SessionPhase,
) -> Result<OpenTunnel, TransportError> {
    let mut state_rx = watch_connection_state(pc);
    emit_local_candidates(pc, outbound.clone(), request.host_id, request.client_id);

    // The inbound channel lands asynchronously; hold it in a single slot
    // and signal only once it is open.
    let (channel_tx, mut channel_rx) = mpsc::channel::<Arc<RTCDataChannel>>(1);
    pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
        let channel_tx = channel_tx.clone();
        Box::pin(async move {
            debug!(label = dc.label(), "data channel arrived");
            let channel = dc.clone();
            dc.on_open(Box::new(move || {
                let channel_tx = channel_tx.clone();
                let channel = channel.clone();
                Box::pin(async move {
                    let _ = channel_tx.try_send(channel);
                })
            }));
        })
    }));

    let sdp = offer.session_description().map_err(to_setup_error)?;
    pc.set_remote_description(sdp).await.map_err(to_setup_error)?;

    let answer = pc.create_answer(None).await.map_err(to_setup_error)?;
    // Queue the answer ahead of any trickled candidate: candidate emission
    // starts with set_local_description and the outbound channel is FIFO.
    outbound.send(Envelope::answer(
        request.host_id,
        request.client_id,
        answer.clone(),
    ))?;
    pc.set_local_description(answer)
        .await
        .map_err(to_setup_error)?;
    *phase = SessionPhase::Negotiating;
    debug!(client_id = request.client_id, "answer sent");

    let dc = timeout(
        request.handshake_timeout,
        drive_handshake(inbox, pc, &mut state_rx, &mut channel_rx, phase),
    )
    .await
    .map_err(|_| TransportError::HandshakeTimeout)??;

    *phase = SessionPhase::Bridging;
    Ok(OpenTunnel { pc: pc.clone(), dc })
}

/// Absorb trickled candidates until the remote-created data channel opens.
async fn drive_handshake(
    inbox: &mut mpsc::Receiver<Envelope>,
    pc: &Arc<RTCPeerConnection>,
    state_rx: &mut watch::Receiver<RTCPeerConnectionState>,
    channel_rx: &mut mpsc::Receiver<Arc<RTCDataChannel>>,
    phase: &mut SessionPhase,
) -> Result<Arc<RTCDataChannel>, TransportError> {
    let mut candidates = CandidateBuffer::default();

    loop {
        let state = *state_rx.borrow();
        match state {
            RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed => {
                return Err(TransportError::Failed(state));
            }
            RTCPeerConnectionState::Connected if *phase == SessionPhase::Negotiating => {
                *phase = SessionPhase::Connected;
            }
            _ => {}
        }

        tokio::select! {
            channel = channel_rx.recv() => {
                if let Some(dc) = channel {
                    return Ok(dc);
                }
            }
            changed = state_rx.changed() => {
                if changed.is_err() {
                    return Err(TransportError::Failed(RTCPeerConnectionState::Closed));
                }
            }
            inbound = inbox.recv() => {
                let Some(envelope) = inbound else {
                    return Err(TransportError::Setup("session inbox closed".to_string()));
                };
                match envelope.kind {
                    EnvelopeKind::Candidate => {
                        let init = envelope.ice_candidate().map_err(to_setup_error)?;
                        candidates.absorb(pc, init).await;
                    }
                    other => debug!(kind = ?other, "ignoring unexpected envelope"),
                }
            }
        }
    }
}

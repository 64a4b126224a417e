use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{interval_at, sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::protocol::{Envelope, EnvelopeKind, MAX_ENVELOPE_BYTES};
use crate::relay::registry::{ClaimError, RouteOutcome, OUTBOUND_QUEUE};
use crate::relay::RelayState;

/// Deadline for the first envelope on a fresh connection.
pub const FIRST_FRAME_DEADLINE: Duration = Duration::from_secs(10);
/// Interval between relay-originated WebSocket pings.
pub const HEARTBEAT_PERIOD: Duration = Duration::from_secs(54);
/// A connection is considered dead this long after its last frame.
pub const PONG_GRACE: Duration = Duration::from_secs(60);

/// How the first envelope classified this connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Host,
    Client,
}

impl Role {
    fn as_str(&self) -> &'static str {
        match self {
            Role::Host => "host",
            Role::Client => "client",
        }
    }
}

/// Drive one relay connection from upgrade to eviction.
///
/// States: awaiting-first-frame -> host-registered | client-relaying ->
/// closing. Any read/write error or liveness lapse lands in closing, which
/// releases the registry entry and drops the socket.
pub(crate) async fn handle_socket(socket: WebSocket, state: Arc<RelayState>) {
    let (mut sink, mut stream) = socket.split();

    let first = match read_first_envelope(&state, &mut stream).await {
        Ok(envelope) => envelope,
        Err(reason) => {
            debug!(reason, "closing connection before registration");
            let _ = sink.close().await;
            return;
        }
    };

    let (tx, rx) = mpsc::channel::<Envelope>(OUTBOUND_QUEUE);

    let (id, role) = match classify(&first) {
        Ok(pair) => pair,
        Err(message) => {
            reject(&mut sink, &first, &message).await;
            return;
        }
    };

    if let Err(err) = state.registry.claim(&id, tx.clone()) {
        let message = match err {
            ClaimError::EmptyId => "sender_id is required".to_string(),
            ClaimError::Duplicate => format!("identity already registered: {id}"),
        };
        warn!(id = %id, role = role.as_str(), %message, "registration rejected");
        reject(&mut sink, &first, &message).await;
        return;
    }

    info!(id = %id, role = role.as_str(), "peer connected");

    // A client's first envelope doubles as its first routed message.
    if role == Role::Client {
        dispatch(&state, &tx, first);
    }

    let writer = tokio::spawn(write_worker(sink, rx));
    read_worker(&state, &tx, &mut stream, &id).await;

    state.registry.release(&id);
    writer.abort();
    info!(id = %id, role = role.as_str(), "peer disconnected");
}

/// Wait for the first data frame, tolerating ping/pong noise.
async fn read_first_envelope(
    state: &Arc<RelayState>,
    stream: &mut SplitStream<WebSocket>,
) -> Result<Envelope, &'static str> {
    let deadline = Instant::now() + FIRST_FRAME_DEADLINE;
    loop {
        let frame = tokio::select! {
            _ = state.shutdown.cancelled() => return Err("relay shutting down"),
            _ = sleep_until(deadline) => return Err("first frame deadline lapsed"),
            frame = stream.next() => frame,
        };
        match frame {
            Some(Ok(message)) => match envelope_from_message(message)? {
                Some(envelope) => return Ok(envelope),
                None => continue,
            },
            Some(Err(_)) | None => return Err("socket closed before first frame"),
        }
    }
}

/// Extract an envelope from a frame. `Ok(None)` means a control frame that
/// carries no envelope.
fn envelope_from_message(message: Message) -> Result<Option<Envelope>, &'static str> {
    let text = match message {
        Message::Text(text) => {
            if text.len() > MAX_ENVELOPE_BYTES {
                return Err("oversized envelope");
            }
            text
        }
        Message::Binary(data) => {
            if data.len() > MAX_ENVELOPE_BYTES {
                return Err("oversized envelope");
            }
            match String::from_utf8(data) {
                Ok(text) => text,
                Err(_) => return Ok(None),
            }
        }
        Message::Close(_) => return Err("peer closed"),
        Message::Ping(_) | Message::Pong(_) => return Ok(None),
    };
    match serde_json::from_str::<Envelope>(&text) {
        Ok(envelope) => Ok(Some(envelope)),
        Err(err) => {
            warn!(error = %err, "dropping malformed envelope");
            Ok(None)
        }
    }
}

fn classify(first: &Envelope) -> Result<(String, Role), String> {
    if first.sender_id.is_empty() {
        return Err("sender_id is required".to_string());
    }
    let role = if first.kind == EnvelopeKind::Register {
        Role::Host
    } else {
        Role::Client
    };
    Ok((first.sender_id.clone(), role))
}

/// Best-effort error reply on a connection that never made it past
/// registration, then close.
async fn reject(sink: &mut SplitSink<WebSocket, Message>, offending: &Envelope, message: &str) {
    let reply = Envelope::error(&offending.sender_id, message, offending.message_id.clone());
    if let Ok(text) = serde_json::to_string(&reply) {
        let _ = sink.send(Message::Text(text)).await;
    }
    let _ = sink.close().await;
}

/// Drain the outbound queue and emit periodic heartbeats.
async fn write_worker(mut sink: SplitSink<WebSocket, Message>, mut rx: mpsc::Receiver<Envelope>) {
    let mut heartbeat = interval_at(Instant::now() + HEARTBEAT_PERIOD, HEARTBEAT_PERIOD);
    loop {
        tokio::select! {
            outbound = rx.recv() => match outbound {
                Some(envelope) => {
                    let text = match serde_json::to_string(&envelope) {
                        Ok(text) => text,
                        Err(err) => {
                            warn!(error = %err, "failed to encode envelope");
                            continue;
                        }
                    };
                    if sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            _ = heartbeat.tick() => {
                if sink.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }
    let _ = sink.close().await;
}

/// Read envelopes until error, close, shutdown or liveness lapse. Every
/// inbound frame, pongs included, refreshes the liveness deadline.
async fn read_worker(
    state: &Arc<RelayState>,
    tx: &mpsc::Sender<Envelope>,
    stream: &mut SplitStream<WebSocket>,
    id: &str,
) {
    let mut deadline = Instant::now() + PONG_GRACE;
    loop {
        let frame = tokio::select! {
            _ = state.shutdown.cancelled() => {
                debug!(id, "relay shutting down, closing connection");
                return;
            }
            _ = sleep_until(deadline) => {
                warn!(id, "liveness deadline lapsed, closing connection");
                return;
            }
            frame = stream.next() => frame,
        };
        deadline = Instant::now() + PONG_GRACE;

        match frame {
            Some(Ok(message)) => match envelope_from_message(message) {
                Ok(Some(envelope)) => dispatch(state, tx, envelope),
                Ok(None) => continue,
                Err(reason) => {
                    warn!(id, reason, "closing connection");
                    return;
                }
            },
            Some(Err(err)) => {
                debug!(id, error = %err, "read error");
                return;
            }
            None => return,
        }
    }
}

/// Route one envelope, answering the sender with an `error` envelope when
/// it cannot be forwarded.
fn dispatch(state: &Arc<RelayState>, tx: &mpsc::Sender<Envelope>, envelope: Envelope) {
    let message_id = envelope.message_id.clone();
    let sender_id = envelope.sender_id.clone();

    if envelope.kind == EnvelopeKind::Register {
        reply_error(tx, &sender_id, "already registered on this connection", message_id);
        return;
    }
    if envelope.target_id.is_empty() {
        reply_error(tx, &sender_id, "target_id is required", message_id);
        return;
    }

    let target_id = envelope.target_id.clone();
    match state.registry.route(envelope) {
        RouteOutcome::Delivered | RouteOutcome::Dropped => {}
        RouteOutcome::UnknownTarget => {
            debug!(target_id = %target_id, sender_id = %sender_id, "unknown target");
            reply_error(
                tx,
                &sender_id,
                &format!("unknown target: {target_id}"),
                message_id,
            );
        }
    }
}

fn reply_error(
    tx: &mpsc::Sender<Envelope>,
    sender_id: &str,
    message: &str,
    message_id: Option<String>,
) {
    let reply = Envelope::error(sender_id, message, message_id);
    if tx.try_send(reply).is_err() {
        debug!(sender_id, "error reply dropped");
    }
}

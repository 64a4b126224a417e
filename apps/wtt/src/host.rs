use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::{lookup_host, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bridge;
use crate::config::{HostConfig, Protocol};
use crate::protocol::{Envelope, EnvelopeKind};
use crate::signaling::{Backoff, BrokerLink, EnvelopeSender, SignalError};
use crate::transport::answerer::{accept_tunnel, AcceptRequest};
use crate::transport::SessionPhase;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
const SESSION_INBOX: usize = 32;
/// A relay link older than this resets the reconnect backoff on loss.
const STABLE_LINK: Duration = Duration::from_secs(60);

/// One live per-client session, owned by the host loop.
struct SessionHandle {
    generation: u64,
    inbox: mpsc::Sender<Envelope>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct SessionEnded {
    client_id: String,
    generation: u64,
}

/// Run the host role: register an identity with the relay and answer
/// offers until cancelled. Registration is durable for the process
/// lifetime; relay loss triggers reconnection with backoff while
/// established tunnels keep flowing.
pub async fn run(cfg: HostConfig, shutdown: CancellationToken) -> anyhow::Result<()> {
    cfg.validate()?;
    let host_id = if cfg.id.is_empty() {
        let id = Uuid::new_v4().to_string();
        info!(id = %id, "generated host identity");
        id
    } else {
        cfg.id.clone()
    };
    info!(
        id = %host_id,
        remote = %cfg.remote,
        protocol = %cfg.protocol,
        "starting host"
    );

    let mut sessions: HashMap<String, SessionHandle> = HashMap::new();
    let (events_tx, mut events_rx) = mpsc::unbounded_channel::<SessionEnded>();
    let mut generation: u64 = 0;
    let mut fatal: Option<anyhow::Error> = None;
    let mut backoff = Backoff::new();

    'outer: while !shutdown.is_cancelled() {
        let mut link = match BrokerLink::connect(&cfg.signal, &cfg.token).await {
            Ok(link) => link,
            Err(err @ (SignalError::Unauthorized | SignalError::InvalidUrl { .. })) => {
                fatal = Some(anyhow::Error::new(err).context("connecting to relay"));
                break 'outer;
            }
            Err(err) => {
                let delay = backoff.next_delay();
                warn!(error = %err, delay_secs = delay.as_secs(), "relay unreachable, retrying");
                tokio::select! {
                    _ = shutdown.cancelled() => break 'outer,
                    _ = sleep(delay) => {}
                }
                continue;
            }
        };

        if let Err(err) = link.send(Envelope::register(&host_id)) {
            warn!(error = %err, "failed to send registration, reconnecting");
            continue;
        }
        info!(id = %host_id, "registered with relay");
        let established = Instant::now();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break 'outer,
                Some(ended) = events_rx.recv() => retire(&mut sessions, ended),
                inbound = link.recv() => {
                    let Some(envelope) = inbound else {
                        warn!("relay connection lost, reconnecting");
                        break;
                    };
                    match envelope.kind {
                        EnvelopeKind::Offer => {
                            let client_id = envelope.sender_id.clone();
                            if client_id.is_empty() {
                                debug!("dropping offer without sender_id");
                                continue;
                            }
                            if let Some(old) = sessions.remove(&client_id) {
                                info!(client_id = %client_id, "replacing session for re-offering client");
                                old.cancel.cancel();
                            }
                            generation += 1;
                            let handle = spawn_session(
                                generation,
                                envelope,
                                link.sender(),
                                &host_id,
                                &cfg,
                                shutdown.child_token(),
                                events_tx.clone(),
                            );
                            sessions.insert(client_id, handle);
                        }
                        EnvelopeKind::Candidate => {
                            match sessions.get(&envelope.sender_id) {
                                Some(session) => {
                                    if session.inbox.try_send(envelope).is_err() {
                                        debug!("session inbox full, dropping candidate");
                                    }
                                }
                                None => debug!(
                                    sender_id = %envelope.sender_id,
                                    "candidate for unknown session"
                                ),
                            }
                        }
                        EnvelopeKind::Error => {
                            warn!(message = %envelope.error_message(), "relay reported an error");
                        }
                        other => debug!(kind = ?other, "ignoring unexpected envelope"),
                    }
                }
            }
        }

        // Established tunnels keep flowing while the relay is away; only
        // new sessions wait for the reconnect.
        if established.elapsed() >= STABLE_LINK {
            backoff.reset();
        }
        let delay = backoff.next_delay();
        debug!(delay_secs = delay.as_secs(), "reconnecting to relay");
        tokio::select! {
            _ = shutdown.cancelled() => break 'outer,
            _ = sleep(delay) => {}
        }
    }

    close_sessions(sessions).await;
    match fatal {
        Some(err) => Err(err),
        None => {
            info!("host stopped");
            Ok(())
        }
    }
}

fn spawn_session(
    generation: u64,
    offer: Envelope,
    outbound: EnvelopeSender,
    host_id: &str,
    cfg: &HostConfig,
    cancel: CancellationToken,
    events: mpsc::UnboundedSender<SessionEnded>,
) -> SessionHandle {
    let (inbox_tx, inbox_rx) = mpsc::channel::<Envelope>(SESSION_INBOX);
    let client_id = offer.sender_id.clone();
    info!(client_id = %client_id, "starting session");

    let session = Session {
        host_id: host_id.to_string(),
        client_id: client_id.clone(),
        remote: cfg.remote.clone(),
        protocol: cfg.protocol,
        stun_servers: cfg.stun_servers.clone(),
        handshake_timeout: Duration::from_secs(cfg.timeout),
    };
    let session_cancel = cancel.clone();
    let task = tokio::spawn(async move {
        if let Err(err) = session.run(offer, outbound, inbox_rx, session_cancel).await {
            warn!(client_id = %client_id, error = %err, "session failed");
        } else {
            debug!(client_id = %client_id, "session ended");
        }
        let _ = events.send(SessionEnded {
            client_id,
            generation,
        });
    });

    SessionHandle {
        generation,
        inbox: inbox_tx,
        cancel,
        task,
    }
}

/// Remove a finished session, unless a replacement already took its slot.
fn retire(sessions: &mut HashMap<String, SessionHandle>, ended: SessionEnded) {
    if sessions
        .get(&ended.client_id)
        .is_some_and(|handle| handle.generation == ended.generation)
    {
        sessions.remove(&ended.client_id);
        debug!(client_id = %ended.client_id, "session retired");
    }
}

async fn close_sessions(sessions: HashMap<String, SessionHandle>) {
    if sessions.is_empty() {
        return;
    }
    info!(count = sessions.len(), "closing sessions");
    let mut tasks = Vec::with_capacity(sessions.len());
    for (_, handle) in sessions {
        handle.cancel.cancel();
        tasks.push(handle.task);
    }
    if timeout(SHUTDOWN_GRACE, futures_util::future::join_all(tasks))
        .await
        .is_err()
    {
        warn!("sessions did not close within the grace period");
    }
}

struct Session {
    host_id: String,
    client_id: String,
    remote: String,
    protocol: Protocol,
    stun_servers: Vec<String>,
    handshake_timeout: Duration,
}

impl Session {
    /// Answer the offer, dial the local service, then bridge until either
    /// side closes. Candidates trickling in during the bridge phase are
    /// still applied.
    async fn run(
        &self,
        offer: Envelope,
        outbound: EnvelopeSender,
        mut inbox: mpsc::Receiver<Envelope>,
        cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        let request = AcceptRequest {
            host_id: &self.host_id,
            client_id: &self.client_id,
            stun_servers: &self.stun_servers,
            handshake_timeout: self.handshake_timeout,
        };

        let tunnel = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            negotiated = accept_tunnel(outbound, &mut inbox, &offer, request) => {
                negotiated.context("answering offer")?
            }
        };
        info!(client_id = %self.client_id, "tunnel established");

        let bridge = self.bridge_local(&tunnel.dc);
        tokio::pin!(bridge);
        let mut inbox_open = true;
        let result = loop {
            tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                finished = &mut bridge => break finished,
                trickled = inbox.recv(), if inbox_open => match trickled {
                    Some(envelope) if envelope.kind == EnvelopeKind::Candidate => {
                        if let Ok(init) = envelope.ice_candidate() {
                            if let Err(err) = tunnel.pc.add_ice_candidate(init).await {
                                debug!(error = %err, "late candidate rejected");
                            }
                        }
                    }
                    Some(_) => {}
                    None => inbox_open = false,
                }
            }
        };

        debug!(client_id = %self.client_id, phase = ?SessionPhase::Closing, "releasing session");
        tunnel.close().await;
        debug!(client_id = %self.client_id, phase = ?SessionPhase::Terminated, "session done");
        result
    }

    async fn bridge_local(
        &self,
        dc: &Arc<webrtc::data_channel::RTCDataChannel>,
    ) -> anyhow::Result<()> {
        match self.protocol {
            Protocol::Tcp => {
                let stream = TcpStream::connect(&self.remote)
                    .await
                    .with_context(|| format!("connecting to {}", self.remote))?;
                debug!(remote = %self.remote, "connected to local service");
                bridge::stream::run(dc.clone(), stream).await?;
            }
            Protocol::Udp => {
                let dest = resolve_remote(&self.remote).await?;
                let bind_addr: SocketAddr = if dest.is_ipv4() {
                    "0.0.0.0:0".parse().expect("ipv4 wildcard")
                } else {
                    "[::]:0".parse().expect("ipv6 wildcard")
                };
                let socket = UdpSocket::bind(bind_addr)
                    .await
                    .context("binding service-side socket")?;
                bridge::packet::run(dc.clone(), Arc::new(socket), Some(dest)).await?;
            }
        }
        Ok(())
    }
}

async fn resolve_remote(remote: &str) -> anyhow::Result<SocketAddr> {
    lookup_host(remote)
        .await
        .with_context(|| format!("resolving {remote}"))?
        .next()
        .with_context(|| format!("{remote} did not resolve"))
}

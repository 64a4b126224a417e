use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bridge;
use crate::config::{resolve_listen_addr, ClientConfig, Protocol};
use crate::signaling::{Backoff, BrokerLink, SignalError};
use crate::transport::offerer::{open_tunnel, TunnelRequest};
use crate::transport::{OpenTunnel, SessionPhase, TransportError};

/// Run the client role: expose the remote service on a local endpoint.
///
/// TCP accepts concurrent local connections, one tunnel each; UDP binds a
/// single packet socket to a single tunnel. An unknown target identity is
/// fatal; per-tunnel handshake failures only cost the affected tunnel.
pub async fn run(cfg: ClientConfig, shutdown: CancellationToken) -> anyhow::Result<()> {
    cfg.validate()?;
    let tunneler = Arc::new(Tunneler::from(&cfg));
    match cfg.protocol {
        Protocol::Tcp => run_tcp(&cfg, tunneler, shutdown).await,
        Protocol::Udp => run_udp(&cfg, tunneler, shutdown).await,
    }
}

async fn run_tcp(
    cfg: &ClientConfig,
    tunneler: Arc<Tunneler>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let listen = resolve_listen_addr(&cfg.local)?;
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("binding {listen}"))?;
    info!(addr = %listen, target = %cfg.id, "listening for tcp connections");

    let (fatal_tx, mut fatal_rx) = mpsc::channel::<anyhow::Error>(1);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            Some(err) = fatal_rx.recv() => return Err(err),
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        warn!(error = %err, "accept failed");
                        continue;
                    }
                };
                info!(%peer, "accepted local connection");
                let tunneler = tunneler.clone();
                let cancel = shutdown.child_token();
                let fatal = fatal_tx.clone();
                tokio::spawn(async move {
                    tunneler.serve_stream(stream, cancel, fatal).await;
                });
            }
        }
    }

    info!("client stopped");
    Ok(())
}

async fn run_udp(
    cfg: &ClientConfig,
    tunneler: Arc<Tunneler>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let listen = resolve_listen_addr(&cfg.local)?;
    let socket = Arc::new(
        UdpSocket::bind(listen)
            .await
            .with_context(|| format!("binding {listen}"))?,
    );
    info!(addr = %listen, target = %cfg.id, "listening for udp packets");

    let mut backoff = Backoff::new();
    while !shutdown.is_cancelled() {
        match tunneler.establish(&shutdown).await {
            Ok((link, tunnel)) => {
                backoff.reset();
                let bridged = tokio::select! {
                    _ = shutdown.cancelled() => Ok(()),
                    bridged = bridge::packet::run(tunnel.dc.clone(), socket.clone(), None) => bridged,
                };
                tunnel.close().await;
                drop(link);
                match bridged {
                    Ok(()) => debug!("udp bridge closed"),
                    Err(err) => warn!(error = %err, "udp bridge failed"),
                }
                if !shutdown.is_cancelled() {
                    info!("tunnel closed, re-establishing");
                }
            }
            Err(TunnelFailure::Cancelled) => break,
            Err(TunnelFailure::Fatal(err)) => return Err(err),
            Err(TunnelFailure::Transient(err)) => {
                let delay = backoff.next_delay();
                warn!(error = %err, delay_secs = delay.as_secs(), "tunnel failed, retrying");
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = sleep(delay) => {}
                }
            }
        }
    }

    info!("client stopped");
    Ok(())
}

enum TunnelFailure {
    /// Misconfiguration the process cannot recover from.
    Fatal(anyhow::Error),
    /// Costs only the affected tunnel.
    Transient(anyhow::Error),
    Cancelled,
}

/// Everything needed to negotiate one tunnel to the target host.
struct Tunneler {
    target_id: String,
    signal: String,
    token: String,
    protocol: Protocol,
    stun_servers: Vec<String>,
    handshake_timeout: Duration,
}

impl From<&ClientConfig> for Tunneler {
    fn from(cfg: &ClientConfig) -> Self {
        Self {
            target_id: cfg.id.clone(),
            signal: cfg.signal.clone(),
            token: cfg.token.clone(),
            protocol: cfg.protocol,
            stun_servers: cfg.stun_servers.clone(),
            handshake_timeout: Duration::from_secs(cfg.timeout),
        }
    }
}

impl Tunneler {
    /// Negotiate a tunnel for one accepted TCP connection and pump it.
    /// Handshake failure closes the accepted connection by dropping it.
    async fn serve_stream(
        &self,
        stream: TcpStream,
        cancel: CancellationToken,
        fatal: mpsc::Sender<anyhow::Error>,
    ) {
        let (link, tunnel) = match self.establish(&cancel).await {
            Ok(pair) => pair,
            Err(TunnelFailure::Cancelled) => return,
            Err(TunnelFailure::Fatal(err)) => {
                let _ = fatal.try_send(err);
                return;
            }
            Err(TunnelFailure::Transient(err)) => {
                warn!(error = %err, "tunnel handshake failed, closing local connection");
                return;
            }
        };

        let bridged = tokio::select! {
            _ = cancel.cancelled() => Ok(()),
            bridged = bridge::stream::run(tunnel.dc.clone(), stream) => bridged,
        };
        debug!(phase = ?SessionPhase::Closing, "releasing tunnel");
        tunnel.close().await;
        drop(link);
        match bridged {
            Ok(()) => debug!("tcp bridge closed"),
            Err(err) => warn!(error = %err, "tcp bridge failed"),
        }
    }

    /// Dial the relay (with backoff) and run the offerer handshake under a
    /// fresh tunnel identity. The link is returned alive so late
    /// candidates still reach the relay while the bridge runs.
    async fn establish(
        &self,
        cancel: &CancellationToken,
    ) -> Result<(BrokerLink, OpenTunnel), TunnelFailure> {
        let mut link = BrokerLink::connect_with_backoff(&self.signal, &self.token, cancel)
            .await
            .map_err(|err| match err {
                SignalError::Cancelled => TunnelFailure::Cancelled,
                err @ (SignalError::Unauthorized | SignalError::InvalidUrl { .. }) => {
                    TunnelFailure::Fatal(anyhow::Error::new(err).context("connecting to relay"))
                }
                err => TunnelFailure::Transient(err.into()),
            })?;

        let local_id = Uuid::new_v4().to_string();
        debug!(local_id = %local_id, target = %self.target_id, "negotiating tunnel");
        let request = TunnelRequest {
            local_id: &local_id,
            target_id: &self.target_id,
            protocol: self.protocol,
            stun_servers: &self.stun_servers,
            handshake_timeout: self.handshake_timeout,
        };

        match open_tunnel(&mut link, request).await {
            Ok(tunnel) => {
                info!(target = %self.target_id, "tunnel established");
                Ok((link, tunnel))
            }
            Err(TransportError::PeerUnavailable(message)) => Err(TunnelFailure::Fatal(anyhow!(
                "target {} unavailable: {message}",
                self.target_id
            ))),
            Err(err) => Err(TunnelFailure::Transient(err.into())),
        }
    }
}

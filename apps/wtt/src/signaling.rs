use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::connect_async;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::protocol::Envelope;

pub const BACKOFF_BASE: Duration = Duration::from_secs(2);
pub const BACKOFF_CAP: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum SignalError {
    #[error("invalid signaling url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("relay rejected the connection: unauthorized")]
    Unauthorized,
    #[error("failed to connect to relay: {0}")]
    Connect(String),
    #[error("relay connection lost")]
    Closed,
    #[error("cancelled")]
    Cancelled,
}

/// Cloneable handle for emitting envelopes through a [`BrokerLink`],
/// usable from peer-connection callbacks.
#[derive(Clone)]
pub struct EnvelopeSender(mpsc::UnboundedSender<Envelope>);

impl EnvelopeSender {
    pub fn send(&self, envelope: Envelope) -> Result<(), SignalError> {
        self.0.send(envelope).map_err(|_| SignalError::Closed)
    }
}

/// One persistent message connection to the relay. A writer task drains
/// queued envelopes onto the socket; a reader task decodes inbound frames
/// into an ordered channel. Dropping the link tears both down.
pub struct BrokerLink {
    outbound: mpsc::UnboundedSender<Envelope>,
    inbound: mpsc::UnboundedReceiver<Envelope>,
    tasks: Vec<JoinHandle<()>>,
}

impl BrokerLink {
    pub async fn connect(signal_url: &str, token: &str) -> Result<Self, SignalError> {
        let url = normalize_signal_url(signal_url)?;
        let mut request =
            url.as_str()
                .into_client_request()
                .map_err(|err| SignalError::InvalidUrl {
                    url: signal_url.to_string(),
                    reason: err.to_string(),
                })?;
        if !token.is_empty() {
            let value = HeaderValue::from_str(&format!("Bearer {token}")).map_err(|err| {
                SignalError::InvalidUrl {
                    url: signal_url.to_string(),
                    reason: format!("token not usable in a header: {err}"),
                }
            })?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (stream, _) = connect_async(request).await.map_err(|err| match err {
            WsError::Http(response) if response.status() == 401 => SignalError::Unauthorized,
            other => SignalError::Connect(other.to_string()),
        })?;
        debug!(url = %url, "connected to relay");
        let (mut ws_write, mut ws_read) = stream.split();

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Envelope>();
        let (inbound_tx, inbound) = mpsc::unbounded_channel::<Envelope>();

        let writer = tokio::spawn(async move {
            while let Some(envelope) = outbound_rx.recv().await {
                let text = match serde_json::to_string(&envelope) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(error = %err, "failed to encode envelope");
                        continue;
                    }
                };
                if ws_write.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            let _ = ws_write.close().await;
        });

        let reader = tokio::spawn(async move {
            while let Some(frame) = ws_read.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        forward_envelope(&inbound_tx, text.as_bytes());
                    }
                    Ok(Message::Binary(data)) => {
                        forward_envelope(&inbound_tx, &data);
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        debug!(error = %err, "relay read error");
                        break;
                    }
                }
            }
            // Dropping inbound_tx signals connection loss to the receiver.
        });

        Ok(Self {
            outbound,
            inbound,
            tasks: vec![writer, reader],
        })
    }

    /// Dial the relay until it succeeds, backing off exponentially.
    /// Unauthorized and malformed-URL failures are not retried.
    pub async fn connect_with_backoff(
        signal_url: &str,
        token: &str,
        cancel: &CancellationToken,
    ) -> Result<Self, SignalError> {
        let mut backoff = Backoff::new();
        loop {
            match Self::connect(signal_url, token).await {
                Ok(link) => return Ok(link),
                Err(err @ (SignalError::Unauthorized | SignalError::InvalidUrl { .. })) => {
                    return Err(err);
                }
                Err(err) => {
                    let delay = backoff.next_delay();
                    info!(error = %err, delay_secs = delay.as_secs(), "relay unreachable, retrying");
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(SignalError::Cancelled),
                        _ = sleep(delay) => {}
                    }
                }
            }
        }
    }

    pub fn sender(&self) -> EnvelopeSender {
        EnvelopeSender(self.outbound.clone())
    }

    pub fn send(&self, envelope: Envelope) -> Result<(), SignalError> {
        self.outbound.send(envelope).map_err(|_| SignalError::Closed)
    }

    /// Next inbound envelope; `None` means the relay connection is gone.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.inbound.recv().await
    }
}

impl Drop for BrokerLink {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

fn forward_envelope(tx: &mpsc::UnboundedSender<Envelope>, raw: &[u8]) {
    match serde_json::from_slice::<Envelope>(raw) {
        Ok(envelope) => {
            let _ = tx.send(envelope);
        }
        Err(err) => warn!(error = %err, "dropping malformed envelope from relay"),
    }
}

/// Accept ws/wss URLs directly and map http/https onto them.
pub fn normalize_signal_url(signal_url: &str) -> Result<Url, SignalError> {
    let mut url = Url::parse(signal_url).map_err(|err| SignalError::InvalidUrl {
        url: signal_url.to_string(),
        reason: err.to_string(),
    })?;
    let scheme = match url.scheme() {
        "ws" | "wss" => return Ok(url),
        "http" => "ws",
        "https" => "wss",
        other => {
            return Err(SignalError::InvalidUrl {
                url: signal_url.to_string(),
                reason: format!("unsupported scheme: {other}"),
            });
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| SignalError::InvalidUrl {
            url: signal_url.to_string(),
            reason: "scheme rewrite failed".to_string(),
        })?;
    Ok(url)
}

/// Exponential reconnect backoff: 2 s base, doubling, 30 s cap.
pub struct Backoff {
    attempt: u32,
}

impl Backoff {
    pub fn new() -> Self {
        Self { attempt: 0 }
    }

    pub fn next_delay(&mut self) -> Duration {
        let exponent = self.attempt.min(8);
        self.attempt = self.attempt.saturating_add(1);
        BACKOFF_CAP.min(BACKOFF_BASE.saturating_mul(1u32 << exponent))
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_from_base_and_caps() {
        let mut backoff = Backoff::new();
        let delays: Vec<u64> = (0..6).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![2, 4, 8, 16, 30, 30]);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
    }

    #[test]
    fn http_schemes_map_to_websocket_schemes() {
        assert_eq!(
            normalize_signal_url("http://127.0.0.1:8080").unwrap().scheme(),
            "ws"
        );
        assert_eq!(
            normalize_signal_url("https://relay.example").unwrap().scheme(),
            "wss"
        );
        assert_eq!(
            normalize_signal_url("ws://127.0.0.1:8080").unwrap().scheme(),
            "ws"
        );
        assert!(normalize_signal_url("ftp://relay.example").is_err());
        assert!(normalize_signal_url("not a url").is_err());
    }
}

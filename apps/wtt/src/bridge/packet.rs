use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;

use crate::bridge::{BridgeError, READ_BUFFER};

/// Destination for inbound data-channel messages on a packet bridge.
///
/// The client side learns it from the source of the first local packet;
/// the host side fixes it to the service address up front. Once set it
/// never changes for the bridge's lifetime.
pub struct ReturnAddress {
    slot: Mutex<Option<SocketAddr>>,
}

impl ReturnAddress {
    pub fn new(fixed: Option<SocketAddr>) -> Self {
        Self {
            slot: Mutex::new(fixed),
        }
    }

    /// Record `addr` as the return address unless one is already set.
    pub fn observe(&self, addr: SocketAddr) {
        let mut slot = self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if slot.is_none() {
            info!(%addr, "return address fixed");
            *slot = Some(addr);
        }
    }

    pub fn get(&self) -> Option<SocketAddr> {
        *self
            .slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Pump datagrams between an open data channel and a local UDP socket.
///
/// `peer` pre-fixes the return address when the far side is known (the
/// host's service endpoint); with `None` it is learned from the first
/// packet the local side sends. Inbound messages arriving before the
/// return address is known are dropped.
pub async fn run(
    dc: Arc<RTCDataChannel>,
    socket: Arc<UdpSocket>,
    peer: Option<SocketAddr>,
) -> Result<(), BridgeError> {
    let return_addr = Arc::new(ReturnAddress::new(peer));
    let closer = CancellationToken::new();

    // Remote -> local.
    let socket_out = socket.clone();
    let addr_out = return_addr.clone();
    let close_on_error = closer.clone();
    dc.on_message(Box::new(move |message: DataChannelMessage| {
        let socket_out = socket_out.clone();
        let addr_out = addr_out.clone();
        let close_on_error = close_on_error.clone();
        Box::pin(async move {
            if message.data.is_empty() {
                return;
            }
            let Some(dest) = addr_out.get() else {
                warn!("dropping inbound message, no return address yet");
                return;
            };
            if let Err(err) = socket_out.send_to(&message.data, dest).await {
                warn!(error = %err, "local send failed, closing bridge");
                close_on_error.cancel();
            }
        })
    }));

    let close_on_remote = closer.clone();
    dc.on_close(Box::new(move || {
        let close_on_remote = close_on_remote.clone();
        Box::pin(async move {
            debug!("data channel closed, closing bridge");
            close_on_remote.cancel();
        })
    }));

    // Local -> remote.
    let mut buf = vec![0u8; READ_BUFFER];
    let result = loop {
        tokio::select! {
            _ = closer.cancelled() => break Ok(()),
            received = socket.recv_from(&mut buf) => match received {
                Ok((n, from)) => {
                    return_addr.observe(from);
                    if n == 0 {
                        continue;
                    }
                    if let Err(err) = dc.send(&Bytes::copy_from_slice(&buf[..n])).await {
                        break Err(BridgeError::Channel(err));
                    }
                }
                Err(err) => break Err(BridgeError::Io(err)),
            }
        }
    };

    closer.cancel();
    if let Err(err) = dc.close().await {
        debug!(error = %err, "data channel close failed");
    }
    result
}

use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;

use crate::bridge::{BridgeError, READ_BUFFER};

/// Pump bytes between an open data channel and a connected TCP stream
/// until either side closes.
///
/// The data channel is treated as a reliable ordered byte stream; frame
/// boundaries are not preserved. Both halves share a once-only closer:
/// any error, local EOF or data-channel close shuts both ends down.
pub async fn run(dc: Arc<RTCDataChannel>, stream: TcpStream) -> Result<(), BridgeError> {
    let (mut read_half, write_half) = stream.into_split();
    let writer = Arc::new(AsyncMutex::new(write_half));
    let closer = CancellationToken::new();

    // Remote -> local.
    let write_side = writer.clone();
    let close_on_error = closer.clone();
    dc.on_message(Box::new(move |message: DataChannelMessage| {
        let write_side = write_side.clone();
        let close_on_error = close_on_error.clone();
        Box::pin(async move {
            if message.data.is_empty() {
                return;
            }
            let mut guard = write_side.lock().await;
            if let Err(err) = guard.write_all(&message.data).await {
                warn!(error = %err, "local write failed, closing bridge");
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
            read = read_half.read(&mut buf) => match read {
                Ok(0) => break Ok(()),
                Ok(n) => {
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
    let _ = writer.lock().await.shutdown().await;
    result
}

use thiserror::Error;

pub mod packet;
pub mod stream;

pub use packet::ReturnAddress;

/// Read buffer size for both bridge directions, TCP and UDP alike.
pub const READ_BUFFER: usize = 16 * 1024;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("local endpoint i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("data channel send failed: {0}")]
    Channel(#[from] webrtc::Error),
}

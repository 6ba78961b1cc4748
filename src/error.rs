use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Failure to assemble the WebSocket upgrade request from config.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("invalid connection request: {0}")]
    Request(#[from] tungstenite::http::Error),
}

/// An inbound frame that could not be routed.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("invalid base64 audio payload: {0}")]
    BadAudio(#[from] base64::DecodeError),
}

/// A drained batch whose bytes cannot form valid samples.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("pcm buffer length {0} is not sample-aligned")]
    Truncated(usize),
}

/// The audio device could not take a batch.
#[derive(Debug, Error)]
pub enum OutputError {
    #[error("audio device thread is gone")]
    DeviceGone,
}

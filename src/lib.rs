//! Client-side realtime duplex channel for streaming voice services.
//!
//! Maintains a persistent WebSocket to the service, reconnecting with
//! capped backoff after any transport fault, and feeds a continuous
//! audio-playback pipeline from asynchronously arriving base64 or binary
//! audio fragments. Inbound envelopes carry `interrupt`, `text`, and
//! `audio` fields; outbound messages are sent only while the channel is
//! open and dropped otherwise.

pub mod config;
pub mod connection;
pub mod envelope;
pub mod error;
pub mod ingest;
pub mod output;
pub mod playback;
pub mod reconnect;

pub use config::{ChannelConfig, DEFAULT_SAMPLE_RATE};
pub use connection::{Channel, ChannelEvent, ConnectionState};
pub use error::{ChannelError, DecodeError, DispatchError, OutputError};
pub use ingest::AudioFragment;
pub use output::{AudioOutput, CpalOutput, PlaybackSession};
pub use playback::PlaybackHandle;
pub use reconnect::ReconnectPolicy;

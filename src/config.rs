use serde_json::{json, Value};
use std::time::Duration;

/// Fixed playback sample rate for inbound audio: mono s16le PCM.
pub const DEFAULT_SAMPLE_RATE: u32 = 24_000;

/// Everything needed to establish and run the duplex channel.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub url: String,
    /// Extra headers for the upgrade request (auth tokens and the like).
    pub headers: Vec<(String, String)>,
    /// Payload for the one-time `{"setup": ...}` message sent after open.
    pub setup: Value,
    /// Mime type stamped on outbound media chunks.
    pub mime_type: String,
    pub sample_rate: u32,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
    pub connect_timeout: Duration,
    /// Level-triggered playback check interval.
    pub poll_interval: Duration,
    /// If set, sent as a text frame at `keepalive_interval` while open.
    pub keepalive: Option<Value>,
    pub keepalive_interval: Duration,
}

impl ChannelConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            headers: Vec::new(),
            setup: json!({}),
            mime_type: "audio/pcm".into(),
            sample_rate: DEFAULT_SAMPLE_RATE,
            reconnect_base: Duration::from_millis(5000),
            reconnect_max: Duration::from_millis(30_000),
            connect_timeout: Duration::from_millis(30_000),
            poll_interval: Duration::from_millis(50),
            keepalive: None,
            keepalive_interval: Duration::from_secs(15),
        }
    }
}

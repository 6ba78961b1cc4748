use crate::error::DispatchError;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Deserialize;
use serde_json::{json, Value};

/// Inbound envelope shape. All fields are optional; routing is
/// priority-ordered, interrupt first.
#[derive(Debug, Default, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub interrupt: Option<bool>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub audio: Option<String>,
}

/// One routed action from an inbound text frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Stop playback and discard queued audio. Skips any other fields
    /// carried in the same envelope.
    Interrupt,
    Text(String),
    /// One audio fragment, already base64-decoded to raw PCM bytes.
    Audio(Vec<u8>),
}

/// Parse one text frame and route its fields.
pub fn dispatch(raw: &str) -> Result<Vec<Inbound>, DispatchError> {
    let envelope: Envelope = serde_json::from_str(raw)?;
    if envelope.interrupt == Some(true) {
        return Ok(vec![Inbound::Interrupt]);
    }
    let mut routed = Vec::new();
    if let Some(text) = envelope.text {
        routed.push(Inbound::Text(text));
    }
    if let Some(audio) = envelope.audio {
        routed.push(Inbound::Audio(BASE64.decode(audio.as_bytes())?));
    }
    Ok(routed)
}

/// `{"setup": ...}` handshake frame, sent exactly once per successful open.
pub fn setup_message(setup: &Value) -> Value {
    json!({ "setup": setup })
}

/// Wrap one media fragment in the outbound envelope shape.
pub fn media_chunk_message(mime_type: &str, data: &[u8]) -> Value {
    json!({
        "realtime_input": {
            "media_chunks": [{ "mime_type": mime_type, "data": BASE64.encode(data) }]
        }
    })
}

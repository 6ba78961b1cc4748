use crate::error::DecodeError;
use std::collections::VecDeque;
use std::time::Instant;

/// One discrete unit of audio payload as delivered by the service,
/// pre-decode. Immutable once created.
#[derive(Debug, Clone)]
pub struct AudioFragment {
    pub bytes: Vec<u8>,
    pub arrived_at: Instant,
}

impl AudioFragment {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            arrived_at: Instant::now(),
        }
    }
}

/// FIFO buffer of arrived fragments, insertion order = arrival order.
/// Cleared wholesale only: drained into a playback batch or discarded by
/// an interrupt flush.
#[derive(Debug, Default)]
pub struct IngestQueue {
    fragments: VecDeque<AudioFragment>,
}

impl IngestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, fragment: AudioFragment) {
        self.fragments.push_back(fragment);
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fragments.len()
    }

    /// Swap out everything queued so far. Fragments arriving during an
    /// in-flight batch accumulate in the now-empty queue instead of
    /// blocking behind it.
    pub fn take_all(&mut self) -> Vec<AudioFragment> {
        self.fragments.drain(..).collect()
    }

    pub fn clear(&mut self) {
        self.fragments.clear();
    }
}

/// Concatenate a batch in arrival order into one contiguous byte buffer.
pub fn concat_batch(batch: &[AudioFragment]) -> Vec<u8> {
    let total = batch.iter().map(|f| f.bytes.len()).sum();
    let mut bytes = Vec::with_capacity(total);
    for fragment in batch {
        bytes.extend_from_slice(&fragment.bytes);
    }
    bytes
}

/// Interpret bytes as mono s16le PCM and normalize to -1.0..1.0.
pub fn decode_pcm16(bytes: &[u8]) -> Result<Vec<f32>, DecodeError> {
    if bytes.len() % 2 != 0 {
        return Err(DecodeError::Truncated(bytes.len()));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0)
        .collect())
}

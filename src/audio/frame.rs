//! Captured audio frames.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// An immutable slice of little-endian 16-bit PCM.
///
/// Frames are created by the external audio source, forwarded to the
/// active backend, and not retained past the current utterance.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    data: Bytes,
    sample_rate: u32,
    channels: u16,
    captured_at: DateTime<Utc>,
}

impl AudioFrame {
    /// Create a frame from raw PCM16LE bytes.
    pub fn new(data: Bytes, sample_rate: u32, channels: u16, captured_at: DateTime<Utc>) -> Self {
        Self {
            data,
            sample_rate,
            channels,
            captured_at,
        }
    }

    /// Raw PCM bytes.
    pub fn bytes(&self) -> &Bytes {
        &self.data
    }

    /// Sample rate in Hz.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Channel count.
    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Capture timestamp.
    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    /// Number of samples per channel.
    pub fn sample_count(&self) -> usize {
        self.data.len() / 2 / self.channels.max(1) as usize
    }

    /// Frame duration, derived from byte count.
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.sample_count() as f64 / self.sample_rate as f64)
    }

    /// Whether the frame carries no samples.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

//! Audio sink seam.
//!
//! Playback hardware lives outside the core; the orchestrator owns a sink
//! handle and backends write response audio through it.

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Mutex;

/// Format of a chunk handed to the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkFormat {
    /// Raw little-endian 16-bit PCM at the given rate, mono.
    Pcm16 { sample_rate: u32 },
    /// Container/compressed audio as returned by the synthesis provider
    /// (typically MPEG); the sink is responsible for decoding.
    Encoded { mime: &'static str },
}

/// Destination for response audio.
#[async_trait]
pub trait AudioSink: Send + Sync {
    /// Queue one chunk for playback.
    async fn play(&self, chunk: Bytes, format: SinkFormat) -> Result<()>;

    /// Signal end of the current chunk stream and drain queued audio.
    async fn flush(&self) -> Result<()>;
}

/// Sink that discards everything. Useful for headless hosts and tests.
#[derive(Debug, Default)]
pub struct NullSink;

#[async_trait]
impl AudioSink for NullSink {
    async fn play(&self, _chunk: Bytes, _format: SinkFormat) -> Result<()> {
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Sink that accumulates chunks in memory for assertions.
#[derive(Debug, Default)]
pub struct MemorySink {
    chunks: Mutex<Vec<(Bytes, SinkFormat)>>,
    flushes: Mutex<usize>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total bytes played so far.
    pub fn byte_count(&self) -> usize {
        self.chunks
            .lock()
            .map(|c| c.iter().map(|(b, _)| b.len()).sum())
            .unwrap_or(0)
    }

    /// Number of chunks played so far.
    pub fn chunk_count(&self) -> usize {
        self.chunks.lock().map(|c| c.len()).unwrap_or(0)
    }

    /// Number of flush signals received.
    pub fn flush_count(&self) -> usize {
        self.flushes.lock().map(|f| *f).unwrap_or(0)
    }
}

#[async_trait]
impl AudioSink for MemorySink {
    async fn play(&self, chunk: Bytes, format: SinkFormat) -> Result<()> {
        if let Ok(mut chunks) = self.chunks.lock() {
            chunks.push((chunk, format));
        }
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        if let Ok(mut flushes) = self.flushes.lock() {
            *flushes += 1;
        }
        Ok(())
    }
}

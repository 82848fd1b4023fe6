//! WAV container composition and parsing for the transcription stage.
//!
//! The committed utterance is raw PCM16LE; the transcription endpoint
//! expects a RIFF/WAVE file. Composition happens fully in memory so the
//! upload leaves no filesystem artifacts.

use crate::error::{AgentError, Result};
use std::io::Cursor;

/// Parsed WAV header facts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WavInfo {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
    /// Length of the data chunk in bytes.
    pub data_len: u32,
}

/// Wrap raw PCM16LE samples in a WAV container.
///
/// Produces a standard RIFF/WAVE layout: `fmt ` chunk with PCM format
/// code, byte rate and block align computed from the arguments, followed
/// by the `data` chunk.
pub fn encode_wav(pcm: &[u8], sample_rate: u32, channels: u16) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::with_capacity(pcm.len() + 44));
    let mut writer = hound::WavWriter::new(&mut cursor, spec)
        .map_err(|e| AgentError::Audio(format!("failed to start WAV container: {e}")))?;

    for pair in pcm.chunks_exact(2) {
        let sample = i16::from_le_bytes([pair[0], pair[1]]);
        writer
            .write_sample(sample)
            .map_err(|e| AgentError::Audio(format!("failed to write WAV sample: {e}")))?;
    }

    writer
        .finalize()
        .map_err(|e| AgentError::Audio(format!("failed to finalize WAV container: {e}")))?;

    Ok(cursor.into_inner())
}

/// Parse a WAV header, recovering rate, channels, bit depth, and data length.
pub fn parse_wav(bytes: &[u8]) -> Result<WavInfo> {
    let reader = hound::WavReader::new(Cursor::new(bytes))
        .map_err(|e| AgentError::Audio(format!("invalid WAV container: {e}")))?;
    let spec = reader.spec();
    let frames = reader.duration(); // samples per channel
    let data_len = frames * u32::from(spec.channels) * u32::from(spec.bits_per_sample / 8);
    Ok(WavInfo {
        sample_rate: spec.sample_rate,
        channels: spec.channels,
        bits_per_sample: spec.bits_per_sample,
        data_len,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compose_then_parse_recovers_header_exactly() {
        // 100 ms of 16 kHz mono PCM16.
        let pcm = vec![0u8; 3_200];
        let wav = encode_wav(&pcm, 16_000, 1).unwrap();

        let info = parse_wav(&wav).unwrap();
        assert_eq!(info.sample_rate, 16_000);
        assert_eq!(info.channels, 1);
        assert_eq!(info.bits_per_sample, 16);
        assert_eq!(info.data_len, 3_200);
    }

    #[test]
    fn riff_and_wave_magic_present() {
        let wav = encode_wav(&[0u8; 64], 16_000, 1).unwrap();
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
    }

    #[test]
    fn empty_pcm_yields_empty_data_chunk() {
        let wav = encode_wav(&[], 16_000, 1).unwrap();
        let info = parse_wav(&wav).unwrap();
        assert_eq!(info.data_len, 0);
    }

    #[test]
    fn stereo_header_round_trip() {
        let pcm = vec![0u8; 1_600];
        let wav = encode_wav(&pcm, 44_100, 2).unwrap();
        let info = parse_wav(&wav).unwrap();
        assert_eq!(info.sample_rate, 44_100);
        assert_eq!(info.channels, 2);
        assert_eq!(info.data_len, 1_600);
    }

    #[test]
    fn samples_survive_round_trip() {
        let samples: Vec<i16> = vec![0, 1000, -1000, i16::MAX, i16::MIN];
        let pcm: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        let wav = encode_wav(&pcm, 16_000, 1).unwrap();

        let reader = hound::WavReader::new(Cursor::new(&wav)).unwrap();
        let decoded: Vec<i16> = reader.into_samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(decoded, samples);
    }

    #[test]
    fn garbage_bytes_fail_to_parse() {
        assert!(parse_wav(b"definitely not a wav file").is_err());
    }
}

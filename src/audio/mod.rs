//! Audio domain types: frames, WAV container, playback sink seam.

pub mod frame;
pub mod sink;
pub mod wav;

pub use frame::AudioFrame;
pub use sink::{AudioSink, MemorySink, NullSink, SinkFormat};
pub use wav::{WavInfo, encode_wav, parse_wav};

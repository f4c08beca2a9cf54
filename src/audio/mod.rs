//! Audio processing building blocks
//!
//! Codec plugin interface and built-in codecs, loss concealment and the
//! drift-compensating resampler used by Sinks.

mod codec;
mod null;
#[cfg(feature = "opus-codec")]
mod opus;
mod pcm;
mod plc;
mod resampler;

pub use codec::{
    Codec, CodecControl, CodecError, CodecRegistry, Decoder, Encoder, Format,
    MAX_FORMAT_EXTENSION,
};
pub use null::NullCodec;
#[cfg(feature = "opus-codec")]
pub use opus::{opus_extension, OpusCodec};
pub use pcm::{pcm_format, BitDepth, PcmCodec};
pub use plc::PcmPlc;
pub use resampler::DynamicResampler;

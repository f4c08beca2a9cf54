//! Audio codec abstraction for encoding/decoding audio blocks
//!
//! A [`Codec`] is a factory: it validates stream formats, converts the
//! codec-specific part of a format to and from its wire representation and
//! creates [`Encoder`]/[`Decoder`] instances. Codecs are looked up by name
//! in a [`CodecRegistry`], which the host builds at startup and hands to its
//! Sources and Sinks.
//!
//! Encoders and decoders run on the audio thread and must not allocate
//! after construction.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::null::NullCodec;
use super::pcm::PcmCodec;

/// Largest codec-specific format extension
pub const MAX_FORMAT_EXTENSION: usize = 64;

/// Stream format
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Format {
    /// Codec name, e.g. "pcm" or "opus"
    pub codec: String,
    pub num_channels: u16,
    /// Nominal sample rate in Hz
    pub sample_rate: u32,
    /// Samples per channel in one encoded block
    pub block_size: u32,
    /// Codec-specific settings in the codec's wire form
    pub extension: Vec<u8>,
}

impl Format {
    pub fn new(codec: &str, num_channels: u16, sample_rate: u32, block_size: u32) -> Self {
        Self {
            codec: codec.to_string(),
            num_channels,
            sample_rate,
            block_size,
            extension: Vec::new(),
        }
    }

    /// Interleaved samples in one block
    pub fn samples_per_block(&self) -> usize {
        self.block_size as usize * self.num_channels as usize
    }

    /// Block duration in seconds
    pub fn block_duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.block_size as f64 / self.sample_rate as f64
    }

    /// Basic sanity checks shared by all codecs
    pub fn check(&self) -> Result<(), CodecError> {
        if self.num_channels == 0 || self.num_channels > 255 {
            return Err(CodecError::InvalidFormat(format!(
                "bad channel count {}",
                self.num_channels
            )));
        }
        if self.sample_rate == 0 || self.block_size == 0 {
            return Err(CodecError::InvalidFormat(
                "sample rate and block size must be positive".to_string(),
            ));
        }
        if self.extension.len() > MAX_FORMAT_EXTENSION {
            return Err(CodecError::InvalidFormat(format!(
                "format extension too large ({} bytes)",
                self.extension.len()
            )));
        }
        Ok(())
    }
}

/// Errors that can occur during codec operations
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Codec initialization failed: {0}")]
    InitializationFailed(String),

    #[error("Encode failed: {0}")]
    EncodeFailed(String),

    #[error("Decode failed: {0}")]
    DecodeFailed(String),

    #[error("Invalid frame size: expected {expected}, got {actual}")]
    InvalidFrameSize { expected: usize, actual: usize },

    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    #[error("Unknown codec: {0}")]
    UnknownCodec(String),

    #[error("Output buffer too small: need {needed}, have {available}")]
    BufferTooSmall { needed: usize, available: usize },

    #[error("Control not supported")]
    Unsupported,

    #[error("Codec not available: {0}")]
    NotAvailable(String),
}

/// Runtime controls understood by some encoders/decoders
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecControl {
    /// Clear internal state (new stream)
    Reset,
    SetBitrate(u32),
    SetComplexity(u8),
    /// Expected packet loss in percent, lets encoders add redundancy
    SetPacketLoss(u8),
}

/// Encoder for one stream
pub trait Encoder: Send {
    fn format(&self) -> &Format;

    /// Upper bound for the encoded size of one block
    fn max_encoded_size(&self) -> usize;

    /// Encode one block of interleaved samples, returning the bytes written
    fn encode(&mut self, input: &[f32], output: &mut [u8]) -> Result<usize, CodecError>;

    fn control(&mut self, ctl: CodecControl) -> Result<(), CodecError> {
        match ctl {
            CodecControl::Reset => Ok(()),
            _ => Err(CodecError::Unsupported),
        }
    }
}

/// Decoder for one stream
pub trait Decoder: Send {
    fn format(&self) -> &Format;

    /// Largest encoded block the decoder accepts
    fn max_encoded_size(&self) -> usize;

    /// Decode one block into interleaved samples.
    ///
    /// `None` asks the decoder to conceal a lost block.
    fn decode(&mut self, input: Option<&[u8]>, output: &mut [f32]) -> Result<usize, CodecError>;

    fn control(&mut self, ctl: CodecControl) -> Result<(), CodecError> {
        match ctl {
            CodecControl::Reset => Ok(()),
            _ => Err(CodecError::Unsupported),
        }
    }
}

/// Codec factory
pub trait Codec: Send + Sync {
    fn name(&self) -> &'static str;

    /// Validate a format, filling in default settings where the extension
    /// is empty
    fn validate(&self, format: &mut Format) -> Result<(), CodecError>;

    fn new_encoder(&self, format: &Format) -> Result<Box<dyn Encoder>, CodecError>;

    fn new_decoder(&self, format: &Format) -> Result<Box<dyn Decoder>, CodecError>;

    /// Wire form of the codec-specific settings
    fn serialize(&self, format: &Format) -> Result<Vec<u8>, CodecError> {
        let mut format = format.clone();
        self.validate(&mut format)?;
        Ok(format.extension)
    }

    /// Rebuild a format from its common fields and codec-specific wire data
    fn deserialize(
        &self,
        num_channels: u16,
        sample_rate: u32,
        block_size: u32,
        extension: &[u8],
    ) -> Result<Format, CodecError> {
        if extension.len() > MAX_FORMAT_EXTENSION {
            return Err(CodecError::InvalidFormat(format!(
                "format extension too large ({} bytes)",
                extension.len()
            )));
        }
        let mut format = Format {
            codec: self.name().to_string(),
            num_channels,
            sample_rate,
            block_size,
            extension: extension.to_vec(),
        };
        self.validate(&mut format)?;
        Ok(format)
    }
}

/// Codecs available to Sources and Sinks, keyed by name
#[derive(Clone)]
pub struct CodecRegistry {
    codecs: HashMap<&'static str, Arc<dyn Codec>>,
}

impl CodecRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self {
            codecs: HashMap::new(),
        }
    }

    /// Registry with all built-in codecs
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(PcmCodec));
        registry.register(Arc::new(NullCodec));
        #[cfg(feature = "opus-codec")]
        registry.register(Arc::new(super::opus::OpusCodec));
        registry
    }

    /// Add a codec, replacing any codec with the same name
    pub fn register(&mut self, codec: Arc<dyn Codec>) {
        self.codecs.insert(codec.name(), codec);
    }

    pub fn find(&self, name: &str) -> Option<Arc<dyn Codec>> {
        self.codecs.get(name).cloned()
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Codec>, CodecError> {
        self.find(name)
            .ok_or_else(|| CodecError::UnknownCodec(name.to_string()))
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.codecs.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Validate a format against its codec
    pub fn validate(&self, format: &mut Format) -> Result<(), CodecError> {
        format.check()?;
        self.get(&format.codec)?.validate(format)
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_registry() {
        let registry = CodecRegistry::with_defaults();
        assert!(registry.find("pcm").is_some());
        assert!(registry.find("null").is_some());
        assert!(matches!(
            registry.get("mp3"),
            Err(CodecError::UnknownCodec(_))
        ));

        #[cfg(feature = "opus-codec")]
        assert!(registry.find("opus").is_some());
    }

    #[test]
    fn test_format_check() {
        let mut format = Format::new("pcm", 2, 48000, 128);
        assert!(format.check().is_ok());
        assert_eq!(format.samples_per_block(), 256);

        format.extension = vec![0; MAX_FORMAT_EXTENSION + 1];
        assert!(format.check().is_err());

        let zero = Format::new("pcm", 0, 48000, 128);
        assert!(zero.check().is_err());
    }

    #[test]
    fn test_registry_validate_fills_extension() {
        let registry = CodecRegistry::with_defaults();
        let mut format = Format::new("pcm", 1, 44100, 64);
        registry.validate(&mut format).unwrap();
        assert!(!format.extension.is_empty());
    }

    #[test]
    fn test_deserialize_rejects_large_extension() {
        let codec = PcmCodec;
        let ext = vec![0u8; MAX_FORMAT_EXTENSION + 1];
        assert!(codec.deserialize(1, 48000, 64, &ext).is_err());
    }
}

//! Uncompressed PCM codec
//!
//! Samples are written big-endian at the bit depth named in the format
//! extension (a single 4-byte big-endian code). Lost blocks are concealed
//! with [`PcmPlc`].

use super::codec::{Codec, CodecControl, CodecError, Decoder, Encoder, Format};
use super::plc::PcmPlc;

/// Sample representation on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BitDepth {
    Int16,
    Int24,
    #[default]
    Float32,
    Float64,
}

impl BitDepth {
    pub fn bytes(self) -> usize {
        match self {
            BitDepth::Int16 => 2,
            BitDepth::Int24 => 3,
            BitDepth::Float32 => 4,
            BitDepth::Float64 => 8,
        }
    }

    fn code(self) -> i32 {
        match self {
            BitDepth::Int16 => 0,
            BitDepth::Int24 => 1,
            BitDepth::Float32 => 2,
            BitDepth::Float64 => 3,
        }
    }

    fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(BitDepth::Int16),
            1 => Some(BitDepth::Int24),
            2 => Some(BitDepth::Float32),
            3 => Some(BitDepth::Float64),
            _ => None,
        }
    }

    /// Format extension for this bit depth
    pub fn extension(self) -> Vec<u8> {
        self.code().to_be_bytes().to_vec()
    }

    /// Bit depth named by a format extension
    pub fn from_format(format: &Format) -> Result<Self, CodecError> {
        let ext: [u8; 4] = format
            .extension
            .as_slice()
            .try_into()
            .map_err(|_| CodecError::InvalidFormat("pcm extension must be 4 bytes".to_string()))?;
        let code = i32::from_be_bytes(ext);
        Self::from_code(code)
            .ok_or_else(|| CodecError::InvalidFormat(format!("unknown pcm bit depth {}", code)))
    }
}

/// Build a PCM format
pub fn pcm_format(num_channels: u16, sample_rate: u32, block_size: u32, depth: BitDepth) -> Format {
    Format {
        codec: PcmCodec::NAME.to_string(),
        num_channels,
        sample_rate,
        block_size,
        extension: depth.extension(),
    }
}

/// PCM codec factory
#[derive(Debug, Clone, Copy, Default)]
pub struct PcmCodec;

impl PcmCodec {
    pub const NAME: &'static str = "pcm";
}

impl Codec for PcmCodec {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn validate(&self, format: &mut Format) -> Result<(), CodecError> {
        format.check()?;
        if format.extension.is_empty() {
            format.extension = BitDepth::default().extension();
        }
        BitDepth::from_format(format)?;
        Ok(())
    }

    fn new_encoder(&self, format: &Format) -> Result<Box<dyn Encoder>, CodecError> {
        let mut format = format.clone();
        self.validate(&mut format)?;
        Ok(Box::new(PcmEncoder {
            depth: BitDepth::from_format(&format)?,
            format,
        }))
    }

    fn new_decoder(&self, format: &Format) -> Result<Box<dyn Decoder>, CodecError> {
        let mut format = format.clone();
        self.validate(&mut format)?;
        Ok(Box::new(PcmDecoder {
            depth: BitDepth::from_format(&format)?,
            plc: PcmPlc::new(format.block_size as usize, format.num_channels as usize),
            format,
        }))
    }
}

struct PcmEncoder {
    format: Format,
    depth: BitDepth,
}

impl Encoder for PcmEncoder {
    fn format(&self) -> &Format {
        &self.format
    }

    fn max_encoded_size(&self) -> usize {
        self.format.samples_per_block() * self.depth.bytes()
    }

    fn encode(&mut self, input: &[f32], output: &mut [u8]) -> Result<usize, CodecError> {
        let needed = input.len() * self.depth.bytes();
        if output.len() < needed {
            return Err(CodecError::BufferTooSmall {
                needed,
                available: output.len(),
            });
        }
        let width = self.depth.bytes();
        for (sample, out) in input.iter().zip(output.chunks_exact_mut(width)) {
            match self.depth {
                BitDepth::Int16 => {
                    let v = (sample.clamp(-1.0, 1.0) * 32767.0).round() as i16;
                    out.copy_from_slice(&v.to_be_bytes());
                }
                BitDepth::Int24 => {
                    let v = (sample.clamp(-1.0, 1.0) * 8_388_607.0).round() as i32;
                    out.copy_from_slice(&v.to_be_bytes()[1..]);
                }
                BitDepth::Float32 => out.copy_from_slice(&sample.to_be_bytes()),
                BitDepth::Float64 => out.copy_from_slice(&f64::from(*sample).to_be_bytes()),
            }
        }
        Ok(needed)
    }
}

struct PcmDecoder {
    format: Format,
    depth: BitDepth,
    plc: PcmPlc,
}

impl Decoder for PcmDecoder {
    fn format(&self) -> &Format {
        &self.format
    }

    fn max_encoded_size(&self) -> usize {
        self.format.samples_per_block() * self.depth.bytes()
    }

    fn decode(&mut self, input: Option<&[u8]>, output: &mut [f32]) -> Result<usize, CodecError> {
        let Some(input) = input else {
            self.plc.conceal(output);
            return Ok(output.len());
        };

        let width = self.depth.bytes();
        if input.len() % width != 0 {
            return Err(CodecError::DecodeFailed(format!(
                "{} bytes is not a whole number of samples",
                input.len()
            )));
        }
        let count = input.len() / width;
        if count > output.len() {
            return Err(CodecError::BufferTooSmall {
                needed: count,
                available: output.len(),
            });
        }

        for (bytes, out) in input.chunks_exact(width).zip(output.iter_mut()) {
            *out = match self.depth {
                BitDepth::Int16 => f32::from(i16::from_be_bytes([bytes[0], bytes[1]])) / 32767.0,
                BitDepth::Int24 => {
                    // sign-extend via the top byte
                    let v = i32::from_be_bytes([bytes[0], bytes[1], bytes[2], 0]) >> 8;
                    v as f32 / 8_388_607.0
                }
                BitDepth::Float32 => f32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
                BitDepth::Float64 => {
                    let mut b = [0u8; 8];
                    b.copy_from_slice(bytes);
                    f64::from_be_bytes(b) as f32
                }
            };
        }
        output[count..].fill(0.0);
        self.plc.store(&output[..count]);
        Ok(count)
    }

    fn control(&mut self, ctl: CodecControl) -> Result<(), CodecError> {
        match ctl {
            CodecControl::Reset => {
                self.plc.reset();
                Ok(())
            }
            _ => Err(CodecError::Unsupported),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(depth: BitDepth, tolerance: f32) {
        let format = pcm_format(2, 48000, 32, depth);
        let mut encoder = PcmCodec.new_encoder(&format).unwrap();
        let mut decoder = PcmCodec.new_decoder(&format).unwrap();

        let input: Vec<f32> = (0..64).map(|i| (i as f32 / 64.0) * 2.0 - 1.0).collect();
        let mut bytes = vec![0u8; encoder.max_encoded_size()];
        let n = encoder.encode(&input, &mut bytes).unwrap();
        assert_eq!(n, 64 * depth.bytes());

        let mut output = vec![0.0f32; 64];
        decoder.decode(Some(&bytes[..n]), &mut output).unwrap();
        for (a, b) in input.iter().zip(output.iter()) {
            assert!((a - b).abs() <= tolerance, "{} vs {} at {:?}", a, b, depth);
        }
    }

    #[test]
    fn test_all_bit_depths() {
        roundtrip(BitDepth::Int16, 1.0 / 16000.0);
        roundtrip(BitDepth::Int24, 1.0 / 4_000_000.0);
        roundtrip(BitDepth::Float32, 0.0);
        roundtrip(BitDepth::Float64, 0.0);
    }

    #[test]
    fn test_int24_negative() {
        let format = pcm_format(1, 48000, 1, BitDepth::Int24);
        let mut encoder = PcmCodec.new_encoder(&format).unwrap();
        let mut decoder = PcmCodec.new_decoder(&format).unwrap();
        let mut bytes = [0u8; 3];
        encoder.encode(&[-0.5], &mut bytes).unwrap();
        let mut out = [0.0f32; 1];
        decoder.decode(Some(&bytes), &mut out).unwrap();
        assert!((out[0] + 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_concealment_after_loss() {
        let format = pcm_format(1, 48000, 4, BitDepth::Float32);
        let mut encoder = PcmCodec.new_encoder(&format).unwrap();
        let mut decoder = PcmCodec.new_decoder(&format).unwrap();

        let mut bytes = [0u8; 16];
        encoder.encode(&[1.0; 4], &mut bytes).unwrap();
        let mut out = [0.0f32; 4];
        decoder.decode(Some(&bytes), &mut out).unwrap();

        decoder.decode(None, &mut out).unwrap();
        assert!((out[0] - 0.85).abs() < 1e-6);
    }

    #[test]
    fn test_output_too_small() {
        let format = pcm_format(1, 48000, 4, BitDepth::Int16);
        let mut encoder = PcmCodec.new_encoder(&format).unwrap();
        let mut bytes = [0u8; 4];
        assert!(matches!(
            encoder.encode(&[0.0; 4], &mut bytes),
            Err(CodecError::BufferTooSmall { .. })
        ));
    }

    #[test]
    fn test_bad_extension() {
        let mut format = pcm_format(1, 48000, 4, BitDepth::Int16);
        format.extension = vec![0, 0, 0, 9];
        assert!(PcmCodec.validate(&mut format).is_err());
    }
}

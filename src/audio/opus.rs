//! Opus codec (requires the `opus-codec` feature and libopus)
//!
//! Format extension: bitrate (4 bytes) and expected packet loss in percent
//! (4 bytes), both big-endian. A non-zero loss figure enables in-band FEC.
//! The encoder runs in low-delay mode. Lost blocks use the decoder's
//! built-in concealment.

use super::codec::{Codec, CodecControl, CodecError, Decoder, Encoder, Format};

const DEFAULT_BITRATE: i32 = 128_000;
const DEFAULT_PACKET_LOSS: i32 = 0;

/// Opus packets never exceed this size
const MAX_PACKET_SIZE: usize = 1275 * 3;

#[derive(Debug, Clone, Copy, Default)]
pub struct OpusCodec;

impl OpusCodec {
    pub const NAME: &'static str = "opus";

    fn settings(format: &Format) -> Result<(i32, i32), CodecError> {
        if format.extension.len() != 8 {
            return Err(CodecError::InvalidFormat(
                "opus extension must be 8 bytes".to_string(),
            ));
        }
        let e = &format.extension;
        let bitrate = i32::from_be_bytes([e[0], e[1], e[2], e[3]]);
        let packet_loss = i32::from_be_bytes([e[4], e[5], e[6], e[7]]);
        if !(0..=100).contains(&packet_loss) {
            return Err(CodecError::InvalidFormat(format!(
                "packet loss {} out of range",
                packet_loss
            )));
        }
        Ok((bitrate, packet_loss))
    }

    fn channels(format: &Format) -> Result<opus::Channels, CodecError> {
        match format.num_channels {
            1 => Ok(opus::Channels::Mono),
            2 => Ok(opus::Channels::Stereo),
            n => Err(CodecError::InvalidFormat(format!(
                "opus supports 1 or 2 channels, not {}",
                n
            ))),
        }
    }
}

/// Build an Opus format extension
pub fn opus_extension(bitrate: i32, packet_loss: i32) -> Vec<u8> {
    let mut ext = bitrate.to_be_bytes().to_vec();
    ext.extend_from_slice(&packet_loss.to_be_bytes());
    ext
}

impl Codec for OpusCodec {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn validate(&self, format: &mut Format) -> Result<(), CodecError> {
        format.check()?;
        Self::channels(format)?;
        if ![8000, 12000, 16000, 24000, 48000].contains(&format.sample_rate) {
            return Err(CodecError::InvalidFormat(format!(
                "opus does not support {} Hz",
                format.sample_rate
            )));
        }
        // 2.5, 5, 10, 20, 40 or 60 ms
        let block = format.block_size as u64 * 400 / format.sample_rate as u64;
        let exact = format.block_size as u64 * 400 % format.sample_rate as u64 == 0;
        if !exact || ![1, 2, 4, 8, 16, 24].contains(&block) {
            return Err(CodecError::InvalidFormat(format!(
                "opus does not support blocks of {} samples at {} Hz",
                format.block_size, format.sample_rate
            )));
        }
        if format.extension.is_empty() {
            format.extension = opus_extension(DEFAULT_BITRATE, DEFAULT_PACKET_LOSS);
        }
        Self::settings(format)?;
        Ok(())
    }

    fn new_encoder(&self, format: &Format) -> Result<Box<dyn Encoder>, CodecError> {
        let mut format = format.clone();
        self.validate(&mut format)?;
        let (bitrate, packet_loss) = Self::settings(&format)?;

        let mut encoder = opus::Encoder::new(
            format.sample_rate,
            Self::channels(&format)?,
            opus::Application::LowDelay,
        )
        .map_err(|e| CodecError::InitializationFailed(format!("Encoder init failed: {}", e)))?;
        encoder
            .set_bitrate(opus::Bitrate::Bits(bitrate))
            .map_err(|e| CodecError::InitializationFailed(format!("Set bitrate failed: {}", e)))?;
        if packet_loss > 0 {
            encoder
                .set_inband_fec(true)
                .and_then(|_| encoder.set_packet_loss_perc(packet_loss))
                .map_err(|e| CodecError::InitializationFailed(format!("Set FEC failed: {}", e)))?;
        }

        Ok(Box::new(OpusEncoder { encoder, format }))
    }

    fn new_decoder(&self, format: &Format) -> Result<Box<dyn Decoder>, CodecError> {
        let mut format = format.clone();
        self.validate(&mut format)?;
        let decoder = opus::Decoder::new(format.sample_rate, Self::channels(&format)?)
            .map_err(|e| CodecError::InitializationFailed(format!("Decoder init failed: {}", e)))?;
        Ok(Box::new(OpusDecoder { decoder, format }))
    }
}

struct OpusEncoder {
    encoder: opus::Encoder,
    format: Format,
}

impl Encoder for OpusEncoder {
    fn format(&self) -> &Format {
        &self.format
    }

    fn max_encoded_size(&self) -> usize {
        MAX_PACKET_SIZE
    }

    fn encode(&mut self, input: &[f32], output: &mut [u8]) -> Result<usize, CodecError> {
        let expected = self.format.samples_per_block();
        if input.len() != expected {
            return Err(CodecError::InvalidFrameSize {
                expected,
                actual: input.len(),
            });
        }
        self.encoder
            .encode_float(input, output)
            .map_err(|e| CodecError::EncodeFailed(format!("Opus encode failed: {}", e)))
    }

    fn control(&mut self, ctl: CodecControl) -> Result<(), CodecError> {
        let result = match ctl {
            CodecControl::Reset => self.encoder.reset_state(),
            CodecControl::SetBitrate(bits) => {
                self.encoder.set_bitrate(opus::Bitrate::Bits(bits as i32))
            }
            CodecControl::SetComplexity(_) => return Err(CodecError::Unsupported),
            CodecControl::SetPacketLoss(pct) => {
                self.encoder.set_packet_loss_perc(i32::from(pct))
            }
        };
        result.map_err(|e| CodecError::EncodeFailed(format!("Opus control failed: {}", e)))
    }
}

struct OpusDecoder {
    decoder: opus::Decoder,
    format: Format,
}

impl Decoder for OpusDecoder {
    fn format(&self) -> &Format {
        &self.format
    }

    fn max_encoded_size(&self) -> usize {
        MAX_PACKET_SIZE
    }

    fn decode(&mut self, input: Option<&[u8]>, output: &mut [f32]) -> Result<usize, CodecError> {
        // an empty packet also asks for concealment
        let packet = input.unwrap_or(&[]);
        let frames = self
            .decoder
            .decode_float(packet, output, false)
            .map_err(|e| CodecError::DecodeFailed(format!("Opus decode failed: {}", e)))?;
        Ok(frames * self.format.num_channels as usize)
    }

    fn control(&mut self, ctl: CodecControl) -> Result<(), CodecError> {
        match ctl {
            CodecControl::Reset => self
                .decoder
                .reset_state()
                .map_err(|e| CodecError::DecodeFailed(format!("Opus reset failed: {}", e))),
            _ => Err(CodecError::Unsupported),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format() -> Format {
        Format::new(OpusCodec::NAME, 1, 48000, 120)
    }

    #[test]
    fn test_opus_roundtrip() {
        let mut encoder = OpusCodec.new_encoder(&format()).unwrap();
        let mut decoder = OpusCodec.new_decoder(&format()).unwrap();

        let samples: Vec<f32> = (0..120)
            .map(|i| (i as f32 * 2.0 * std::f32::consts::PI / 48.0).sin() * 0.5)
            .collect();
        let mut packet = vec![0u8; encoder.max_encoded_size()];
        let n = encoder.encode(&samples, &mut packet).unwrap();
        assert!(n < samples.len() * 4);

        let mut out = vec![0.0f32; 120];
        assert_eq!(decoder.decode(Some(&packet[..n]), &mut out).unwrap(), 120);
        assert_eq!(decoder.decode(None, &mut out).unwrap(), 120);
    }

    #[test]
    fn test_opus_rejects_odd_block_size() {
        let mut f = Format::new(OpusCodec::NAME, 1, 48000, 100);
        assert!(OpusCodec.validate(&mut f).is_err());
        let mut f = Format::new(OpusCodec::NAME, 3, 48000, 120);
        assert!(OpusCodec.validate(&mut f).is_err());
    }
}

//! Null codec
//!
//! Produces empty blocks and decodes everything to silence. Useful for
//! measuring protocol overhead and for tests that only care about timing.

use super::codec::{Codec, CodecError, Decoder, Encoder, Format};

#[derive(Debug, Clone, Copy, Default)]
pub struct NullCodec;

impl NullCodec {
    pub const NAME: &'static str = "null";
}

impl Codec for NullCodec {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn validate(&self, format: &mut Format) -> Result<(), CodecError> {
        format.check()?;
        format.extension.clear();
        Ok(())
    }

    fn new_encoder(&self, format: &Format) -> Result<Box<dyn Encoder>, CodecError> {
        format.check()?;
        Ok(Box::new(NullCoder(format.clone())))
    }

    fn new_decoder(&self, format: &Format) -> Result<Box<dyn Decoder>, CodecError> {
        format.check()?;
        Ok(Box::new(NullCoder(format.clone())))
    }
}

struct NullCoder(Format);

impl Encoder for NullCoder {
    fn format(&self) -> &Format {
        &self.0
    }

    fn max_encoded_size(&self) -> usize {
        0
    }

    fn encode(&mut self, _input: &[f32], _output: &mut [u8]) -> Result<usize, CodecError> {
        Ok(0)
    }
}

impl Decoder for NullCoder {
    fn format(&self) -> &Format {
        &self.0
    }

    fn max_encoded_size(&self) -> usize {
        0
    }

    fn decode(&mut self, _input: Option<&[u8]>, output: &mut [f32]) -> Result<usize, CodecError> {
        output.fill(0.0);
        Ok(output.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_codec_is_silent() {
        let format = Format::new(NullCodec::NAME, 2, 48000, 16);
        let mut encoder = NullCodec.new_encoder(&format).unwrap();
        let mut decoder = NullCodec.new_decoder(&format).unwrap();

        assert_eq!(encoder.encode(&[1.0; 32], &mut []).unwrap(), 0);
        let mut out = [1.0f32; 32];
        decoder.decode(Some(&[]), &mut out).unwrap();
        assert!(out.iter().all(|&s| s == 0.0));
    }
}

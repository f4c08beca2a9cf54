//! Packet loss concealment for codecs without built-in concealment
//!
//! Repeats the last good block with an exponential fade-out. After a few
//! consecutive losses the output falls back to silence.
//!
//! All buffers are sized at construction; `store` and `conceal` never
//! allocate, so they are safe on the audio thread.

/// Default gain applied per consecutive lost block
const DEFAULT_FADEOUT_FACTOR: f32 = 0.85;

/// Lost blocks after which the output is silence
const DEFAULT_MAX_LOSSES: u32 = 5;

/// Fade-out concealment for PCM-like codecs
#[derive(Debug, Clone)]
pub struct PcmPlc {
    last_block: Vec<f32>,
    consecutive_losses: u32,
    fadeout_factor: f32,
    max_losses_before_silence: u32,
}

impl PcmPlc {
    /// Create concealment state for blocks of `block_size` frames
    pub fn new(block_size: usize, channels: usize) -> Self {
        Self {
            last_block: vec![0.0; block_size * channels],
            consecutive_losses: 0,
            fadeout_factor: DEFAULT_FADEOUT_FACTOR,
            max_losses_before_silence: DEFAULT_MAX_LOSSES,
        }
    }

    /// Remember a correctly received block
    pub fn store(&mut self, block: &[f32]) {
        let n = block.len().min(self.last_block.len());
        self.last_block[..n].copy_from_slice(&block[..n]);
        self.last_block[n..].fill(0.0);
        self.consecutive_losses = 0;
    }

    /// Fill `output` with a concealment block
    pub fn conceal(&mut self, output: &mut [f32]) {
        self.consecutive_losses += 1;

        if self.consecutive_losses > self.max_losses_before_silence {
            output.fill(0.0);
            return;
        }

        let gain = self.fadeout_factor.powi(self.consecutive_losses as i32);
        for (out, &last) in output.iter_mut().zip(self.last_block.iter()) {
            *out = last * gain;
        }
        if output.len() > self.last_block.len() {
            output[self.last_block.len()..].fill(0.0);
        }
    }

    /// Forget the stored block (new stream)
    pub fn reset(&mut self) {
        self.last_block.fill(0.0);
        self.consecutive_losses = 0;
    }

    pub fn consecutive_losses(&self) -> u32 {
        self.consecutive_losses
    }

    pub fn is_concealing(&self) -> bool {
        self.consecutive_losses > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plc_first_loss() {
        let mut plc = PcmPlc::new(120, 1);
        let block: Vec<f32> = (0..120).map(|i| i as f32 / 120.0).collect();
        plc.store(&block);

        let mut out = vec![0.0; 120];
        plc.conceal(&mut out);
        for (i, &sample) in out.iter().enumerate() {
            assert!((sample - block[i] * 0.85).abs() < 1e-6, "sample {} mismatch", i);
        }
        assert!(plc.is_concealing());
    }

    #[test]
    fn test_plc_fade_sequence() {
        let mut plc = PcmPlc::new(16, 1);
        plc.store(&[1.0; 16]);

        let mut out = [0.0; 16];
        plc.conceal(&mut out);
        assert!((out[0] - 0.85).abs() < 1e-6);
        plc.conceal(&mut out);
        assert!((out[0] - 0.7225).abs() < 1e-4);
    }

    #[test]
    fn test_plc_silence_after_many_losses() {
        let mut plc = PcmPlc::new(16, 2);
        plc.store(&[1.0; 32]);

        let mut out = [0.5; 32];
        for _ in 0..=DEFAULT_MAX_LOSSES {
            plc.conceal(&mut out);
        }
        assert!(out.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_good_block_resets_losses() {
        let mut plc = PcmPlc::new(8, 1);
        plc.store(&[1.0; 8]);
        let mut out = [0.0; 8];
        plc.conceal(&mut out);
        plc.conceal(&mut out);
        assert_eq!(plc.consecutive_losses(), 2);

        plc.store(&[1.0; 8]);
        assert_eq!(plc.consecutive_losses(), 0);

        plc.reset();
        plc.conceal(&mut out);
        assert!(out.iter().all(|&s| s == 0.0));
    }
}

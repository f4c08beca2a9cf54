//! Variable-ratio resampler for clock drift compensation
//!
//! Buffers interleaved frames in a fixed ring and reads them back at an
//! arbitrary ratio (input frames consumed per output frame) using linear
//! interpolation. A ratio of exactly 1.0 on a frame boundary is a plain
//! copy, so a drift-free stream passes through unchanged.
//!
//! The ring is allocated once; `write` and `read` never allocate.

#[derive(Debug, Clone)]
pub struct DynamicResampler {
    buffer: Vec<f32>,
    channels: usize,
    capacity: usize,
    read_pos: usize,
    count: usize,
    phase: f64,
}

impl DynamicResampler {
    /// Create a resampler holding up to `capacity` frames
    pub fn new(channels: usize, capacity: usize) -> Self {
        let channels = channels.max(1);
        let capacity = capacity.max(2);
        Self {
            buffer: vec![0.0; channels * capacity],
            channels,
            capacity,
            read_pos: 0,
            count: 0,
            phase: 0.0,
        }
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn reset(&mut self) {
        self.read_pos = 0;
        self.count = 0;
        self.phase = 0.0;
    }

    /// Frames that can still be written
    pub fn write_available(&self) -> usize {
        self.capacity - self.count
    }

    /// Frames buffered
    pub fn read_available(&self) -> usize {
        self.count
    }

    /// Append interleaved samples; returns the number of frames taken
    pub fn write(&mut self, data: &[f32]) -> usize {
        let frames = (data.len() / self.channels).min(self.write_available());
        let mut write_pos = (self.read_pos + self.count) % self.capacity;
        for frame in data.chunks_exact(self.channels).take(frames) {
            let start = write_pos * self.channels;
            self.buffer[start..start + self.channels].copy_from_slice(frame);
            write_pos = (write_pos + 1) % self.capacity;
        }
        self.count += frames;
        frames
    }

    /// Input frames required to produce `frames` output frames at `ratio`
    pub fn frames_needed(&self, frames: usize, ratio: f64) -> usize {
        if frames == 0 {
            return 0;
        }
        if ratio == 1.0 && self.phase == 0.0 {
            return frames;
        }
        let last = (self.phase + (frames - 1) as f64 * ratio).floor() as usize + 2;
        let consumed = (self.phase + frames as f64 * ratio).floor() as usize;
        last.max(consumed)
    }

    /// Fill `out` with interleaved output frames.
    ///
    /// Returns false (leaving `out` untouched) when not enough input is
    /// buffered.
    pub fn read(&mut self, out: &mut [f32], ratio: f64) -> bool {
        let frames = out.len() / self.channels;
        if ratio.is_nan() || ratio <= 0.0 || self.frames_needed(frames, ratio) > self.count {
            return false;
        }

        if ratio == 1.0 && self.phase == 0.0 {
            for frame in out.chunks_exact_mut(self.channels) {
                let start = self.read_pos * self.channels;
                frame.copy_from_slice(&self.buffer[start..start + self.channels]);
                self.read_pos = (self.read_pos + 1) % self.capacity;
            }
            self.count -= frames;
            return true;
        }

        for (i, frame) in out.chunks_exact_mut(self.channels).enumerate() {
            let pos = self.phase + i as f64 * ratio;
            let index = pos.floor() as usize;
            let frac = (pos - index as f64) as f32;
            let a = ((self.read_pos + index) % self.capacity) * self.channels;
            let b = ((self.read_pos + index + 1) % self.capacity) * self.channels;
            for (ch, sample) in frame.iter_mut().enumerate() {
                let x0 = self.buffer[a + ch];
                let x1 = self.buffer[b + ch];
                *sample = x0 + (x1 - x0) * frac;
            }
        }

        let advance = self.phase + frames as f64 * ratio;
        let consumed = advance.floor() as usize;
        self.phase = advance - consumed as f64;
        self.read_pos = (self.read_pos + consumed) % self.capacity;
        self.count -= consumed;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unity_ratio_is_exact_copy() {
        let mut rs = DynamicResampler::new(2, 16);
        let input: Vec<f32> = (0..16).map(|i| i as f32).collect();
        assert_eq!(rs.write(&input), 8);

        let mut out = vec![0.0; 8];
        assert!(rs.read(&mut out, 1.0));
        assert_eq!(out, &input[..8]);
        assert_eq!(rs.read_available(), 4);
    }

    #[test]
    fn test_not_enough_input() {
        let mut rs = DynamicResampler::new(1, 8);
        rs.write(&[1.0, 2.0]);
        let mut out = [9.0; 4];
        assert!(!rs.read(&mut out, 1.0));
        assert_eq!(out, [9.0; 4]);
    }

    #[test]
    fn test_half_ratio_interpolates() {
        let mut rs = DynamicResampler::new(1, 16);
        rs.write(&[0.0, 1.0, 2.0, 3.0, 4.0]);
        let mut out = [0.0f32; 6];
        assert!(rs.read(&mut out, 0.5));
        assert_eq!(out, [0.0, 0.5, 1.0, 1.5, 2.0, 2.5]);
        // three input frames consumed
        assert_eq!(rs.read_available(), 2);
    }

    #[test]
    fn test_ring_wraps() {
        let mut rs = DynamicResampler::new(1, 4);
        let mut out = [0.0f32; 3];
        for round in 0..5 {
            let base = round as f32 * 3.0;
            assert_eq!(rs.write(&[base, base + 1.0, base + 2.0]), 3);
            assert!(rs.read(&mut out, 1.0));
            assert_eq!(out, [base, base + 1.0, base + 2.0]);
        }
    }

    #[test]
    fn test_write_respects_capacity() {
        let mut rs = DynamicResampler::new(1, 4);
        assert_eq!(rs.write(&[0.0; 10]), 4);
        assert_eq!(rs.write_available(), 0);
    }
}

//! Round trip time estimation
//!
//! Smoothed RTT and RTT variation with TCP-style exponential averaging
//! (alpha 1/8, beta 1/4). Each new sample moves the estimate by a bounded
//! fraction of the difference.

use std::collections::VecDeque;

use tracing::trace;

/// Number of raw samples kept for diagnostics
const RTT_SAMPLE_COUNT: usize = 10;

const ALPHA: f64 = 0.125;
const BETA: f64 = 0.25;

/// Smoothed round trip time (seconds)
#[derive(Debug, Clone)]
pub struct RttEstimator {
    rtt: f64,
    jitter: f64,
    samples: VecDeque<f64>,
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self {
            rtt: 0.0,
            jitter: 0.0,
            samples: VecDeque::with_capacity(RTT_SAMPLE_COUNT),
        }
    }
}

impl RttEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a measured round trip time; negative samples are clamped to 0
    pub fn update(&mut self, sample: f64) -> f64 {
        let sample = sample.max(0.0);
        if self.samples.len() >= RTT_SAMPLE_COUNT {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);

        if self.samples.len() == 1 {
            self.rtt = sample;
        } else {
            self.rtt = (1.0 - ALPHA) * self.rtt + ALPHA * sample;
        }
        let diff = (sample - self.rtt).abs();
        self.jitter = (1.0 - BETA) * self.jitter + BETA * diff;

        trace!(
            "RTT updated: rtt={:.3}ms, jitter={:.3}ms (sample={:.3}ms)",
            self.rtt * 1000.0,
            self.jitter * 1000.0,
            sample * 1000.0
        );
        self.rtt
    }

    /// Smoothed RTT in seconds (0 before the first sample)
    pub fn rtt(&self) -> f64 {
        self.rtt
    }

    /// RTT variation in seconds
    pub fn jitter(&self) -> f64 {
        self.jitter
    }

    pub fn has_samples(&self) -> bool {
        !self.samples.is_empty()
    }

    /// Smallest RTT among the recent samples
    pub fn min_rtt(&self) -> Option<f64> {
        self.samples.iter().copied().reduce(f64::min)
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_sample_initializes() {
        let mut rtt = RttEstimator::new();
        assert!(!rtt.has_samples());
        assert_eq!(rtt.update(0.02), 0.02);
    }

    #[test]
    fn test_bounded_step() {
        let mut rtt = RttEstimator::new();
        rtt.update(0.010);
        let before = rtt.rtt();
        let after = rtt.update(0.110);
        let step = after - before;
        assert!(step > 0.0);
        assert!((step - ALPHA * 0.100).abs() < 1e-12);
        assert!(after < 0.110);
    }

    #[test]
    fn test_negative_sample_clamped() {
        let mut rtt = RttEstimator::new();
        assert_eq!(rtt.update(-1.0), 0.0);
        assert_eq!(rtt.min_rtt(), Some(0.0));
    }

    #[test]
    fn test_sample_window() {
        let mut rtt = RttEstimator::new();
        for i in 0..20 {
            rtt.update(i as f64 * 0.001);
        }
        assert!((rtt.min_rtt().unwrap() - 0.010).abs() < 1e-12);
    }
}

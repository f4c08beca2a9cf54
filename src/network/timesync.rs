//! Clock drift estimation between a Source and a Sink
//!
//! Each side measures its own effective sample rate against the system
//! clock: samples processed versus seconds elapsed. The Sink receives the
//! Source's (sample count, time) pairs through pings and measures its own
//! from the audio callback. The ratio of the two rates drives the
//! resampler so that the receive buffer neither drains nor overflows.
//!
//! Each estimate is an exponential average of per-interval rates. The
//! averaging weight follows from the filter bandwidth and the interval
//! length, so the time constant is the same whether updates come every
//! block or once per second.

use std::f64::consts::PI;

/// Default filter bandwidth in Hz
pub const DEFAULT_BANDWIDTH: f64 = 0.012;

/// Measured rates further than this factor from nominal are rejected
const MAX_DEVIATION: f64 = 2.0;

/// Sample rate estimate from (sample count, time) observations
#[derive(Debug, Clone)]
pub struct RateEstimator {
    nominal: f64,
    bandwidth: f64,
    last: Option<(f64, f64)>,
    rate: Option<f64>,
}

impl RateEstimator {
    pub fn new(nominal: f64, bandwidth: f64) -> Self {
        Self {
            nominal,
            bandwidth: bandwidth.max(0.0),
            last: None,
            rate: None,
        }
    }

    /// Add an observation: `samples` processed so far at `time` seconds.
    ///
    /// Observations that do not move forward in both samples and time are
    /// ignored. Returns whether the observation was used.
    pub fn update(&mut self, samples: f64, time: f64) -> bool {
        let Some((last_samples, last_time)) = self.last else {
            self.last = Some((samples, time));
            return true;
        };
        let dt = time - last_time;
        let ds = samples - last_samples;
        if dt <= 0.0 || ds <= 0.0 {
            return false;
        }

        let instant = ds / dt;
        if self.nominal > 0.0
            && (instant > self.nominal * MAX_DEVIATION || instant < self.nominal / MAX_DEVIATION)
        {
            // Clock jump or stream restart; re-anchor
            self.last = Some((samples, time));
            return false;
        }

        // The first interval starts from nominal like any other
        let rate = match self.rate {
            Some(rate) => rate,
            None if self.nominal > 0.0 => self.nominal,
            None => instant,
        };
        self.rate = Some(rate + self.weight(dt) * (instant - rate));
        self.last = Some((samples, time));
        true
    }

    /// Share of the difference to a new interval's rate that is applied
    fn weight(&self, dt: f64) -> f64 {
        1.0 - (-2.0 * PI * self.bandwidth * dt).exp()
    }

    /// Estimated rate, or the nominal rate before the first interval
    pub fn rate(&self) -> f64 {
        self.rate.unwrap_or(self.nominal)
    }

    pub fn is_measured(&self) -> bool {
        self.rate.is_some()
    }

    pub fn nominal(&self) -> f64 {
        self.nominal
    }

    pub fn reset(&mut self, nominal: f64) {
        self.nominal = nominal;
        self.last = None;
        self.rate = None;
    }
}

/// Rate ratio between a remote and the local audio clock
#[derive(Debug, Clone)]
pub struct TimeSyncFilter {
    remote: RateEstimator,
    local: RateEstimator,
}

impl TimeSyncFilter {
    pub fn new(remote_nominal: f64, local_nominal: f64, bandwidth: f64) -> Self {
        Self {
            remote: RateEstimator::new(remote_nominal, bandwidth),
            local: RateEstimator::new(local_nominal, bandwidth),
        }
    }

    pub fn update_remote(&mut self, samples: f64, time: f64) -> bool {
        self.remote.update(samples, time)
    }

    pub fn update_local(&mut self, samples: f64, time: f64) -> bool {
        self.local.update(samples, time)
    }

    /// Remote samples to consume per local sample
    pub fn ratio(&self) -> f64 {
        let local = self.local.rate();
        if local <= 0.0 {
            return 1.0;
        }
        (self.remote.rate() / local).clamp(1.0 / MAX_DEVIATION, MAX_DEVIATION)
    }

    pub fn remote_rate(&self) -> f64 {
        self.remote.rate()
    }

    pub fn local_rate(&self) -> f64 {
        self.local.rate()
    }

    pub fn reset(&mut self, remote_nominal: f64, local_nominal: f64) {
        self.remote.reset(remote_nominal);
        self.local.reset(local_nominal);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_drift_gives_unity_ratio() {
        let mut filter = TimeSyncFilter::new(48000.0, 48000.0, DEFAULT_BANDWIDTH);
        for i in 0..100 {
            let t = i as f64;
            filter.update_remote(t * 48000.0, t);
            filter.update_local(t * 48000.0, t + 0.0005);
        }
        assert!((filter.ratio() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_drift_converges() {
        // remote runs 0.1% fast
        let mut filter = TimeSyncFilter::new(48000.0, 48000.0, DEFAULT_BANDWIDTH);
        for i in 0..200 {
            let t = i as f64;
            filter.update_remote(t * 48048.0, t);
            filter.update_local(t * 48000.0, t);
        }
        assert!((filter.ratio() - 1.001).abs() < 1e-6);
    }

    #[test]
    fn test_first_interval_moves_by_one_step() {
        let mut est = RateEstimator::new(48000.0, DEFAULT_BANDWIDTH);
        let period = 64.0 / 48000.0;
        est.update(0.0, 0.0);
        // one block whose timestamp arrives 0.4 ms early
        let dt = period - 0.0004;
        assert!(est.update(64.0, dt));
        let instant = 64.0 / dt;
        let step = est.weight(dt) * (instant - 48000.0);
        assert!((est.rate() - 48000.0 - step).abs() < 1e-9);
        assert!((est.rate() / 48000.0 - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_noisy_block_keeps_ratio_near_unity() {
        let mut filter = TimeSyncFilter::new(48000.0, 48000.0, DEFAULT_BANDWIDTH);
        let period = 64.0 / 48000.0;
        filter.update_local(0.0, 0.0);
        filter.update_local(64.0, period - 0.0004);
        assert!((filter.ratio() - 1.0).abs() < 1e-4, "ratio {}", filter.ratio());
    }

    #[test]
    fn test_drift_converges_gradually() {
        // remote runs 0.1% fast
        let mut filter = TimeSyncFilter::new(48000.0, 48000.0, DEFAULT_BANDWIDTH);
        filter.update_remote(0.0, 0.0);
        filter.update_local(0.0, 0.0);
        filter.update_remote(48048.0, 1.0);
        filter.update_local(48000.0, 1.0);
        let first = filter.ratio() - 1.0;
        assert!(first > 0.0 && first < 0.0001, "first step {}", first);

        let mut previous = first;
        for i in 2..200 {
            let t = i as f64;
            filter.update_remote(t * 48048.0, t);
            filter.update_local(t * 48000.0, t);
            let error = filter.ratio() - 1.0;
            assert!(error >= previous - 1e-12);
            previous = error;
        }
        assert!((filter.ratio() - 1.001).abs() < 1e-6);
    }

    #[test]
    fn test_jitter_is_smoothed() {
        let mut est = RateEstimator::new(48000.0, DEFAULT_BANDWIDTH);
        let mut max_error: f64 = 0.0;
        for i in 0..1000 {
            // +-2 ms timestamp jitter on 10 ms blocks
            let jitter = if i % 2 == 0 { 0.002 } else { -0.002 };
            est.update(i as f64 * 480.0, i as f64 * 0.01 + jitter);
            if i > 500 {
                max_error = max_error.max((est.rate() - 48000.0).abs());
            }
        }
        assert!(max_error < 48000.0 * 0.01, "error {}", max_error);
    }

    #[test]
    fn test_non_monotonic_ignored() {
        let mut est = RateEstimator::new(44100.0, DEFAULT_BANDWIDTH);
        assert!(est.update(0.0, 0.0));
        assert!(!est.update(0.0, 1.0));
        assert!(!est.update(44100.0, 0.0));
        assert!(!est.is_measured());
        assert_eq!(est.rate(), 44100.0);
    }

    #[test]
    fn test_reanchors_on_jump() {
        let mut est = RateEstimator::new(48000.0, DEFAULT_BANDWIDTH);
        est.update(0.0, 0.0);
        est.update(48000.0, 1.0);
        assert!(!est.update(10_000_000.0, 2.0));
        assert!(est.update(10_048_000.0, 3.0));
        assert!((est.rate() - 48000.0).abs() < 1e-6);
    }
}

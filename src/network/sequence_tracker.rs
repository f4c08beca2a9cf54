//! Block sequence tracking for packet loss statistics
//!
//! Sinks feed every newly seen block sequence into a tracker. The tracker
//! counts gaps as provisional losses and takes them back when a late block
//! fills the gap, so the reported loss is what actually never arrived.
//! The loss ratio reported back to the Source in ping replies covers the
//! interval since the previous report.

/// How a recorded sequence relates to what was seen before
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceStatus {
    /// Next expected or first block
    InOrder,
    /// Ahead of the newest block; the count is the gap that opened
    Gap(u32),
    /// Fills an earlier gap
    Late,
    /// Already seen, or too old to tell
    Duplicate,
}

/// Tracks block sequence numbers of one stream
///
/// A 64-entry bitmap behind the newest sequence tells late arrivals from
/// duplicates.
#[derive(Debug, Clone, Default)]
pub struct SequenceTracker {
    highest: Option<i32>,
    /// Bit N set: block (highest - N) was received
    received_bitmap: u64,
    received: u64,
    lost: u64,
    interval_received: u64,
    interval_lost: u64,
}

const WINDOW: i64 = 64;

impl SequenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a block sequence
    pub fn record(&mut self, sequence: i32) -> SequenceStatus {
        let Some(highest) = self.highest else {
            self.highest = Some(sequence);
            self.received_bitmap = 1;
            self.count_received();
            return SequenceStatus::InOrder;
        };

        let diff = i64::from(sequence.wrapping_sub(highest));
        if diff > 0 {
            self.highest = Some(sequence);
            self.count_received();
            if diff >= WINDOW {
                // Large jump: start over rather than count a huge loss
                self.received_bitmap = 1;
                return SequenceStatus::InOrder;
            }
            self.received_bitmap = (self.received_bitmap << diff) | 1;
            let gap = (diff - 1) as u32;
            if gap == 0 {
                SequenceStatus::InOrder
            } else {
                self.lost += u64::from(gap);
                self.interval_lost += u64::from(gap);
                SequenceStatus::Gap(gap)
            }
        } else if diff < 0 && -diff < WINDOW {
            let mask = 1u64 << (-diff);
            if self.received_bitmap & mask != 0 {
                return SequenceStatus::Duplicate;
            }
            self.received_bitmap |= mask;
            self.count_received();
            self.lost = self.lost.saturating_sub(1);
            self.interval_lost = self.interval_lost.saturating_sub(1);
            SequenceStatus::Late
        } else {
            SequenceStatus::Duplicate
        }
    }

    fn count_received(&mut self) {
        self.received += 1;
        self.interval_received += 1;
    }

    /// Overall loss ratio (0.0 - 1.0)
    pub fn loss_rate(&self) -> f32 {
        ratio(self.lost, self.received)
    }

    /// Loss ratio since the previous call
    pub fn take_interval_loss(&mut self) -> f32 {
        let rate = ratio(self.interval_lost, self.interval_received);
        self.interval_lost = 0;
        self.interval_received = 0;
        rate
    }

    pub fn blocks_received(&self) -> u64 {
        self.received
    }

    pub fn blocks_lost(&self) -> u64 {
        self.lost
    }

    pub fn highest_sequence(&self) -> Option<i32> {
        self.highest
    }

    /// Forget everything (new stream)
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

fn ratio(lost: u64, received: u64) -> f32 {
    let total = lost + received;
    if total == 0 {
        0.0
    } else {
        lost as f32 / total as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequential_blocks() {
        let mut tracker = SequenceTracker::new();
        for i in 0..10 {
            assert_eq!(tracker.record(i), SequenceStatus::InOrder);
        }
        assert_eq!(tracker.blocks_received(), 10);
        assert_eq!(tracker.blocks_lost(), 0);
        assert_eq!(tracker.loss_rate(), 0.0);
    }

    #[test]
    fn test_gap_then_late_arrival() {
        let mut tracker = SequenceTracker::new();
        tracker.record(0);
        tracker.record(1);
        assert_eq!(tracker.record(4), SequenceStatus::Gap(2));
        assert_eq!(tracker.blocks_lost(), 2);

        assert_eq!(tracker.record(2), SequenceStatus::Late);
        assert_eq!(tracker.blocks_lost(), 1);
        assert_eq!(tracker.record(2), SequenceStatus::Duplicate);
    }

    #[test]
    fn test_interval_loss_resets() {
        let mut tracker = SequenceTracker::new();
        tracker.record(0);
        tracker.record(2);
        // 1 lost of 3
        assert!((tracker.take_interval_loss() - 1.0 / 3.0).abs() < 1e-6);
        tracker.record(3);
        assert_eq!(tracker.take_interval_loss(), 0.0);
        assert_eq!(tracker.blocks_lost(), 1);
    }

    #[test]
    fn test_wraparound_continues() {
        let mut tracker = SequenceTracker::new();
        tracker.record(i32::MAX - 1);
        assert_eq!(tracker.record(i32::MAX), SequenceStatus::InOrder);
        assert_eq!(tracker.record(i32::MIN + 1), SequenceStatus::Gap(1));
        assert_eq!(tracker.record(i32::MIN), SequenceStatus::Late);
        assert_eq!(tracker.blocks_lost(), 0);
        assert_eq!(tracker.highest_sequence(), Some(i32::MIN + 1));
    }

    #[test]
    fn test_large_jump_is_not_loss() {
        let mut tracker = SequenceTracker::new();
        tracker.record(0);
        assert_eq!(tracker.record(1000), SequenceStatus::InOrder);
        assert_eq!(tracker.blocks_lost(), 0);
        assert_eq!(tracker.record(-5), SequenceStatus::Duplicate);
    }
}

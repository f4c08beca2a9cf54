//! Jitter buffer for incoming audio blocks
//!
//! Blocks are kept in a contiguous window keyed by sequence number, from the
//! next block to play up to the newest block seen. Sequences skipped by the
//! sender's stream show up as placeholders that are re-requested after a
//! grace period. Playout is strictly in sequence order: a placeholder at the
//! front is either waited for or, once it can no longer be recovered,
//! handed out as a lost block exactly once.

use std::collections::VecDeque;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::protocol::{DataFrame, ResendRequest};

/// Upper bound on recycled block buffers kept around
const MAX_POOLED_BUFFERS: usize = 64;

/// Configuration for the jitter buffer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JitterBufferConfig {
    /// Maximum number of blocks held (default: 64, must be >= 2)
    pub capacity: usize,
    /// Whether missing blocks are re-requested at all
    pub resend: bool,
    /// Minimum time between two requests for the same block (seconds)
    pub resend_interval: f64,
    /// Requests per block before it is given up
    pub resend_limit: u32,
    /// Frames requested per pass over the buffer
    pub resend_max_frames: usize,
    /// Time a gap must persist before the first request (seconds)
    pub resend_grace: f64,
}

impl JitterBufferConfig {
    /// Validate and normalize the configuration
    pub fn validated(self) -> Self {
        Self {
            capacity: self.capacity.max(2),
            resend: self.resend && self.resend_limit > 0,
            resend_interval: finite_or(self.resend_interval, 0.01).max(0.0),
            resend_limit: self.resend_limit,
            resend_max_frames: self.resend_max_frames.max(1),
            resend_grace: finite_or(self.resend_grace, 0.005).max(0.0),
        }
    }
}

fn finite_or(value: f64, fallback: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        fallback
    }
}

impl Default for JitterBufferConfig {
    fn default() -> Self {
        Self {
            capacity: 64,
            resend: true,
            resend_interval: 0.01,
            resend_limit: 16,
            resend_max_frames: 64,
            resend_grace: 0.005,
        }
    }
}

#[derive(Debug)]
struct Block {
    sequence: i32,
    /// Zero while nothing of the block has arrived
    num_frames: u16,
    received: Vec<bool>,
    frames_received: u16,
    total_size: usize,
    sample_rate: f64,
    xrun: bool,
    data: Vec<u8>,
    detected: Instant,
    requests: u32,
    last_request: Option<Instant>,
}

impl Block {
    fn placeholder(sequence: i32, now: Instant, data: Vec<u8>) -> Self {
        Self {
            sequence,
            num_frames: 0,
            received: Vec::new(),
            frames_received: 0,
            total_size: 0,
            sample_rate: 0.0,
            xrun: false,
            data,
            detected: now,
            requests: 0,
            last_request: None,
        }
    }

    fn is_placeholder(&self) -> bool {
        self.num_frames == 0
    }

    fn is_complete(&self) -> bool {
        self.num_frames > 0 && self.frames_received == self.num_frames
    }

    fn init(&mut self, frame: &DataFrame<'_>) {
        self.num_frames = frame.num_frames.max(1);
        self.received.clear();
        self.received.resize(usize::from(self.num_frames), false);
        self.frames_received = 0;
        self.total_size = frame.total_size as usize;
        self.sample_rate = frame.sample_rate;
        self.xrun = frame.xrun;
        self.data.clear();
        self.data.resize(self.total_size, 0);
    }

    fn matches(&self, frame: &DataFrame<'_>) -> bool {
        self.num_frames == frame.num_frames.max(1) && self.total_size == frame.total_size as usize
    }

    /// Copy a frame into the block; false if it was already there
    fn add_frame(&mut self, frame: &DataFrame<'_>, offset: usize) -> bool {
        let index = usize::from(frame.frame_index);
        if self.received[index] {
            return false;
        }
        self.data[offset..offset + frame.payload.len()].copy_from_slice(frame.payload);
        self.received[index] = true;
        self.frames_received += 1;
        true
    }

    /// Whether a request for this block is due
    fn request_due(&self, now: Instant, config: &JitterBufferConfig) -> bool {
        if self.requests >= config.resend_limit {
            return false;
        }
        match self.last_request {
            None => elapsed(self.detected, now) >= config.resend_grace,
            Some(last) => elapsed(last, now) >= config.resend_interval,
        }
    }

    /// All requests were spent and the last one went unanswered
    fn exhausted(&self, now: Instant, config: &JitterBufferConfig) -> bool {
        config.resend
            && self.requests >= config.resend_limit
            && self
                .last_request
                .is_some_and(|last| elapsed(last, now) >= config.resend_interval)
    }
}

fn elapsed(since: Instant, now: Instant) -> f64 {
    now.saturating_duration_since(since).as_secs_f64()
}

/// What happened to an inserted frame
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InsertReport {
    /// The frame was stored
    pub accepted: bool,
    pub duplicate: bool,
    /// The block was already played or given up
    pub late: bool,
    /// The frame completed its block
    pub completed: bool,
    /// A block that had been requested was completed
    pub resent: bool,
    /// A gap was filled without a request
    pub reordered: bool,
    /// Blocks skipped over by a transmission gap larger than the buffer
    pub lost: u32,
    /// Unplayed blocks evicted to make room
    pub evicted: u32,
}

/// A block handed out for playback
#[derive(Debug)]
pub enum Playout {
    /// Complete encoded block; hand the buffer back with [`JitterBuffer::recycle`]
    Block {
        sequence: i32,
        sample_rate: f64,
        data: Vec<u8>,
    },
    /// The sender reported a dropout for this block
    XRun { sequence: i32 },
    /// The block never arrived
    Lost { sequence: i32 },
}

impl Playout {
    pub fn sequence(&self) -> i32 {
        match self {
            Playout::Block { sequence, .. }
            | Playout::XRun { sequence }
            | Playout::Lost { sequence } => *sequence,
        }
    }
}

/// Jitter buffer statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JitterBufferStats {
    pub frames_inserted: u64,
    pub blocks_played: u64,
    pub blocks_lost: u64,
    pub blocks_evicted: u64,
    pub late_arrivals: u64,
    pub duplicates: u64,
    pub reordered: u64,
    pub resent: u64,
    pub resend_requests: u64,
    pub current_depth: usize,
}

/// Reordering buffer with bounded resend bookkeeping
pub struct JitterBuffer {
    blocks: VecDeque<Block>,
    /// Next sequence to hand out; None before the first frame
    next: Option<i32>,
    config: JitterBufferConfig,
    pool: Vec<Vec<u8>>,
    stats: JitterBufferStats,
}

impl JitterBuffer {
    /// Create a new jitter buffer with default configuration
    pub fn new() -> Self {
        Self::with_config(JitterBufferConfig::default())
    }

    /// Create a new jitter buffer with custom configuration
    ///
    /// The configuration is validated to ensure sensible values.
    pub fn with_config(config: JitterBufferConfig) -> Self {
        let config = config.validated();
        Self {
            blocks: VecDeque::with_capacity(config.capacity),
            next: None,
            pool: Vec::new(),
            stats: JitterBufferStats::default(),
            config,
        }
    }

    pub fn config(&self) -> &JitterBufferConfig {
        &self.config
    }

    /// Insert a received frame
    pub fn insert(&mut self, frame: &DataFrame<'_>, now: Instant) -> InsertReport {
        let mut report = InsertReport::default();
        let Some(offset) = frame.offset() else {
            return report;
        };
        self.stats.frames_inserted += 1;

        let seq = frame.sequence;
        let next = *self.next.get_or_insert(seq);
        // Sequence numbers wrap, so positions are wrapping distances
        let delta = i64::from(seq.wrapping_sub(next));
        if delta < 0 {
            trace!("late frame for block {} (next {})", seq, next);
            self.stats.late_arrivals += 1;
            report.late = true;
            return report;
        }

        let len = self.blocks.len() as i64;
        if delta >= len {
            let ahead = delta - len + 1;
            if ahead > self.config.capacity as i64 {
                // Transmission gap: everything buffered is stale
                let skipped = (ahead - 1).min(i64::from(u32::MAX)) as u32;
                debug!("transmission gap of {} blocks, restarting at {}", skipped, seq);
                report.lost = skipped;
                self.stats.blocks_lost += u64::from(skipped);
                self.clear();
                self.next = Some(seq);
                self.push_placeholder(seq, now);
            } else {
                let newest = next.wrapping_add(len as i32).wrapping_sub(1);
                for step in 1..=ahead as i32 {
                    if self.blocks.len() >= self.config.capacity {
                        report.evicted += self.evict_front();
                    }
                    self.push_placeholder(newest.wrapping_add(step), now);
                }
            }
        }

        let Some(front) = self.next else {
            return report;
        };
        let Ok(index) = usize::try_from(seq.wrapping_sub(front)) else {
            return report;
        };
        let is_newest = index + 1 == self.blocks.len();
        let Some(block) = self.blocks.get_mut(index) else {
            return report;
        };

        let was_placeholder = block.is_placeholder();
        if was_placeholder {
            block.init(frame);
        } else if block.is_complete() || !block.matches(frame) {
            self.stats.duplicates += 1;
            report.duplicate = true;
            return report;
        }
        if !block.add_frame(frame, offset) {
            self.stats.duplicates += 1;
            report.duplicate = true;
            return report;
        }
        report.accepted = true;

        if block.is_complete() {
            report.completed = true;
            if block.requests > 0 {
                report.resent = true;
                self.stats.resent += 1;
            } else if !is_newest {
                report.reordered = true;
                self.stats.reordered += 1;
            }
        }
        report
    }

    fn push_placeholder(&mut self, sequence: i32, now: Instant) {
        let data = self.pool.pop().unwrap_or_default();
        self.blocks.push_back(Block::placeholder(sequence, now, data));
    }

    fn evict_front(&mut self) -> u32 {
        match self.blocks.pop_front() {
            Some(block) => {
                self.next = Some(block.sequence.wrapping_add(1));
                self.stats.blocks_evicted += 1;
                self.recycle(block.data);
                1
            }
            None => 0,
        }
    }

    /// Take the next block for playback.
    ///
    /// An incomplete block at the front is returned as lost when `must_play`
    /// is set (the output would otherwise run dry) or when its requests are
    /// used up. Otherwise nothing is returned and the buffer waits.
    pub fn pop(&mut self, now: Instant, must_play: bool) -> Option<Playout> {
        let front = self.blocks.front()?;
        let playout = if front.is_complete() {
            let block = self.blocks.pop_front()?;
            self.stats.blocks_played += 1;
            if block.xrun {
                self.recycle(block.data);
                Playout::XRun {
                    sequence: block.sequence,
                }
            } else {
                Playout::Block {
                    sequence: block.sequence,
                    sample_rate: block.sample_rate,
                    data: block.data,
                }
            }
        } else if must_play || front.exhausted(now, &self.config) {
            let block = self.blocks.pop_front()?;
            trace!(
                "block {} lost after {} requests",
                block.sequence,
                block.requests
            );
            self.stats.blocks_lost += 1;
            self.recycle(block.data);
            Playout::Lost {
                sequence: block.sequence,
            }
        } else {
            return None;
        };
        self.next = Some(playout.sequence().wrapping_add(1));
        Some(playout)
    }

    /// Whether the front block is complete and can be played right away
    pub fn front_ready(&self) -> bool {
        self.blocks.front().is_some_and(Block::is_complete)
    }

    /// Append resend requests for incomplete blocks that are due.
    ///
    /// The newest block is left alone since its remaining frames may still
    /// be in flight. Returns the number of requests added.
    pub fn collect_resend_requests(&mut self, now: Instant, out: &mut Vec<ResendRequest>) -> usize {
        if !self.config.resend || self.blocks.len() <= 1 {
            return 0;
        }
        let max_frames = self.config.resend_max_frames;
        let start = out.len();
        let mut budget = max_frames;
        let last = self.blocks.len() - 1;
        for block in self.blocks.iter_mut().take(last) {
            if block.is_complete() || !block.request_due(now, &self.config) {
                continue;
            }
            if block.is_placeholder() {
                if budget == 0 {
                    break;
                }
                out.push(ResendRequest {
                    sequence: block.sequence,
                    frame: -1,
                });
                budget -= 1;
            } else {
                let missing = block.received.iter().filter(|r| !**r).count();
                if missing > budget {
                    break;
                }
                for (index, _) in block.received.iter().enumerate().filter(|(_, r)| !**r) {
                    out.push(ResendRequest {
                        sequence: block.sequence,
                        frame: index as i32,
                    });
                }
                budget -= missing;
            }
            block.requests += 1;
            block.last_request = Some(now);
        }
        let added = out.len() - start;
        self.stats.resend_requests += added as u64;
        added
    }

    /// Hand a played block buffer back for reuse
    pub fn recycle(&mut self, mut buf: Vec<u8>) {
        if self.pool.len() < MAX_POOLED_BUFFERS {
            buf.clear();
            self.pool.push(buf);
        }
    }

    /// Next sequence to be played
    pub fn next_sequence(&self) -> Option<i32> {
        self.next
    }

    /// Newest sequence seen
    pub fn newest_sequence(&self) -> Option<i32> {
        let next = self.next?;
        Some(next.wrapping_add(self.blocks.len() as i32).wrapping_sub(1))
    }

    /// Number of blocks held, placeholders included
    pub fn depth(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    /// Drop all blocks but keep the playout position
    pub fn clear(&mut self) {
        while let Some(block) = self.blocks.pop_front() {
            self.recycle(block.data);
        }
    }

    /// Forget everything (new stream)
    pub fn reset(&mut self) {
        self.clear();
        self.next = None;
    }

    pub fn stats(&self) -> JitterBufferStats {
        JitterBufferStats {
            current_depth: self.blocks.len(),
            ..self.stats.clone()
        }
    }
}

impl Default for JitterBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::time::Duration;

    fn frame(sequence: i32, payload: &[u8]) -> DataFrame<'_> {
        DataFrame {
            stream_id: 0,
            sequence,
            sample_rate: 0.0,
            total_size: payload.len() as u32,
            num_frames: 1,
            frame_index: 0,
            xrun: false,
            payload,
        }
    }

    fn config() -> JitterBufferConfig {
        JitterBufferConfig {
            capacity: 16,
            resend: true,
            resend_interval: 0.01,
            resend_limit: 3,
            resend_max_frames: 32,
            resend_grace: 0.005,
        }
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_in_order_playout() {
        let mut jb = JitterBuffer::with_config(config());
        let now = Instant::now();
        for seq in 0..4 {
            let report = jb.insert(&frame(seq, &[seq as u8]), now);
            assert!(report.accepted && report.completed);
        }
        for seq in 0..4 {
            match jb.pop(now, false) {
                Some(Playout::Block { sequence, data, .. }) => {
                    assert_eq!(sequence, seq);
                    assert_eq!(data, vec![seq as u8]);
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        assert!(jb.pop(now, true).is_none());
    }

    #[test]
    fn test_reordered_block_waits() {
        let mut jb = JitterBuffer::with_config(config());
        let now = Instant::now();
        jb.insert(&frame(0, &[0]), now);
        jb.insert(&frame(2, &[2]), now);
        assert!(matches!(jb.pop(now, false), Some(Playout::Block { sequence: 0, .. })));
        // 1 is missing but may still come
        assert!(jb.pop(now, false).is_none());

        let report = jb.insert(&frame(1, &[1]), now);
        assert!(report.reordered);
        assert!(matches!(jb.pop(now, false), Some(Playout::Block { sequence: 1, .. })));
        assert!(matches!(jb.pop(now, false), Some(Playout::Block { sequence: 2, .. })));
    }

    #[test]
    fn test_duplicate_and_late() {
        let mut jb = JitterBuffer::with_config(config());
        let now = Instant::now();
        jb.insert(&frame(5, &[5]), now);
        assert!(jb.insert(&frame(5, &[5]), now).duplicate);
        jb.pop(now, false);
        assert!(jb.insert(&frame(5, &[5]), now).late);
        assert!(jb.insert(&frame(4, &[4]), now).late);
        assert_eq!(jb.stats().duplicates, 1);
        assert_eq!(jb.stats().late_arrivals, 2);
    }

    #[test]
    fn test_resend_requests_respect_grace_and_interval() {
        let mut jb = JitterBuffer::with_config(config());
        let t0 = Instant::now();
        jb.insert(&frame(0, &[0]), t0);
        jb.insert(&frame(3, &[3]), t0);

        let mut out = Vec::new();
        assert_eq!(jb.collect_resend_requests(t0, &mut out), 0);
        assert_eq!(jb.collect_resend_requests(t0 + ms(5), &mut out), 2);
        assert_eq!(
            out,
            vec![
                ResendRequest { sequence: 1, frame: -1 },
                ResendRequest { sequence: 2, frame: -1 },
            ]
        );
        // interval not yet elapsed
        assert_eq!(jb.collect_resend_requests(t0 + ms(10), &mut out), 0);
        assert_eq!(jb.collect_resend_requests(t0 + ms(15), &mut out), 2);
    }

    #[test]
    fn test_exhausted_gap_is_lost_exactly_once() {
        let mut jb = JitterBuffer::with_config(config());
        let t0 = Instant::now();
        jb.insert(&frame(0, &[0]), t0);
        jb.insert(&frame(2, &[2]), t0);
        assert!(matches!(jb.pop(t0, false), Some(Playout::Block { sequence: 0, .. })));

        let mut out = Vec::new();
        let mut t = t0;
        for _ in 0..50 {
            t += ms(10);
            jb.collect_resend_requests(t, &mut out);
        }
        // limit bounds the number of requests
        assert_eq!(out.len(), 3);

        assert!(matches!(jb.pop(t, false), Some(Playout::Lost { sequence: 1 })));
        assert!(matches!(jb.pop(t, false), Some(Playout::Block { sequence: 2, .. })));
        assert_eq!(jb.stats().blocks_lost, 1);

        // a very late resend does not resurrect it
        assert!(jb.insert(&frame(1, &[1]), t).late);
    }

    #[test]
    fn test_resent_block_is_counted() {
        let mut jb = JitterBuffer::with_config(config());
        let t0 = Instant::now();
        jb.insert(&frame(0, &[0]), t0);
        jb.insert(&frame(2, &[2]), t0);
        let mut out = Vec::new();
        jb.collect_resend_requests(t0 + ms(6), &mut out);
        let report = jb.insert(&frame(1, &[1]), t0 + ms(8));
        assert!(report.resent);
        assert!(!report.reordered);
        assert_eq!(jb.stats().resent, 1);
    }

    #[test]
    fn test_multi_frame_block() {
        let mut jb = JitterBuffer::with_config(config());
        let t0 = Instant::now();
        let data = [1u8, 2, 3, 4, 5, 6, 7];
        let part = |index: u16, payload| DataFrame {
            stream_id: 0,
            sequence: 0,
            sample_rate: 0.0,
            total_size: 7,
            num_frames: 3,
            frame_index: index,
            xrun: false,
            payload,
        };
        jb.insert(&part(2, &data[6..]), t0);
        jb.insert(&part(0, &data[..3]), t0);
        jb.insert(&frame(1, &[9]), t0);

        let mut out = Vec::new();
        jb.collect_resend_requests(t0 + ms(6), &mut out);
        assert_eq!(out, vec![ResendRequest { sequence: 0, frame: 1 }]);

        assert!(jb.pop(t0, false).is_none());
        assert!(jb.insert(&part(1, &data[3..6]), t0).completed);
        match jb.pop(t0, false) {
            Some(Playout::Block { data: block, .. }) => assert_eq!(block, data.to_vec()),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_resend_max_frames_caps_pass() {
        let mut jb = JitterBuffer::with_config(JitterBufferConfig {
            resend_max_frames: 2,
            ..config()
        });
        let t0 = Instant::now();
        jb.insert(&frame(0, &[0]), t0);
        jb.insert(&frame(6, &[6]), t0);
        let mut out = Vec::new();
        assert_eq!(jb.collect_resend_requests(t0 + ms(5), &mut out), 2);
        assert_eq!(out[1].sequence, 2);
    }

    #[test]
    fn test_transmission_gap_resets() {
        let mut jb = JitterBuffer::with_config(config());
        let now = Instant::now();
        jb.insert(&frame(0, &[0]), now);
        let report = jb.insert(&frame(100, &[1]), now);
        assert_eq!(report.lost, 99);
        assert_eq!(jb.depth(), 1);
        assert!(matches!(jb.pop(now, false), Some(Playout::Block { sequence: 100, .. })));
    }

    #[test]
    fn test_overrun_evicts_oldest() {
        let mut jb = JitterBuffer::with_config(config());
        let now = Instant::now();
        let mut evicted = 0;
        for seq in 0..20 {
            evicted += jb.insert(&frame(seq, &[0]), now).evicted;
        }
        assert_eq!(evicted, 4);
        assert_eq!(jb.depth(), 16);
        assert_eq!(jb.pop(now, false).map(|p| p.sequence()), Some(4));
    }

    #[test]
    fn test_xrun_block() {
        let mut jb = JitterBuffer::with_config(config());
        let now = Instant::now();
        let xrun = DataFrame {
            xrun: true,
            ..frame(0, &[])
        };
        jb.insert(&xrun, now);
        assert!(matches!(jb.pop(now, false), Some(Playout::XRun { sequence: 0 })));
    }

    #[test]
    fn test_lowest_sequence_starts_stream() {
        let mut jb = JitterBuffer::with_config(config());
        let now = Instant::now();
        assert!(jb.insert(&frame(i32::MIN, &[1]), now).completed);
        assert!(jb.insert(&frame(i32::MIN + 1, &[2]), now).completed);
        assert_eq!(jb.newest_sequence(), Some(i32::MIN + 1));
        assert!(matches!(jb.pop(now, false), Some(Playout::Block { sequence: i32::MIN, .. })));
        assert!(jb.insert(&frame(i32::MAX, &[0]), now).late);
    }

    #[test]
    fn test_sequence_wraparound() {
        let mut jb = JitterBuffer::with_config(config());
        let now = Instant::now();
        let seqs = [i32::MAX - 1, i32::MAX, i32::MIN, i32::MIN + 1];
        for seq in seqs {
            let report = jb.insert(&frame(seq, &[0]), now);
            assert!(report.accepted && !report.late, "block {} refused", seq);
        }
        let played: Vec<i32> = std::iter::from_fn(|| jb.pop(now, false).map(|p| p.sequence())).collect();
        assert_eq!(played, seqs);
        assert!(jb.insert(&frame(i32::MAX, &[0]), now).late);
    }

    #[test]
    fn test_gap_across_wraparound() {
        let mut jb = JitterBuffer::with_config(config());
        let t0 = Instant::now();
        jb.insert(&frame(i32::MAX, &[0]), t0);
        jb.insert(&frame(i32::MIN + 1, &[0]), t0);
        assert_eq!(jb.depth(), 3);

        let mut out = Vec::new();
        jb.collect_resend_requests(t0 + ms(5), &mut out);
        assert_eq!(out, vec![ResendRequest { sequence: i32::MIN, frame: -1 }]);
        assert!(jb.insert(&frame(i32::MIN, &[0]), t0 + ms(6)).resent);
    }

    proptest! {
        #[test]
        fn prop_playout_strictly_increasing(
            order in Just((0..40i32).collect::<Vec<_>>()).prop_shuffle(),
            dups in proptest::collection::vec(0..40i32, 0..20),
            pops in proptest::collection::vec(any::<bool>(), 0..60),
        ) {
            let mut jb = JitterBuffer::with_config(JitterBufferConfig {
                capacity: 64,
                ..config()
            });
            let now = Instant::now();
            let mut played = Vec::new();
            let arrivals: Vec<i32> = order.iter().copied().chain(dups.iter().copied()).collect();
            for (i, seq) in arrivals.iter().enumerate() {
                jb.insert(&frame(*seq, &[*seq as u8]), now);
                if pops.get(i).copied().unwrap_or(false) {
                    if let Some(p) = jb.pop(now, true) {
                        played.push(p.sequence());
                    }
                }
            }
            while let Some(p) = jb.pop(now, true) {
                played.push(p.sequence());
            }
            for pair in played.windows(2) {
                prop_assert!(pair[0] < pair[1]);
            }
        }
    }
}

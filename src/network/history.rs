//! Resend history of a Source
//!
//! Recently sent blocks, oldest first. Sequence numbers within one stream
//! are contiguous, so lookup is an index computation. Blocks outside the
//! window are gone for good; requests for them are not answered.

use std::collections::VecDeque;

use crate::protocol::DataFrame;

/// An encoded block kept for resending
#[derive(Debug, Clone, Default)]
pub struct HistoryBlock {
    pub sequence: i32,
    pub sample_rate: f64,
    pub xrun: bool,
    pub data: Vec<u8>,
    /// Payload bytes per frame (the last frame may be shorter)
    pub frame_size: usize,
}

impl HistoryBlock {
    pub fn num_frames(&self) -> u16 {
        frame_count(self.data.len(), self.frame_size)
    }

    /// Frame `index` of this block
    pub fn frame(&self, stream_id: i32, index: u16) -> Option<DataFrame<'_>> {
        let num_frames = self.num_frames();
        if index >= num_frames {
            return None;
        }
        let start = usize::from(index) * self.frame_size;
        let end = (start + self.frame_size).min(self.data.len());
        Some(DataFrame {
            stream_id,
            sequence: self.sequence,
            sample_rate: self.sample_rate,
            total_size: self.data.len() as u32,
            num_frames,
            frame_index: index,
            xrun: self.xrun,
            payload: &self.data[start.min(end)..end],
        })
    }
}

/// Number of frames needed for `size` bytes; an empty block still takes one frame
pub fn frame_count(size: usize, frame_size: usize) -> u16 {
    if size == 0 || frame_size == 0 {
        return 1;
    }
    size.div_ceil(frame_size).min(usize::from(u16::MAX)) as u16
}

#[derive(Debug, Default)]
pub struct HistoryBuffer {
    blocks: VecDeque<HistoryBlock>,
    capacity: usize,
}

impl HistoryBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            blocks: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Store a block. Returns the data buffer of an evicted block for reuse.
    ///
    /// A block that does not continue the stored sequence starts the
    /// history over.
    pub fn push(&mut self, block: HistoryBlock) -> Option<Vec<u8>> {
        if self.capacity == 0 {
            return Some(block.data);
        }
        let mut evicted = None;
        if let Some(last) = self.blocks.back() {
            if last.sequence.wrapping_add(1) != block.sequence {
                self.blocks.clear();
            }
        }
        if self.blocks.len() >= self.capacity {
            evicted = self.blocks.pop_front().map(|b| b.data);
        }
        self.blocks.push_back(block);
        evicted
    }

    pub fn find(&self, sequence: i32) -> Option<&HistoryBlock> {
        let first = self.blocks.front()?.sequence;
        let index = i64::from(sequence.wrapping_sub(first));
        if index < 0 {
            return None;
        }
        self.blocks
            .get(index as usize)
            .filter(|b| b.sequence == sequence)
    }

    /// Oldest sequence still available
    pub fn oldest(&self) -> Option<i32> {
        self.blocks.front().map(|b| b.sequence)
    }

    /// Remove all blocks, handing their buffers to `recycle`
    pub fn clear(&mut self, mut recycle: impl FnMut(Vec<u8>)) {
        for block in self.blocks.drain(..) {
            recycle(block.data);
        }
    }

    /// Change the window size, dropping the oldest blocks if it shrinks
    pub fn resize(&mut self, capacity: usize, mut recycle: impl FnMut(Vec<u8>)) {
        self.capacity = capacity;
        while self.blocks.len() > capacity {
            if let Some(block) = self.blocks.pop_front() {
                recycle(block.data);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(sequence: i32, size: usize) -> HistoryBlock {
        HistoryBlock {
            sequence,
            sample_rate: 0.0,
            xrun: false,
            data: (0..size).map(|i| i as u8).collect(),
            frame_size: 4,
        }
    }

    #[test]
    fn test_find_within_window() {
        let mut history = HistoryBuffer::new(3);
        for seq in 0..5 {
            history.push(block(seq, 8));
        }
        assert!(history.find(1).is_none());
        assert_eq!(history.find(2).map(|b| b.sequence), Some(2));
        assert_eq!(history.find(4).map(|b| b.sequence), Some(4));
        assert!(history.find(5).is_none());
        assert_eq!(history.oldest(), Some(2));
    }

    #[test]
    fn test_find_across_wraparound() {
        let mut history = HistoryBuffer::new(4);
        for seq in [i32::MAX - 1, i32::MAX, i32::MIN, i32::MIN + 1] {
            history.push(block(seq, 8));
        }
        assert_eq!(history.len(), 4);
        assert_eq!(history.find(i32::MAX).map(|b| b.sequence), Some(i32::MAX));
        assert_eq!(history.find(i32::MIN + 1).map(|b| b.sequence), Some(i32::MIN + 1));
        assert!(history.find(i32::MAX - 2).is_none());
    }

    #[test]
    fn test_push_returns_evicted_buffer() {
        let mut history = HistoryBuffer::new(1);
        assert!(history.push(block(0, 8)).is_none());
        let evicted = history.push(block(1, 8)).unwrap();
        assert_eq!(evicted.len(), 8);
    }

    #[test]
    fn test_discontinuity_restarts() {
        let mut history = HistoryBuffer::new(10);
        history.push(block(0, 8));
        history.push(block(1, 8));
        history.push(block(0, 8));
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn test_frames_split() {
        let b = block(7, 10);
        assert_eq!(b.num_frames(), 3);
        let last = b.frame(1, 2).unwrap();
        assert_eq!(last.payload, &[8, 9]);
        assert_eq!(last.offset(), Some(8));
        let first = b.frame(1, 0).unwrap();
        assert_eq!(first.payload, &[0, 1, 2, 3]);
        assert!(b.frame(1, 3).is_none());
    }

    #[test]
    fn test_empty_block_has_one_frame() {
        let b = block(0, 0);
        assert_eq!(b.num_frames(), 1);
        let f = b.frame(0, 0).unwrap();
        assert!(f.payload.is_empty());
        assert_eq!(f.total_size, 0);
    }
}

//! Length-prefixed framing for the TCP control channel
//!
//! Each OSC message on a stream connection is preceded by its length as a
//! 4-byte big-endian integer. A frame larger than
//! [`MAX_CONTROL_MESSAGE_SIZE`] is a protocol violation and closes the
//! connection.

use crate::network::NetworkError;

/// Largest accepted control message
pub const MAX_CONTROL_MESSAGE_SIZE: usize = 64 * 1024;

const LENGTH_PREFIX: usize = 4;

/// Append one length-prefixed frame to `out`
pub fn write_frame(out: &mut Vec<u8>, message: &[u8]) -> Result<(), NetworkError> {
    if message.len() > MAX_CONTROL_MESSAGE_SIZE {
        return Err(NetworkError::MessageTooLarge {
            size: message.len(),
            max: MAX_CONTROL_MESSAGE_SIZE,
        });
    }
    out.extend_from_slice(&(message.len() as u32).to_be_bytes());
    out.extend_from_slice(message);
    Ok(())
}

/// Reassembles frames from arbitrary stream chunks
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    start: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes read from the stream
    pub fn push(&mut self, data: &[u8]) {
        // Compact consumed bytes before growing
        if self.start > 0 && self.start == self.buffer.len() {
            self.buffer.clear();
            self.start = 0;
        } else if self.start > MAX_CONTROL_MESSAGE_SIZE {
            self.buffer.drain(..self.start);
            self.start = 0;
        }
        self.buffer.extend_from_slice(data);
    }

    /// Take the next complete frame, if any
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, NetworkError> {
        let pending = &self.buffer[self.start..];
        if pending.len() < LENGTH_PREFIX {
            return Ok(None);
        }
        let len = u32::from_be_bytes([pending[0], pending[1], pending[2], pending[3]]) as usize;
        if len > MAX_CONTROL_MESSAGE_SIZE {
            return Err(NetworkError::MessageTooLarge {
                size: len,
                max: MAX_CONTROL_MESSAGE_SIZE,
            });
        }
        if pending.len() < LENGTH_PREFIX + len {
            return Ok(None);
        }
        let frame = pending[LENGTH_PREFIX..LENGTH_PREFIX + len].to_vec();
        self.start += LENGTH_PREFIX + len;
        Ok(Some(frame))
    }

    /// Bytes buffered but not yet returned as frames
    pub fn pending(&self) -> usize {
        self.buffer.len() - self.start
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_across_chunks() {
        let mut stream = Vec::new();
        write_frame(&mut stream, b"hello").unwrap();
        write_frame(&mut stream, b"").unwrap();
        write_frame(&mut stream, b"world!").unwrap();

        let mut decoder = FrameDecoder::new();
        let mut frames = Vec::new();
        for chunk in stream.chunks(3) {
            decoder.push(chunk);
            while let Some(frame) = decoder.next_frame().unwrap() {
                frames.push(frame);
            }
        }
        assert_eq!(frames, vec![b"hello".to_vec(), Vec::new(), b"world!".to_vec()]);
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut decoder = FrameDecoder::new();
        decoder.push(&(MAX_CONTROL_MESSAGE_SIZE as u32 + 1).to_be_bytes());
        assert!(matches!(
            decoder.next_frame(),
            Err(NetworkError::MessageTooLarge { .. })
        ));

        let big = vec![0u8; MAX_CONTROL_MESSAGE_SIZE + 1];
        assert!(write_frame(&mut Vec::new(), &big).is_err());
    }
}

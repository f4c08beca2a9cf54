//! Compact binary message format
//!
//! Binary messages carry audio data and relayed datagrams. They share the
//! UDP socket with OSC messages; the first byte tells them apart, since an
//! OSC message always starts with `/` (0x2F) while a binary message has the
//! high bit set.
//!
//! Header (4 bytes, used when both ids fit in a byte):
//! - type: 1 byte (`0x80 | message type`)
//! - command: 1 byte (bit 7 clear)
//! - recipient id: 1 byte
//! - sender id: 1 byte
//!
//! Large header (12 bytes):
//! - type: 1 byte
//! - command: 1 byte (bit 7 set)
//! - padding: 2 bytes
//! - recipient id: 4 bytes (big-endian)
//! - sender id: 4 bytes (big-endian)
//!
//! Data body:
//! - stream id: 4 bytes
//! - sequence: 4 bytes
//! - flags: 1 byte
//! - if FRAMES: total size (4), frame count (2), frame index (2)
//! - if SAMPLE_RATE: sample rate (8, f64)
//! - payload: remaining bytes

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::network::NetworkError;

/// Set on the first byte of every binary message
pub const DOMAIN_BIT: u8 = 0x80;

/// Set on the command byte when the large header is used
const LARGE_HEADER_BIT: u8 = 0x80;

/// Small header size in bytes
pub const HEADER_SIZE: usize = 4;

/// Large header size in bytes
pub const LARGE_HEADER_SIZE: usize = 12;

/// Largest data header (large header + full data body)
pub const MAX_DATA_HEADER_SIZE: usize = LARGE_HEADER_SIZE + 9 + 8 + 8;

/// Command of a data message
pub const CMD_DATA: u8 = 0;

/// Command of a relay message
pub const CMD_RELAY: u8 = 0;

/// Binary message types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// Addressed to a Source
    Source = 0x00,
    /// Addressed to a Sink
    Sink = 0x01,
    /// Datagram forwarded through the server
    Relay = 0x02,
}

impl TryFrom<u8> for MessageType {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(MessageType::Source),
            0x01 => Ok(MessageType::Sink),
            0x02 => Ok(MessageType::Relay),
            _ => Err(()),
        }
    }
}

/// Whether a datagram is a binary message
pub fn is_binary(data: &[u8]) -> bool {
    data.first().is_some_and(|b| b & DOMAIN_BIT != 0)
}

/// Parsed binary header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BinaryHeader {
    pub msg_type: MessageType,
    pub cmd: u8,
    pub to: i32,
    pub from: i32,
}

impl BinaryHeader {
    pub fn new(msg_type: MessageType, cmd: u8, to: i32, from: i32) -> Self {
        Self {
            msg_type,
            cmd,
            to,
            from,
        }
    }

    fn fits_small(&self) -> bool {
        (0..=255).contains(&self.to) && (0..=255).contains(&self.from)
    }

    pub fn size(&self) -> usize {
        if self.fits_small() {
            HEADER_SIZE
        } else {
            LARGE_HEADER_SIZE
        }
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        out.push(DOMAIN_BIT | self.msg_type as u8);
        if self.fits_small() {
            out.push(self.cmd & !LARGE_HEADER_BIT);
            out.push(self.to as u8);
            out.push(self.from as u8);
        } else {
            out.push(self.cmd | LARGE_HEADER_BIT);
            out.extend_from_slice(&[0, 0]);
            out.extend_from_slice(&self.to.to_be_bytes());
            out.extend_from_slice(&self.from.to_be_bytes());
        }
    }

    /// Parse a header, returning it together with the header length
    pub fn parse(data: &[u8]) -> Result<(Self, usize), NetworkError> {
        if data.len() < HEADER_SIZE || !is_binary(data) {
            return Err(NetworkError::InvalidPacket);
        }
        let msg_type =
            MessageType::try_from(data[0] & !DOMAIN_BIT).map_err(|_| NetworkError::InvalidPacket)?;
        let cmd = data[1] & !LARGE_HEADER_BIT;

        if data[1] & LARGE_HEADER_BIT != 0 {
            if data.len() < LARGE_HEADER_SIZE {
                return Err(NetworkError::InvalidPacket);
            }
            let to = i32::from_be_bytes([data[4], data[5], data[6], data[7]]);
            let from = i32::from_be_bytes([data[8], data[9], data[10], data[11]]);
            Ok((Self::new(msg_type, cmd, to, from), LARGE_HEADER_SIZE))
        } else {
            Ok((
                Self::new(msg_type, cmd, i32::from(data[2]), i32::from(data[3])),
                HEADER_SIZE,
            ))
        }
    }
}

/// Data frame flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DataFlags {
    /// Frame carries the measured source sample rate
    pub sample_rate: bool,
    /// Block is split into several frames
    pub frames: bool,
    /// Block stands for an audio dropout on the sending side
    pub xrun: bool,
}

impl DataFlags {
    pub fn to_u8(self) -> u8 {
        let mut flags = 0u8;
        if self.sample_rate {
            flags |= 0x01;
        }
        if self.frames {
            flags |= 0x02;
        }
        if self.xrun {
            flags |= 0x08;
        }
        flags
    }

    pub fn from_u8(value: u8) -> Self {
        Self {
            sample_rate: (value & 0x01) != 0,
            frames: (value & 0x02) != 0,
            xrun: (value & 0x08) != 0,
        }
    }
}

/// One frame of an encoded audio block
///
/// All frames of a block have the same size except the last one, so the
/// byte offset of a frame follows from its index and the total size.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DataFrame<'a> {
    pub stream_id: i32,
    pub sequence: i32,
    /// Measured source sample rate, 0 when not transmitted
    pub sample_rate: f64,
    /// Size of the whole encoded block
    pub total_size: u32,
    pub num_frames: u16,
    pub frame_index: u16,
    pub xrun: bool,
    pub payload: &'a [u8],
}

impl<'a> DataFrame<'a> {
    /// Byte offset of this frame inside the block
    pub fn offset(&self) -> Option<usize> {
        let total = self.total_size as usize;
        let len = self.payload.len();
        if self.frame_index >= self.num_frames || len > total {
            return None;
        }
        let offset = if self.frame_index + 1 == self.num_frames {
            total - len
        } else {
            self.frame_index as usize * len
        };
        (offset + len <= total).then_some(offset)
    }

    pub fn is_single(&self) -> bool {
        self.num_frames <= 1
    }
}

/// Append a complete binary data message for `frame`
pub fn write_data(out: &mut Vec<u8>, sink_id: i32, source_id: i32, frame: &DataFrame<'_>) {
    BinaryHeader::new(MessageType::Sink, CMD_DATA, sink_id, source_id).write(out);

    let flags = DataFlags {
        sample_rate: frame.sample_rate > 0.0,
        frames: frame.num_frames > 1,
        xrun: frame.xrun,
    };
    out.extend_from_slice(&frame.stream_id.to_be_bytes());
    out.extend_from_slice(&frame.sequence.to_be_bytes());
    out.push(flags.to_u8());
    if flags.frames {
        out.extend_from_slice(&frame.total_size.to_be_bytes());
        out.extend_from_slice(&frame.num_frames.to_be_bytes());
        out.extend_from_slice(&frame.frame_index.to_be_bytes());
    }
    if flags.sample_rate {
        out.extend_from_slice(&frame.sample_rate.to_be_bytes());
    }
    out.extend_from_slice(frame.payload);
}

/// Parse the body of a data message (everything after the header)
pub fn parse_data(body: &[u8]) -> Result<DataFrame<'_>, NetworkError> {
    if body.len() < 9 {
        return Err(NetworkError::malformed("data frame too short"));
    }
    let stream_id = i32::from_be_bytes([body[0], body[1], body[2], body[3]]);
    let sequence = i32::from_be_bytes([body[4], body[5], body[6], body[7]]);
    let flags = DataFlags::from_u8(body[8]);
    let mut pos = 9;

    let (total_size, num_frames, frame_index) = if flags.frames {
        if body.len() < pos + 8 {
            return Err(NetworkError::malformed("data frame header truncated"));
        }
        let total = u32::from_be_bytes([body[pos], body[pos + 1], body[pos + 2], body[pos + 3]]);
        let count = u16::from_be_bytes([body[pos + 4], body[pos + 5]]);
        let index = u16::from_be_bytes([body[pos + 6], body[pos + 7]]);
        pos += 8;
        (Some(total), count, index)
    } else {
        (None, 1, 0)
    };

    let sample_rate = if flags.sample_rate {
        if body.len() < pos + 8 {
            return Err(NetworkError::malformed("data frame header truncated"));
        }
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&body[pos..pos + 8]);
        pos += 8;
        f64::from_be_bytes(bytes)
    } else {
        0.0
    };

    let payload = &body[pos..];
    let frame = DataFrame {
        stream_id,
        sequence,
        sample_rate,
        total_size: total_size.unwrap_or(payload.len() as u32),
        num_frames,
        frame_index,
        xrun: flags.xrun,
        payload,
    };
    if frame.num_frames == 0 || frame.offset().is_none() {
        return Err(NetworkError::malformed("inconsistent frame layout"));
    }
    Ok(frame)
}

/// Append a relay message wrapping `payload`.
///
/// Sent to the server, `addr` is the final destination; forwarded by the
/// server, it is the original sender.
pub fn write_relay(out: &mut Vec<u8>, addr: SocketAddr, payload: &[u8]) {
    BinaryHeader::new(MessageType::Relay, CMD_RELAY, 0, 0).write(out);
    match addr.ip() {
        IpAddr::V4(ip) => {
            out.push(0);
            out.extend_from_slice(&addr.port().to_be_bytes());
            out.extend_from_slice(&ip.octets());
        }
        IpAddr::V6(ip) => match ip.to_ipv4_mapped() {
            Some(v4) => {
                out.push(0);
                out.extend_from_slice(&addr.port().to_be_bytes());
                out.extend_from_slice(&v4.octets());
            }
            None => {
                out.push(1);
                out.extend_from_slice(&addr.port().to_be_bytes());
                out.extend_from_slice(&ip.octets());
            }
        },
    }
    out.extend_from_slice(payload);
}

/// Parse a relay message, returning the embedded address and payload
pub fn parse_relay(data: &[u8]) -> Result<(SocketAddr, &[u8]), NetworkError> {
    let (header, offset) = BinaryHeader::parse(data)?;
    if header.msg_type != MessageType::Relay {
        return Err(NetworkError::InvalidPacket);
    }
    let body = &data[offset..];
    if body.len() < 3 {
        return Err(NetworkError::malformed("relay header truncated"));
    }
    let port = u16::from_be_bytes([body[1], body[2]]);
    match body[0] {
        0 => {
            if body.len() < 7 {
                return Err(NetworkError::malformed("relay header truncated"));
            }
            let ip = Ipv4Addr::new(body[3], body[4], body[5], body[6]);
            Ok((SocketAddr::new(IpAddr::V4(ip), port), &body[7..]))
        }
        1 => {
            if body.len() < 19 {
                return Err(NetworkError::malformed("relay header truncated"));
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&body[3..19]);
            Ok((SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port), &body[19..]))
        }
        other => Err(NetworkError::malformed(format!(
            "unknown relay address family {}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(payload: &[u8]) -> DataFrame<'_> {
        DataFrame {
            stream_id: 7,
            sequence: 42,
            sample_rate: 0.0,
            total_size: payload.len() as u32,
            num_frames: 1,
            frame_index: 0,
            xrun: false,
            payload,
        }
    }

    #[test]
    fn test_small_header_layout() {
        let mut buf = Vec::new();
        write_data(&mut buf, 1, 2, &frame(&[1, 2, 3]));
        assert_eq!(buf[0], DOMAIN_BIT | MessageType::Sink as u8);
        assert_eq!(buf[1], CMD_DATA);
        assert_eq!(buf[2], 1);
        assert_eq!(buf[3], 2);
        // header + stream id + sequence + flags + payload
        assert_eq!(buf.len(), HEADER_SIZE + 9 + 3);
    }

    #[test]
    fn test_large_header_for_big_ids() {
        let mut buf = Vec::new();
        write_data(&mut buf, 1000, -1, &frame(&[]));
        let (header, len) = BinaryHeader::parse(&buf).unwrap();
        assert_eq!(len, LARGE_HEADER_SIZE);
        assert_eq!(header.to, 1000);
        assert_eq!(header.from, -1);
        assert_eq!(header.msg_type, MessageType::Sink);
    }

    #[test]
    fn test_multi_frame_data() {
        let mut buf = Vec::new();
        let f = DataFrame {
            stream_id: 3,
            sequence: 9,
            sample_rate: 44100.5,
            total_size: 10,
            num_frames: 3,
            frame_index: 2,
            xrun: false,
            payload: &[7, 7],
        };
        write_data(&mut buf, 5, 6, &f);
        let (_, offset) = BinaryHeader::parse(&buf).unwrap();
        let parsed = parse_data(&buf[offset..]).unwrap();
        assert_eq!(parsed, f);
        // last frame sits at the end of the block
        assert_eq!(parsed.offset(), Some(8));
    }

    #[test]
    fn test_frame_offsets() {
        let mut f = frame(&[0; 4]);
        f.total_size = 10;
        f.num_frames = 3;
        f.frame_index = 1;
        assert_eq!(f.offset(), Some(4));
        f.frame_index = 3;
        assert_eq!(f.offset(), None);
    }

    #[test]
    fn test_truncated_data_rejected() {
        assert!(parse_data(&[0, 0, 0, 1, 0, 0]).is_err());
        // FRAMES flag without the frame fields
        assert!(parse_data(&[0, 0, 0, 1, 0, 0, 0, 1, 0x02, 0]).is_err());
    }

    #[test]
    fn test_flags_roundtrip() {
        let flags = DataFlags {
            sample_rate: true,
            frames: false,
            xrun: true,
        };
        assert_eq!(DataFlags::from_u8(flags.to_u8()), flags);
    }

    #[test]
    fn test_relay_v4_and_v6() {
        let payload = b"/jam/sink/1/ping";
        for addr in ["192.168.0.9:5000", "[2001:db8::1]:6000"] {
            let addr: SocketAddr = addr.parse().unwrap();
            let mut buf = Vec::new();
            write_relay(&mut buf, addr, payload);
            assert!(is_binary(&buf));
            let (parsed_addr, parsed_payload) = parse_relay(&buf).unwrap();
            assert_eq!(parsed_addr, addr);
            assert_eq!(parsed_payload, payload);
        }
    }

    #[test]
    fn test_osc_is_not_binary() {
        assert!(!is_binary(b"/jam/src/1/data"));
        assert!(!is_binary(&[]));
    }
}

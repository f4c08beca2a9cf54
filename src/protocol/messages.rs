//! Stream and peer messages exchanged over UDP
//!
//! OSC address space:
//!
//! | address                     | direction      |
//! |-----------------------------|----------------|
//! | `/jam/src/<id>/<cmd>`       | sink -> source |
//! | `/jam/sink/<id>/<cmd>`      | source -> sink |
//! | `/jam/peer/<cmd>`           | peer -> peer   |
//! | `/jam/server/<cmd>`         | client -> server |
//! | `/jam/client/<cmd>`         | server -> client |
//!
//! Audio data may also travel as a binary message (see [`super::binary`]).

use std::borrow::Cow;
use std::fmt::Write as _;

use crate::audio::Format;
use crate::network::NetworkError;
use crate::time::NtpTime;

use super::binary::{self, BinaryHeader, DataFrame, MessageType, CMD_DATA};
use super::osc::{peek_address, ArgReader, OscMessage, OscWriter};

/// Root of the OSC address space
pub const DOMAIN: &str = "/jam";

/// Protocol major version; peers with a different major version are rejected
pub const VERSION_MAJOR: u32 = 0;
pub const VERSION_MINOR: u32 = 1;

/// Version string sent with stream and login requests
pub fn version_string() -> String {
    format!("jamlink {}.{}", VERSION_MAJOR, VERSION_MINOR)
}

/// Check a remote version string for compatibility
pub fn check_version(version: &str) -> bool {
    let Some(numbers) = version.strip_prefix("jamlink ") else {
        return false;
    };
    let mut parts = numbers.split('.');
    matches!(
        parts.next().and_then(|m| m.parse::<u32>().ok()),
        Some(major) if major == VERSION_MAJOR
    )
}

/// Command names
pub mod cmd {
    pub const START: &str = "start";
    pub const STOP: &str = "stop";
    pub const DATA: &str = "data";
    pub const PING: &str = "ping";
    pub const PONG: &str = "pong";
    pub const INVITE: &str = "invite";
    pub const UNINVITE: &str = "uninvite";
    pub const DECLINE: &str = "decline";
    pub const QUERY: &str = "query";
    pub const MESSAGE: &str = "msg";
}

/// Recipient named by a message address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Source(i32),
    Sink(i32),
    Peer,
    Server,
    Client,
}

/// Routing information of an incoming datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route<'a> {
    pub target: Target,
    /// Command name; empty for binary messages
    pub cmd: &'a str,
}

/// Work out where a datagram should be dispatched, without fully decoding it
pub fn route(data: &[u8]) -> Result<Route<'_>, NetworkError> {
    if binary::is_binary(data) {
        let (header, _) = BinaryHeader::parse(data)?;
        let target = match header.msg_type {
            MessageType::Sink => Target::Sink(header.to),
            MessageType::Source => Target::Source(header.to),
            MessageType::Relay => Target::Client,
        };
        return Ok(Route { target, cmd: "" });
    }

    let address = peek_address(data)?;
    let rest = address
        .strip_prefix(DOMAIN)
        .and_then(|r| r.strip_prefix('/'))
        .ok_or_else(|| NetworkError::UnknownAddress(address.to_string()))?;

    let mut parts = rest.splitn(3, '/');
    let kind = parts.next().unwrap_or_default();
    let unknown = || NetworkError::UnknownAddress(address.to_string());
    match kind {
        "src" | "sink" => {
            let id: i32 = parts
                .next()
                .and_then(|s| s.parse().ok())
                .ok_or_else(unknown)?;
            let cmd = parts.next().ok_or_else(unknown)?;
            let target = if kind == "src" {
                Target::Source(id)
            } else {
                Target::Sink(id)
            };
            Ok(Route { target, cmd })
        }
        "peer" | "server" | "client" => {
            let cmd = parts.next().ok_or_else(unknown)?;
            let target = match kind {
                "peer" => Target::Peer,
                "server" => Target::Server,
                _ => Target::Client,
            };
            Ok(Route { target, cmd })
        }
        _ => Err(unknown()),
    }
}

fn source_address(buf: &mut String, id: i32, cmd: &str) {
    buf.clear();
    let _ = write!(buf, "{}/src/{}/{}", DOMAIN, id, cmd);
}

fn sink_address(buf: &mut String, id: i32, cmd: &str) {
    buf.clear();
    let _ = write!(buf, "{}/sink/{}/{}", DOMAIN, id, cmd);
}

/// Address of a peer, server or client command
pub fn address(target: Target, cmd: &str) -> String {
    let mut buf = String::new();
    match target {
        Target::Source(id) => source_address(&mut buf, id, cmd),
        Target::Sink(id) => sink_address(&mut buf, id, cmd),
        Target::Peer => buf = format!("{}/peer/{}", DOMAIN, cmd),
        Target::Server => buf = format!("{}/server/{}", DOMAIN, cmd),
        Target::Client => buf = format!("{}/client/{}", DOMAIN, cmd),
    }
    buf
}

/// One resend request entry: a block and a frame index, or -1 for the whole block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResendRequest {
    pub sequence: i32,
    pub frame: i32,
}

/// Messages a Sink sends to a Source
#[derive(Debug, Clone, PartialEq)]
pub enum ToSource<'a> {
    /// Ask for the current format (sent when data arrives for an unknown stream)
    FormatRequest { sink_id: i32, version: Cow<'a, str> },
    /// Ask for missing blocks or frames
    DataRequest {
        sink_id: i32,
        stream_id: i32,
        requests: Cow<'a, [ResendRequest]>,
    },
    /// Answer to a source ping
    PingReply {
        sink_id: i32,
        t1: NtpTime,
        t2: NtpTime,
        packet_loss: f32,
    },
    Invite {
        sink_id: i32,
        token: i32,
        metadata: Option<Cow<'a, [u8]>>,
    },
    Uninvite { sink_id: i32, token: i32 },
}

impl<'a> ToSource<'a> {
    pub fn sink_id(&self) -> i32 {
        match self {
            ToSource::FormatRequest { sink_id, .. }
            | ToSource::DataRequest { sink_id, .. }
            | ToSource::PingReply { sink_id, .. }
            | ToSource::Invite { sink_id, .. }
            | ToSource::Uninvite { sink_id, .. } => *sink_id,
        }
    }

    /// Append the encoded message for source `source_id` to `out`
    pub fn encode(&self, source_id: i32, addr_buf: &mut String, out: &mut Vec<u8>) {
        match self {
            ToSource::FormatRequest { sink_id, version } => {
                source_address(addr_buf, source_id, cmd::START);
                OscWriter::new(out, addr_buf, ",is")
                    .int(*sink_id)
                    .string(version);
            }
            ToSource::DataRequest {
                sink_id,
                stream_id,
                requests,
            } => {
                source_address(addr_buf, source_id, cmd::DATA);
                let mut tags = String::with_capacity(3 + requests.len() * 2);
                tags.push_str(",ii");
                for _ in requests.iter() {
                    tags.push_str("ii");
                }
                let mut w = OscWriter::new(out, addr_buf, &tags);
                w.int(*sink_id).int(*stream_id);
                for r in requests.iter() {
                    w.int(r.sequence).int(r.frame);
                }
            }
            ToSource::PingReply {
                sink_id,
                t1,
                t2,
                packet_loss,
            } => {
                source_address(addr_buf, source_id, cmd::PING);
                OscWriter::new(out, addr_buf, ",ittf")
                    .int(*sink_id)
                    .time(*t1)
                    .time(*t2)
                    .float(*packet_loss);
            }
            ToSource::Invite {
                sink_id,
                token,
                metadata,
            } => {
                source_address(addr_buf, source_id, cmd::INVITE);
                match metadata {
                    Some(md) => {
                        OscWriter::new(out, addr_buf, ",iib")
                            .int(*sink_id)
                            .int(*token)
                            .blob(md);
                    }
                    None => {
                        OscWriter::new(out, addr_buf, ",iiN")
                            .int(*sink_id)
                            .int(*token);
                    }
                }
            }
            ToSource::Uninvite { sink_id, token } => {
                source_address(addr_buf, source_id, cmd::UNINVITE);
                OscWriter::new(out, addr_buf, ",ii")
                    .int(*sink_id)
                    .int(*token);
            }
        }
    }

    /// Decode a message addressed to a source
    pub fn decode(cmd_name: &str, msg: &'a OscMessage) -> Result<Self, NetworkError> {
        let mut r = msg.reader();
        let sink_id = r.int()?;
        let message = match cmd_name {
            cmd::START => ToSource::FormatRequest {
                sink_id,
                version: Cow::Borrowed(r.string()?),
            },
            cmd::DATA => {
                let stream_id = r.int()?;
                if r.remaining() % 2 != 0 {
                    return Err(NetworkError::malformed("odd number of resend arguments"));
                }
                let mut requests = Vec::with_capacity(r.remaining() / 2);
                while r.remaining() > 0 {
                    requests.push(ResendRequest {
                        sequence: r.int()?,
                        frame: r.int()?,
                    });
                }
                ToSource::DataRequest {
                    sink_id,
                    stream_id,
                    requests: Cow::Owned(requests),
                }
            }
            cmd::PING => ToSource::PingReply {
                sink_id,
                t1: r.time()?,
                t2: r.time()?,
                packet_loss: r.float()?,
            },
            cmd::INVITE => ToSource::Invite {
                sink_id,
                token: r.int()?,
                metadata: r.opt_blob()?.map(Cow::Borrowed),
            },
            cmd::UNINVITE => ToSource::Uninvite {
                sink_id,
                token: r.int()?,
            },
            other => return Err(NetworkError::UnknownAddress(other.to_string())),
        };
        Ok(message)
    }
}

/// Stream announcement sent by a Source
#[derive(Debug, Clone, PartialEq)]
pub struct StreamStart<'a> {
    pub source_id: i32,
    pub version: Cow<'a, str>,
    pub stream_id: i32,
    pub format: Format,
    pub metadata: Option<Cow<'a, [u8]>>,
}

/// Messages a Source sends to a Sink
#[derive(Debug, Clone, PartialEq)]
pub enum ToSink<'a> {
    Start(StreamStart<'a>),
    Stop { source_id: i32, stream_id: i32 },
    Data { source_id: i32, frame: DataFrame<'a> },
    /// Periodic ping carrying the source's audio clock position
    Ping {
        source_id: i32,
        t1: NtpTime,
        sample_count: i64,
    },
    Decline { source_id: i32, token: i32 },
}

impl<'a> ToSink<'a> {
    pub fn source_id(&self) -> i32 {
        match self {
            ToSink::Start(start) => start.source_id,
            ToSink::Stop { source_id, .. }
            | ToSink::Data { source_id, .. }
            | ToSink::Ping { source_id, .. }
            | ToSink::Decline { source_id, .. } => *source_id,
        }
    }

    /// Append the OSC encoding for sink `sink_id` to `out`
    pub fn encode(&self, sink_id: i32, addr_buf: &mut String, out: &mut Vec<u8>) {
        match self {
            ToSink::Start(start) => {
                sink_address(addr_buf, sink_id, cmd::START);
                let f = &start.format;
                let tags = if start.metadata.is_some() {
                    ",isisiiibb"
                } else {
                    ",isisiiibN"
                };
                let mut w = OscWriter::new(out, addr_buf, tags);
                w.int(start.source_id)
                    .string(&start.version)
                    .int(start.stream_id)
                    .string(&f.codec)
                    .int(i32::from(f.num_channels))
                    .int(f.sample_rate as i32)
                    .int(f.block_size as i32)
                    .blob(&f.extension);
                if let Some(md) = &start.metadata {
                    w.blob(md);
                }
            }
            ToSink::Stop {
                source_id,
                stream_id,
            } => {
                sink_address(addr_buf, sink_id, cmd::STOP);
                OscWriter::new(out, addr_buf, ",ii")
                    .int(*source_id)
                    .int(*stream_id);
            }
            ToSink::Data { source_id, frame } => {
                sink_address(addr_buf, sink_id, cmd::DATA);
                OscWriter::new(out, addr_buf, ",iiidiiiib")
                    .int(*source_id)
                    .int(frame.stream_id)
                    .int(frame.sequence)
                    .double(frame.sample_rate)
                    .int(i32::from(frame.xrun))
                    .int(frame.total_size as i32)
                    .int(i32::from(frame.num_frames))
                    .int(i32::from(frame.frame_index))
                    .blob(frame.payload);
            }
            ToSink::Ping {
                source_id,
                t1,
                sample_count,
            } => {
                sink_address(addr_buf, sink_id, cmd::PING);
                OscWriter::new(out, addr_buf, ",ith")
                    .int(*source_id)
                    .time(*t1)
                    .long(*sample_count);
            }
            ToSink::Decline { source_id, token } => {
                sink_address(addr_buf, sink_id, cmd::DECLINE);
                OscWriter::new(out, addr_buf, ",ii")
                    .int(*source_id)
                    .int(*token);
            }
        }
    }

    /// Binary encoding of a data frame
    pub fn encode_binary_data(
        sink_id: i32,
        source_id: i32,
        frame: &DataFrame<'_>,
        out: &mut Vec<u8>,
    ) {
        binary::write_data(out, sink_id, source_id, frame);
    }

    /// Decode an OSC message addressed to a sink
    pub fn decode(cmd_name: &str, msg: &'a OscMessage) -> Result<Self, NetworkError> {
        let mut r: ArgReader<'a> = msg.reader();
        let source_id = r.int()?;
        let message = match cmd_name {
            cmd::START => {
                let version = Cow::Borrowed(r.string()?);
                let stream_id = r.int()?;
                let format = decode_format(&mut r)?;
                let metadata = r.opt_blob()?.map(Cow::Borrowed);
                ToSink::Start(StreamStart {
                    source_id,
                    version,
                    stream_id,
                    format,
                    metadata,
                })
            }
            cmd::STOP => ToSink::Stop {
                source_id,
                stream_id: r.int()?,
            },
            cmd::DATA => {
                let stream_id = r.int()?;
                let sequence = r.int()?;
                let sample_rate = r.double()?;
                let xrun = r.int()? != 0;
                let total_size = r.int()?;
                let num_frames = r.int()?;
                let frame_index = r.int()?;
                let payload = r.blob()?;
                let (Ok(total_size), Ok(num_frames), Ok(frame_index)) = (
                    u32::try_from(total_size),
                    u16::try_from(num_frames),
                    u16::try_from(frame_index),
                ) else {
                    return Err(NetworkError::malformed("frame fields out of range"));
                };
                let frame = DataFrame {
                    stream_id,
                    sequence,
                    sample_rate,
                    total_size,
                    num_frames,
                    frame_index,
                    xrun,
                    payload,
                };
                if num_frames == 0 || frame.offset().is_none() {
                    return Err(NetworkError::malformed("inconsistent frame layout"));
                }
                ToSink::Data { source_id, frame }
            }
            cmd::PING => ToSink::Ping {
                source_id,
                t1: r.time()?,
                sample_count: r.long()?,
            },
            cmd::DECLINE => ToSink::Decline {
                source_id,
                token: r.int()?,
            },
            other => return Err(NetworkError::UnknownAddress(other.to_string())),
        };
        Ok(message)
    }

    /// Decode a binary message addressed to a sink
    pub fn decode_binary(data: &'a [u8]) -> Result<(i32, Self), NetworkError> {
        let (header, offset) = BinaryHeader::parse(data)?;
        if header.msg_type != MessageType::Sink || header.cmd != CMD_DATA {
            return Err(NetworkError::InvalidPacket);
        }
        let frame = binary::parse_data(&data[offset..])?;
        Ok((
            header.to,
            ToSink::Data {
                source_id: header.from,
                frame,
            },
        ))
    }
}

fn decode_format(r: &mut ArgReader<'_>) -> Result<Format, NetworkError> {
    let codec = r.string()?.to_string();
    let num_channels = r.int()?;
    let sample_rate = r.int()?;
    let block_size = r.int()?;
    let extension = r.blob()?.to_vec();
    let (Ok(num_channels), Ok(sample_rate), Ok(block_size)) = (
        u16::try_from(num_channels),
        u32::try_from(sample_rate),
        u32::try_from(block_size),
    ) else {
        return Err(NetworkError::malformed("format fields out of range"));
    };
    Ok(Format {
        codec,
        num_channels,
        sample_rate,
        block_size,
        extension,
    })
}

/// Peer-to-peer messages between clients of the same group
#[derive(Debug, Clone, PartialEq)]
pub enum PeerMessage {
    /// Handshake and keep-alive message
    Ping {
        group_id: i32,
        user_id: i32,
        t1: NtpTime,
    },
    Pong {
        group_id: i32,
        user_id: i32,
        t1: NtpTime,
        t2: NtpTime,
    },
    /// Application message sent directly to a peer
    Message {
        group_id: i32,
        user_id: i32,
        flags: i32,
        data: Vec<u8>,
    },
}

impl PeerMessage {
    pub fn to_osc(&self) -> OscMessage {
        match self {
            PeerMessage::Ping {
                group_id,
                user_id,
                t1,
            } => OscMessage::new(address(Target::Peer, cmd::PING))
                .with(*group_id)
                .with(*user_id)
                .with(*t1),
            PeerMessage::Pong {
                group_id,
                user_id,
                t1,
                t2,
            } => OscMessage::new(address(Target::Peer, cmd::PONG))
                .with(*group_id)
                .with(*user_id)
                .with(*t1)
                .with(*t2),
            PeerMessage::Message {
                group_id,
                user_id,
                flags,
                data,
            } => OscMessage::new(address(Target::Peer, cmd::MESSAGE))
                .with(*group_id)
                .with(*user_id)
                .with(*flags)
                .with(data.clone()),
        }
    }

    pub fn decode(cmd_name: &str, msg: &OscMessage) -> Result<Self, NetworkError> {
        let mut r = msg.reader();
        let group_id = r.int()?;
        let user_id = r.int()?;
        let message = match cmd_name {
            cmd::PING => PeerMessage::Ping {
                group_id,
                user_id,
                t1: r.time()?,
            },
            cmd::PONG => PeerMessage::Pong {
                group_id,
                user_id,
                t1: r.time()?,
                t2: r.time()?,
            },
            cmd::MESSAGE => PeerMessage::Message {
                group_id,
                user_id,
                flags: r.int()?,
                data: r.blob()?.to_vec(),
            },
            other => return Err(NetworkError::UnknownAddress(other.to_string())),
        };
        Ok(message)
    }
}

/// Public address query, sent by a client to the server over UDP
pub fn query_request() -> OscMessage {
    OscMessage::new(address(Target::Server, cmd::QUERY))
}

/// Reply to a query: the address the server saw the query come from
pub fn query_reply(ip: &str, port: u16) -> OscMessage {
    OscMessage::new(address(Target::Client, cmd::QUERY))
        .with(ip)
        .with(i32::from(port))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format() -> Format {
        Format {
            codec: "pcm".to_string(),
            num_channels: 2,
            sample_rate: 48000,
            block_size: 256,
            extension: vec![0, 0, 0, 4],
        }
    }

    #[test]
    fn test_version_check() {
        assert!(check_version(&version_string()));
        assert!(check_version(&format!("jamlink {}.99", VERSION_MAJOR)));
        assert!(!check_version(&format!("jamlink {}.0", VERSION_MAJOR + 1)));
        assert!(!check_version("other 0.1"));
    }

    #[test]
    fn test_route_osc() {
        let mut buf = Vec::new();
        let mut addr = String::new();
        ToSink::Stop {
            source_id: 4,
            stream_id: 2,
        }
        .encode(17, &mut addr, &mut buf);
        assert_eq!(
            route(&buf).unwrap(),
            Route {
                target: Target::Sink(17),
                cmd: cmd::STOP
            }
        );

        let bytes = query_request().to_bytes();
        assert_eq!(route(&bytes).unwrap().target, Target::Server);
    }

    #[test]
    fn test_route_rejects_foreign_address() {
        let bytes = OscMessage::new("/other/sink/1/data").to_bytes();
        assert!(matches!(route(&bytes), Err(NetworkError::UnknownAddress(_))));
        let bytes = OscMessage::new("/jam/sink/x/data").to_bytes();
        assert!(route(&bytes).is_err());
    }

    #[test]
    fn test_start_message() {
        let start = ToSink::Start(StreamStart {
            source_id: 1,
            version: Cow::Owned(version_string()),
            stream_id: 5,
            format: format(),
            metadata: Some(Cow::Owned(vec![1, 2])),
        });
        let mut buf = Vec::new();
        start.encode(2, &mut String::new(), &mut buf);

        let msg = OscMessage::decode(&buf).unwrap();
        let route = route(&buf).unwrap();
        assert_eq!(ToSink::decode(route.cmd, &msg).unwrap(), start);
    }

    #[test]
    fn test_osc_data_matches_binary_data() {
        let frame = DataFrame {
            stream_id: 1,
            sequence: 100,
            sample_rate: 48000.0,
            total_size: 6,
            num_frames: 2,
            frame_index: 1,
            xrun: false,
            payload: &[4, 5, 6],
        };
        let mut osc = Vec::new();
        ToSink::Data {
            source_id: 3,
            frame,
        }
        .encode(9, &mut String::new(), &mut osc);
        let msg = OscMessage::decode(&osc).unwrap();
        let from_osc = ToSink::decode(cmd::DATA, &msg).unwrap();

        let mut bin = Vec::new();
        ToSink::encode_binary_data(9, 3, &frame, &mut bin);
        assert_eq!(route(&bin).unwrap().target, Target::Sink(9));
        let (sink_id, from_bin) = ToSink::decode_binary(&bin).unwrap();

        assert_eq!(sink_id, 9);
        assert_eq!(from_osc, from_bin);
    }

    #[test]
    fn test_resend_request_message() {
        let requests = [
            ResendRequest {
                sequence: 10,
                frame: -1,
            },
            ResendRequest {
                sequence: 11,
                frame: 2,
            },
        ];
        let msg = ToSource::DataRequest {
            sink_id: 8,
            stream_id: 3,
            requests: Cow::Borrowed(&requests),
        };
        let mut buf = Vec::new();
        msg.encode(1, &mut String::new(), &mut buf);
        let decoded_osc = OscMessage::decode(&buf).unwrap();
        let decoded = ToSource::decode(cmd::DATA, &decoded_osc).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.sink_id(), 8);
    }

    #[test]
    fn test_invite_without_metadata() {
        let msg = ToSource::Invite {
            sink_id: 1,
            token: 77,
            metadata: None,
        };
        let mut buf = Vec::new();
        msg.encode(5, &mut String::new(), &mut buf);
        let osc = OscMessage::decode(&buf).unwrap();
        assert_eq!(route(&buf).unwrap().target, Target::Source(5));
        assert_eq!(ToSource::decode(cmd::INVITE, &osc).unwrap(), msg);
    }

    #[test]
    fn test_peer_message() {
        let msg = PeerMessage::Message {
            group_id: 1,
            user_id: 2,
            flags: 0,
            data: b"hi".to_vec(),
        };
        let bytes = msg.to_osc().to_bytes();
        let route = route(&bytes).unwrap();
        assert_eq!(route.target, Target::Peer);
        let decoded = PeerMessage::decode(route.cmd, &OscMessage::decode(&bytes).unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }
}

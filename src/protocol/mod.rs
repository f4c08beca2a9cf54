//! Wire protocol
//!
//! Stream traffic (start/stop, audio data, resend requests, pings,
//! invitations) is OSC over UDP, with an optional compact binary encoding
//! for audio data. Client/server traffic is OSC over a length-prefixed TCP
//! stream.

pub mod binary;
pub mod control;
mod framing;
pub mod messages;
mod osc;

pub use binary::{DataFrame, MessageType};
pub use control::{
    ClientRequest, ErrorCode, ErrorReply, GroupJoinReply, LoginReply, PeerAnnouncement,
    ServerMessage,
};
pub use framing::{write_frame, FrameDecoder, MAX_CONTROL_MESSAGE_SIZE};
pub use messages::{
    check_version, route, version_string, PeerMessage, ResendRequest, Route, StreamStart, Target,
    ToSink, ToSource,
};
pub use osc::{peek_address, ArgReader, OscArg, OscError, OscMessage, OscWriter};

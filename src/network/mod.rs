//! Network module for peer-to-peer audio streaming
//!
//! Sockets and transport servers, the Source and Sink stream endpoints, and
//! the Client and Server that organize peers into groups.

pub mod addr;
mod client;
mod endpoint;
mod error;
mod history;
mod jitter_buffer;
mod rtt;
mod sequence_tracker;
mod server;
mod sink;
mod source;
mod tcp_server;
mod timesync;
mod udp_server;

pub use addr::{IpAddress, SocketFamily};
pub use client::{
    Callback, Client, ClientConfig, ClientError, JoinRequest, Membership, PeerInfo, FLAG_DIRECT,
};
pub use endpoint::Endpoint;
pub use error::NetworkError;
pub use history::{HistoryBlock, HistoryBuffer};
pub use jitter_buffer::{JitterBuffer, JitterBufferConfig, JitterBufferStats, Playout};
pub use rtt::RttEstimator;
pub use sequence_tracker::{SequenceStatus, SequenceTracker};
pub use server::{
    Server, ServerConfig, ServerError, ServerHandle, ServerState, ServerStats, DEFAULT_PORT,
};
pub use sink::{Sink, SinkConfig, StreamStats, ERROR_DECODE};
pub use source::{SinkStats, Source, SourceConfig, SourceStats, ERROR_ENCODE};
pub use tcp_server::{ClientId, TcpEvent, TcpServer, TcpStopHandle};
pub use timesync::{RateEstimator, TimeSyncFilter};
pub use udp_server::{ReceiveHandler, Received, UdpServer, UdpServerConfig, MAX_DATAGRAM_SIZE};

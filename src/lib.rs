//! jamlink - Low-latency peer-to-peer audio streaming
//!
//! A [`Source`](network::Source) encodes audio and streams it to any number
//! of [`Sink`](network::Sink)s, which buffer, resend-request, resample and
//! play it back. A [`Client`](network::Client) hosts Sources and Sinks on a
//! single UDP socket and meets other clients in groups managed by a
//! [`Server`](network::Server), which also relays traffic for peers that
//! cannot reach each other directly.

pub mod audio;
pub mod events;
pub mod network;
pub mod protocol;
pub mod time;

pub use audio::{CodecRegistry, Format};
pub use events::{Event, EventMode, EventQueue};
pub use network::{Client, ClientConfig, Server, ServerConfig, Sink, SinkConfig, Source, SourceConfig};
pub use time::NtpTime;

//! Event delivery
//!
//! Sources, Sinks, the Client and the Server report state changes as
//! [`Event`]s. Each component owns one [`EventQueue`], fixed at setup in one
//! of two modes:
//!
//! - **Poll**: events are pushed into a bounded lock-free queue and drained
//!   by the host with [`EventQueue::poll`]. When the queue is full the event
//!   is dropped and counted.
//! - **Callback**: events are handed to a handler immediately, on whichever
//!   thread produced them. The handler learns which context that is through
//!   [`ThreadLevel`].
//!
//! Events raised from the audio path never allocate: their payloads are
//! plain values.

use std::borrow::Cow;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam::queue::ArrayQueue;

use crate::audio::Format;
use crate::network::Endpoint;
use crate::time::NtpTime;

/// Default number of events a poll-mode queue can hold
pub const DEFAULT_EVENT_QUEUE_SIZE: usize = 256;

/// Context an event was raised from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadLevel {
    Audio,
    Network,
    Unknown,
}

/// Playback state of a remote stream as seen by a Sink
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Inactive,
    Active,
    Buffering,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ErrorEvent {
    pub code: i32,
    pub message: Cow<'static, str>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SinkPingEvent {
    pub endpoint: Endpoint,
    pub t1: NtpTime,
    pub t2: NtpTime,
    pub t3: NtpTime,
    /// Smoothed round trip time in seconds
    pub rtt: f64,
    pub packet_loss: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SourcePingEvent {
    pub endpoint: Endpoint,
    pub t1: NtpTime,
    pub t2: NtpTime,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InviteEvent {
    pub endpoint: Endpoint,
    pub token: i32,
    pub metadata: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamStartEvent {
    pub endpoint: Endpoint,
    pub stream_id: i32,
    pub metadata: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamStateEvent {
    pub endpoint: Endpoint,
    pub state: StreamState,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FormatChangeEvent {
    pub endpoint: Endpoint,
    pub format: Format,
}

/// Aggregated block statistics for one process period
#[derive(Debug, Clone, PartialEq)]
pub struct BlockEvent {
    pub endpoint: Endpoint,
    pub count: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PeerEvent {
    pub group_id: i32,
    pub user_id: i32,
    pub group_name: String,
    pub user_name: String,
    pub address: Option<SocketAddr>,
    pub relayed: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PeerPingEvent {
    pub group_id: i32,
    pub user_id: i32,
    pub rtt: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PeerMessageEvent {
    pub group_id: i32,
    pub user_id: i32,
    pub flags: i32,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetadataUpdateEvent {
    pub group_id: i32,
    /// Updating user, or -1 when the server changed it
    pub user_id: i32,
    pub metadata: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClientLoginEvent {
    pub client_id: i32,
    pub address: SocketAddr,
    pub accepted: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroupEvent {
    pub group_id: i32,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroupMemberEvent {
    pub group_id: i32,
    pub user_id: i32,
    pub user_name: String,
    pub client_id: i32,
}

/// Everything a component can report
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Error(ErrorEvent),

    // Source side
    SinkAdd(Endpoint),
    SinkRemove(Endpoint),
    SinkPing(SinkPingEvent),
    Invite(InviteEvent),
    Uninvite(InviteEvent),

    // Sink side
    SourceAdd(Endpoint),
    SourceRemove(Endpoint),
    SourcePing(SourcePingEvent),
    StreamStart(StreamStartEvent),
    StreamStop(Endpoint),
    StreamState(StreamStateEvent),
    FormatChange(FormatChangeEvent),
    InviteDecline(Endpoint),
    InviteTimeout(Endpoint),
    UninviteTimeout(Endpoint),
    BufferOverrun(Endpoint),
    BufferUnderrun(Endpoint),
    BlockLost(BlockEvent),
    BlockResent(BlockEvent),
    BlockReordered(BlockEvent),
    BlockDropped(BlockEvent),
    BlockXRun(BlockEvent),

    // Client side
    Disconnect { reason: Option<String> },
    Notification { data: Vec<u8> },
    GroupEject { group_id: i32 },
    GroupUpdate(MetadataUpdateEvent),
    UserUpdate(MetadataUpdateEvent),
    PeerHandshake(PeerEvent),
    PeerTimeout(PeerEvent),
    PeerJoin(PeerEvent),
    PeerLeave(PeerEvent),
    PeerUpdate(MetadataUpdateEvent),
    PeerPing(PeerPingEvent),
    PeerMessage(PeerMessageEvent),

    // Server side
    ClientLogin(ClientLoginEvent),
    ClientLogout { client_id: i32 },
    GroupAdd(GroupEvent),
    GroupRemove(GroupEvent),
    GroupJoin(GroupMemberEvent),
    GroupLeave(GroupMemberEvent),
}

/// Discriminant of [`Event`], handy for filtering and counting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    Error,
    SinkAdd,
    SinkRemove,
    SinkPing,
    Invite,
    Uninvite,
    SourceAdd,
    SourceRemove,
    SourcePing,
    StreamStart,
    StreamStop,
    StreamState,
    FormatChange,
    InviteDecline,
    InviteTimeout,
    UninviteTimeout,
    BufferOverrun,
    BufferUnderrun,
    BlockLost,
    BlockResent,
    BlockReordered,
    BlockDropped,
    BlockXRun,
    Disconnect,
    Notification,
    GroupEject,
    GroupUpdate,
    UserUpdate,
    PeerHandshake,
    PeerTimeout,
    PeerJoin,
    PeerLeave,
    PeerUpdate,
    PeerPing,
    PeerMessage,
    ClientLogin,
    ClientLogout,
    GroupAdd,
    GroupRemove,
    GroupJoin,
    GroupLeave,
}

impl Event {
    pub fn event_type(&self) -> EventType {
        match self {
            Event::Error(_) => EventType::Error,
            Event::SinkAdd(_) => EventType::SinkAdd,
            Event::SinkRemove(_) => EventType::SinkRemove,
            Event::SinkPing(_) => EventType::SinkPing,
            Event::Invite(_) => EventType::Invite,
            Event::Uninvite(_) => EventType::Uninvite,
            Event::SourceAdd(_) => EventType::SourceAdd,
            Event::SourceRemove(_) => EventType::SourceRemove,
            Event::SourcePing(_) => EventType::SourcePing,
            Event::StreamStart(_) => EventType::StreamStart,
            Event::StreamStop(_) => EventType::StreamStop,
            Event::StreamState(_) => EventType::StreamState,
            Event::FormatChange(_) => EventType::FormatChange,
            Event::InviteDecline(_) => EventType::InviteDecline,
            Event::InviteTimeout(_) => EventType::InviteTimeout,
            Event::UninviteTimeout(_) => EventType::UninviteTimeout,
            Event::BufferOverrun(_) => EventType::BufferOverrun,
            Event::BufferUnderrun(_) => EventType::BufferUnderrun,
            Event::BlockLost(_) => EventType::BlockLost,
            Event::BlockResent(_) => EventType::BlockResent,
            Event::BlockReordered(_) => EventType::BlockReordered,
            Event::BlockDropped(_) => EventType::BlockDropped,
            Event::BlockXRun(_) => EventType::BlockXRun,
            Event::Disconnect { .. } => EventType::Disconnect,
            Event::Notification { .. } => EventType::Notification,
            Event::GroupEject { .. } => EventType::GroupEject,
            Event::GroupUpdate(_) => EventType::GroupUpdate,
            Event::UserUpdate(_) => EventType::UserUpdate,
            Event::PeerHandshake(_) => EventType::PeerHandshake,
            Event::PeerTimeout(_) => EventType::PeerTimeout,
            Event::PeerJoin(_) => EventType::PeerJoin,
            Event::PeerLeave(_) => EventType::PeerLeave,
            Event::PeerUpdate(_) => EventType::PeerUpdate,
            Event::PeerPing(_) => EventType::PeerPing,
            Event::PeerMessage(_) => EventType::PeerMessage,
            Event::ClientLogin(_) => EventType::ClientLogin,
            Event::ClientLogout { .. } => EventType::ClientLogout,
            Event::GroupAdd(_) => EventType::GroupAdd,
            Event::GroupRemove(_) => EventType::GroupRemove,
            Event::GroupJoin(_) => EventType::GroupJoin,
            Event::GroupLeave(_) => EventType::GroupLeave,
        }
    }
}

/// Handler invoked for every event in callback mode
pub type EventHandler = Arc<dyn Fn(&Event, ThreadLevel) + Send + Sync>;

/// Delivery mode, fixed when the queue is created
pub enum EventMode {
    Poll { capacity: usize },
    Callback(EventHandler),
}

impl Default for EventMode {
    fn default() -> Self {
        EventMode::Poll {
            capacity: DEFAULT_EVENT_QUEUE_SIZE,
        }
    }
}

impl fmt::Debug for EventMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventMode::Poll { capacity } => write!(f, "Poll({})", capacity),
            EventMode::Callback(_) => write!(f, "Callback"),
        }
    }
}

/// Event sink shared between the audio and network contexts
pub struct EventQueue {
    queue: Option<ArrayQueue<Event>>,
    handler: Option<EventHandler>,
    dropped: AtomicU64,
}

impl EventQueue {
    pub fn new(mode: EventMode) -> Self {
        match mode {
            EventMode::Poll { capacity } => Self {
                queue: Some(ArrayQueue::new(capacity.max(1))),
                handler: None,
                dropped: AtomicU64::new(0),
            },
            EventMode::Callback(handler) => Self {
                queue: None,
                handler: Some(handler),
                dropped: AtomicU64::new(0),
            },
        }
    }

    pub fn is_callback(&self) -> bool {
        self.handler.is_some()
    }

    /// Deliver an event. Never blocks.
    pub fn push(&self, event: Event, level: ThreadLevel) {
        if let Some(handler) = &self.handler {
            handler(&event, level);
        } else if let Some(queue) = &self.queue {
            if queue.push(event).is_err() {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Drain all queued events. Returns the number of events handled.
    pub fn poll(&self, mut f: impl FnMut(Event)) -> usize {
        let Some(queue) = &self.queue else {
            return 0;
        };
        let mut count = 0;
        while let Some(event) = queue.pop() {
            f(event);
            count += 1;
        }
        count
    }

    /// Drain all queued events into a vector
    pub fn drain(&self) -> Vec<Event> {
        let mut events = Vec::new();
        self.poll(|e| events.push(e));
        events
    }

    /// Number of events waiting to be polled
    pub fn available(&self) -> usize {
        self.queue.as_ref().map_or(0, |q| q.len())
    }

    /// Number of events lost because the queue was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new(EventMode::default())
    }
}

impl fmt::Debug for EventQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventQueue")
            .field("callback", &self.is_callback())
            .field("available", &self.available())
            .field("dropped", &self.dropped())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn endpoint() -> Endpoint {
        Endpoint::new("127.0.0.1:9000".parse::<SocketAddr>().unwrap(), 1)
    }

    #[test]
    fn test_poll_mode_fifo() {
        let queue = EventQueue::new(EventMode::Poll { capacity: 8 });
        queue.push(Event::SinkAdd(endpoint()), ThreadLevel::Network);
        queue.push(Event::StreamStop(endpoint()), ThreadLevel::Network);
        assert_eq!(queue.available(), 2);

        let events = queue.drain();
        assert_eq!(events[0].event_type(), EventType::SinkAdd);
        assert_eq!(events[1].event_type(), EventType::StreamStop);
        assert_eq!(queue.available(), 0);
    }

    #[test]
    fn test_full_queue_drops_and_counts() {
        let queue = EventQueue::new(EventMode::Poll { capacity: 2 });
        for _ in 0..5 {
            queue.push(Event::SinkAdd(endpoint()), ThreadLevel::Audio);
        }
        assert_eq!(queue.available(), 2);
        assert_eq!(queue.dropped(), 3);
    }

    #[test]
    fn test_callback_mode() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let queue = EventQueue::new(EventMode::Callback(Arc::new(move |event, level| {
            seen_clone.lock().push((event.event_type(), level));
        })));

        queue.push(
            Event::BlockLost(BlockEvent {
                endpoint: endpoint(),
                count: 2,
            }),
            ThreadLevel::Audio,
        );

        assert!(queue.is_callback());
        assert_eq!(queue.available(), 0);
        assert_eq!(
            seen.lock().as_slice(),
            &[(EventType::BlockLost, ThreadLevel::Audio)]
        );
    }
}

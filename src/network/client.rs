//! Peer client
//!
//! A [`Client`] owns one UDP socket shared by all of its Sources and Sinks,
//! plus a TCP control connection to a [`Server`](super::Server). The server
//! tells the client about the other members of its groups; the client then
//! handshakes with each of them over UDP and, once a peer answers, points
//! the local Sources and Sinks at it. Peers that never answer are reached
//! through the server relay when the server offers one.
//!
//! Requests (`connect`, `join_group`, ...) never block: they return at once
//! and complete through a callback, or through the `*_async` variants.
//! Every request fails with [`ClientError::Timeout`] after
//! `request_timeout` seconds without a reply.
//!
//! [`Client::run`] drives the client and must be running for anything to
//! happen on the network.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use crate::events::{
    Event, EventMode, EventQueue, MetadataUpdateEvent, PeerEvent, PeerMessageEvent,
    PeerPingEvent, ThreadLevel,
};
use crate::protocol::binary;
use crate::protocol::control::parse_control_address;
use crate::protocol::messages::{cmd, query_request};
use crate::protocol::{
    route, version_string, write_frame, ClientRequest, ErrorCode, ErrorReply, FrameDecoder,
    GroupJoinReply, LoginReply, OscMessage, PeerAnnouncement, PeerMessage, ServerMessage, Target,
};
use crate::time::NtpTime;

use super::addr::{self, IpAddress, SocketFamily};
use super::endpoint::Endpoint;
use super::error::NetworkError;
use super::rtt::RttEstimator;
use super::sink::Sink;
use super::source::Source;
use super::udp_server::{ReceiveHandler, Received, UdpServer, UdpServerConfig};

/// Message flag: send straight to the peers over UDP instead of via the
/// server
pub const FLAG_DIRECT: i32 = 0x01;

const READ_BUFFER_SIZE: usize = 8192;

/// Errors reported to request callbacks
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Wrong password")]
    WrongPassword,

    #[error("Group not found")]
    GroupNotFound,

    #[error("Already connected")]
    AlreadyConnected,

    #[error("Not connected")]
    NotConnected,

    #[error("User already exists")]
    UserAlreadyExists,

    #[error("Already a member of this group")]
    AlreadyMember,

    #[error("Not a member of this group")]
    NotMember,

    #[error("Incompatible server version: {0}")]
    VersionMismatch(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Server error {code:?}: {message}")]
    Server { code: ErrorCode, message: String },

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),
}

impl From<ErrorReply> for ClientError {
    fn from(e: ErrorReply) -> Self {
        match e.code {
            ErrorCode::WrongPassword => ClientError::WrongPassword,
            ErrorCode::GroupNotFound => ClientError::GroupNotFound,
            ErrorCode::UserAlreadyExists => ClientError::UserAlreadyExists,
            ErrorCode::AlreadyMember => ClientError::AlreadyMember,
            ErrorCode::NotMember => ClientError::NotMember,
            ErrorCode::AlreadyLoggedIn => ClientError::AlreadyConnected,
            ErrorCode::NotLoggedIn => ClientError::NotConnected,
            ErrorCode::VersionMismatch => ClientError::VersionMismatch(e.message),
            code => ClientError::Server {
                code,
                message: e.message,
            },
        }
    }
}

impl From<io::Error> for ClientError {
    fn from(e: io::Error) -> Self {
        ClientError::Network(e.into())
    }
}

/// Completion handler of a request
pub type Callback<T> = Box<dyn FnOnce(Result<T, ClientError>) + Send>;

/// Configuration for [`Client`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Local UDP port (0 picks a free one)
    pub port: u16,
    pub family: SocketFamily,
    /// Seconds until a request fails with a timeout
    pub request_timeout: f64,
    /// Seconds of unanswered handshake before a peer is relayed or given up
    pub peer_timeout: f64,
    /// Interval between handshake pings (seconds)
    pub handshake_interval: f64,
    /// Interval between pings to connected peers (seconds)
    pub peer_ping_interval: f64,
    /// Interval between public address queries (seconds)
    pub query_interval: f64,
    /// How long to wait for the public address before logging in anyway
    pub query_timeout: f64,
    /// Keep-alive interval for the control connection (seconds)
    pub server_ping_interval: f64,
    /// Period of the housekeeping timer (seconds)
    pub update_interval: f64,
    /// Stream every local Source to each peer and accept each peer in every
    /// local Sink, matching Source and Sink ids
    pub auto_connect: bool,
}

impl ClientConfig {
    pub fn validated(self) -> Self {
        Self {
            request_timeout: self.request_timeout.max(0.1),
            peer_timeout: self.peer_timeout.max(0.1),
            handshake_interval: self.handshake_interval.max(0.01),
            peer_ping_interval: self.peer_ping_interval.max(0.1),
            query_interval: self.query_interval.max(0.01),
            query_timeout: self.query_timeout.max(0.0),
            server_ping_interval: self.server_ping_interval.max(1.0),
            update_interval: self.update_interval.clamp(0.001, 1.0),
            ..self
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            port: 0,
            family: SocketFamily::DualStack,
            request_timeout: 10.0,
            peer_timeout: 5.0,
            handshake_interval: 0.1,
            peer_ping_interval: 1.0,
            query_interval: 0.1,
            query_timeout: 2.0,
            server_ping_interval: 5.0,
            update_interval: 0.01,
            auto_connect: true,
        }
    }
}

/// What to send with a group join
#[derive(Debug, Clone, Default)]
pub struct JoinRequest {
    pub group_name: String,
    pub group_password: String,
    pub user_name: String,
    pub user_password: String,
    pub group_metadata: Option<Vec<u8>>,
    pub user_metadata: Option<Vec<u8>>,
}

impl JoinRequest {
    pub fn new(group_name: impl Into<String>, user_name: impl Into<String>) -> Self {
        Self {
            group_name: group_name.into(),
            user_name: user_name.into(),
            ..Default::default()
        }
    }
}

/// A group this client belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Membership {
    pub group_id: i32,
    pub group_name: String,
    pub user_id: i32,
    pub user_name: String,
}

/// Public view of a peer
#[derive(Debug, Clone, PartialEq)]
pub struct PeerInfo {
    pub group_id: i32,
    pub group_name: String,
    pub user_id: i32,
    pub user_name: String,
    pub metadata: Option<Vec<u8>>,
    /// Address in use once the handshake succeeded
    pub address: Option<SocketAddr>,
    pub relayed: bool,
    pub connected: bool,
    pub rtt: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Connection {
    #[default]
    Disconnected,
    Connecting,
    Connected { client_id: i32, relay: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PeerState {
    Handshake,
    Connected,
    TimedOut,
}

struct Peer {
    group_id: i32,
    group_name: String,
    user_id: i32,
    user_name: String,
    metadata: Option<Vec<u8>>,
    candidates: Vec<SocketAddr>,
    address: Option<SocketAddr>,
    relay: Option<SocketAddr>,
    state: PeerState,
    joined: Instant,
    last_ping: Option<Instant>,
    rtt: RttEstimator,
}

impl Peer {
    fn new(a: PeerAnnouncement, now: Instant) -> Self {
        Self {
            group_id: a.group_id,
            group_name: a.group_name,
            user_id: a.user_id,
            user_name: a.user_name,
            metadata: a.metadata,
            candidates: a.addresses,
            address: None,
            relay: None,
            state: PeerState::Handshake,
            joined: now,
            last_ping: None,
            rtt: RttEstimator::new(),
        }
    }

    fn is(&self, group_id: i32, user_id: i32) -> bool {
        self.group_id == group_id && self.user_id == user_id
    }

    fn ping_due(&self, now: Instant, interval: Duration) -> bool {
        self.last_ping
            .map_or(true, |t| now.saturating_duration_since(t) >= interval)
    }

    fn event(&self) -> PeerEvent {
        PeerEvent {
            group_id: self.group_id,
            user_id: self.user_id,
            group_name: self.group_name.clone(),
            user_name: self.user_name.clone(),
            address: self.address,
            relayed: self.relay.is_some(),
        }
    }

    fn info(&self) -> PeerInfo {
        PeerInfo {
            group_id: self.group_id,
            group_name: self.group_name.clone(),
            user_id: self.user_id,
            user_name: self.user_name.clone(),
            metadata: self.metadata.clone(),
            address: self.address,
            relayed: self.relay.is_some(),
            connected: self.state == PeerState::Connected,
            rtt: self.rtt.has_samples().then(|| self.rtt.rtt()),
        }
    }
}

enum PendingRequest {
    Login(Callback<LoginReply>),
    GroupJoin {
        group_name: String,
        user_name: String,
        callback: Callback<GroupJoinReply>,
    },
    GroupLeave {
        group_id: i32,
        callback: Callback<()>,
    },
    GroupUpdate(Callback<()>),
    UserUpdate(Callback<()>),
}

impl PendingRequest {
    fn fail(self, e: ClientError) {
        match self {
            PendingRequest::Login(cb) => cb(Err(e)),
            PendingRequest::GroupJoin { callback, .. } => callback(Err(e)),
            PendingRequest::GroupLeave { callback, .. } => callback(Err(e)),
            PendingRequest::GroupUpdate(cb) | PendingRequest::UserUpdate(cb) => cb(Err(e)),
        }
    }
}

struct Pending {
    deadline: Instant,
    request: PendingRequest,
}

struct Control {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    reader: JoinHandle<()>,
}

#[derive(Default)]
struct ClientState {
    connection: Connection,
    control: Option<Control>,
    server: Option<SocketAddr>,
    public_addr: Option<SocketAddr>,
    query: Option<oneshot::Sender<SocketAddr>>,
    pending: HashMap<i32, Pending>,
    groups: Vec<Membership>,
    peers: Vec<Peer>,
    last_server_ping: Option<Instant>,
}

impl ClientState {
    fn own_user_id(&self, group_id: i32) -> Option<i32> {
        self.groups
            .iter()
            .find(|g| g.group_id == group_id)
            .map(|g| g.user_id)
    }

    /// Record a membership; a repeated join of the same group replaces the
    /// record instead of adding a second one
    fn add_membership(&mut self, membership: Membership) -> bool {
        match self
            .groups
            .iter_mut()
            .find(|g| g.group_id == membership.group_id)
        {
            Some(existing) => {
                *existing = membership;
                false
            }
            None => {
                self.groups.push(membership);
                true
            }
        }
    }

    /// Drop a group and its peers. Returns the addresses that no other
    /// connected peer uses any more.
    fn remove_group(&mut self, group_id: i32) -> Vec<SocketAddr> {
        self.groups.retain(|g| g.group_id != group_id);
        let (removed, kept): (Vec<Peer>, Vec<Peer>) = std::mem::take(&mut self.peers)
            .into_iter()
            .partition(|p| p.group_id == group_id);
        self.peers = kept;
        removed
            .iter()
            .filter_map(|p| p.address)
            .filter(|a| !self.address_in_use(*a))
            .collect()
    }

    fn address_in_use(&self, addr: SocketAddr) -> bool {
        self.peers
            .iter()
            .any(|p| p.state == PeerState::Connected && p.address == Some(addr))
    }
}

/// A Source or Sink attached to the client
struct Attached<T> {
    inner: Arc<T>,
    forward: JoinHandle<()>,
}

impl<T> Drop for Attached<T> {
    fn drop(&mut self) {
        self.forward.abort();
    }
}

/// Network node: Sources, Sinks, and a session on a control server
pub struct Client {
    config: ClientConfig,
    udp: Arc<UdpServer>,
    runtime: Handle,
    sources: RwLock<Vec<Attached<Source>>>,
    sinks: RwLock<Vec<Attached<Sink>>>,
    state: Mutex<ClientState>,
    events: EventQueue,
    next_token: AtomicI32,
}

impl Client {
    /// Bind the UDP socket. Must be called inside a tokio runtime.
    pub async fn new(config: ClientConfig, events: EventMode) -> Result<Arc<Self>, ClientError> {
        let config = config.validated();
        let udp = UdpServer::bind(UdpServerConfig {
            port: config.port,
            family: config.family,
            ..Default::default()
        })
        .await?;
        Ok(Arc::new(Self {
            config,
            udp: Arc::new(udp),
            runtime: Handle::current(),
            sources: RwLock::new(Vec::new()),
            sinks: RwLock::new(Vec::new()),
            state: Mutex::new(ClientState::default()),
            events: EventQueue::new(events),
            next_token: AtomicI32::new(1),
        }))
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.udp.local_addr()
    }

    pub fn events(&self) -> &EventQueue {
        &self.events
    }

    pub fn poll_events(&self, f: impl FnMut(Event)) -> usize {
        self.events.poll(f)
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state.lock().connection, Connection::Connected { .. })
    }

    pub fn client_id(&self) -> Option<i32> {
        match self.state.lock().connection {
            Connection::Connected { client_id, .. } => Some(client_id),
            _ => None,
        }
    }

    /// Our address as seen by the server
    pub fn public_address(&self) -> Option<SocketAddr> {
        self.state.lock().public_addr
    }

    pub fn groups(&self) -> Vec<Membership> {
        self.state.lock().groups.clone()
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        self.state.lock().peers.iter().map(Peer::info).collect()
    }

    pub fn find_peer_by_name(&self, group_name: &str, user_name: &str) -> Option<PeerInfo> {
        self.state
            .lock()
            .peers
            .iter()
            .find(|p| p.group_name == group_name && p.user_name == user_name)
            .map(Peer::info)
    }

    pub fn find_peer_by_address(&self, addr: SocketAddr) -> Option<PeerInfo> {
        let addr = IpAddress::new(addr);
        self.state
            .lock()
            .peers
            .iter()
            .find(|p| p.address.is_some_and(|a| IpAddress::new(a) == addr))
            .map(Peer::info)
    }

    fn next_token(&self) -> i32 {
        self.next_token.fetch_add(1, Ordering::Relaxed)
    }

    fn deadline(&self) -> Instant {
        Instant::now() + Duration::from_secs_f64(self.config.request_timeout)
    }

    // ---------------------------------------------------------------------
    // Sources and Sinks
    // ---------------------------------------------------------------------

    fn forward_wakeup(&self, wakeup: Arc<tokio::sync::Notify>) -> JoinHandle<()> {
        let udp = self.udp.clone();
        self.runtime.spawn(async move {
            loop {
                wakeup.notified().await;
                udp.notify();
            }
        })
    }

    /// Attach a Source; it streams to every connected peer
    pub fn add_source(&self, source: Arc<Source>) -> bool {
        let mut sources = self.sources.write();
        if sources.iter().any(|s| s.inner.id() == source.id()) {
            return false;
        }
        if self.config.auto_connect {
            for (addr, relay) in self.connected_peers() {
                source.add_endpoint(Endpoint::new(addr, source.id()).with_relay(relay), true);
            }
        }
        let forward = self.forward_wakeup(source.wakeup());
        sources.push(Attached {
            inner: source,
            forward,
        });
        self.udp.notify();
        true
    }

    pub fn remove_source(&self, id: i32) -> Option<Arc<Source>> {
        let mut sources = self.sources.write();
        let index = sources.iter().position(|s| s.inner.id() == id)?;
        let attached = sources.remove(index);
        Some(attached.inner.clone())
    }

    /// Attach a Sink; it accepts streams from every connected peer
    pub fn add_sink(&self, sink: Arc<Sink>) -> bool {
        let mut sinks = self.sinks.write();
        if sinks.iter().any(|s| s.inner.id() == sink.id()) {
            return false;
        }
        if self.config.auto_connect {
            for (addr, relay) in self.connected_peers() {
                sink.add_source(Endpoint::new(addr, sink.id()).with_relay(relay));
            }
        }
        let forward = self.forward_wakeup(sink.wakeup());
        sinks.push(Attached {
            inner: sink,
            forward,
        });
        true
    }

    pub fn remove_sink(&self, id: i32) -> Option<Arc<Sink>> {
        let mut sinks = self.sinks.write();
        let index = sinks.iter().position(|s| s.inner.id() == id)?;
        let attached = sinks.remove(index);
        Some(attached.inner.clone())
    }

    fn connected_peers(&self) -> Vec<(SocketAddr, Option<SocketAddr>)> {
        let state = self.state.lock();
        let mut result: Vec<(SocketAddr, Option<SocketAddr>)> = Vec::new();
        for peer in state.peers.iter().filter(|p| p.state == PeerState::Connected) {
            if let Some(addr) = peer.address {
                if !result.iter().any(|(a, _)| *a == addr) {
                    result.push((addr, peer.relay));
                }
            }
        }
        result
    }

    fn wire(&self, addr: SocketAddr, relay: Option<SocketAddr>) {
        if !self.config.auto_connect {
            return;
        }
        for source in self.sources.read().iter() {
            let id = source.inner.id();
            source
                .inner
                .add_endpoint(Endpoint::new(addr, id).with_relay(relay), true);
        }
        for sink in self.sinks.read().iter() {
            let id = sink.inner.id();
            sink.inner
                .add_source(Endpoint::new(addr, id).with_relay(relay));
        }
        self.udp.notify();
    }

    fn unwire(&self, addr: SocketAddr) {
        if !self.config.auto_connect {
            return;
        }
        for source in self.sources.read().iter() {
            source.inner.remove_endpoints_at(addr);
        }
        for sink in self.sinks.read().iter() {
            sink.inner.remove_sources_at(addr);
        }
        self.udp.notify();
    }

    // ---------------------------------------------------------------------
    // Run loop
    // ---------------------------------------------------------------------

    /// Receive, send and do housekeeping until [`stop`](Self::stop)
    pub async fn run(self: Arc<Self>) -> Result<(), ClientError> {
        let receiver = {
            let client = self.clone();
            let udp = self.udp.clone();
            tokio::spawn(async move {
                let handler: ReceiveHandler = Arc::new(move |received: Received<'_>| match received {
                    Received::Packet { data, from } => client.handle_datagram(data, from),
                    Received::Error(e) => trace!("UDP receive error: {}", e),
                });
                udp.run(handler).await
            })
        };

        let wakeup = self.udp.send_wakeup();
        let mut ticker = tokio::time::interval(Duration::from_secs_f64(self.config.update_interval));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        while !self.udp.is_stopping() {
            tokio::select! {
                _ = wakeup.notified() => {}
                _ = ticker.tick() => self.update(Instant::now()),
            }
            self.flush();
        }

        match receiver.await {
            Ok(result) => result.map_err(ClientError::from),
            Err(e) => {
                warn!("Client receive task failed: {}", e);
                Ok(())
            }
        }
    }

    /// Disconnect and make [`run`](Self::run) return
    pub fn stop(&self) {
        self.close_connection(None);
        self.udp.stop();
        self.udp.notify();
    }

    /// Flush everything the Sources and Sinks have to send
    fn flush(&self) {
        let udp = &self.udp;
        let mut relay_buf = Vec::new();
        let mut send = |data: &[u8], endpoint: &Endpoint| -> Result<(), NetworkError> {
            match endpoint.relay {
                Some(relay) => {
                    relay_buf.clear();
                    binary::write_relay(&mut relay_buf, endpoint.socket_addr(), data);
                    udp.try_send_to(&relay_buf, relay)?;
                }
                None => {
                    udp.try_send_to(data, endpoint.socket_addr())?;
                }
            }
            Ok(())
        };
        for source in self.sources.read().iter() {
            source.inner.send(&mut send);
        }
        for sink in self.sinks.read().iter() {
            sink.inner.send(&mut send);
        }
    }

    /// Timers: request timeouts, peer handshakes and pings, server keep-alive
    fn update(&self, now: Instant) {
        let handshake_interval = Duration::from_secs_f64(self.config.handshake_interval);
        let ping_interval = Duration::from_secs_f64(self.config.peer_ping_interval);
        let peer_timeout = Duration::from_secs_f64(self.config.peer_timeout);
        let mut expired = Vec::new();
        let mut wire = Vec::new();
        let mut events = Vec::new();
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;

            let timed_out: Vec<i32> = state
                .pending
                .iter()
                .filter(|(_, p)| p.deadline <= now)
                .map(|(token, _)| *token)
                .collect();
            for token in timed_out {
                if let Some(pending) = state.pending.remove(&token) {
                    expired.push(pending.request);
                }
            }

            let relay_server = match state.connection {
                Connection::Connected { relay: true, .. } => state.server,
                _ => None,
            };
            let t1 = NtpTime::now();
            for peer in state.peers.iter_mut() {
                let Some(own_id) = state
                    .groups
                    .iter()
                    .find(|g| g.group_id == peer.group_id)
                    .map(|g| g.user_id)
                else {
                    continue;
                };
                let ping = PeerMessage::Ping {
                    group_id: peer.group_id,
                    user_id: own_id,
                    t1,
                }
                .to_osc()
                .to_bytes();
                match peer.state {
                    PeerState::Handshake if now.saturating_duration_since(peer.joined) >= peer_timeout => {
                        match (relay_server, peer.candidates.last()) {
                            (Some(server), Some(&addr)) => {
                                info!(
                                    "Peer {} in group {} unreachable, relaying via {}",
                                    peer.user_name, peer.group_name, server
                                );
                                peer.address = Some(addr);
                                peer.relay = Some(server);
                                peer.state = PeerState::Connected;
                                wire.push((addr, Some(server)));
                                events.push(Event::PeerJoin(peer.event()));
                            }
                            _ => {
                                warn!(
                                    "Handshake with peer {} in group {} timed out",
                                    peer.user_name, peer.group_name
                                );
                                peer.state = PeerState::TimedOut;
                                events.push(Event::PeerTimeout(peer.event()));
                            }
                        }
                    }
                    PeerState::Handshake if peer.ping_due(now, handshake_interval) => {
                        for &candidate in &peer.candidates {
                            if let Err(e) = self.udp.try_send_to(&ping, candidate) {
                                trace!("Handshake ping to {} failed: {}", candidate, e);
                            }
                        }
                        peer.last_ping = Some(now);
                    }
                    PeerState::Connected if peer.ping_due(now, ping_interval) => {
                        if let Some(addr) = peer.address {
                            if let Err(e) = send_datagram(&self.udp, &ping, addr, peer.relay) {
                                debug!("Ping to peer {} failed: {}", peer.user_name, e);
                            }
                        }
                        peer.last_ping = Some(now);
                    }
                    _ => {}
                }
            }

            if let Connection::Connected { .. } = state.connection {
                let interval = Duration::from_secs_f64(self.config.server_ping_interval);
                let due = state
                    .last_server_ping
                    .map_or(true, |t| now.saturating_duration_since(t) >= interval);
                if due {
                    let token = self.next_token();
                    if let Err(e) = self.send_request(state, &ClientRequest::Ping { token }) {
                        debug!("Server ping failed: {}", e);
                    }
                    state.last_server_ping = Some(now);
                }
            }
        }

        let mut close = false;
        for request in expired {
            close |= matches!(request, PendingRequest::Login(_));
            request.fail(ClientError::Timeout);
        }
        if close {
            self.close_connection(None);
        }
        for (addr, relay) in wire {
            self.wire(addr, relay);
        }
        for event in events {
            self.events.push(event, ThreadLevel::Network);
        }
    }

    // ---------------------------------------------------------------------
    // Datagrams
    // ---------------------------------------------------------------------

    fn handle_datagram(&self, data: &[u8], from: SocketAddr) {
        if data.is_empty() {
            return;
        }
        let from = IpAddress::new(from).unmapped();
        let result = if binary::is_binary(data)
            && matches!(route(data), Ok(r) if r.target == Target::Client)
        {
            binary::parse_relay(data)
                .and_then(|(origin, payload)| self.dispatch(payload, origin, Some(from)))
        } else {
            self.dispatch(data, from, None)
        };
        if let Err(e) = result {
            debug!("Datagram from {}: {}", from, e);
        }
    }

    fn dispatch(
        &self,
        data: &[u8],
        from: SocketAddr,
        relay: Option<SocketAddr>,
    ) -> Result<(), NetworkError> {
        let r = route(data)?;
        match r.target {
            Target::Source(id) => {
                let sources = self.sources.read();
                let Some(source) = sources.iter().find(|s| s.inner.id() == id) else {
                    trace!("No source {} for message from {}", id, from);
                    return Ok(());
                };
                match relay {
                    Some(relay) => source.inner.handle_relayed_message(data, from, relay),
                    None => source.inner.handle_message(data, from),
                }
            }
            Target::Sink(id) => {
                let sinks = self.sinks.read();
                let Some(sink) = sinks.iter().find(|s| s.inner.id() == id) else {
                    trace!("No sink {} for message from {}", id, from);
                    return Ok(());
                };
                match relay {
                    Some(relay) => sink.inner.handle_relayed_message(data, from, relay),
                    None => sink.inner.handle_message(data, from),
                }
            }
            Target::Peer => {
                let msg = OscMessage::decode(data)?;
                self.handle_peer_message(r.cmd, &msg, from, relay)
            }
            Target::Client if r.cmd == cmd::QUERY => {
                let msg = OscMessage::decode(data)?;
                let mut reader = msg.reader();
                let ip: std::net::IpAddr = reader.string()?.parse().map_err(|_| {
                    NetworkError::malformed("bad address in query reply")
                })?;
                let port = u16::try_from(reader.int()?)
                    .map_err(|_| NetworkError::malformed("bad port in query reply"))?;
                let public = SocketAddr::new(ip, port);
                let mut state = self.state.lock();
                if state.server.map(IpAddress::new) != Some(IpAddress::new(from)) {
                    return Err(NetworkError::malformed("query reply from unknown host"));
                }
                state.public_addr = Some(public);
                if let Some(tx) = state.query.take() {
                    let _ = tx.send(public);
                }
                Ok(())
            }
            _ => {
                trace!("Ignoring message {} from {}", r.cmd, from);
                Ok(())
            }
        }
    }

    fn handle_peer_message(
        &self,
        cmd_name: &str,
        msg: &OscMessage,
        from: SocketAddr,
        relay: Option<SocketAddr>,
    ) -> Result<(), NetworkError> {
        match PeerMessage::decode(cmd_name, msg)? {
            PeerMessage::Ping {
                group_id,
                user_id,
                t1,
            } => {
                let state = self.state.lock();
                let Some(own_id) = state.own_user_id(group_id) else {
                    return Ok(());
                };
                if !state.peers.iter().any(|p| p.is(group_id, user_id)) {
                    trace!("Ping from unknown peer {} in group {}", user_id, group_id);
                    return Ok(());
                }
                drop(state);
                let pong = PeerMessage::Pong {
                    group_id,
                    user_id: own_id,
                    t1,
                    t2: NtpTime::now(),
                }
                .to_osc()
                .to_bytes();
                send_datagram(&self.udp, &pong, from, relay)
            }
            PeerMessage::Pong {
                group_id,
                user_id,
                t1,
                ..
            } => {
                let rtt = NtpTime::duration(t1, NtpTime::now()).max(0.0);
                let mut state = self.state.lock();
                let Some(peer) = state.peers.iter_mut().find(|p| p.is(group_id, user_id)) else {
                    return Ok(());
                };
                let rtt = peer.rtt.update(rtt);
                if peer.state == PeerState::Connected {
                    drop(state);
                    self.events.push(
                        Event::PeerPing(PeerPingEvent {
                            group_id,
                            user_id,
                            rtt,
                        }),
                        ThreadLevel::Network,
                    );
                    return Ok(());
                }
                peer.state = PeerState::Connected;
                peer.address = Some(from);
                peer.relay = relay;
                let event = peer.event();
                drop(state);
                info!(
                    "Peer {} in group {} connected at {}",
                    event.user_name, event.group_name, from
                );
                self.wire(from, relay);
                self.events.push(Event::PeerJoin(event), ThreadLevel::Network);
                Ok(())
            }
            PeerMessage::Message {
                group_id,
                user_id,
                flags,
                data,
            } => {
                let known = self
                    .state
                    .lock()
                    .peers
                    .iter()
                    .any(|p| p.is(group_id, user_id));
                if known {
                    self.events.push(
                        Event::PeerMessage(PeerMessageEvent {
                            group_id,
                            user_id,
                            flags,
                            data,
                        }),
                        ThreadLevel::Network,
                    );
                }
                Ok(())
            }
        }
    }

    // ---------------------------------------------------------------------
    // Control connection
    // ---------------------------------------------------------------------

    fn send_request(&self, state: &ClientState, request: &ClientRequest) -> Result<(), ClientError> {
        let control = state.control.as_ref().ok_or(ClientError::NotConnected)?;
        let mut frame = Vec::new();
        write_frame(&mut frame, &request.to_osc().to_bytes())?;
        control
            .tx
            .send(frame)
            .map_err(|_| ClientError::NotConnected)
    }

    /// Send a request that expects a reply, unless we are not logged in
    fn submit(&self, token: i32, request: &ClientRequest, pending: PendingRequest) {
        let mut state = self.state.lock();
        let result = match state.connection {
            Connection::Connected { .. } => self.send_request(&state, request),
            _ => Err(ClientError::NotConnected),
        };
        match result {
            Ok(()) => {
                state.pending.insert(
                    token,
                    Pending {
                        deadline: self.deadline(),
                        request: pending,
                    },
                );
            }
            Err(e) => {
                drop(state);
                pending.fail(e);
            }
        }
    }

    /// Connect and log in to the server at `host:port`
    pub fn connect(
        self: &Arc<Self>,
        host: &str,
        port: u16,
        password: &str,
        metadata: Option<Vec<u8>>,
        callback: impl FnOnce(Result<LoginReply, ClientError>) + Send + 'static,
    ) {
        {
            let mut state = self.state.lock();
            if state.connection != Connection::Disconnected {
                drop(state);
                callback(Err(ClientError::AlreadyConnected));
                return;
            }
            state.connection = Connection::Connecting;
        }
        let client = self.clone();
        let host = host.to_string();
        let password = password.to_string();
        self.runtime.spawn(async move {
            client
                .login(&host, port, password, metadata, Box::new(callback))
                .await;
        });
    }

    async fn login(
        self: Arc<Self>,
        host: &str,
        port: u16,
        password: String,
        metadata: Option<Vec<u8>>,
        callback: Callback<LoginReply>,
    ) {
        if let Err(e) = self.open(host, port).await {
            warn!("Connecting to {}:{} failed: {}", host, port, e);
            self.close_connection(None);
            callback(Err(e));
            return;
        }
        let token = self.next_token();
        let request = ClientRequest::Login {
            token,
            version: version_string(),
            password,
            metadata,
        };
        let mut state = self.state.lock();
        match self.send_request(&state, &request) {
            Ok(()) => {
                state.pending.insert(
                    token,
                    Pending {
                        deadline: self.deadline(),
                        request: PendingRequest::Login(callback),
                    },
                );
            }
            Err(e) => {
                drop(state);
                self.close_connection(None);
                callback(Err(e));
            }
        }
    }

    /// Open the TCP connection and find out our public address
    async fn open(self: &Arc<Self>, host: &str, port: u16) -> Result<(), ClientError> {
        let addrs = addr::resolve(host, port, self.udp.family()).await?;
        let timeout = Duration::from_secs_f64(self.config.request_timeout);
        let mut last_error = ClientError::Network(NetworkError::ConnectionRefused);
        let mut connected = None;
        for candidate in addrs.iter().map(IpAddress::unmapped) {
            match tokio::time::timeout(timeout, TcpStream::connect(candidate)).await {
                Ok(Ok(stream)) => {
                    connected = Some((stream, candidate));
                    break;
                }
                Ok(Err(e)) => last_error = e.into(),
                Err(_) => last_error = ClientError::Timeout,
            }
        }
        let Some((stream, server)) = connected else {
            return Err(last_error);
        };
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(write_loop(writer, rx));
        let reader = tokio::spawn(self.clone().read_loop(reader));
        {
            let mut state = self.state.lock();
            state.server = Some(server);
            state.control = Some(Control { tx, reader });
        }
        info!("Connected to server {}", server);

        match self.query_public_address(server).await {
            Some(public) => info!("Public address is {}", public),
            None => warn!("No reply to address query from {}", server),
        }
        Ok(())
    }

    async fn query_public_address(&self, server: SocketAddr) -> Option<SocketAddr> {
        let (tx, mut rx) = oneshot::channel();
        self.state.lock().query = Some(tx);
        let request = query_request().to_bytes();
        let interval = Duration::from_secs_f64(self.config.query_interval);
        let deadline =
            tokio::time::Instant::now() + Duration::from_secs_f64(self.config.query_timeout);
        loop {
            if let Err(e) = self.udp.try_send_to(&request, server) {
                debug!("Address query failed: {}", e);
            }
            tokio::select! {
                result = &mut rx => return result.ok(),
                _ = tokio::time::sleep(interval) => {}
            }
            if tokio::time::Instant::now() >= deadline {
                self.state.lock().query = None;
                return None;
            }
        }
    }

    async fn read_loop(self: Arc<Self>, mut reader: OwnedReadHalf) {
        let mut decoder = FrameDecoder::new();
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        let reason = 'read: loop {
            match reader.read(&mut buf).await {
                Ok(0) => break "server closed the connection".to_string(),
                Ok(n) => {
                    decoder.push(&buf[..n]);
                    loop {
                        match decoder.next_frame() {
                            Ok(Some(frame)) => match decode_server_message(&frame) {
                                Ok(message) => self.handle_server_message(message),
                                Err(e) => warn!("Bad message from server: {}", e),
                            },
                            Ok(None) => break,
                            Err(e) => break 'read e.to_string(),
                        }
                    }
                }
                Err(e) => break e.to_string(),
            }
        };
        self.close_connection(Some(reason));
    }

    /// Tear down the session. `reason` is set when the connection was lost
    /// rather than closed by us.
    fn close_connection(&self, reason: Option<String>) {
        let (control, pending, addresses) = {
            let mut state = self.state.lock();
            if state.connection == Connection::Disconnected && state.control.is_none() {
                return;
            }
            state.connection = Connection::Disconnected;
            state.groups.clear();
            state.server = None;
            state.public_addr = None;
            state.query = None;
            state.last_server_ping = None;
            let addresses: Vec<SocketAddr> = state.peers.drain(..).filter_map(|p| p.address).collect();
            (
                state.control.take(),
                std::mem::take(&mut state.pending),
                addresses,
            )
        };
        if let Some(control) = control {
            control.reader.abort();
        }
        for addr in addresses {
            self.unwire(addr);
        }
        for (_, p) in pending {
            p.request.fail(ClientError::NotConnected);
        }
        match reason {
            Some(reason) => {
                warn!("Disconnected from server: {}", reason);
                self.events.push(
                    Event::Disconnect {
                        reason: Some(reason),
                    },
                    ThreadLevel::Network,
                );
            }
            None => info!("Disconnected from server"),
        }
    }

    /// Log out and close the control connection
    pub fn disconnect(&self) {
        self.close_connection(None);
    }

    fn take_pending(&self, token: i32) -> Option<PendingRequest> {
        self.state.lock().pending.remove(&token).map(|p| p.request)
    }

    fn unexpected_reply(&self, token: i32, pending: Option<PendingRequest>) {
        match pending {
            Some(request) => request.fail(ClientError::Network(NetworkError::malformed(
                "reply does not match the request",
            ))),
            None => debug!("Reply for unknown request {}", token),
        }
    }

    fn handle_server_message(&self, message: ServerMessage) {
        match message {
            ServerMessage::Login { token, result } => {
                let result = result.map_err(ClientError::from);
                if let Ok(reply) = &result {
                    let mut state = self.state.lock();
                    state.connection = Connection::Connected {
                        client_id: reply.client_id,
                        relay: reply.relay,
                    };
                    info!("Logged in as client {}", reply.client_id);
                }
                let failed = result.is_err();
                match self.take_pending(token) {
                    Some(PendingRequest::Login(callback)) => callback(result),
                    other => self.unexpected_reply(token, other),
                }
                if failed {
                    self.close_connection(None);
                }
            }
            ServerMessage::GroupJoin { token, result } => match self.take_pending(token) {
                Some(PendingRequest::GroupJoin {
                    group_name,
                    user_name,
                    callback,
                }) => {
                    let result = result.map_err(ClientError::from);
                    if let Ok(reply) = &result {
                        info!(
                            "Joined group {} '{}' as user {} '{}'",
                            reply.group_id, group_name, reply.user_id, user_name
                        );
                        self.state.lock().add_membership(Membership {
                            group_id: reply.group_id,
                            group_name,
                            user_id: reply.user_id,
                            user_name,
                        });
                    }
                    callback(result);
                }
                other => self.unexpected_reply(token, other),
            },
            ServerMessage::GroupLeave { token, result } => match self.take_pending(token) {
                Some(PendingRequest::GroupLeave { group_id, callback }) => {
                    if result.is_ok() {
                        info!("Left group {}", group_id);
                        self.leave_locally(group_id);
                    }
                    callback(result.map_err(ClientError::from));
                }
                other => self.unexpected_reply(token, other),
            },
            ServerMessage::GroupUpdate { token, result } => match self.take_pending(token) {
                Some(PendingRequest::GroupUpdate(callback)) => {
                    callback(result.map_err(ClientError::from))
                }
                other => self.unexpected_reply(token, other),
            },
            ServerMessage::UserUpdate { token, result } => match self.take_pending(token) {
                Some(PendingRequest::UserUpdate(callback)) => {
                    callback(result.map_err(ClientError::from))
                }
                other => self.unexpected_reply(token, other),
            },
            ServerMessage::Pong { token } => trace!("Server pong {}", token),
            ServerMessage::PeerJoin(announcement) => self.add_peer(announcement),
            ServerMessage::PeerLeave { group_id, user_id } => {
                let (peer, unused) = {
                    let mut state = self.state.lock();
                    let Some(index) = state.peers.iter().position(|p| p.is(group_id, user_id)) else {
                        return;
                    };
                    let peer = state.peers.remove(index);
                    let unused = peer.address.filter(|a| !state.address_in_use(*a));
                    (peer, unused)
                };
                info!("Peer {} left group {}", peer.user_name, peer.group_name);
                if let Some(addr) = unused {
                    self.unwire(addr);
                }
                self.events
                    .push(Event::PeerLeave(peer.event()), ThreadLevel::Network);
            }
            ServerMessage::PeerUpdate {
                group_id,
                user_id,
                metadata,
            } => {
                if let Some(peer) = self
                    .state
                    .lock()
                    .peers
                    .iter_mut()
                    .find(|p| p.is(group_id, user_id))
                {
                    peer.metadata = Some(metadata.clone());
                }
                self.events.push(
                    Event::PeerUpdate(MetadataUpdateEvent {
                        group_id,
                        user_id,
                        metadata,
                    }),
                    ThreadLevel::Network,
                );
            }
            ServerMessage::GroupChanged {
                group_id,
                user_id,
                metadata,
            } => self.events.push(
                Event::GroupUpdate(MetadataUpdateEvent {
                    group_id,
                    user_id,
                    metadata,
                }),
                ThreadLevel::Network,
            ),
            ServerMessage::UserChanged {
                group_id,
                user_id,
                metadata,
            } => self.events.push(
                Event::UserUpdate(MetadataUpdateEvent {
                    group_id,
                    user_id,
                    metadata,
                }),
                ThreadLevel::Network,
            ),
            ServerMessage::GroupEject { group_id } => {
                warn!("Ejected from group {}", group_id);
                self.leave_locally(group_id);
                self.events
                    .push(Event::GroupEject { group_id }, ThreadLevel::Network);
            }
            ServerMessage::Message {
                group_id,
                user_id,
                flags,
                data,
            } => self.events.push(
                Event::PeerMessage(PeerMessageEvent {
                    group_id,
                    user_id,
                    flags,
                    data,
                }),
                ThreadLevel::Network,
            ),
            ServerMessage::Notification { data } => self
                .events
                .push(Event::Notification { data }, ThreadLevel::Network),
        }
    }

    fn leave_locally(&self, group_id: i32) {
        let unused = self.state.lock().remove_group(group_id);
        for addr in unused {
            self.unwire(addr);
        }
    }

    fn add_peer(&self, announcement: PeerAnnouncement) {
        let mut state = self.state.lock();
        if state.own_user_id(announcement.group_id).is_none() {
            debug!(
                "Announcement for group {} we are not in",
                announcement.group_id
            );
            return;
        }
        if state
            .peers
            .iter()
            .any(|p| p.is(announcement.group_id, announcement.user_id))
        {
            return;
        }
        let peer = Peer::new(announcement, Instant::now());
        let event = peer.event();
        debug!(
            "Handshake with peer {} in group {} ({} candidate address(es))",
            peer.user_name,
            peer.group_name,
            peer.candidates.len()
        );
        state.peers.push(peer);
        drop(state);
        self.events
            .push(Event::PeerHandshake(event), ThreadLevel::Network);
        self.udp.notify();
    }

    // ---------------------------------------------------------------------
    // Requests
    // ---------------------------------------------------------------------

    /// Join (or, with auto-creation on the server, create) a group
    pub fn join_group(
        &self,
        request: JoinRequest,
        callback: impl FnOnce(Result<GroupJoinReply, ClientError>) + Send + 'static,
    ) {
        let mut addresses: Vec<SocketAddr> = addr::local_addresses(self.udp.local_addr().port())
            .iter()
            .map(IpAddress::unmapped)
            .collect();
        {
            let state = self.state.lock();
            if state.groups.iter().any(|g| g.group_name == request.group_name) {
                drop(state);
                callback(Err(ClientError::AlreadyMember));
                return;
            }
            if let Some(public) = state.public_addr {
                if !addresses.contains(&public) {
                    addresses.push(public);
                }
            }
        }
        let token = self.next_token();
        let JoinRequest {
            group_name,
            group_password,
            user_name,
            user_password,
            group_metadata,
            user_metadata,
        } = request;
        let message = ClientRequest::GroupJoin {
            token,
            group_name: group_name.clone(),
            group_password,
            user_name: user_name.clone(),
            user_password,
            group_metadata,
            user_metadata,
            addresses,
        };
        self.submit(
            token,
            &message,
            PendingRequest::GroupJoin {
                group_name,
                user_name,
                callback: Box::new(callback),
            },
        );
    }

    pub fn leave_group(
        &self,
        group_id: i32,
        callback: impl FnOnce(Result<(), ClientError>) + Send + 'static,
    ) {
        if self.state.lock().own_user_id(group_id).is_none() {
            callback(Err(ClientError::NotMember));
            return;
        }
        let token = self.next_token();
        self.submit(
            token,
            &ClientRequest::GroupLeave { token, group_id },
            PendingRequest::GroupLeave {
                group_id,
                callback: Box::new(callback),
            },
        );
    }

    pub fn update_group(
        &self,
        group_id: i32,
        metadata: Vec<u8>,
        callback: impl FnOnce(Result<(), ClientError>) + Send + 'static,
    ) {
        let token = self.next_token();
        self.submit(
            token,
            &ClientRequest::GroupUpdate {
                token,
                group_id,
                metadata,
            },
            PendingRequest::GroupUpdate(Box::new(callback)),
        );
    }

    pub fn update_user(
        &self,
        group_id: i32,
        metadata: Vec<u8>,
        callback: impl FnOnce(Result<(), ClientError>) + Send + 'static,
    ) {
        let token = self.next_token();
        self.submit(
            token,
            &ClientRequest::UserUpdate {
                token,
                group_id,
                metadata,
            },
            PendingRequest::UserUpdate(Box::new(callback)),
        );
    }

    /// Send a message to one member (`Some(user_id)`) or the whole group.
    ///
    /// With [`FLAG_DIRECT`] the message goes straight to connected peers
    /// over UDP; otherwise the server forwards it.
    pub fn send_message(
        &self,
        group_id: i32,
        target: Option<i32>,
        data: &[u8],
        flags: i32,
    ) -> Result<(), ClientError> {
        let state = self.state.lock();
        let own_id = state.own_user_id(group_id).ok_or(ClientError::NotMember)?;
        if flags & FLAG_DIRECT == 0 {
            return self.send_request(
                &state,
                &ClientRequest::Message {
                    group_id,
                    target: target.unwrap_or(-1),
                    flags,
                    data: data.to_vec(),
                },
            );
        }
        let bytes = PeerMessage::Message {
            group_id,
            user_id: own_id,
            flags,
            data: data.to_vec(),
        }
        .to_osc()
        .to_bytes();
        for peer in state.peers.iter().filter(|p| {
            p.group_id == group_id
                && p.state == PeerState::Connected
                && target.map_or(true, |t| t == p.user_id)
        }) {
            if let Some(addr) = peer.address {
                send_datagram(&self.udp, &bytes, addr, peer.relay)?;
            }
        }
        Ok(())
    }

    pub async fn connect_async(
        self: &Arc<Self>,
        host: &str,
        port: u16,
        password: &str,
        metadata: Option<Vec<u8>>,
    ) -> Result<LoginReply, ClientError> {
        wait(|cb| self.connect(host, port, password, metadata, cb)).await
    }

    pub async fn join_group_async(&self, request: JoinRequest) -> Result<GroupJoinReply, ClientError> {
        wait(|cb| self.join_group(request, cb)).await
    }

    pub async fn leave_group_async(&self, group_id: i32) -> Result<(), ClientError> {
        wait(|cb| self.leave_group(group_id, cb)).await
    }

    pub async fn update_group_async(&self, group_id: i32, metadata: Vec<u8>) -> Result<(), ClientError> {
        wait(|cb| self.update_group(group_id, metadata, cb)).await
    }

    pub async fn update_user_async(&self, group_id: i32, metadata: Vec<u8>) -> Result<(), ClientError> {
        wait(|cb| self.update_user(group_id, metadata, cb)).await
    }
}

/// Turn a callback-style request into a future
async fn wait<T: Send + 'static>(start: impl FnOnce(Callback<T>)) -> Result<T, ClientError> {
    let (tx, rx) = oneshot::channel();
    start(Box::new(move |result| {
        let _ = tx.send(result);
    }));
    rx.await.map_err(|_| ClientError::NotConnected)?
}

/// Send a datagram, wrapped for the relay when there is one
fn send_datagram(
    udp: &UdpServer,
    data: &[u8],
    to: SocketAddr,
    relay: Option<SocketAddr>,
) -> Result<(), NetworkError> {
    match relay {
        Some(relay) => {
            let mut out = Vec::with_capacity(data.len() + 24);
            binary::write_relay(&mut out, to, data);
            udp.try_send_to(&out, relay)?;
        }
        None => {
            udp.try_send_to(data, to)?;
        }
    }
    Ok(())
}

fn decode_server_message(frame: &[u8]) -> Result<ServerMessage, NetworkError> {
    let msg = OscMessage::decode(frame)?;
    let (target, cmd_name) = parse_control_address(&msg)?;
    if target != Target::Client {
        return Err(NetworkError::UnknownAddress(msg.address.clone()));
    }
    ServerMessage::decode(cmd_name, &msg)
}

async fn write_loop(mut writer: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = writer.write_all(&frame).await {
            debug!("Control connection write failed: {}", e);
            return;
        }
    }
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ClientConfig {
        ClientConfig {
            family: SocketFamily::Ipv4,
            request_timeout: 0.5,
            peer_timeout: 0.5,
            ..Default::default()
        }
    }

    /// Pretend to be logged in, with control messages going nowhere
    fn fake_login(client: &Client) -> mpsc::UnboundedReceiver<Vec<u8>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = client.state.lock();
        state.connection = Connection::Connected {
            client_id: 1,
            relay: false,
        };
        state.control = Some(Control {
            tx,
            reader: tokio::spawn(async {}),
        });
        rx
    }

    fn join_reply(token: i32) -> ServerMessage {
        ServerMessage::GroupJoin {
            token,
            result: Ok(GroupJoinReply {
                group_id: 3,
                user_id: 0,
                group_metadata: None,
            }),
        }
    }

    #[test]
    fn test_error_mapping() {
        let e: ClientError = ErrorReply::new(ErrorCode::WrongPassword, "x").into();
        assert!(matches!(e, ClientError::WrongPassword));
        let e: ClientError = ErrorReply::new(ErrorCode::UserNotFound, "x").into();
        assert!(matches!(
            e,
            ClientError::Server {
                code: ErrorCode::UserNotFound,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_requests_need_connection() {
        let client = Client::new(config(), EventMode::default()).await.unwrap();
        let result = client.join_group_async(JoinRequest::new("band", "alice")).await;
        assert!(matches!(result, Err(ClientError::NotConnected)));
        assert!(matches!(
            client.leave_group_async(1).await,
            Err(ClientError::NotMember)
        ));
    }

    #[tokio::test]
    async fn test_replayed_join_reply_keeps_one_membership() {
        let client = Client::new(config(), EventMode::default()).await.unwrap();
        let mut control = fake_login(&client);

        for _ in 0..2 {
            let (tx, rx) = oneshot::channel();
            client.submit(
                42,
                &ClientRequest::Ping { token: 42 },
                PendingRequest::GroupJoin {
                    group_name: "band".to_string(),
                    user_name: "alice".to_string(),
                    callback: Box::new(move |r| {
                        let _ = tx.send(r.is_ok());
                    }),
                },
            );
            assert!(control.try_recv().is_ok());
            client.handle_server_message(join_reply(42));
            assert!(rx.await.unwrap());
        }
        // A reply nobody asked for changes nothing either
        client.handle_server_message(join_reply(99));
        assert_eq!(client.groups().len(), 1);
        assert_eq!(client.groups()[0].group_name, "band");
    }

    #[tokio::test]
    async fn test_request_timeout() {
        let client = Client::new(config(), EventMode::default()).await.unwrap();
        let _control = fake_login(&client);
        let (tx, rx) = oneshot::channel();
        client.join_group(JoinRequest::new("band", "alice"), move |r| {
            let _ = tx.send(r);
        });
        client.update(Instant::now());
        client.update(Instant::now() + Duration::from_secs(1));
        assert!(matches!(rx.await.unwrap(), Err(ClientError::Timeout)));
    }

    #[tokio::test]
    async fn test_lost_connection_fails_pending_requests() {
        let client = Client::new(config(), EventMode::default()).await.unwrap();
        let _control = fake_login(&client);
        let (tx, rx) = oneshot::channel();
        client.update_user(3, vec![1], move |r| {
            let _ = tx.send(r);
        });
        client.close_connection(Some("reset".to_string()));
        assert!(matches!(rx.await.unwrap(), Err(ClientError::NotConnected)));
        assert!(!client.is_connected());
        let events = client.events().drain();
        assert!(matches!(
            &events[..],
            [Event::Disconnect { reason: Some(r) }] if r == "reset"
        ));
    }

    fn announce(group_id: i32, user_id: i32, name: &str, addr: SocketAddr) -> ServerMessage {
        ServerMessage::PeerJoin(PeerAnnouncement {
            group_id,
            group_name: "band".to_string(),
            user_id,
            user_name: name.to_string(),
            metadata: None,
            addresses: vec![addr],
        })
    }

    fn member(client: &Client, user_id: i32) {
        client.state.lock().add_membership(Membership {
            group_id: 1,
            group_name: "band".to_string(),
            user_id,
            user_name: format!("user{}", user_id),
        });
    }

    fn loopback(client: &Client) -> SocketAddr {
        addr::loopback_for(client.local_addr())
    }

    #[tokio::test]
    async fn test_peer_handshake() {
        let a = Client::new(config(), EventMode::default()).await.unwrap();
        let b = Client::new(config(), EventMode::default()).await.unwrap();
        let _ca = fake_login(&a);
        let _cb = fake_login(&b);
        member(&a, 0);
        member(&b, 1);
        a.handle_server_message(announce(1, 1, "bob", loopback(&b)));
        b.handle_server_message(announce(1, 0, "alice", loopback(&a)));

        let ta = tokio::spawn(a.clone().run());
        let tb = tokio::spawn(b.clone().run());
        tokio::time::sleep(Duration::from_millis(300)).await;

        let bob = a.find_peer_by_name("band", "bob").unwrap();
        assert!(bob.connected);
        assert!(!bob.relayed);
        assert_eq!(bob.address, Some(loopback(&b)));
        assert!(a.find_peer_by_address(loopback(&b)).is_some());

        let joins = a
            .events()
            .drain()
            .into_iter()
            .filter(|e| matches!(e, Event::PeerJoin(_)))
            .count();
        assert_eq!(joins, 1);

        // Direct message
        b.send_message(1, None, b"hello", FLAG_DIRECT).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let got = a.events().drain().into_iter().any(|e| {
            matches!(e, Event::PeerMessage(m) if m.data == b"hello" && m.user_id == 1)
        });
        assert!(got);

        a.stop();
        b.stop();
        ta.await.unwrap().unwrap();
        tb.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_peer_times_out() {
        let a = Client::new(config(), EventMode::default()).await.unwrap();
        let _control = fake_login(&a);
        member(&a, 0);
        // Nobody listens here
        let silent = UdpServer::bind(UdpServerConfig {
            family: SocketFamily::Ipv4,
            ..Default::default()
        })
        .await
        .unwrap();
        a.handle_server_message(announce(1, 1, "bob", addr::loopback_for(silent.local_addr())));

        let now = Instant::now();
        a.update(now);
        a.update(now + Duration::from_secs(1));
        a.update(now + Duration::from_secs(2));
        let timeouts = a
            .events()
            .drain()
            .into_iter()
            .filter(|e| matches!(e, Event::PeerTimeout(_)))
            .count();
        assert_eq!(timeouts, 1);
        assert!(!a.peers()[0].connected);
    }

    #[tokio::test]
    async fn test_relay_fallback() {
        let a = Client::new(config(), EventMode::default()).await.unwrap();
        let _control = fake_login(&a);
        let server: SocketAddr = "127.0.0.1:7078".parse().unwrap();
        {
            let mut state = a.state.lock();
            state.connection = Connection::Connected {
                client_id: 1,
                relay: true,
            };
            state.server = Some(server);
        }
        member(&a, 0);
        let public: SocketAddr = "203.0.113.5:4000".parse().unwrap();
        a.handle_server_message(announce(1, 1, "bob", public));
        let now = Instant::now();
        a.update(now);
        a.update(now + Duration::from_secs(1));

        let bob = a.find_peer_by_name("band", "bob").unwrap();
        assert!(bob.connected);
        assert!(bob.relayed);
        assert_eq!(bob.address, Some(public));

        a.handle_server_message(ServerMessage::PeerLeave {
            group_id: 1,
            user_id: 1,
        });
        a.handle_server_message(ServerMessage::PeerLeave {
            group_id: 1,
            user_id: 1,
        });
        let leaves = a
            .events()
            .drain()
            .into_iter()
            .filter(|e| matches!(e, Event::PeerLeave(_)))
            .count();
        assert_eq!(leaves, 1);
        assert!(a.peers().is_empty());
    }
}

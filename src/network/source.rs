//! Sending endpoint
//!
//! A [`Source`] encodes audio from the host's audio callback and streams it
//! to any number of sink endpoints.
//!
//! Two contexts touch a Source:
//!
//! - the audio callback calls [`Source::process`], which interleaves and
//!   encodes complete blocks into pooled buffers and hands them to the
//!   network side through a lock-free ring buffer. It only ever try-locks.
//! - the network side calls [`Source::handle_message`] for incoming
//!   requests and [`Source::send`] to flush outgoing data: stream
//!   announcements, data frames, resent frames and pings.
//!
//! Every sent block stays in a resend history for `resend_buffer_size`
//! seconds. Requests for blocks that have left the history are ignored.

use std::borrow::Cow;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crossbeam::queue::ArrayQueue;
use parking_lot::Mutex;
use ringbuf::traits::{Consumer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, info, trace, warn};

use crate::audio::{CodecControl, CodecError, CodecRegistry, Encoder, Format};
use crate::events::{ErrorEvent, Event, EventMode, EventQueue, InviteEvent, SinkPingEvent, ThreadLevel};
use crate::protocol::binary::MAX_DATA_HEADER_SIZE;
use crate::protocol::{
    check_version, route, version_string, DataFrame, OscMessage, ResendRequest, StreamStart,
    Target, ToSink, ToSource,
};
use crate::time::NtpTime;

use super::endpoint::Endpoint;
use super::error::NetworkError;
use super::history::{HistoryBlock, HistoryBuffer};
use super::rtt::RttEstimator;
use super::timesync::{RateEstimator, DEFAULT_BANDWIDTH};

/// Room left for the address, type tags and arguments of an OSC data message
const OSC_DATA_OVERHEAD: usize = 96;

/// Smallest payload carried by one frame
const MIN_FRAME_SIZE: usize = 16;

/// Pending resend requests kept per sink
const MAX_PENDING_REQUESTS: usize = 256;

/// Error code for events raised when encoding fails
pub const ERROR_ENCODE: i32 = 1;

/// Configuration for [`Source`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Maximum UDP payload size in bytes
    pub packet_size: usize,
    /// Capacity of the queue between audio and network side (seconds)
    pub buffer_size: f64,
    /// How long sent blocks stay available for resending (seconds)
    pub resend_buffer_size: f64,
    /// How many times each frame is sent
    pub redundancy: u32,
    /// Interval between pings to each sink (seconds)
    pub ping_interval: f64,
    /// Send data frames in the compact binary format
    pub binary_data: bool,
    /// Activate sinks that invite this source without asking the host
    pub accept_invitations: bool,
    /// Bandwidth of the local sample rate estimate (Hz)
    pub dll_bandwidth: f64,
}

impl SourceConfig {
    /// Validate and normalize the configuration
    pub fn validated(self) -> Self {
        let positive = |v: f64, fallback: f64| if v.is_finite() && v > 0.0 { v } else { fallback };
        Self {
            packet_size: self.packet_size.clamp(MAX_DATA_HEADER_SIZE + MIN_FRAME_SIZE, 65000),
            buffer_size: positive(self.buffer_size, 0.025),
            resend_buffer_size: if self.resend_buffer_size.is_finite() {
                self.resend_buffer_size.max(0.0)
            } else {
                1.0
            },
            redundancy: self.redundancy.clamp(1, 16),
            ping_interval: positive(self.ping_interval, 1.0),
            dll_bandwidth: positive(self.dll_bandwidth, DEFAULT_BANDWIDTH),
            ..self
        }
    }

    fn frame_size(&self) -> usize {
        let overhead = if self.binary_data {
            MAX_DATA_HEADER_SIZE
        } else {
            OSC_DATA_OVERHEAD
        };
        self.packet_size.saturating_sub(overhead).max(MIN_FRAME_SIZE)
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            packet_size: 512,
            buffer_size: 0.025,
            resend_buffer_size: 1.0,
            redundancy: 1,
            ping_interval: 1.0,
            binary_data: true,
            accept_invitations: true,
            dll_bandwidth: DEFAULT_BANDWIDTH,
        }
    }
}

/// Network statistics for one sink
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SinkStats {
    /// Smoothed round trip time (seconds)
    pub rtt: f64,
    pub jitter: f64,
    /// Loss ratio last reported by the sink
    pub packet_loss: f32,
    pub reachable: bool,
}

/// Source counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceStats {
    pub blocks_encoded: u64,
    /// Blocks lost because the network side did not keep up
    pub blocks_dropped: u64,
    pub frames_sent: u64,
    pub frames_resent: u64,
    /// Resend requests for blocks no longer in the history
    pub requests_too_old: u64,
}

struct EncodedBlock {
    stream_id: i32,
    sequence: i32,
    sample_rate: f64,
    xrun: bool,
    data: Vec<u8>,
}

struct AudioState {
    /// Host sample rate once known
    host_rate: Option<u32>,
    encoder: Option<Box<dyn Encoder>>,
    producer: Option<HeapProd<EncodedBlock>>,
    pool: Arc<ArrayQueue<Vec<u8>>>,
    accum: Vec<f32>,
    accum_frames: usize,
    block_frames: usize,
    channels: usize,
    max_encoded: usize,
    stream_id: i32,
    sequence: i32,
    sample_count: i64,
    rate: RateEstimator,
}

struct SinkDesc {
    endpoint: Endpoint,
    active: bool,
    format_sent: bool,
    unreachable: bool,
    stop_stream: Option<i32>,
    decline: Option<i32>,
    pending_invite: Option<i32>,
    requests: Vec<ResendRequest>,
    rtt: RttEstimator,
    packet_loss: f32,
}

impl SinkDesc {
    fn new(endpoint: Endpoint, active: bool) -> Self {
        Self {
            endpoint,
            active,
            format_sent: false,
            unreachable: false,
            stop_stream: None,
            decline: None,
            pending_invite: None,
            requests: Vec::new(),
            rtt: RttEstimator::new(),
            packet_loss: 0.0,
        }
    }

    /// Record the outcome of a send
    fn sent(&mut self, result: Result<(), NetworkError>) -> bool {
        match result {
            Ok(()) => {
                if self.unreachable {
                    info!("Sink {} reachable again", self.endpoint);
                    self.unreachable = false;
                }
                true
            }
            Err(e) => {
                if !self.unreachable {
                    warn!("Sink {} unreachable: {}", self.endpoint, e);
                    self.unreachable = true;
                }
                false
            }
        }
    }
}

struct NetState {
    consumer: Option<HeapCons<EncodedBlock>>,
    pool: Arc<ArrayQueue<Vec<u8>>>,
    history: HistoryBuffer,
    sinks: Vec<SinkDesc>,
    /// Stop messages owed to sinks that were removed
    removed: Vec<(Endpoint, i32)>,
    format: Option<Format>,
    metadata: Option<Vec<u8>>,
    stream_id: i32,
    last_ping: Option<Instant>,
    requests: Vec<ResendRequest>,
    addr_buf: String,
    out: Vec<u8>,
    stats: SourceStats,
}

impl NetState {
    fn find(&mut self, endpoint: &Endpoint) -> Option<&mut SinkDesc> {
        self.sinks.iter_mut().find(|s| s.endpoint == *endpoint)
    }

    fn recycle(&self, buf: Vec<u8>) {
        if buf.capacity() > 0 {
            let _ = self.pool.push(buf);
        }
    }
}

/// Sending endpoint
pub struct Source {
    id: i32,
    config: SourceConfig,
    codecs: Arc<CodecRegistry>,
    audio: Mutex<AudioState>,
    net: Mutex<NetState>,
    /// Audio clock position for pings: (samples, time at that sample)
    clock: Mutex<(i64, NtpTime)>,
    streaming: AtomicBool,
    blocks_encoded: AtomicU64,
    blocks_dropped: AtomicU64,
    events: EventQueue,
    wakeup: Arc<Notify>,
}

impl Source {
    pub fn new(id: i32, config: SourceConfig, codecs: Arc<CodecRegistry>, events: EventMode) -> Self {
        let config = config.validated();
        let stream_id = rand::random::<i32>() & 0x3fff_ffff;
        let pool = Arc::new(ArrayQueue::new(1));
        Self {
            id,
            codecs,
            audio: Mutex::new(AudioState {
                host_rate: None,
                encoder: None,
                producer: None,
                pool: pool.clone(),
                accum: Vec::new(),
                accum_frames: 0,
                block_frames: 0,
                channels: 0,
                max_encoded: 0,
                stream_id,
                sequence: 0,
                sample_count: 0,
                rate: RateEstimator::new(0.0, config.dll_bandwidth),
            }),
            net: Mutex::new(NetState {
                consumer: None,
                pool,
                history: HistoryBuffer::new(0),
                sinks: Vec::new(),
                removed: Vec::new(),
                format: None,
                metadata: None,
                stream_id,
                last_ping: None,
                requests: Vec::new(),
                addr_buf: String::new(),
                out: Vec::with_capacity(config.packet_size),
                stats: SourceStats::default(),
            }),
            clock: Mutex::new((0, NtpTime::default())),
            streaming: AtomicBool::new(false),
            blocks_encoded: AtomicU64::new(0),
            blocks_dropped: AtomicU64::new(0),
            events: EventQueue::new(events),
            wakeup: Arc::new(Notify::new()),
            config,
        }
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn config(&self) -> &SourceConfig {
        &self.config
    }

    /// Event raised whenever there is something to send
    pub fn wakeup(&self) -> Arc<Notify> {
        self.wakeup.clone()
    }

    pub fn events(&self) -> &EventQueue {
        &self.events
    }

    /// Drain queued events (poll mode)
    pub fn poll_events(&self, f: impl FnMut(Event)) -> usize {
        self.events.poll(f)
    }

    /// Tell the source about the host audio settings
    pub fn setup(&self, sample_rate: u32, block_size: u32, channels: u16) -> Result<(), NetworkError> {
        let mut audio = self.audio.lock();
        if let Some(format) = self.net.lock().format.as_ref() {
            if format.sample_rate != sample_rate {
                return Err(CodecError::InvalidFormat(format!(
                    "format sample rate {} differs from host sample rate {}",
                    format.sample_rate, sample_rate
                ))
                .into());
            }
        }
        audio.host_rate = Some(sample_rate);
        audio.rate.reset(f64::from(sample_rate));
        audio.accum_frames = 0;
        debug!(
            "Source {} setup: {} Hz, block size {}, {} channels",
            self.id, sample_rate, block_size, channels
        );
        Ok(())
    }

    /// Set the stream format. A running stream restarts with a new stream id.
    pub fn set_format(&self, mut format: Format) -> Result<(), NetworkError> {
        self.codecs.validate(&mut format)?;
        let codec = self.codecs.get(&format.codec)?;
        let encoder = codec.new_encoder(&format)?;
        let max_encoded = encoder.max_encoded_size();

        let blocks_per_sec = f64::from(format.sample_rate) / f64::from(format.block_size);
        let queue_blocks = ((self.config.buffer_size * blocks_per_sec).ceil() as usize).max(8);
        let history_blocks = (self.config.resend_buffer_size * blocks_per_sec).ceil() as usize;
        let pool_size = queue_blocks + history_blocks + 4;
        let pool = Arc::new(ArrayQueue::new(pool_size));
        for _ in 0..pool_size {
            let _ = pool.push(Vec::with_capacity(max_encoded));
        }
        let (producer, consumer) = HeapRb::<EncodedBlock>::new(queue_blocks).split();

        let mut audio = self.audio.lock();
        if let Some(host_rate) = audio.host_rate {
            if host_rate != format.sample_rate {
                return Err(CodecError::InvalidFormat(format!(
                    "format sample rate {} differs from host sample rate {}",
                    format.sample_rate, host_rate
                ))
                .into());
            }
        }
        let mut net = self.net.lock();

        let channels = usize::from(format.num_channels);
        let block_frames = format.block_size as usize;
        audio.encoder = Some(encoder);
        audio.producer = Some(producer);
        audio.pool = pool.clone();
        audio.accum.clear();
        audio.accum.resize(channels * block_frames, 0.0);
        audio.accum_frames = 0;
        audio.block_frames = block_frames;
        audio.channels = channels;
        audio.max_encoded = max_encoded;
        audio.rate.reset(f64::from(format.sample_rate));

        net.consumer = Some(consumer);
        net.pool = pool;
        net.history = HistoryBuffer::new(history_blocks);
        info!(
            "Source {} format: {} {} ch {} Hz block {}",
            self.id, format.codec, format.num_channels, format.sample_rate, format.block_size
        );
        net.format = Some(format);

        if self.streaming.load(Ordering::Acquire) {
            Self::new_stream(&mut audio, &mut net);
        }
        drop(net);
        drop(audio);
        self.wakeup.notify_one();
        Ok(())
    }

    pub fn format(&self) -> Option<Format> {
        self.net.lock().format.clone()
    }

    fn new_stream(audio: &mut AudioState, net: &mut NetState) -> i32 {
        let stream_id = net.stream_id.wrapping_add(1) & 0x7fff_ffff;
        net.stream_id = stream_id;
        audio.stream_id = stream_id;
        audio.sequence = 0;
        audio.accum_frames = 0;
        if let Some(encoder) = audio.encoder.as_mut() {
            let _ = encoder.control(CodecControl::Reset);
        }
        let pool = net.pool.clone();
        net.history.clear(|buf| {
            let _ = pool.push(buf);
        });
        for sink in &mut net.sinks {
            sink.format_sent = false;
            sink.requests.clear();
        }
        stream_id
    }

    /// Start a new stream
    pub fn start(&self, metadata: Option<Vec<u8>>) -> Result<(), NetworkError> {
        let mut audio = self.audio.lock();
        let mut net = self.net.lock();
        if net.format.is_none() {
            return Err(CodecError::InvalidFormat("no format set".to_string()).into());
        }
        if self.streaming.load(Ordering::Acquire) {
            Self::queue_stop(&mut net);
        }
        net.metadata = metadata;
        let stream_id = Self::new_stream(&mut audio, &mut net);
        net.last_ping = None;
        self.streaming.store(true, Ordering::Release);
        info!("Source {} started stream {}", self.id, stream_id);
        drop(net);
        drop(audio);
        self.wakeup.notify_one();
        Ok(())
    }

    /// Stop the stream; active sinks get a stop message
    pub fn stop(&self) {
        let mut audio = self.audio.lock();
        let mut net = self.net.lock();
        if !self.streaming.swap(false, Ordering::AcqRel) {
            return;
        }
        Self::queue_stop(&mut net);
        let stream_id = Self::new_stream(&mut audio, &mut net);
        info!("Source {} stopped (next stream {})", self.id, stream_id);
        drop(net);
        drop(audio);
        self.wakeup.notify_one();
    }

    fn queue_stop(net: &mut NetState) {
        let stream_id = net.stream_id;
        for sink in net.sinks.iter_mut().filter(|s| s.active) {
            sink.stop_stream = Some(stream_id);
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::Acquire)
    }

    pub fn stream_id(&self) -> i32 {
        self.net.lock().stream_id
    }

    /// Audio callback: consume one block of non-interleaved input.
    ///
    /// Returns false if nothing was processed (not streaming, no format, or
    /// the network side currently holds the state).
    pub fn process(&self, input: &[&[f32]], t: NtpTime) -> bool {
        if !self.streaming.load(Ordering::Acquire) {
            return false;
        }
        let Some(mut guard) = self.audio.try_lock() else {
            return false;
        };
        let audio = &mut *guard;
        if audio.encoder.is_none() || audio.block_frames == 0 {
            return false;
        }
        let nframes = input.first().map_or(0, |c| c.len());

        if let Some(mut clock) = self.clock.try_lock() {
            *clock = (audio.sample_count, t);
        }
        audio.rate.update(audio.sample_count as f64, t.as_secs_f64());

        let channels = audio.channels;
        let mut pos = 0;
        while pos < nframes {
            let n = (audio.block_frames - audio.accum_frames).min(nframes - pos);
            for i in 0..n {
                let dst = (audio.accum_frames + i) * channels;
                for ch in 0..channels {
                    audio.accum[dst + ch] = input
                        .get(ch)
                        .and_then(|c| c.get(pos + i))
                        .copied()
                        .unwrap_or(0.0);
                }
            }
            audio.accum_frames += n;
            pos += n;
            if audio.accum_frames == audio.block_frames {
                self.encode_block(audio);
                audio.accum_frames = 0;
            }
        }
        audio.sample_count += nframes as i64;
        self.wakeup.notify_one();
        true
    }

    fn encode_block(&self, audio: &mut AudioState) {
        let AudioState {
            encoder,
            producer,
            pool,
            accum,
            max_encoded,
            stream_id,
            sequence,
            rate,
            ..
        } = audio;
        let (Some(encoder), Some(producer)) = (encoder.as_mut(), producer.as_mut()) else {
            return;
        };
        let seq = *sequence;
        *sequence = sequence.wrapping_add(1);

        let Some(mut buf) = pool.pop() else {
            self.blocks_dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };
        buf.clear();
        buf.resize(*max_encoded, 0);
        let xrun = match encoder.encode(accum, &mut buf) {
            Ok(n) => {
                buf.truncate(n);
                false
            }
            Err(_) => {
                buf.clear();
                self.events.push(
                    Event::Error(ErrorEvent {
                        code: ERROR_ENCODE,
                        message: Cow::Borrowed("failed to encode block"),
                    }),
                    ThreadLevel::Audio,
                );
                true
            }
        };
        let block = EncodedBlock {
            stream_id: *stream_id,
            sequence: seq,
            sample_rate: if rate.is_measured() { rate.rate() } else { 0.0 },
            xrun,
            data: buf,
        };
        match producer.try_push(block) {
            Ok(()) => {
                self.blocks_encoded.fetch_add(1, Ordering::Relaxed);
            }
            Err(block) => {
                let _ = pool.push(block.data);
                self.blocks_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Report that the host skipped `nsamples` samples of input.
    ///
    /// The gap is sent as empty blocks flagged as dropouts, so sinks keep
    /// their timing.
    pub fn report_xrun(&self, nsamples: usize) {
        if !self.streaming.load(Ordering::Acquire) {
            return;
        }
        let Some(mut guard) = self.audio.try_lock() else {
            return;
        };
        let audio = &mut *guard;
        if audio.block_frames == 0 {
            return;
        }
        let blocks = (nsamples as f64 / audio.block_frames as f64).round().max(1.0) as usize;
        audio.sample_count += nsamples as i64;
        let Some(producer) = audio.producer.as_mut() else {
            return;
        };
        for _ in 0..blocks {
            let block = EncodedBlock {
                stream_id: audio.stream_id,
                sequence: audio.sequence,
                sample_rate: 0.0,
                xrun: true,
                data: Vec::new(),
            };
            audio.sequence = audio.sequence.wrapping_add(1);
            if producer.try_push(block).is_err() {
                self.blocks_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.wakeup.notify_one();
    }

    /// Add a sink or change whether it is active
    pub fn add_endpoint(&self, endpoint: Endpoint, active: bool) {
        let mut net = self.net.lock();
        if let Some(sink) = net.find(&endpoint) {
            sink.endpoint.relay = endpoint.relay;
            if sink.active != active {
                sink.active = active;
                sink.format_sent = false;
            }
            return;
        }
        debug!("Source {}: add sink {}", self.id, endpoint);
        net.sinks.push(SinkDesc::new(endpoint, active));
        drop(net);
        self.events.push(Event::SinkAdd(endpoint), ThreadLevel::Network);
        self.wakeup.notify_one();
    }

    /// Remove a sink; an active sink receives a final stop message
    pub fn remove_endpoint(&self, endpoint: &Endpoint) -> bool {
        let mut net = self.net.lock();
        let Some(pos) = net.sinks.iter().position(|s| s.endpoint == *endpoint) else {
            return false;
        };
        let sink = net.sinks.remove(pos);
        if sink.active && self.streaming.load(Ordering::Acquire) {
            let stream_id = net.stream_id;
            net.removed.push((sink.endpoint, stream_id));
        }
        drop(net);
        debug!("Source {}: remove sink {}", self.id, endpoint);
        self.events.push(Event::SinkRemove(*endpoint), ThreadLevel::Network);
        self.wakeup.notify_one();
        true
    }

    /// Remove every sink at `addr`, whatever its id
    pub fn remove_endpoints_at(&self, addr: SocketAddr) -> usize {
        let endpoints: Vec<_> = self
            .endpoints()
            .into_iter()
            .filter(|e| e.address == addr.into())
            .collect();
        endpoints.iter().filter(|e| self.remove_endpoint(e)).count()
    }

    pub fn remove_all(&self) {
        let endpoints = self.endpoints();
        for endpoint in &endpoints {
            self.remove_endpoint(endpoint);
        }
    }

    /// Start or stop sending to an existing sink
    pub fn activate(&self, endpoint: &Endpoint, active: bool) -> bool {
        let mut net = self.net.lock();
        let stream_id = net.stream_id;
        let streaming = self.streaming.load(Ordering::Acquire);
        let Some(sink) = net.find(endpoint) else {
            return false;
        };
        if sink.active != active {
            sink.active = active;
            sink.format_sent = false;
            if !active && streaming {
                sink.stop_stream = Some(stream_id);
            }
        }
        drop(net);
        self.wakeup.notify_one();
        true
    }

    /// Accept a pending invitation from `endpoint`
    pub fn accept_invite(&self, endpoint: &Endpoint) -> bool {
        let mut net = self.net.lock();
        let Some(sink) = net.find(endpoint) else {
            return false;
        };
        if sink.pending_invite.take().is_none() {
            return false;
        }
        sink.active = true;
        sink.format_sent = false;
        drop(net);
        self.wakeup.notify_one();
        true
    }

    /// Decline a pending invitation; the sink is told so
    pub fn decline_invite(&self, endpoint: &Endpoint) -> bool {
        let mut net = self.net.lock();
        let Some(sink) = net.find(endpoint) else {
            return false;
        };
        let Some(token) = sink.pending_invite.take() else {
            return false;
        };
        sink.decline = Some(token);
        drop(net);
        self.wakeup.notify_one();
        true
    }

    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.net.lock().sinks.iter().map(|s| s.endpoint).collect()
    }

    pub fn has_endpoint(&self, endpoint: &Endpoint) -> bool {
        self.net.lock().sinks.iter().any(|s| s.endpoint == *endpoint)
    }

    pub fn sink_stats(&self, endpoint: &Endpoint) -> Option<SinkStats> {
        let net = self.net.lock();
        let sink = net.sinks.iter().find(|s| s.endpoint == *endpoint)?;
        Some(SinkStats {
            rtt: sink.rtt.rtt(),
            jitter: sink.rtt.jitter(),
            packet_loss: sink.packet_loss,
            reachable: !sink.unreachable,
        })
    }

    pub fn stats(&self) -> SourceStats {
        let mut stats = self.net.lock().stats.clone();
        stats.blocks_encoded = self.blocks_encoded.load(Ordering::Relaxed);
        stats.blocks_dropped = self.blocks_dropped.load(Ordering::Relaxed);
        stats
    }

    /// Handle a message addressed to this source
    pub fn handle_message(&self, data: &[u8], from: SocketAddr) -> Result<(), NetworkError> {
        self.handle_message_via(data, from, None)
    }

    /// Handle a message that was forwarded by the relay at `relay`
    pub fn handle_relayed_message(
        &self,
        data: &[u8],
        from: SocketAddr,
        relay: SocketAddr,
    ) -> Result<(), NetworkError> {
        self.handle_message_via(data, from, Some(relay))
    }

    fn handle_message_via(
        &self,
        data: &[u8],
        from: SocketAddr,
        relay: Option<SocketAddr>,
    ) -> Result<(), NetworkError> {
        let r = route(data)?;
        match r.target {
            Target::Source(id) if id == self.id && !r.cmd.is_empty() => {}
            _ => return Err(NetworkError::InvalidPacket),
        }
        let msg = OscMessage::decode(data)?;
        let message = ToSource::decode(r.cmd, &msg)?;
        let endpoint = Endpoint::new(from, message.sink_id()).with_relay(relay);
        trace!("Source {}: {} from {}", self.id, r.cmd, endpoint);
        if relay.is_some() {
            if let Some(sink) = self.net.lock().find(&endpoint) {
                sink.endpoint.relay = relay;
            }
        }

        match message {
            ToSource::FormatRequest { version, .. } => {
                if !check_version(&version) {
                    return Err(NetworkError::VersionMismatch(version.into_owned()));
                }
                let mut net = self.net.lock();
                match net.find(&endpoint) {
                    Some(sink) if sink.active => sink.format_sent = false,
                    _ => debug!("Format request from unknown sink {}", endpoint),
                }
            }
            ToSource::DataRequest {
                stream_id,
                requests,
                ..
            } => {
                let mut net = self.net.lock();
                let current = net.stream_id;
                let Some(sink) = net.find(&endpoint) else {
                    return Ok(());
                };
                if stream_id != current {
                    trace!("Ignoring resend request for old stream {}", stream_id);
                    return Ok(());
                }
                let room = MAX_PENDING_REQUESTS.saturating_sub(sink.requests.len());
                sink.requests.extend(requests.iter().copied().take(room));
            }
            ToSource::PingReply {
                t1,
                t2,
                packet_loss,
                ..
            } => {
                let t3 = NtpTime::now();
                let mut net = self.net.lock();
                let Some(sink) = net.find(&endpoint) else {
                    return Ok(());
                };
                let rtt = sink.rtt.update(NtpTime::duration(t1, t3));
                sink.packet_loss = packet_loss;
                drop(net);
                self.events.push(
                    Event::SinkPing(SinkPingEvent {
                        endpoint,
                        t1,
                        t2,
                        t3,
                        rtt,
                        packet_loss,
                    }),
                    ThreadLevel::Network,
                );
            }
            ToSource::Invite { token, metadata, .. } => {
                let accept = self.config.accept_invitations;
                let mut net = self.net.lock();
                let added = match net.find(&endpoint) {
                    Some(sink) => {
                        if accept {
                            sink.active = true;
                            sink.format_sent = false;
                        } else {
                            sink.pending_invite = Some(token);
                        }
                        false
                    }
                    None => {
                        let mut sink = SinkDesc::new(endpoint, accept);
                        if !accept {
                            sink.pending_invite = Some(token);
                        }
                        net.sinks.push(sink);
                        true
                    }
                };
                drop(net);
                if added {
                    self.events.push(Event::SinkAdd(endpoint), ThreadLevel::Network);
                }
                self.events.push(
                    Event::Invite(InviteEvent {
                        endpoint,
                        token,
                        metadata: metadata.map(Cow::into_owned),
                    }),
                    ThreadLevel::Network,
                );
                self.wakeup.notify_one();
            }
            ToSource::Uninvite { token, .. } => {
                let accept = self.config.accept_invitations;
                let streaming = self.streaming.load(Ordering::Acquire);
                let mut net = self.net.lock();
                let stream_id = net.stream_id;
                let Some(sink) = net.find(&endpoint) else {
                    return Ok(());
                };
                if accept && sink.active {
                    sink.active = false;
                    if streaming {
                        sink.stop_stream = Some(stream_id);
                    }
                }
                drop(net);
                self.events.push(
                    Event::Uninvite(InviteEvent {
                        endpoint,
                        token,
                        metadata: None,
                    }),
                    ThreadLevel::Network,
                );
                self.wakeup.notify_one();
            }
        }
        Ok(())
    }

    /// Flush everything that is due: stop and format messages, new data,
    /// requested resends and pings.
    ///
    /// `send` is called once per datagram. A failing sink is marked
    /// unreachable and retried with the next datagram.
    pub fn send<F>(&self, mut send: F)
    where
        F: FnMut(&[u8], &Endpoint) -> Result<(), NetworkError>,
    {
        let streaming = self.streaming.load(Ordering::Acquire);
        let frame_size = self.config.frame_size();
        let mut guard = self.net.lock();
        let net = &mut *guard;
        let NetState {
            consumer,
            pool,
            history,
            sinks,
            removed,
            format,
            metadata,
            stream_id,
            last_ping,
            requests,
            addr_buf,
            out,
            stats,
        } = net;
        let source_id = self.id;
        let stream_id = *stream_id;

        for (endpoint, old_stream) in removed.drain(..) {
            out.clear();
            ToSink::Stop {
                source_id,
                stream_id: old_stream,
            }
            .encode(endpoint.id, addr_buf, out);
            if let Err(e) = send(out, &endpoint) {
                debug!("Stop message to {} failed: {}", endpoint, e);
            }
        }

        for sink in sinks.iter_mut() {
            if let Some(old_stream) = sink.stop_stream.take() {
                out.clear();
                ToSink::Stop {
                    source_id,
                    stream_id: old_stream,
                }
                .encode(sink.endpoint.id, addr_buf, out);
                sink.sent(send(out, &sink.endpoint));
            }
            if let Some(token) = sink.decline.take() {
                out.clear();
                ToSink::Decline { source_id, token }.encode(sink.endpoint.id, addr_buf, out);
                sink.sent(send(out, &sink.endpoint));
            }
        }

        if let (true, Some(format)) = (streaming, format.as_ref()) {
            let version = version_string();
            for sink in sinks.iter_mut().filter(|s| s.active && !s.format_sent) {
                out.clear();
                ToSink::Start(StreamStart {
                    source_id,
                    version: Cow::Borrowed(&version),
                    stream_id,
                    format: format.clone(),
                    metadata: metadata.as_deref().map(Cow::Borrowed),
                })
                .encode(sink.endpoint.id, addr_buf, out);
                sink.format_sent = sink.sent(send(out, &sink.endpoint));
                debug!("Source {}: sent format to {}", source_id, sink.endpoint);
            }
        }

        if let Some(consumer) = consumer.as_mut() {
            while let Some(block) = consumer.try_pop() {
                if block.stream_id != stream_id {
                    let _ = pool.push(block.data);
                    continue;
                }
                let block = HistoryBlock {
                    sequence: block.sequence,
                    sample_rate: block.sample_rate,
                    xrun: block.xrun,
                    data: block.data,
                    frame_size,
                };
                if streaming {
                    for index in 0..block.num_frames() {
                        let Some(frame) = block.frame(stream_id, index) else {
                            continue;
                        };
                        for sink in sinks.iter_mut().filter(|s| s.active && s.format_sent) {
                            for _ in 0..self.config.redundancy {
                                encode_frame(
                                    self.config.binary_data,
                                    source_id,
                                    sink.endpoint.id,
                                    &frame,
                                    addr_buf,
                                    out,
                                );
                                if sink.sent(send(out, &sink.endpoint)) {
                                    stats.frames_sent += 1;
                                }
                            }
                        }
                    }
                }
                if let Some(buf) = history.push(block) {
                    if buf.capacity() > 0 {
                        let _ = pool.push(buf);
                    }
                }
            }
        }

        for sink in sinks.iter_mut().filter(|s| s.active) {
            if sink.requests.is_empty() {
                continue;
            }
            requests.clear();
            requests.append(&mut sink.requests);
            for request in requests.iter() {
                let Some(block) = history.find(request.sequence) else {
                    trace!(
                        "Block {} no longer in history (oldest {:?})",
                        request.sequence,
                        history.oldest()
                    );
                    stats.requests_too_old += 1;
                    continue;
                };
                let frames = if request.frame < 0 {
                    0..block.num_frames()
                } else {
                    let index = request.frame as u16;
                    index..index.saturating_add(1)
                };
                for index in frames {
                    let Some(frame) = block.frame(stream_id, index) else {
                        continue;
                    };
                    encode_frame(
                        self.config.binary_data,
                        source_id,
                        sink.endpoint.id,
                        &frame,
                        addr_buf,
                        out,
                    );
                    if sink.sent(send(out, &sink.endpoint)) {
                        stats.frames_resent += 1;
                    }
                }
            }
        }

        if streaming {
            let now = Instant::now();
            let due = last_ping
                .map_or(true, |t| now.duration_since(t).as_secs_f64() >= self.config.ping_interval);
            if due {
                *last_ping = Some(now);
                let t1 = NtpTime::now();
                let rate = format.as_ref().map_or(0.0, |f| f64::from(f.sample_rate));
                let sample_count = self.clock_at(t1, rate);
                for sink in sinks.iter_mut().filter(|s| s.active) {
                    out.clear();
                    ToSink::Ping {
                        source_id,
                        t1,
                        sample_count,
                    }
                    .encode(sink.endpoint.id, addr_buf, out);
                    sink.sent(send(out, &sink.endpoint));
                }
            }
        }
    }

    /// Audio clock position extrapolated to `t`
    fn clock_at(&self, t: NtpTime, rate: f64) -> i64 {
        let (samples, at) = *self.clock.lock();
        if at.is_empty() {
            return samples;
        }
        let ahead = NtpTime::duration(at, t).max(0.0);
        samples + (ahead * rate).round() as i64
    }
}

fn encode_frame(
    binary: bool,
    source_id: i32,
    sink_id: i32,
    frame: &DataFrame<'_>,
    addr_buf: &mut String,
    out: &mut Vec<u8>,
) {
    out.clear();
    if binary {
        ToSink::encode_binary_data(sink_id, source_id, frame, out);
    } else {
        ToSink::Data {
            source_id,
            frame: *frame,
        }
        .encode(sink_id, addr_buf, out);
    }
}

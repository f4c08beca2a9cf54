//! Receiving endpoint
//!
//! A [`Sink`] receives streams from any number of remote Sources, puts
//! their blocks back in order and mixes them into the host's output.
//!
//! Per source the work is split between two contexts:
//!
//! - the network side ([`Sink::handle_message`], [`Sink::send`]) owns the
//!   jitter buffer and the decoder. It decodes blocks in sequence order
//!   into a sample ring buffer that was prefilled with `latency` seconds
//!   of silence, and decides when a missing block is given up: either when
//!   the ring would otherwise run dry or when its resend requests are
//!   spent.
//! - the audio side ([`Sink::process`]) only try-locks a small per-source
//!   state, reads the ring through the drift-compensating resampler and
//!   turns counters into events.

use std::borrow::Cow;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, info, trace, warn};

use crate::audio::{CodecRegistry, Decoder, DynamicResampler, Format};
use crate::events::{
    BlockEvent, ErrorEvent, Event, EventMode, EventQueue, FormatChangeEvent, SourcePingEvent,
    StreamStartEvent, StreamState, StreamStateEvent, ThreadLevel,
};
use crate::protocol::{
    check_version, route, version_string, DataFrame, OscMessage, ResendRequest, StreamStart,
    Target, ToSink, ToSource,
};
use crate::time::NtpTime;

use super::endpoint::Endpoint;
use super::error::NetworkError;
use super::jitter_buffer::{InsertReport, JitterBuffer, JitterBufferConfig, JitterBufferStats, Playout};
use super::sequence_tracker::SequenceTracker;
use super::timesync::{TimeSyncFilter, DEFAULT_BANDWIDTH};
use super::udp_server::MAX_DATAGRAM_SIZE;

/// Minimum time between two format requests or invitations to one source (seconds)
const REQUEST_INTERVAL: f64 = 0.1;

const MIN_JITTER_BLOCKS: usize = 8;
const MAX_JITTER_BLOCKS: usize = 4096;

/// Error code for events raised when a block cannot be decoded
pub const ERROR_DECODE: i32 = 2;

/// Configuration for [`Sink`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkConfig {
    /// Playout delay (seconds)
    pub latency: f64,
    /// Request missing blocks from the source
    pub resend: bool,
    /// Minimum time between two requests for the same block (seconds)
    pub resend_interval: f64,
    /// Requests per block before it is given up
    pub resend_limit: u32,
    /// Frames requested per pass
    pub resend_max_frames: usize,
    /// How long a gap may persist before it is treated as loss rather than
    /// reordering (seconds). Lower values detect loss faster, higher values
    /// avoid spurious requests on networks that reorder a lot.
    pub resend_grace: f64,
    /// Silence after which a source is removed (seconds)
    pub source_timeout: f64,
    /// Time a source has to answer an invitation (seconds)
    pub invite_timeout: f64,
    /// Follow the clock drift between source and sink
    pub dynamic_resampling: bool,
    /// Bandwidth of the sample rate estimates (Hz)
    pub dll_bandwidth: f64,
}

impl SinkConfig {
    /// Validate and normalize the configuration
    pub fn validated(self) -> Self {
        let positive = |v: f64, fallback: f64| if v.is_finite() && v > 0.0 { v } else { fallback };
        let jitter = self.jitter_config(MIN_JITTER_BLOCKS);
        Self {
            latency: positive(self.latency, 0.05),
            resend: jitter.resend,
            resend_interval: jitter.resend_interval,
            resend_max_frames: jitter.resend_max_frames,
            resend_grace: jitter.resend_grace,
            source_timeout: positive(self.source_timeout, 10.0),
            invite_timeout: positive(self.invite_timeout, 1.0),
            dll_bandwidth: positive(self.dll_bandwidth, DEFAULT_BANDWIDTH),
            ..self
        }
    }

    fn jitter_config(&self, capacity: usize) -> JitterBufferConfig {
        JitterBufferConfig {
            capacity,
            resend: self.resend,
            resend_interval: self.resend_interval,
            resend_limit: self.resend_limit,
            resend_max_frames: self.resend_max_frames,
            resend_grace: self.resend_grace,
        }
        .validated()
    }
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            latency: 0.05,
            resend: true,
            resend_interval: 0.01,
            resend_limit: 16,
            resend_max_frames: 64,
            resend_grace: 0.005,
            source_timeout: 10.0,
            invite_timeout: 1.0,
            dynamic_resampling: true,
            dll_bandwidth: DEFAULT_BANDWIDTH,
        }
    }
}

/// Statistics for one remote stream
#[derive(Debug, Clone, PartialEq)]
pub struct StreamStats {
    pub state: StreamState,
    pub stream_id: Option<i32>,
    pub format: Option<Format>,
    pub jitter: JitterBufferStats,
    pub blocks_received: u64,
    pub blocks_lost: u64,
    /// Overall loss ratio
    pub packet_loss: f32,
    /// Sample ring fill level, 0 to 1
    pub buffer_fill: f32,
}

fn state_to_u8(state: StreamState) -> u8 {
    match state {
        StreamState::Inactive => 0,
        StreamState::Active => 1,
        StreamState::Buffering => 2,
    }
}

fn state_from_u8(value: u8) -> StreamState {
    match value {
        1 => StreamState::Active,
        2 => StreamState::Buffering,
        _ => StreamState::Inactive,
    }
}

#[derive(Debug, Clone, Copy)]
struct HostSettings {
    sample_rate: u32,
    block_size: u32,
}

/// Counters filled by the network side and turned into events by the audio side
#[derive(Default)]
struct Counters {
    lost: AtomicU32,
    resent: AtomicU32,
    reordered: AtomicU32,
    dropped: AtomicU32,
    xrun: AtomicU32,
    overrun: AtomicBool,
}

struct AudioState {
    consumer: Option<HeapCons<f32>>,
    resampler: DynamicResampler,
    transfer: Vec<f32>,
    output: Vec<f32>,
    channels: usize,
    sync: TimeSyncFilter,
    nominal_ratio: f64,
    local_samples: f64,
    underrun: bool,
}

impl AudioState {
    fn new(bandwidth: f64) -> Self {
        Self {
            consumer: None,
            resampler: DynamicResampler::new(1, 2),
            transfer: Vec::new(),
            output: Vec::new(),
            channels: 0,
            sync: TimeSyncFilter::new(0.0, 0.0, bandwidth),
            nominal_ratio: 1.0,
            local_samples: 0.0,
            underrun: false,
        }
    }

    /// Read one host block and add it to `outputs`. False on underrun.
    fn mix(&mut self, outputs: &mut [&mut [f32]], nframes: usize, t: NtpTime, dynamic: bool) -> bool {
        let channels = self.channels;
        if channels == 0 || self.consumer.is_none() {
            return false;
        }
        self.sync.update_local(self.local_samples, t.as_secs_f64());
        self.local_samples += nframes as f64;
        let ratio = if dynamic {
            self.sync.ratio()
        } else {
            self.nominal_ratio
        };

        let frames = nframes.min(self.output.len() / channels);
        let needed = self.resampler.frames_needed(frames, ratio);
        let have = self.resampler.read_available();
        if needed > have {
            let want = ((needed - have) * channels).min(self.transfer.len());
            if let Some(consumer) = self.consumer.as_mut() {
                let n = consumer.pop_slice(&mut self.transfer[..want]);
                self.resampler.write(&self.transfer[..n]);
            }
        }
        let out = &mut self.output[..frames * channels];
        if !self.resampler.read(out, ratio) {
            return false;
        }
        for (i, frame) in out.chunks_exact(channels).enumerate() {
            for (ch, sample) in frame.iter().enumerate() {
                if let Some(slot) = outputs.get_mut(ch).and_then(|o| o.get_mut(i)) {
                    *slot += *sample;
                }
            }
        }
        true
    }
}

struct PendingRequest {
    token: i32,
    metadata: Option<Vec<u8>>,
    started: Instant,
    last_sent: Option<Instant>,
}

impl PendingRequest {
    fn new(token: i32, metadata: Option<Vec<u8>>, now: Instant) -> Self {
        Self {
            token,
            metadata,
            started: now,
            last_sent: None,
        }
    }

    fn due(&self, now: Instant) -> bool {
        self.last_sent
            .map_or(true, |t| now.duration_since(t).as_secs_f64() >= REQUEST_INTERVAL)
    }

    fn expired(&self, now: Instant, timeout: f64) -> bool {
        now.duration_since(self.started).as_secs_f64() >= timeout
    }
}

struct NetState {
    relay: Option<SocketAddr>,
    stream_id: Option<i32>,
    format: Option<Format>,
    decoder: Option<Box<dyn Decoder>>,
    /// Largest encoded block the decoder accepts
    max_block_size: usize,
    producer: Option<HeapProd<f32>>,
    queue_capacity: usize,
    /// Ring fill (samples) below which a missing block is given up
    min_fill: usize,
    decode_buf: Vec<f32>,
    fade_in: bool,
    jitter: JitterBuffer,
    tracker: SequenceTracker,
    last_packet: Instant,
    format_request: bool,
    last_format_request: Option<Instant>,
    pong: Option<(NtpTime, NtpTime)>,
    invite: Option<PendingRequest>,
    uninvite: Option<PendingRequest>,
    requests: Vec<ResendRequest>,
}

impl NetState {
    fn new(relay: Option<SocketAddr>, now: Instant) -> Self {
        Self {
            relay,
            stream_id: None,
            format: None,
            decoder: None,
            max_block_size: 0,
            producer: None,
            queue_capacity: 0,
            min_fill: 0,
            decode_buf: Vec::new(),
            fade_in: true,
            jitter: JitterBuffer::new(),
            tracker: SequenceTracker::new(),
            last_packet: now,
            format_request: false,
            last_format_request: None,
            pong: None,
            invite: None,
            uninvite: None,
            requests: Vec::new(),
        }
    }

    fn buffer_fill(&self) -> f32 {
        match &self.producer {
            Some(p) if self.queue_capacity > 0 => p.occupied_len() as f32 / self.queue_capacity as f32,
            _ => 0.0,
        }
    }
}

/// One remote Source as seen by the sink
struct SourceDesc {
    endpoint: Endpoint,
    audio: Mutex<AudioState>,
    net: Mutex<NetState>,
    state: AtomicU8,
    counters: Counters,
}

impl SourceDesc {
    fn new(endpoint: Endpoint, bandwidth: f64, now: Instant) -> Self {
        Self {
            endpoint,
            audio: Mutex::new(AudioState::new(bandwidth)),
            net: Mutex::new(NetState::new(endpoint.relay, now)),
            state: AtomicU8::new(state_to_u8(StreamState::Inactive)),
            counters: Counters::default(),
        }
    }

    fn state(&self) -> StreamState {
        state_from_u8(self.state.load(Ordering::Acquire))
    }

    /// Change the state; returns true if it changed
    fn set_state(&self, state: StreamState) -> bool {
        self.state.swap(state_to_u8(state), Ordering::AcqRel) != state_to_u8(state)
    }

    fn reply_endpoint(&self, net: &NetState) -> Endpoint {
        self.endpoint.with_relay(net.relay)
    }

    fn count(&self, report: &InsertReport) {
        if report.resent {
            self.counters.resent.fetch_add(1, Ordering::Relaxed);
        }
        if report.reordered {
            self.counters.reordered.fetch_add(1, Ordering::Relaxed);
        }
        if report.lost > 0 {
            self.counters.lost.fetch_add(report.lost, Ordering::Relaxed);
        }
        if report.evicted > 0 {
            self.counters.dropped.fetch_add(report.evicted, Ordering::Relaxed);
            self.counters.overrun.store(true, Ordering::Relaxed);
        }
    }

    /// Turn the accumulated counters into events
    fn flush_events(&self, events: &EventQueue, level: ThreadLevel) {
        let block_event = |counter: &AtomicU32, make: fn(BlockEvent) -> Event| {
            let count = counter.swap(0, Ordering::Relaxed);
            if count > 0 {
                events.push(
                    make(BlockEvent {
                        endpoint: self.endpoint,
                        count,
                    }),
                    level,
                );
            }
        };
        block_event(&self.counters.lost, Event::BlockLost);
        block_event(&self.counters.resent, Event::BlockResent);
        block_event(&self.counters.reordered, Event::BlockReordered);
        block_event(&self.counters.dropped, Event::BlockDropped);
        block_event(&self.counters.xrun, Event::BlockXRun);
        if self.counters.overrun.swap(false, Ordering::Relaxed) {
            events.push(Event::BufferOverrun(self.endpoint), level);
        }
    }

    /// Decode every block that is due into the sample ring
    fn drain(&self, net: &mut NetState, now: Instant, events: &EventQueue) {
        loop {
            let Some(producer) = net.producer.as_mut() else {
                return;
            };
            let block_samples = net.decode_buf.len();
            if block_samples == 0 || producer.vacant_len() < block_samples {
                return;
            }
            let must_play = producer.occupied_len() < net.min_fill;
            let Some(playout) = net.jitter.pop(now, must_play) else {
                return;
            };
            let Some(decoder) = net.decoder.as_mut() else {
                return;
            };
            match playout {
                Playout::Block { data, sequence, .. } => {
                    if let Err(e) = decoder.decode(Some(&data), &mut net.decode_buf) {
                        debug!("Block {} from {} failed to decode: {}", sequence, self.endpoint, e);
                        conceal(decoder.as_mut(), &mut net.decode_buf);
                        events.push(
                            Event::Error(ErrorEvent {
                                code: ERROR_DECODE,
                                message: Cow::Owned(format!("failed to decode block {}: {}", sequence, e)),
                            }),
                            ThreadLevel::Network,
                        );
                        net.fade_in = true;
                    } else if net.fade_in {
                        fade_in(&mut net.decode_buf, net.format.as_ref().map_or(1, |f| f.num_channels));
                        net.fade_in = false;
                    }
                    net.jitter.recycle(data);
                }
                Playout::XRun { .. } => {
                    net.decode_buf.fill(0.0);
                    self.counters.xrun.fetch_add(1, Ordering::Relaxed);
                    net.fade_in = true;
                }
                Playout::Lost { sequence } => {
                    trace!("Block {} from {} lost", sequence, self.endpoint);
                    conceal(decoder.as_mut(), &mut net.decode_buf);
                    self.counters.lost.fetch_add(1, Ordering::Relaxed);
                    net.fade_in = true;
                }
            }
            producer.push_slice(&net.decode_buf);
        }
    }
}

/// Whether the peer-declared size of a block is plausible for the stream.
/// Every frame of a block travels in one datagram.
fn block_fits(frame: &DataFrame<'_>, max_block_size: usize) -> bool {
    let total = frame.total_size as usize;
    total <= max_block_size && total <= usize::from(frame.num_frames.max(1)) * MAX_DATAGRAM_SIZE
}

/// Fill `out` with concealment for a missing block, or silence if the
/// decoder cannot conceal
fn conceal(decoder: &mut dyn Decoder, out: &mut [f32]) {
    if decoder.decode(None, out).is_err() {
        out.fill(0.0);
    }
}

/// Linear ramp over one interleaved block
fn fade_in(samples: &mut [f32], channels: u16) {
    let channels = usize::from(channels.max(1));
    let frames = samples.len() / channels;
    if frames == 0 {
        return;
    }
    for (i, frame) in samples.chunks_exact_mut(channels).enumerate() {
        let gain = (i + 1) as f32 / frames as f32;
        for s in frame {
            *s *= gain;
        }
    }
}

/// Receiving endpoint
pub struct Sink {
    id: i32,
    config: SinkConfig,
    codecs: Arc<CodecRegistry>,
    host: Mutex<Option<HostSettings>>,
    sources: RwLock<Vec<Arc<SourceDesc>>>,
    events: EventQueue,
    malformed: AtomicU64,
    next_token: AtomicI32,
    wakeup: Arc<Notify>,
}

impl Sink {
    pub fn new(id: i32, config: SinkConfig, codecs: Arc<CodecRegistry>, events: EventMode) -> Self {
        Self {
            id,
            config: config.validated(),
            codecs,
            host: Mutex::new(None),
            sources: RwLock::new(Vec::new()),
            events: EventQueue::new(events),
            malformed: AtomicU64::new(0),
            next_token: AtomicI32::new(1),
            wakeup: Arc::new(Notify::new()),
        }
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn config(&self) -> &SinkConfig {
        &self.config
    }

    pub fn events(&self) -> &EventQueue {
        &self.events
    }

    pub fn poll_events(&self, f: impl FnMut(Event)) -> usize {
        self.events.poll(f)
    }

    /// Event raised whenever there is something to send
    pub fn wakeup(&self) -> Arc<Notify> {
        self.wakeup.clone()
    }

    /// Datagrams that could not be decoded
    pub fn malformed_count(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }

    /// Tell the sink about the host audio settings. Running streams are
    /// rebuffered.
    pub fn setup(&self, sample_rate: u32, block_size: u32, channels: u16) {
        *self.host.lock() = Some(HostSettings {
            sample_rate,
            block_size,
        });
        debug!(
            "Sink {} setup: {} Hz, block size {}, {} channels",
            self.id, sample_rate, block_size, channels
        );
        self.reset();
    }

    /// Refill every running stream with `latency` of silence
    pub fn reset(&self) {
        let sources = self.sources.read().clone();
        for src in &sources {
            let stream = {
                let net = src.net.lock();
                net.stream_id.zip(net.format.clone())
            };
            if let Some((stream_id, format)) = stream {
                self.configure_stream(src, stream_id, format);
            }
        }
    }

    fn host_settings(&self, format: &Format) -> HostSettings {
        self.host.lock().unwrap_or(HostSettings {
            sample_rate: format.sample_rate,
            block_size: format.block_size,
        })
    }

    /// Build decoder and buffers for a new stream
    fn configure_stream(&self, src: &SourceDesc, stream_id: i32, format: Format) -> bool {
        let decoder = match self
            .codecs
            .get(&format.codec)
            .and_then(|codec| codec.new_decoder(&format))
        {
            Ok(decoder) => decoder,
            Err(e) => {
                warn!("Cannot decode stream from {}: {}", src.endpoint, e);
                self.events.push(
                    Event::Error(ErrorEvent {
                        code: ERROR_DECODE,
                        message: Cow::Owned(e.to_string()),
                    }),
                    ThreadLevel::Network,
                );
                return false;
            }
        };
        let host = self.host_settings(&format);
        let channels = usize::from(format.num_channels);
        let block = format.block_size as usize;
        let nominal_ratio = f64::from(format.sample_rate) / f64::from(host.sample_rate);
        // host block measured in stream frames
        let host_block = (f64::from(host.block_size) * nominal_ratio).ceil() as usize + 1;

        let latency_frames = (self.config.latency * f64::from(format.sample_rate)).ceil() as usize;
        let capacity_frames = latency_frames + 2 * block + 2 * host_block;
        let (mut producer, consumer) = HeapRb::<f32>::new(capacity_frames * channels).split();
        producer.push_iter(std::iter::repeat(0.0).take(latency_frames * channels));

        let blocks_per_sec = f64::from(format.sample_rate) / block as f64;
        let window = self.config.latency
            + f64::from(self.config.resend_limit) * self.config.resend_interval
            + self.config.resend_grace;
        let jitter_blocks = ((window * blocks_per_sec).ceil() as usize + 4)
            .clamp(MIN_JITTER_BLOCKS, MAX_JITTER_BLOCKS);

        let mut audio = src.audio.lock();
        let mut guard = src.net.lock();
        let net = &mut *guard;

        audio.consumer = Some(consumer);
        audio.resampler = DynamicResampler::new(channels, 2 * host_block + 4);
        audio.transfer = vec![0.0; (2 * host_block + 4) * channels];
        audio.output = vec![0.0; host.block_size as usize * channels];
        audio.channels = channels;
        audio.sync = TimeSyncFilter::new(
            f64::from(format.sample_rate),
            f64::from(host.sample_rate),
            self.config.dll_bandwidth,
        );
        audio.nominal_ratio = nominal_ratio;
        audio.local_samples = 0.0;
        audio.underrun = false;

        net.max_block_size = decoder.max_encoded_size();
        net.decoder = Some(decoder);
        net.producer = Some(producer);
        net.queue_capacity = capacity_frames * channels;
        net.min_fill = host_block * channels;
        net.decode_buf = vec![0.0; format.samples_per_block()];
        net.fade_in = true;
        net.jitter = JitterBuffer::with_config(self.config.jitter_config(jitter_blocks));
        net.tracker.reset();
        net.stream_id = Some(stream_id);
        net.format = Some(format);
        net.format_request = false;
        drop(guard);
        drop(audio);
        src.set_state(StreamState::Active);
        true
    }

    fn find_source(&self, endpoint: &Endpoint) -> Option<Arc<SourceDesc>> {
        self.sources
            .read()
            .iter()
            .find(|s| s.endpoint == *endpoint)
            .cloned()
    }

    fn get_or_add_source(&self, endpoint: Endpoint) -> Arc<SourceDesc> {
        if let Some(src) = self.find_source(&endpoint) {
            return src;
        }
        let mut sources = self.sources.write();
        if let Some(src) = sources.iter().find(|s| s.endpoint == endpoint) {
            return src.clone();
        }
        let src = Arc::new(SourceDesc::new(endpoint, self.config.dll_bandwidth, Instant::now()));
        sources.push(src.clone());
        drop(sources);
        debug!("Sink {}: add source {}", self.id, endpoint);
        self.events.push(Event::SourceAdd(endpoint), ThreadLevel::Network);
        src
    }

    /// Register a source ahead of its first message
    pub fn add_source(&self, endpoint: Endpoint) {
        let src = self.get_or_add_source(endpoint);
        if endpoint.relay.is_some() {
            src.net.lock().relay = endpoint.relay;
        }
    }

    /// Forget a source and free its buffers
    pub fn remove_source(&self, endpoint: &Endpoint) -> bool {
        let mut sources = self.sources.write();
        let Some(pos) = sources.iter().position(|s| s.endpoint == *endpoint) else {
            return false;
        };
        sources.remove(pos);
        drop(sources);
        debug!("Sink {}: remove source {}", self.id, endpoint);
        self.events.push(Event::SourceRemove(*endpoint), ThreadLevel::Network);
        true
    }

    /// Remove every source at `addr`, whatever its id
    pub fn remove_sources_at(&self, addr: SocketAddr) -> usize {
        let endpoints: Vec<_> = self
            .sources()
            .into_iter()
            .filter(|e| e.address == addr.into())
            .collect();
        endpoints.iter().filter(|e| self.remove_source(e)).count()
    }

    pub fn remove_all(&self) {
        for endpoint in self.sources() {
            self.remove_source(&endpoint);
        }
    }

    pub fn sources(&self) -> Vec<Endpoint> {
        self.sources.read().iter().map(|s| s.endpoint).collect()
    }

    pub fn stream_state(&self, endpoint: &Endpoint) -> Option<StreamState> {
        self.find_source(endpoint).map(|s| s.state())
    }

    /// Fill level of the sample ring of one stream, 0 to 1
    pub fn buffer_fill_ratio(&self, endpoint: &Endpoint) -> Option<f32> {
        let src = self.find_source(endpoint)?;
        let net = src.net.lock();
        Some(net.buffer_fill())
    }

    pub fn stream_stats(&self, endpoint: &Endpoint) -> Option<StreamStats> {
        let src = self.find_source(endpoint)?;
        let net = src.net.lock();
        Some(StreamStats {
            state: src.state(),
            stream_id: net.stream_id,
            format: net.format.clone(),
            jitter: net.jitter.stats(),
            blocks_received: net.tracker.blocks_received(),
            blocks_lost: net.tracker.blocks_lost(),
            packet_loss: net.tracker.loss_rate(),
            buffer_fill: net.buffer_fill(),
        })
    }

    /// Ask a source to stream to this sink. Returns the invitation token.
    pub fn invite_source(&self, endpoint: Endpoint, metadata: Option<Vec<u8>>) -> i32 {
        let src = self.get_or_add_source(endpoint);
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let mut net = src.net.lock();
        if endpoint.relay.is_some() {
            net.relay = endpoint.relay;
        }
        net.uninvite = None;
        net.invite = Some(PendingRequest::new(token, metadata, Instant::now()));
        drop(net);
        info!("Sink {}: invite {} (token {})", self.id, endpoint, token);
        self.wakeup.notify_one();
        token
    }

    /// Ask a source to stop streaming to this sink
    pub fn uninvite_source(&self, endpoint: &Endpoint) -> bool {
        let Some(src) = self.find_source(endpoint) else {
            return false;
        };
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let mut net = src.net.lock();
        net.invite = None;
        net.uninvite = Some(PendingRequest::new(token, None, Instant::now()));
        drop(net);
        self.wakeup.notify_one();
        true
    }

    pub fn uninvite_all(&self) {
        for endpoint in self.sources() {
            self.uninvite_source(&endpoint);
        }
    }

    /// Audio callback: mix all streams into `outputs` (non-interleaved).
    ///
    /// Returns false if the source table was busy and the output is silence.
    pub fn process(&self, outputs: &mut [&mut [f32]], t: NtpTime) -> bool {
        for channel in outputs.iter_mut() {
            channel.fill(0.0);
        }
        let Some(sources) = self.sources.try_read() else {
            return false;
        };
        let nframes = outputs.first().map_or(0, |c| c.len());
        for src in sources.iter() {
            src.flush_events(&self.events, ThreadLevel::Audio);
            if src.state() == StreamState::Inactive {
                continue;
            }
            let Some(mut audio) = src.audio.try_lock() else {
                continue;
            };
            let ok = audio.mix(outputs, nframes, t, self.config.dynamic_resampling);
            if ok == audio.underrun {
                audio.underrun = !ok;
                if !ok {
                    self.events
                        .push(Event::BufferUnderrun(src.endpoint), ThreadLevel::Audio);
                }
                let state = if ok {
                    StreamState::Active
                } else {
                    StreamState::Buffering
                };
                if src.set_state(state) {
                    self.events.push(
                        Event::StreamState(StreamStateEvent {
                            endpoint: src.endpoint,
                            state,
                        }),
                        ThreadLevel::Audio,
                    );
                }
            }
        }
        self.wakeup.notify_one();
        true
    }

    /// Handle a message addressed to this sink
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
        let result = self.dispatch(data, from, relay);
        if let Err(e) = &result {
            self.malformed.fetch_add(1, Ordering::Relaxed);
            debug!("Sink {}: dropped message from {}: {}", self.id, from, e);
        }
        result
    }

    fn dispatch(&self, data: &[u8], from: SocketAddr, relay: Option<SocketAddr>) -> Result<(), NetworkError> {
        let r = route(data)?;
        if r.target != Target::Sink(self.id) {
            return Err(NetworkError::InvalidPacket);
        }
        if r.cmd.is_empty() {
            let (_, message) = ToSink::decode_binary(data)?;
            return self.handle(message, from, relay);
        }
        let msg = OscMessage::decode(data)?;
        let message = ToSink::decode(r.cmd, &msg)?;
        self.handle(message, from, relay)
    }

    fn handle(&self, message: ToSink<'_>, from: SocketAddr, relay: Option<SocketAddr>) -> Result<(), NetworkError> {
        let endpoint = Endpoint::new(from, message.source_id()).with_relay(relay);
        let now = Instant::now();
        match message {
            ToSink::Start(start) => self.handle_start(endpoint, start, now),
            ToSink::Stop { stream_id, .. } => {
                let Some(src) = self.find_source(&endpoint) else {
                    return Ok(());
                };
                let mut net = src.net.lock();
                net.last_packet = now;
                net.uninvite = None;
                if net.stream_id != Some(stream_id) {
                    return Ok(());
                }
                net.stream_id = None;
                net.jitter.reset();
                drop(net);
                info!("Sink {}: stream {} from {} stopped", self.id, stream_id, endpoint);
                self.events.push(Event::StreamStop(endpoint), ThreadLevel::Network);
                if src.set_state(StreamState::Inactive) {
                    self.events.push(
                        Event::StreamState(StreamStateEvent {
                            endpoint,
                            state: StreamState::Inactive,
                        }),
                        ThreadLevel::Network,
                    );
                }
                Ok(())
            }
            ToSink::Data { frame, .. } => {
                let src = self.get_or_add_source(endpoint);
                let mut guard = src.net.lock();
                let net = &mut *guard;
                net.last_packet = now;
                if relay.is_some() {
                    net.relay = relay;
                }
                if net.stream_id != Some(frame.stream_id) || net.decoder.is_none() {
                    if !net.format_request {
                        trace!("Data for unknown stream {} from {}", frame.stream_id, endpoint);
                        net.format_request = true;
                        self.wakeup.notify_one();
                    }
                    return Ok(());
                }
                if !block_fits(&frame, net.max_block_size) {
                    return Err(NetworkError::malformed(format!(
                        "block of {} bytes in {} frames exceeds the stream limit of {}",
                        frame.total_size, frame.num_frames, net.max_block_size
                    )));
                }
                net.tracker.record(frame.sequence);
                let report = net.jitter.insert(&frame, now);
                src.count(&report);
                src.drain(net, now, &self.events);
                Ok(())
            }
            ToSink::Ping { t1, sample_count, .. } => {
                let t2 = NtpTime::now();
                let Some(src) = self.find_source(&endpoint) else {
                    return Ok(());
                };
                src.audio
                    .lock()
                    .sync
                    .update_remote(sample_count as f64, t1.as_secs_f64());
                let mut net = src.net.lock();
                net.last_packet = now;
                net.pong = Some((t1, t2));
                drop(net);
                self.events.push(
                    Event::SourcePing(SourcePingEvent { endpoint, t1, t2 }),
                    ThreadLevel::Network,
                );
                self.wakeup.notify_one();
                Ok(())
            }
            ToSink::Decline { token, .. } => {
                let Some(src) = self.find_source(&endpoint) else {
                    return Ok(());
                };
                let mut net = src.net.lock();
                if net.invite.as_ref().is_some_and(|i| i.token == token) {
                    net.invite = None;
                    drop(net);
                    info!("Sink {}: invitation declined by {}", self.id, endpoint);
                    self.events.push(Event::InviteDecline(endpoint), ThreadLevel::Network);
                }
                Ok(())
            }
        }
    }

    fn handle_start(&self, endpoint: Endpoint, start: StreamStart<'_>, now: Instant) -> Result<(), NetworkError> {
        if !check_version(&start.version) {
            return Err(NetworkError::VersionMismatch(start.version.into_owned()));
        }
        let mut format = start.format;
        self.codecs.validate(&mut format)?;
        let src = self.get_or_add_source(endpoint);

        let (same_stream, format_changed) = {
            let mut net = src.net.lock();
            net.last_packet = now;
            if endpoint.relay.is_some() {
                net.relay = endpoint.relay;
            }
            net.invite = None;
            (
                net.stream_id == Some(start.stream_id) && net.format.as_ref() == Some(&format),
                net.format.as_ref() != Some(&format),
            )
        };
        if same_stream {
            return Ok(());
        }
        if !self.configure_stream(&src, start.stream_id, format.clone()) {
            return Ok(());
        }
        info!(
            "Sink {}: stream {} from {} ({} {} ch {} Hz)",
            self.id, start.stream_id, endpoint, format.codec, format.num_channels, format.sample_rate
        );
        self.events.push(
            Event::StreamStart(StreamStartEvent {
                endpoint,
                stream_id: start.stream_id,
                metadata: start.metadata.map(Cow::into_owned),
            }),
            ThreadLevel::Network,
        );
        if format_changed {
            self.events.push(
                Event::FormatChange(FormatChangeEvent { endpoint, format }),
                ThreadLevel::Network,
            );
        }
        self.events.push(
            Event::StreamState(StreamStateEvent {
                endpoint,
                state: StreamState::Active,
            }),
            ThreadLevel::Network,
        );
        Ok(())
    }

    /// Do all time-driven work and flush outgoing messages: ping replies,
    /// format requests, resend requests and invitations.
    ///
    /// Also gives up blocks whose deadline has passed and removes sources
    /// that went silent.
    pub fn send<F>(&self, mut send: F)
    where
        F: FnMut(&[u8], &Endpoint) -> Result<(), NetworkError>,
    {
        let now = Instant::now();
        let sources = self.sources.read().clone();
        let mut addr_buf = String::new();
        let mut out = Vec::new();
        let mut timed_out = Vec::new();

        for src in &sources {
            let mut guard = src.net.lock();
            let net = &mut *guard;
            let to = src.reply_endpoint(net);
            let source_id = src.endpoint.id;

            if now.duration_since(net.last_packet).as_secs_f64() >= self.config.source_timeout
                && net.invite.is_none()
            {
                timed_out.push(src.endpoint);
                continue;
            }

            src.drain(net, now, &self.events);

            if let Some((t1, t2)) = net.pong.take() {
                out.clear();
                ToSource::PingReply {
                    sink_id: self.id,
                    t1,
                    t2,
                    packet_loss: net.tracker.take_interval_loss(),
                }
                .encode(source_id, &mut addr_buf, &mut out);
                log_send_error(send(&out, &to), &to);
            }

            if net.format_request {
                let due = net
                    .last_format_request
                    .map_or(true, |t| now.duration_since(t).as_secs_f64() >= REQUEST_INTERVAL);
                if due {
                    net.last_format_request = Some(now);
                    net.format_request = false;
                    out.clear();
                    ToSource::FormatRequest {
                        sink_id: self.id,
                        version: Cow::Owned(version_string()),
                    }
                    .encode(source_id, &mut addr_buf, &mut out);
                    log_send_error(send(&out, &to), &to);
                    debug!("Sink {}: format request to {}", self.id, to);
                }
            }

            if let Some(stream_id) = net.stream_id {
                net.requests.clear();
                if net.jitter.collect_resend_requests(now, &mut net.requests) > 0 {
                    out.clear();
                    ToSource::DataRequest {
                        sink_id: self.id,
                        stream_id,
                        requests: Cow::Borrowed(&net.requests),
                    }
                    .encode(source_id, &mut addr_buf, &mut out);
                    log_send_error(send(&out, &to), &to);
                    trace!("Sink {}: {} resend requests to {}", self.id, net.requests.len(), to);
                }
            }

            if let Some(invite) = net.invite.as_mut() {
                if invite.expired(now, self.config.invite_timeout) {
                    net.invite = None;
                    warn!("Sink {}: invitation to {} timed out", self.id, to);
                    self.events.push(Event::InviteTimeout(src.endpoint), ThreadLevel::Network);
                } else if invite.due(now) {
                    invite.last_sent = Some(now);
                    out.clear();
                    ToSource::Invite {
                        sink_id: self.id,
                        token: invite.token,
                        metadata: invite.metadata.as_deref().map(Cow::Borrowed),
                    }
                    .encode(source_id, &mut addr_buf, &mut out);
                    log_send_error(send(&out, &to), &to);
                }
            }

            if let Some(uninvite) = net.uninvite.as_mut() {
                if uninvite.expired(now, self.config.invite_timeout) {
                    net.uninvite = None;
                    warn!("Sink {}: uninvitation to {} timed out", self.id, to);
                    self.events.push(Event::UninviteTimeout(src.endpoint), ThreadLevel::Network);
                } else if uninvite.due(now) {
                    uninvite.last_sent = Some(now);
                    out.clear();
                    ToSource::Uninvite {
                        sink_id: self.id,
                        token: uninvite.token,
                    }
                    .encode(source_id, &mut addr_buf, &mut out);
                    log_send_error(send(&out, &to), &to);
                }
            }
        }

        for endpoint in &timed_out {
            info!("Sink {}: source {} timed out", self.id, endpoint);
            self.remove_source(endpoint);
        }
    }
}

fn log_send_error(result: Result<(), NetworkError>, to: &Endpoint) {
    if let Err(e) = result {
        debug!("Send to {} failed: {}", to, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{pcm_format, BitDepth, CodecError};

    const SOURCE_ID: i32 = 3;

    fn from() -> SocketAddr {
        "127.0.0.1:9100".parse().unwrap()
    }

    fn endpoint() -> Endpoint {
        Endpoint::new(from(), SOURCE_ID)
    }

    fn sink(config: SinkConfig) -> Sink {
        let sink = Sink::new(
            1,
            config,
            Arc::new(CodecRegistry::with_defaults()),
            EventMode::Poll { capacity: 1024 },
        );
        sink.setup(48000, 64, 1);
        sink
    }

    fn start_message(stream_id: i32) -> Vec<u8> {
        let mut out = Vec::new();
        ToSink::Start(StreamStart {
            source_id: SOURCE_ID,
            version: Cow::Owned(version_string()),
            stream_id,
            format: pcm_format(1, 48000, 64, BitDepth::Float32),
            metadata: None,
        })
        .encode(1, &mut String::new(), &mut out);
        out
    }

    fn data_message(stream_id: i32, sequence: i32, value: f32) -> Vec<u8> {
        let payload: Vec<u8> = std::iter::repeat(value.to_be_bytes())
            .take(64)
            .flatten()
            .collect();
        let frame = DataFrame {
            stream_id,
            sequence,
            sample_rate: 0.0,
            total_size: payload.len() as u32,
            num_frames: 1,
            frame_index: 0,
            xrun: false,
            payload: &payload,
        };
        let mut out = Vec::new();
        ToSink::encode_binary_data(1, SOURCE_ID, &frame, &mut out);
        out
    }

    fn sent_messages(sink: &Sink) -> Vec<Vec<u8>> {
        let mut packets = Vec::new();
        sink.send(|data, to| {
            assert_eq!(to.socket_addr(), from());
            packets.push(data.to_vec());
            Ok(())
        });
        packets
    }

    fn config() -> SinkConfig {
        SinkConfig {
            dynamic_resampling: false,
            ..Default::default()
        }
    }

    #[test]
    fn test_unknown_stream_requests_format() {
        let sink = sink(config());
        sink.handle_message(&data_message(5, 0, 0.5), from()).unwrap();
        let events = sink.events().drain();
        assert!(matches!(events[0], Event::SourceAdd(e) if e == endpoint()));

        let packets = sent_messages(&sink);
        assert_eq!(packets.len(), 1);
        let r = route(&packets[0]).unwrap();
        assert_eq!(r.target, Target::Source(SOURCE_ID));
        assert_eq!(r.cmd, "start");
    }

    #[test]
    fn test_stream_start_events() {
        let sink = sink(config());
        sink.handle_message(&start_message(9), from()).unwrap();
        let events = sink.events().drain();
        assert!(events.iter().any(|e| matches!(e, Event::StreamStart(s) if s.stream_id == 9)));
        assert!(events.iter().any(|e| matches!(e, Event::FormatChange(_))));
        assert_eq!(sink.stream_state(&endpoint()), Some(StreamState::Active));

        // repeated announcement of the same stream is ignored
        sink.handle_message(&start_message(9), from()).unwrap();
        assert!(sink.events().drain().is_empty());
    }

    #[test]
    fn test_playout_after_latency() {
        let sink = sink(SinkConfig {
            latency: 0.004,
            ..config()
        });
        sink.handle_message(&start_message(1), from()).unwrap();
        for seq in 0..4 {
            sink.handle_message(&data_message(1, seq, 0.25), from()).unwrap();
        }
        let mut out = vec![0.0f32; 64];
        let mut t = NtpTime::now();
        let mut heard = false;
        for _ in 0..6 {
            assert!(sink.process(&mut [&mut out[..]], t));
            sink.send(|_, _| Ok(()));
            if out.iter().any(|&s| (s - 0.25).abs() < 1e-6) {
                heard = true;
            }
            t = t.add_secs(64.0 / 48000.0);
        }
        assert!(heard);
    }

    #[test]
    fn test_stop_makes_stream_inactive() {
        let sink = sink(config());
        sink.handle_message(&start_message(2), from()).unwrap();
        let mut stop = Vec::new();
        ToSink::Stop {
            source_id: SOURCE_ID,
            stream_id: 2,
        }
        .encode(1, &mut String::new(), &mut stop);
        sink.handle_message(&stop, from()).unwrap();
        assert_eq!(sink.stream_state(&endpoint()), Some(StreamState::Inactive));
        assert!(sink
            .events()
            .drain()
            .iter()
            .any(|e| matches!(e, Event::StreamStop(_))));
    }

    #[test]
    fn test_ping_gets_reply() {
        let sink = sink(config());
        sink.handle_message(&start_message(2), from()).unwrap();
        let t1 = NtpTime::now();
        let mut ping = Vec::new();
        ToSink::Ping {
            source_id: SOURCE_ID,
            t1,
            sample_count: 0,
        }
        .encode(1, &mut String::new(), &mut ping);
        sink.handle_message(&ping, from()).unwrap();

        let packets = sent_messages(&sink);
        let reply = packets
            .iter()
            .find(|p| route(p).map(|r| r.cmd == "ping").unwrap_or(false))
            .unwrap();
        let msg = OscMessage::decode(reply).unwrap();
        match ToSource::decode("ping", &msg).unwrap() {
            ToSource::PingReply { t1: echoed, t2, .. } => {
                assert_eq!(echoed, t1);
                assert!(NtpTime::duration(t1, t2) >= 0.0);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_invite_times_out_once() {
        let sink = sink(SinkConfig {
            invite_timeout: 0.02,
            ..config()
        });
        sink.invite_source(endpoint(), None);
        let packets = sent_messages(&sink);
        assert_eq!(route(&packets[0]).unwrap().cmd, "invite");
        std::thread::sleep(std::time::Duration::from_millis(30));
        sent_messages(&sink);
        sent_messages(&sink);
        let timeouts = sink
            .events()
            .drain()
            .into_iter()
            .filter(|e| matches!(e, Event::InviteTimeout(_)))
            .count();
        assert_eq!(timeouts, 1);
    }

    #[test]
    fn test_malformed_counted() {
        let sink = sink(config());
        assert!(sink.handle_message(&[0x80, 0x00], from()).is_err());
        assert!(sink.handle_message(b"garbage", from()).is_err());
        assert_eq!(sink.malformed_count(), 2);
    }

    fn forged_message(stream_id: i32, total_size: u32, num_frames: u16) -> Vec<u8> {
        let payload = [0u8; 10];
        let frame = DataFrame {
            stream_id,
            sequence: 0,
            sample_rate: 0.0,
            total_size,
            num_frames,
            frame_index: num_frames - 1,
            xrun: false,
            payload: &payload,
        };
        let mut out = Vec::new();
        ToSink::encode_binary_data(1, SOURCE_ID, &frame, &mut out);
        out
    }

    #[test]
    fn test_oversized_block_rejected() {
        let sink = sink(config());
        sink.handle_message(&start_message(1), from()).unwrap();
        assert!(sink.handle_message(&forged_message(1, 1 << 30, 2), from()).is_err());
        // One frame larger than the 256 byte Float32 block
        assert!(sink.handle_message(&forged_message(1, 257, 1), from()).is_err());
        assert_eq!(sink.malformed_count(), 2);
        let stats = sink.stream_stats(&endpoint()).unwrap();
        assert_eq!(stats.jitter.frames_inserted, 0);
        assert_eq!(stats.jitter.current_depth, 0);
        assert_eq!(stats.blocks_received, 0);

        sink.handle_message(&data_message(1, 0, 0.5), from()).unwrap();
        let stats = sink.stream_stats(&endpoint()).unwrap();
        assert_eq!(stats.jitter.frames_inserted, 1);
        assert_eq!(sink.malformed_count(), 2);
    }

    #[test]
    fn test_block_fits_datagram_bound() {
        let payload = [0u8; 4];
        let mut frame = DataFrame {
            stream_id: 1,
            sequence: 0,
            sample_rate: 0.0,
            total_size: (MAX_DATAGRAM_SIZE + 1) as u32,
            num_frames: 1,
            frame_index: 0,
            xrun: false,
            payload: &payload,
        };
        assert!(!block_fits(&frame, usize::MAX));
        frame.num_frames = 2;
        assert!(block_fits(&frame, usize::MAX));
        assert!(!block_fits(&frame, MAX_DATAGRAM_SIZE));
    }

    struct BrokenDecoder(Format);

    impl Decoder for BrokenDecoder {
        fn format(&self) -> &Format {
            &self.0
        }

        fn max_encoded_size(&self) -> usize {
            0
        }

        fn decode(&mut self, _: Option<&[u8]>, _: &mut [f32]) -> Result<usize, CodecError> {
            Err(CodecError::DecodeFailed("broken".into()))
        }
    }

    #[test]
    fn test_conceal_falls_back_to_silence() {
        let mut decoder = BrokenDecoder(pcm_format(1, 48000, 64, BitDepth::Float32));
        let mut block = vec![0.75f32; 64];
        conceal(&mut decoder, &mut block);
        assert!(block.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_fade_in_ramp() {
        let mut block = vec![1.0f32; 8];
        fade_in(&mut block, 2);
        assert_eq!(block[0], 0.25);
        assert_eq!(block[1], 0.25);
        assert_eq!(block[7], 1.0);
    }

    #[test]
    fn test_source_timeout_removes() {
        let sink = sink(SinkConfig {
            source_timeout: 0.01,
            ..config()
        });
        sink.handle_message(&start_message(1), from()).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        sent_messages(&sink);
        assert!(sink.sources().is_empty());
        assert!(sink
            .events()
            .drain()
            .iter()
            .any(|e| matches!(e, Event::SourceRemove(_))));
    }
}

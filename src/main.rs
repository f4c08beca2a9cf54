//! jamlink - peer-to-peer audio streaming peer
//!
//! Connects to a group server, joins a group and streams a test tone to
//! every other member while playing back whatever they send. The audio
//! clock is simulated, so no sound device is needed.

use std::f32::consts::TAU;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

use jamlink::audio::{pcm_format, BitDepth, CodecRegistry, Format};
use jamlink::events::{Event, EventMode};
use jamlink::network::{
    Client, ClientConfig, JoinRequest, Sink, SinkConfig, Source, SourceConfig, DEFAULT_PORT,
};
use jamlink::time::NtpTime;

#[derive(Parser, Debug)]
#[command(name = "jamlink")]
#[command(about = "Low-latency peer-to-peer audio streaming")]
#[command(version)]
struct Cli {
    /// Server host name or address
    #[arg(long, default_value = "localhost", env = "JAMLINK_SERVER")]
    server: String,

    /// Server port
    #[arg(long, default_value_t = DEFAULT_PORT, env = "JAMLINK_PORT")]
    port: u16,

    /// Server password
    #[arg(long, default_value = "", env = "JAMLINK_PASSWORD")]
    password: String,

    /// Group to join
    #[arg(short, long)]
    group: String,

    /// Group password
    #[arg(long, default_value = "")]
    group_password: String,

    /// User name within the group
    #[arg(short, long)]
    user: String,

    /// Frequency of the test tone in Hz (0 sends silence)
    #[arg(long, default_value_t = 440.0)]
    tone: f32,

    /// Sample rate in Hz
    #[arg(long, default_value_t = 48000)]
    sample_rate: u32,

    /// Frames per audio block
    #[arg(long, default_value_t = 256)]
    block_size: u32,

    /// Codec name ("pcm", or "opus" when built with opus support)
    #[arg(long, default_value = "pcm")]
    codec: String,

    /// Sink latency in milliseconds
    #[arg(long, default_value_t = 50.0)]
    latency: f64,

    /// Local UDP port (0 picks a free one)
    #[arg(long, default_value_t = 0)]
    local_port: u16,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn setup_logging(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("jamlink={}", level)));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn stream_format(cli: &Cli) -> Format {
    if cli.codec == "pcm" {
        pcm_format(1, cli.sample_rate, cli.block_size, BitDepth::Float32)
    } else {
        Format::new(&cli.codec, 1, cli.sample_rate, cli.block_size)
    }
}

fn log_event(origin: &str, event: Event) {
    match event {
        Event::PeerHandshake(e) => info!("[{}] handshake with {} ({})", origin, e.user_name, e.group_name),
        Event::PeerJoin(e) => info!(
            "[{}] {} joined at {:?}{}",
            origin,
            e.user_name,
            e.address,
            if e.relayed { " (relayed)" } else { "" }
        ),
        Event::PeerLeave(e) => info!("[{}] {} left", origin, e.user_name),
        Event::PeerTimeout(e) => warn!("[{}] {} could not be reached", origin, e.user_name),
        Event::PeerPing(e) => info!("[{}] user {} rtt {:.1} ms", origin, e.user_id, e.rtt * 1000.0),
        Event::PeerMessage(e) => info!(
            "[{}] message from user {}: {}",
            origin,
            e.user_id,
            String::from_utf8_lossy(&e.data)
        ),
        Event::Disconnect { reason } => warn!("[{}] disconnected: {}", origin, reason.unwrap_or_default()),
        Event::SinkPing(e) => info!("[{}] sink rtt {:.1} ms", origin, e.rtt * 1000.0),
        Event::BlockLost(e) => warn!("[{}] {} block(s) lost from {}", origin, e.count, e.endpoint),
        other => info!("[{}] {:?}", origin, other.event_type()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let codecs = Arc::new(CodecRegistry::with_defaults());
    let format = stream_format(&cli);

    let client = Client::new(
        ClientConfig {
            port: cli.local_port,
            ..Default::default()
        },
        EventMode::default(),
    )
    .await?;
    info!("Listening on UDP {}", client.local_addr());
    let runner = tokio::spawn(client.clone().run());

    let source = Arc::new(Source::new(0, SourceConfig::default(), codecs.clone(), EventMode::default()));
    source.setup(cli.sample_rate, cli.block_size, 1)?;
    source
        .set_format(format)
        .context("unsupported stream format")?;
    let sink = Arc::new(Sink::new(
        0,
        SinkConfig {
            latency: cli.latency / 1000.0,
            ..Default::default()
        },
        codecs,
        EventMode::default(),
    ));
    sink.setup(cli.sample_rate, cli.block_size, 1);
    client.add_source(source.clone());
    client.add_sink(sink.clone());

    let login = client
        .connect_async(&cli.server, cli.port, &cli.password, None)
        .await
        .with_context(|| format!("cannot log in to {}:{}", cli.server, cli.port))?;
    info!("Logged in as client {}", login.client_id);

    let mut join = JoinRequest::new(cli.group.clone(), cli.user.clone());
    join.group_password = cli.group_password.clone();
    let group = client
        .join_group_async(join)
        .await
        .with_context(|| format!("cannot join group '{}'", cli.group))?;
    info!("Joined '{}' as user {}", cli.group, group.user_id);

    source.start(None)?;

    let block = cli.block_size as usize;
    let period = Duration::from_secs_f64(f64::from(cli.block_size) / f64::from(cli.sample_rate));
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);
    let mut input = vec![0.0f32; block];
    let mut output = vec![0.0f32; block];
    let mut phase = 0.0f32;
    let step = cli.tone / cli.sample_rate as f32;
    let mut t = NtpTime::now();
    let mut blocks = 0u64;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                break;
            }
            _ = ticker.tick() => {
                for sample in input.iter_mut() {
                    *sample = 0.25 * (TAU * phase).sin();
                    phase = (phase + step).fract();
                }
                source.process(&[input.as_slice()], t);
                sink.process(&mut [output.as_mut_slice()], t);
                t = t.add_secs(period.as_secs_f64());
                blocks += 1;

                if blocks % 200 == 0 {
                    let rms = (output.iter().map(|s| s * s).sum::<f32>() / block as f32).sqrt();
                    info!("Output level {:.3} RMS", rms);
                }
                client.poll_events(|e| log_event("client", e));
                source.poll_events(|e| log_event("source", e));
                sink.poll_events(|e| log_event("sink", e));
            }
        }
    }

    source.stop();
    if let Err(e) = client.leave_group_async(group.group_id).await {
        warn!("Leaving group failed: {}", e);
    }
    client.stop();
    runner.await??;
    Ok(())
}

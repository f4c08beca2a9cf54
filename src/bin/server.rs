//! Standalone group server
//!
//! Run with:
//!   cargo run --bin jamlink-server -- --port 7078 --relay

use clap::Parser;
use tracing::{info, Level};

use jamlink::events::{Event, EventMode, ThreadLevel};
use jamlink::network::{Server, ServerConfig, SocketFamily, DEFAULT_PORT};

/// Group and relay server for jamlink peers
#[derive(Parser, Debug)]
#[command(name = "jamlink-server")]
#[command(about = "Group and relay server for jamlink peers")]
#[command(version)]
struct Args {
    /// Port to listen on (TCP and UDP)
    #[arg(short, long, default_value_t = DEFAULT_PORT, env = "JAMLINK_PORT")]
    port: u16,

    /// Password clients must log in with
    #[arg(long, env = "JAMLINK_PASSWORD")]
    password: Option<String>,

    /// Relay UDP traffic between peers that cannot reach each other
    #[arg(long)]
    relay: bool,

    /// Reject joins to groups that do not exist yet
    #[arg(long)]
    no_auto_create: bool,

    /// Keep groups (and their users) when the last member leaves
    #[arg(long)]
    persistent_groups: bool,

    /// Listen on IPv4 only
    #[arg(long)]
    ipv4: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn describe(event: &Event) -> Option<String> {
    Some(match event {
        Event::ClientLogin(e) => format!(
            "client {} at {} {}",
            e.client_id,
            e.address,
            if e.accepted { "logged in" } else { "rejected" }
        ),
        Event::ClientLogout { client_id } => format!("client {} logged out", client_id),
        Event::GroupAdd(e) => format!("group {} '{}' created", e.group_id, e.name),
        Event::GroupRemove(e) => format!("group {} '{}' removed", e.group_id, e.name),
        Event::GroupJoin(e) => format!("{} joined group {}", e.user_name, e.group_id),
        Event::GroupLeave(e) => format!("{} left group {}", e.user_name, e.group_id),
        _ => return None,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .init();

    let config = ServerConfig {
        port: args.port,
        family: if args.ipv4 {
            SocketFamily::Ipv4
        } else {
            SocketFamily::DualStack
        },
        password: args.password,
        group_auto_create: !args.no_auto_create,
        persistent_groups: args.persistent_groups,
        server_relay: args.relay,
    };

    let events = EventMode::Callback(std::sync::Arc::new(|event: &Event, _level: ThreadLevel| {
        if let Some(text) = describe(event) {
            info!("{}", text);
        }
    }));
    let server = Server::bind(config, events).await?;
    info!(
        "jamlink server listening on {} (tcp) and {} (udp)",
        server.tcp_addr(),
        server.udp_addr()
    );

    let handle = server.handle();
    let task = tokio::spawn(server.run());

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    if let Ok(stats) = handle.stats().await {
        info!(
            "{} client(s), {} group(s), {} member(s)",
            stats.clients, stats.groups, stats.members
        );
    }
    handle.stop();
    task.await??;
    Ok(())
}

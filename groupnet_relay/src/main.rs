// CLI entry point for the groupnet relay.
//
// Starts a standalone relay that game peers connect to. The relay groups
// peers and forwards their messages; it never runs game logic. See
// `server.rs` for the networking architecture and `registry.rs` for the
// shared group state.
//
// Usage:
//   relay (-g <GROUP>... | -f <FILE>) [OPTIONS]
//     -g, --groups <GROUP>...      Groups peers may join
//     -f, --file <FILE>            Read groups from a file (one per line)
//     -i, --interface <ADDR>       Interface to bind (default: all)
//     -p, --port <PORT>            Listen port (default: 65042)
//     -n, --names <FILE>           Candidate names for unnamed peers
//     --idle-timeout <SECS>        Drop silent peers (0 disables, default 5)
//     --status-interval <SECS>     Membership report period (default 5)
//
// Log verbosity follows `RUST_LOG` (default `info`).

use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{ArgGroup, Parser};
use groupnet_protocol::DEFAULT_PORT;
use groupnet_relay::config::load_list;
use groupnet_relay::server::{RelayConfig, start_relay};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "relay", about = "Message relay for small multiplayer games")]
#[command(group(ArgGroup::new("group_source").required(true).args(["groups", "file"])))]
struct Args {
    /// Groups peers may join, separated by spaces.
    #[arg(short = 'g', long, num_args = 1..)]
    groups: Vec<String>,

    /// File listing groups, one per line. Lines starting with # are ignored.
    #[arg(short = 'f', long)]
    file: Option<PathBuf>,

    /// Interface address to bind to.
    #[arg(short = 'i', long, default_value = "0.0.0.0")]
    interface: String,

    /// Port to bind to.
    #[arg(short = 'p', long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// File of candidate names for peers that do not choose one.
    #[arg(short = 'n', long)]
    names: Option<PathBuf>,

    /// Seconds of silence before a peer is dropped (0 disables).
    #[arg(long, default_value_t = 5)]
    idle_timeout: u64,

    /// Seconds between membership reports in the log.
    #[arg(long, default_value_t = 5)]
    status_interval: u64,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = build_config(&args)?;

    let (handle, addr) = start_relay(config).context("failed to start relay")?;
    info!(%addr, "relay ready, press Ctrl+C to stop");

    // The process exits on SIGINT/SIGTERM; connection threads die with it.
    let interval = Duration::from_secs(args.status_interval.max(1));
    loop {
        thread::sleep(interval);
        let registry = handle.registry();
        for group in registry.group_names() {
            let members = registry.peer_names(&group, None);
            if !members.is_empty() {
                info!(group = %group, count = members.len(), ?members, "group status");
            }
        }
    }
}

fn build_config(args: &Args) -> anyhow::Result<RelayConfig> {
    let groups = match &args.file {
        Some(path) => load_list(path)
            .with_context(|| format!("reading group file {}", path.display()))?,
        None => args.groups.clone(),
    };
    if groups.is_empty() {
        bail!("no groups given");
    }

    let name_pool = match &args.names {
        Some(path) => {
            let names = load_list(path)
                .with_context(|| format!("reading name file {}", path.display()))?;
            info!(count = names.len(), "loaded candidate names");
            Some(names)
        }
        None => None,
    };

    Ok(RelayConfig {
        host: args.interface.clone(),
        port: args.port,
        groups,
        name_pool,
        idle_timeout: (args.idle_timeout > 0).then(|| Duration::from_secs(args.idle_timeout)),
        ..RelayConfig::default()
    })
}

//! CLOB lifecycle node - entry point.
//!
//! Replays a JSON block script against the reference collaborators and prints
//! one JSON report per committed block.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

use clob_keeper::keys::ALL_PREFIXES;
use clob_node::{replay, BlockScript, Node, NodeConfig};
use clob_telemetry::Metrics;

/// CLOB order-lifecycle replay node
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file path (can also be set via CLOB_CONFIG env var)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// JSON block script to replay
    #[arg(short, long)]
    blocks: PathBuf,

    /// Snapshot file; overrides `snapshot_path` from the config
    #[arg(long)]
    snapshot: Option<PathBuf>,

    /// Print every keyspace as hex after the replay
    #[arg(long)]
    dump: bool,

    /// Print Prometheus metrics after the replay
    #[arg(long)]
    metrics: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    clob_telemetry::init_logging()?;

    info!("Starting clob-node v{}", env!("CARGO_PKG_VERSION"));

    // CLI arg > CLOB_CONFIG env var > defaults
    let config_path = args
        .config
        .or_else(|| std::env::var("CLOB_CONFIG").ok().map(PathBuf::from));
    let mut config = match config_path {
        Some(path) => {
            info!(config_path = %path.display(), "Loading configuration");
            NodeConfig::from_file(&path)?
        }
        None => {
            info!("No configuration file given, using defaults");
            NodeConfig::default()
        }
    };
    if let Some(snapshot) = args.snapshot {
        config.snapshot_path = Some(snapshot);
    }

    let script = BlockScript::from_file(&args.blocks)?;
    info!(
        blocks = script.blocks.len(),
        markets = script.markets.len(),
        "Block script loaded"
    );

    let (book, mut oracle, mut collateral) = script.build_sim();
    let mut node = Node::new(config, book)?;
    let reports = replay(&mut node, &script.blocks, &mut oracle, &mut collateral)?;
    for report in &reports {
        println!("{}", serde_json::to_string(report)?);
    }

    if args.dump {
        for (name, prefix) in ALL_PREFIXES {
            for line in node.keeper().store().dump_prefix(prefix) {
                println!("{name} {line}");
            }
        }
    }

    if args.metrics {
        print!("{}", Metrics::render()?);
    }

    info!(height = node.last_height(), "Replay complete");
    Ok(())
}

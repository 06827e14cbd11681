//! lindad — replicated tuple-space coordination service.
//!
//! Starts one cluster node: consensus transport, client session
//! front-end and worker loop. Without `--join` the node bootstraps a
//! fresh single-node cluster; with `--join` it announces itself to the
//! seed and is added as a voter.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::error::ErrorKind;
use clap::Parser;
use lindad::node::{Node, NodeConfig};
use tracing::{error, info};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "lindad", version, about = "Replicated tuple-space coordination service")]
struct Args {
    /// Directory for consensus-managed state
    #[arg(value_name = "raft-data-path")]
    data_path: PathBuf,

    /// Client-facing TCP bind address
    #[arg(long, default_value = "localhost:11000")]
    haddr: String,

    /// Consensus transport bind address
    #[arg(long, default_value = "localhost:12000")]
    raddr: String,

    /// Seed address of an existing cluster to join
    #[arg(long)]
    join: Option<String>,

    /// Node id (defaults to the transport bind address)
    #[arg(long)]
    id: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("lindad=info".parse().expect("valid directive")),
        )
        .init();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            err.print().ok();
            return match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
                _ => ExitCode::from(1),
            };
        }
    };
    let config = NodeConfig {
        data_dir: args.data_path,
        haddr: args.haddr,
        raddr: args.raddr.clone(),
        id: args.id.unwrap_or(args.raddr),
        join: args.join,
    };

    info!("lindad v{}", VERSION);

    let node = match Node::start(config).await {
        Ok(node) => node,
        Err(err) => {
            error!(%err, "failed to start node");
            return ExitCode::from(1);
        }
    };

    tokio::signal::ctrl_c().await.ok();
    info!("shutting down...");
    node.shutdown().await;
    ExitCode::SUCCESS
}

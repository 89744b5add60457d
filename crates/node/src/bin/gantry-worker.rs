// Path: crates/node/src/bin/gantry-worker.rs
#![forbid(unsafe_code)]

//! The Gantry worker (agent) binary.

use clap::Parser;
use gantry_types::config::WorkerConfig;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "gantry-worker", version, about = "Gantry data-plane agent")]
struct WorkerOpts {
    /// Path to the worker.toml configuration file.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Override the configured data directory.
    #[arg(long)]
    data_dir: Option<PathBuf>,
    /// Override the configured controller URL.
    #[arg(long, env = "GANTRY_MASTER_URL")]
    master_url: Option<String>,
    /// Override the configured data-plane listen address.
    #[arg(long)]
    data_address: Option<String>,
    /// Override the configured enrollment token.
    #[arg(long, env = "GANTRY_ENROLLMENT_TOKEN")]
    enrollment_token: Option<String>,
    /// Redeem a pairing code against the given peer URL, then exit.
    #[arg(long, requires = "pair_code")]
    pair_with: Option<String>,
    /// The 6-character code shown on the peer.
    #[arg(long, requires = "pair_with")]
    pair_code: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = WorkerOpts::parse();
    let mut config: WorkerConfig = gantry_node::load_config(opts.config.as_deref())?;
    if let Some(data_dir) = opts.data_dir {
        config.node.data_dir = data_dir;
    }
    if let Some(master_url) = opts.master_url {
        config.master_url = master_url;
    }
    if let Some(data_address) = opts.data_address {
        config.data_address = data_address;
    }
    if opts.enrollment_token.is_some() {
        config.enrollment_token = opts.enrollment_token;
    }

    gantry_telemetry::init_tracing(&config.node.log_level)?;

    if let (Some(peer_url), Some(code)) = (&opts.pair_with, &opts.pair_code) {
        return gantry_worker::server::pair_with(&config, peer_url, code).await;
    }

    let cancel = gantry_node::shutdown_token();
    gantry_worker::run_worker(config, cancel).await
}

// Path: crates/node/src/bin/gantry-master.rs
#![forbid(unsafe_code)]

//! The Gantry controller binary.

use clap::Parser;
use gantry_types::config::MasterConfig;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "gantry-master", version, about = "Gantry fleet controller")]
struct MasterOpts {
    /// Path to the master.toml configuration file.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Override the configured data directory.
    #[arg(long)]
    data_dir: Option<PathBuf>,
    /// Override the configured gRPC listen address.
    #[arg(long, env = "GANTRY_LISTEN_ADDR")]
    listen_addr: Option<String>,
    /// Override the configured enrollment token.
    #[arg(long, env = "GANTRY_ENROLLMENT_TOKEN")]
    enrollment_token: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = MasterOpts::parse();
    let mut config: MasterConfig = gantry_node::load_config(opts.config.as_deref())?;
    if let Some(data_dir) = opts.data_dir {
        config.node.data_dir = data_dir;
    }
    if let Some(listen_addr) = opts.listen_addr {
        config.listen_addr = listen_addr;
    }
    if opts.enrollment_token.is_some() {
        config.enrollment_token = opts.enrollment_token;
    }

    gantry_telemetry::init_tracing(&config.node.log_level)?;

    let cancel = gantry_node::shutdown_token();
    gantry_master::run_master(config, cancel).await
}

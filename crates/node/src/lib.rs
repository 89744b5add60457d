// Path: crates/node/src/lib.rs
//! Shared plumbing for the Gantry binaries: configuration file loading
//! and the ctrl-c cancellation bridge.

use serde::de::DeserializeOwned;
use std::path::Path;
use tokio_util::sync::CancellationToken;

/// Loads a TOML configuration file; absent path yields the default.
pub fn load_config<T: DeserializeOwned + Default>(path: Option<&Path>) -> anyhow::Result<T> {
    match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .map_err(|e| anyhow::anyhow!("reading {}: {e}", path.display()))?;
            toml::from_str(&raw).map_err(|e| anyhow::anyhow!("parsing {}: {e}", path.display()))
        }
        None => Ok(T::default()),
    }
}

/// A cancellation token fired on ctrl-c.
pub fn shutdown_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received; shutting down");
            trigger.cancel();
        }
    });
    cancel
}

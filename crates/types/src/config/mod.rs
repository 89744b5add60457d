// Path: crates/types/src/config/mod.rs
//! Configuration structures for the master and worker binaries.
//!
//! Both binaries read a TOML file and apply CLI overrides on top. Every
//! field has a serde default so a minimal file (or none at all) yields a
//! runnable configuration.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Settings shared by every node role.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Root directory for certs, checkpoints, resources and node state.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Initial chunk size in bytes, before dynamic sizing kicks in.
    #[serde(default = "default_chunk_size")]
    pub chunk_size_default: usize,
    /// Simultaneous transfers per migration.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Upper bound on a single resource transfer.
    #[serde(default = "default_transfer_timeout_secs")]
    pub transfer_timeout_secs: u64,
    /// Attempts before a paused transfer is reported to the operator.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Initial retry backoff in seconds.
    #[serde(default = "default_retry_backoff_secs")]
    pub retry_backoff_secs: u64,
    /// Retry backoff ceiling in seconds.
    #[serde(default = "default_retry_max_backoff_secs")]
    pub retry_max_backoff_secs: u64,
    /// Whether the end-of-transfer SHA-256 digests are compared.
    #[serde(default = "default_verify_checksums")]
    pub verify_checksums: bool,
    /// Log filter when RUST_LOG is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/gantry")
}
fn default_chunk_size() -> usize {
    1024 * 1024
}
fn default_max_concurrent() -> usize {
    4
}
fn default_transfer_timeout_secs() -> u64 {
    3600
}
fn default_max_retries() -> u32 {
    5
}
fn default_retry_backoff_secs() -> u64 {
    2
}
fn default_retry_max_backoff_secs() -> u64 {
    60
}
fn default_verify_checksums() -> bool {
    true
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            chunk_size_default: default_chunk_size(),
            max_concurrent: default_max_concurrent(),
            transfer_timeout_secs: default_transfer_timeout_secs(),
            max_retries: default_max_retries(),
            retry_backoff_secs: default_retry_backoff_secs(),
            retry_max_backoff_secs: default_retry_max_backoff_secs(),
            verify_checksums: default_verify_checksums(),
            log_level: default_log_level(),
        }
    }
}

/// Settings for the controller process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterConfig {
    /// Role-independent settings.
    #[serde(default, flatten)]
    pub node: NodeConfig,
    /// gRPC listen endpoint for registration, control streams and relay.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// URL workers use to dial this controller for relayed channels.
    /// Derived from the bound listen address when unset.
    #[serde(default)]
    pub advertise_url: Option<String>,
    /// Enrollment token required at first registration. Generated and
    /// persisted on first start when unset.
    #[serde(default)]
    pub enrollment_token: Option<String>,
    /// Liveness window in seconds.
    #[serde(default = "default_worker_timeout_secs")]
    pub worker_timeout_secs: u64,
    /// Heartbeat interval handed to workers at registration, seconds.
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    /// Inventory interval handed to workers at registration, seconds.
    #[serde(default = "default_inventory_interval_secs")]
    pub inventory_interval_secs: u64,
    /// Registration capacity.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
}

fn default_listen_addr() -> String {
    "0.0.0.0:7710".to_string()
}
fn default_worker_timeout_secs() -> u64 {
    30
}
fn default_heartbeat_interval_secs() -> u64 {
    10
}
fn default_inventory_interval_secs() -> u64 {
    60
}
fn default_max_workers() -> usize {
    256
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            node: NodeConfig::default(),
            listen_addr: default_listen_addr(),
            advertise_url: None,
            enrollment_token: None,
            worker_timeout_secs: default_worker_timeout_secs(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            inventory_interval_secs: default_inventory_interval_secs(),
            max_workers: default_max_workers(),
        }
    }
}

impl MasterConfig {
    /// Liveness window as a `Duration`.
    pub fn worker_timeout(&self) -> Duration {
        Duration::from_secs(self.worker_timeout_secs)
    }
}

/// Settings for the worker (agent) process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Role-independent settings.
    #[serde(default, flatten)]
    pub node: NodeConfig,
    /// Controller endpoint, e.g. `http://master.example:7710`.
    #[serde(default = "default_master_url")]
    pub master_url: String,
    /// Advertised name; defaults to the hostname when empty.
    #[serde(default)]
    pub name: String,
    /// Data-plane listen endpoint (mutual-TLS chunk streams).
    #[serde(default = "default_data_address")]
    pub data_address: String,
    /// Enrollment token pre-shared by the fleet operator.
    #[serde(default)]
    pub enrollment_token: Option<String>,
    /// Operator-assigned labels reported at registration.
    #[serde(default)]
    pub labels: HashMap<String, String>,
    /// Initial reconnect backoff in seconds.
    #[serde(default = "default_reconnect_interval_secs")]
    pub reconnect_interval_secs: u64,
    /// Reconnect backoff ceiling in seconds.
    #[serde(default = "default_max_reconnect_interval_secs")]
    pub max_reconnect_interval_secs: u64,
    /// Optional listen endpoint for the pairing exchange service.
    #[serde(default)]
    pub pairing_addr: Option<String>,
}

fn default_master_url() -> String {
    "http://127.0.0.1:7710".to_string()
}
fn default_data_address() -> String {
    "0.0.0.0:7711".to_string()
}
fn default_reconnect_interval_secs() -> u64 {
    5
}
fn default_max_reconnect_interval_secs() -> u64 {
    300
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            node: NodeConfig::default(),
            master_url: default_master_url(),
            name: String::new(),
            data_address: default_data_address(),
            enrollment_token: None,
            labels: HashMap::new(),
            reconnect_interval_secs: default_reconnect_interval_secs(),
            max_reconnect_interval_secs: default_max_reconnect_interval_secs(),
            pairing_addr: None,
        }
    }
}

impl WorkerConfig {
    /// Initial reconnect backoff as a `Duration`.
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.reconnect_interval_secs)
    }

    /// Reconnect backoff ceiling as a `Duration`.
    pub fn max_reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.max_reconnect_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_fields() {
        let cfg: MasterConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.worker_timeout_secs, 30);
        assert_eq!(cfg.node.chunk_size_default, 1024 * 1024);
        assert!(cfg.node.verify_checksums);

        let cfg: WorkerConfig = serde_json::from_str(r#"{"master_url":"http://m:1"}"#).unwrap();
        assert_eq!(cfg.master_url, "http://m:1");
        assert_eq!(cfg.reconnect_interval_secs, 5);
        assert_eq!(cfg.max_reconnect_interval_secs, 300);
    }
}

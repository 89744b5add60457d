// Path: crates/node/tests/common/mod.rs
//! Shared scaffolding for the in-process fleet tests.

use gantry_master::MasterNode;
use gantry_types::config::{MasterConfig, WorkerConfig};
use std::future::Future;
use std::path::Path;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Starts a controller on an ephemeral port with fast liveness windows.
pub async fn spawn_master(dir: &Path, cancel: &CancellationToken) -> MasterNode {
    let config = MasterConfig {
        listen_addr: "127.0.0.1:0".into(),
        worker_timeout_secs: 5,
        heartbeat_interval_secs: 1,
        inventory_interval_secs: 2,
        node: gantry_types::config::NodeConfig {
            data_dir: dir.join("master"),
            ..Default::default()
        },
        ..Default::default()
    };
    let (node, _task) = gantry_master::start_master(config, cancel.clone())
        .await
        .expect("master start");
    node
}

/// Reserves an ephemeral port for a worker's data listener.
pub fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("reserve port");
    listener.local_addr().expect("local addr").port()
}

/// Builds a worker configuration wired at the given controller.
pub fn worker_config(
    dir: &Path,
    name: &str,
    master_url: String,
    enrollment_token: String,
    data_port: u16,
) -> WorkerConfig {
    WorkerConfig {
        master_url,
        name: name.to_string(),
        data_address: format!("127.0.0.1:{data_port}"),
        enrollment_token: Some(enrollment_token),
        node: gantry_types::config::NodeConfig {
            data_dir: dir.join(name),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Seeds a volume tar in a worker's resource store.
pub fn seed_volume(worker_dir: &Path, name: &str, bytes: &[u8]) {
    let dir = worker_dir.join("resources").join("volumes");
    std::fs::create_dir_all(&dir).expect("volume dir");
    std::fs::write(dir.join(format!("{name}.tar")), bytes).expect("seed volume");
}

/// Deterministic pseudo-random payload.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i * 13 + i / 251) % 256) as u8).collect()
}

/// Polls a condition until it holds or the deadline passes.
pub async fn wait_until<F, Fut>(deadline: Duration, what: &str, mut probe: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let started = tokio::time::Instant::now();
    loop {
        if probe().await {
            return;
        }
        if started.elapsed() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

// Path: crates/node/tests/relay.rs
//! Relay tests: a fleet migration spliced through the controller, and
//! the duplicate-role protocol error.

mod common;

use common::*;
use gantry_ipc::v1 as proto;
use gantry_master::StartRequest;
use gantry_types::model::{MigrationMode, MigrationStatus, MigrationStrategy, ResourceRefs};
use gantry_transfer::DataChannel;
use gantry_worker::channel::RelayedChannel;
use sha2::{Digest, Sha256};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[tokio::test(flavor = "multi_thread")]
async fn volume_migration_through_the_relay() {
    let dir = tempfile::tempdir().unwrap();
    let cancel = CancellationToken::new();
    let master = spawn_master(dir.path(), &cancel).await;
    let master_url = format!("http://{}", master.local_addr);
    let enrollment = master.registry.enrollment_token().await;

    let volume = payload(5 * 1024 * 1024);
    let source_cfg = worker_config(
        dir.path(),
        "w-source",
        master_url.clone(),
        enrollment.clone(),
        free_port(),
    );
    seed_volume(&source_cfg.node.data_dir, "data", &volume);
    let target_cfg = worker_config(dir.path(), "w-target", master_url, enrollment, free_port());
    let target_dir = target_cfg.node.data_dir.clone();

    for cfg in [source_cfg, target_cfg] {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let _ = gantry_worker::run_worker(cfg, cancel).await;
        });
    }

    let registry = master.registry.clone();
    wait_until(Duration::from_secs(15), "both workers online", || {
        let registry = registry.clone();
        async move {
            let workers = registry.list().await;
            workers.len() == 2 && workers.iter().all(|(_, online)| *online)
        }
    })
    .await;

    let workers = master.registry.list().await;
    let find = |name: &str| {
        workers
            .iter()
            .find(|(w, _)| w.name == name)
            .map(|(w, _)| w.id.clone())
            .unwrap()
    };

    let job = master
        .orchestrator
        .start(StartRequest {
            source_worker_id: find("w-source"),
            target_worker_id: find("w-target"),
            resources: ResourceRefs {
                volumes: vec!["data".into()],
                ..Default::default()
            },
            mode: MigrationMode::Copy,
            strategy: MigrationStrategy::Cold,
            via_relay: true,
        })
        .await
        .unwrap();

    let orchestrator = master.orchestrator.clone();
    wait_until(Duration::from_secs(60), "relayed migration to finish", || {
        let orchestrator = orchestrator.clone();
        async move {
            orchestrator
                .get(job.id)
                .await
                .map(|j| j.status.is_terminal())
                .unwrap_or(false)
        }
    })
    .await;

    let done = master.orchestrator.get(job.id).await.unwrap();
    assert_eq!(done.status, MigrationStatus::Completed, "error: {:?}", done.error);

    // All five MiB crossed the splice.
    let relayed = master.relay.bytes_relayed(&job.id.to_string()).await;
    assert_eq!(relayed, Some(5 * 1024 * 1024));

    let received = std::fs::read(target_dir.join("resources/volumes/data.tar")).unwrap();
    assert_eq!(
        hex::encode(Sha256::digest(&received)),
        hex::encode(Sha256::digest(&volume))
    );

    cancel.cancel();
}

#[tokio::test(flavor = "multi_thread")]
async fn duplicate_relay_role_is_rejected_without_breaking_the_channel() {
    let dir = tempfile::tempdir().unwrap();
    let cancel = CancellationToken::new();
    let master = spawn_master(dir.path(), &cancel).await;
    let master_url = format!("http://{}", master.local_addr);
    let enrollment = master.registry.enrollment_token().await;

    // Two credentialed workers, registered directly.
    let register = |name: &str| proto::RegisterWorkerRequest {
        enrollment_token: enrollment.clone(),
        worker_name: name.into(),
        hostname: format!("{name}.local"),
        data_address: "127.0.0.1:1".into(),
        fingerprint: "ab".repeat(32),
        labels: Default::default(),
        version: "0.3.0".into(),
    };
    let first = master.registry.register(&register("w1")).await.unwrap();
    let second = master.registry.register(&register("w2")).await.unwrap();
    let migration_id = uuid::Uuid::new_v4().to_string();

    let mut source = RelayedChannel::connect(
        &master_url,
        &migration_id,
        &first.worker_id,
        &first.auth_token,
        proto::MigrationRole::Source,
    )
    .await
    .unwrap();

    // A second SOURCE handshake on the same migration is refused with
    // the distinct protocol error.
    let duplicate = RelayedChannel::connect(
        &master_url,
        &migration_id,
        &second.worker_id,
        &second.auth_token,
        proto::MigrationRole::Source,
    )
    .await;
    match duplicate {
        Err(e) => assert!(
            e.to_string().contains("RELAY_DUPLICATE_ROLE"),
            "unexpected error: {e}"
        ),
        Ok(_) => panic!("duplicate source handshake was accepted"),
    }

    // The original channel still works once a target attaches.
    let mut target = RelayedChannel::connect(
        &master_url,
        &migration_id,
        &second.worker_id,
        &second.auth_token,
        proto::MigrationRole::Target,
    )
    .await
    .unwrap();

    let chunk_data = vec![7u8; 1024];
    source
        .send_volume_chunk(proto::VolumeChunk {
            volume_id: "data".into(),
            offset: 0,
            checksum: gantry_transfer::chunk::chunk_checksum(&chunk_data),
            data: chunk_data.clone(),
            total_size: 1024,
            is_final: true,
        })
        .await
        .unwrap();

    let frame = target.recv_frame().await.unwrap().unwrap();
    match frame.payload {
        Some(proto::proxy_frame::Payload::Volume(c)) => {
            assert_eq!(c.data, chunk_data);
            assert_eq!(c.volume_id, "data");
        }
        other => panic!("unexpected relay frame: {other:?}"),
    }

    cancel.cancel();
}

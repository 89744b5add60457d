// Path: crates/ipc/src/tests.rs

use crate::v1;
use gantry_types::model::{
    MigrationJob, MigrationMode, MigrationStrategy, ResourceRefs,
};

#[test]
fn resource_set_roundtrip() {
    let refs = ResourceRefs {
        containers: vec!["web".into()],
        images: vec!["nginx:1.25".into()],
        volumes: vec!["data".into(), "logs".into()],
        networks: vec!["frontend".into()],
    };
    let set: v1::ResourceSet = refs.clone().into();
    let back: ResourceRefs = set.into();
    assert_eq!(back, refs);
}

#[test]
fn proxy_frame_payload_accounting() {
    let chunk = v1::ProxyFrame {
        migration_id: "m1".into(),
        worker_id: "w1".into(),
        r#type: v1::ProxyFrameType::Volume as i32,
        payload: Some(v1::proxy_frame::Payload::Volume(v1::VolumeChunk {
            volume_id: "data".into(),
            offset: 0,
            data: vec![0u8; 4096],
            checksum: 7,
            total_size: 4096,
            is_final: true,
        })),
    };
    assert_eq!(chunk.payload_len(), 4096);

    let ack = v1::ProxyFrame {
        migration_id: "m1".into(),
        worker_id: "w2".into(),
        r#type: v1::ProxyFrameType::Ack as i32,
        payload: Some(v1::proxy_frame::Payload::Ack(v1::TransferAck {
            offset: 4096,
            success: true,
            error: String::new(),
            progress: 1.0,
            digest_sha256: String::new(),
        })),
    };
    assert_eq!(ack.payload_len(), 0);
}

#[test]
fn job_info_projection() {
    let job = MigrationJob::new(
        "w-src".into(),
        "w-dst".into(),
        ResourceRefs {
            volumes: vec!["data".into()],
            ..Default::default()
        },
        MigrationMode::Copy,
        MigrationStrategy::Cold,
        1_700_000_000_000,
    );
    let info: v1::MigrationJobInfo = (&job).into();
    assert_eq!(info.id, job.id.to_string());
    assert_eq!(info.status, "pending");
    assert_eq!(info.phase, "initializing");
    assert_eq!(info.completed_at_ms, 0);
    assert!(info.error.is_empty());
}

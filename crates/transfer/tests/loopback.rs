// Path: crates/transfer/tests/loopback.rs
//! End-to-end engine tests over an in-process loopback channel that
//! drives a real `ReceiveSession` against shared "target disk" bytes.

use gantry_ipc::v1::{ContainerBundle, LayerBlob, TransferAck, VolumeChunk};
use gantry_transfer::{
    DataChannel, EngineConfig, InboundChunk, ReceiveSession, TransferEngine,
};
use gantry_types::error::TransferError;
use gantry_types::model::ResourceKind;
use sha2::{Digest, Sha256};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::io::AsyncWrite;
use tokio_util::sync::CancellationToken;

/// Append-only writer over the shared target bytes.
struct SharedVec(Arc<Mutex<Vec<u8>>>);

impl AsyncWrite for SharedVec {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// A channel whose far end is a real receive session writing to shared
/// target bytes, with optional fault injection.
struct LoopbackChannel {
    disk: Arc<Mutex<Vec<u8>>>,
    session: Option<ReceiveSession<SharedVec>>,
    pending_ack: Option<TransferAck>,
    chunk_index: u64,
    corrupt_chunk: Option<u64>,
    fail_after_acks: Option<u64>,
    acks_delivered: u64,
}

impl LoopbackChannel {
    fn new(disk: Arc<Mutex<Vec<u8>>>) -> Self {
        Self {
            disk,
            session: None,
            pending_ack: None,
            chunk_index: 0,
            corrupt_chunk: None,
            fail_after_acks: None,
            acks_delivered: 0,
        }
    }

    async fn handle(&mut self, mut chunk: InboundChunk, kind: ResourceKind, id: &str) {
        if self.session.is_none() {
            // The first chunk's offset is the resume point; the target
            // truncates its partial bytes to match, exactly as the data
            // server does against the resource store.
            let existing = {
                let mut disk = self.disk.lock().unwrap();
                disk.truncate(chunk.offset as usize);
                disk.clone()
            };
            let session = ReceiveSession::resume(
                SharedVec(self.disk.clone()),
                &existing[..],
                kind,
                id.to_string(),
                chunk.total,
                chunk.offset,
            )
            .await
            .expect("resume seed");
            self.session = Some(session);
        }

        if self.corrupt_chunk == Some(self.chunk_index) && !chunk.data.is_empty() {
            chunk.data[0] ^= 0xFF;
        }
        self.chunk_index += 1;

        let session = self.session.as_mut().unwrap();
        let ack = match session.accept(chunk).await {
            Ok(ack) => TransferAck {
                offset: ack.offset,
                success: true,
                error: String::new(),
                progress: ack.progress,
                digest_sha256: ack.digest_hex.unwrap_or_default(),
            },
            Err(e) => TransferAck {
                offset: 0,
                success: false,
                error: e.to_string(),
                progress: 0.0,
                digest_sha256: String::new(),
            },
        };
        self.pending_ack = Some(ack);
    }
}

#[async_trait::async_trait]
impl DataChannel for LoopbackChannel {
    async fn send_volume_chunk(&mut self, chunk: VolumeChunk) -> Result<(), TransferError> {
        let id = chunk.volume_id.clone();
        self.handle(
            InboundChunk {
                offset: chunk.offset,
                data: chunk.data,
                checksum: chunk.checksum,
                total: chunk.total_size,
                is_final: chunk.is_final,
            },
            ResourceKind::Volume,
            &id,
        )
        .await;
        Ok(())
    }

    async fn send_image_blob(&mut self, blob: LayerBlob) -> Result<(), TransferError> {
        let id = blob.image_id.clone();
        self.handle(
            InboundChunk {
                offset: blob.offset,
                data: blob.data,
                checksum: blob.checksum,
                total: blob.layer_size,
                is_final: blob.is_final,
            },
            ResourceKind::Image,
            &id,
        )
        .await;
        Ok(())
    }

    async fn send_container_bundle(
        &mut self,
        bundle: ContainerBundle,
    ) -> Result<(), TransferError> {
        let id = bundle.container_id.clone();
        self.handle(
            InboundChunk {
                offset: bundle.offset,
                data: bundle.data,
                checksum: bundle.checksum,
                total: bundle.total_size,
                is_final: bundle.is_final,
            },
            ResourceKind::Container,
            &id,
        )
        .await;
        Ok(())
    }

    async fn recv_ack(&mut self) -> Result<TransferAck, TransferError> {
        if self.fail_after_acks == Some(self.acks_delivered) {
            return Err(TransferError::Transport("connection reset by peer".into()));
        }
        self.acks_delivered += 1;
        self.pending_ack
            .take()
            .ok_or_else(|| TransferError::Internal("no chunk in flight".into()))
    }

    async fn close(&mut self, _reason: &str) -> Result<(), TransferError> {
        Ok(())
    }
}

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 253) as u8).collect()
}

fn engine_in(dir: &std::path::Path) -> TransferEngine {
    TransferEngine::new(dir, EngineConfig::default())
}

#[tokio::test]
async fn ten_mib_volume_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_in(dir.path());
    let data = payload(10 * 1024 * 1024);
    let disk = Arc::new(Mutex::new(Vec::new()));
    let mut channel = LoopbackChannel::new(disk.clone());

    let mut last_progress = 0u64;
    let outcome = engine
        .send_resource(
            &mut channel,
            ResourceKind::Volume,
            "data",
            "peer-fp",
            &data[..],
            data.len() as u64,
            &CancellationToken::new(),
            |sent, _total| last_progress = sent,
        )
        .await
        .unwrap();

    assert_eq!(outcome.bytes_sent, 10 * 1024 * 1024);
    assert_eq!(outcome.total_bytes, 10 * 1024 * 1024);
    assert_eq!(last_progress, 10 * 1024 * 1024);
    assert_eq!(outcome.digest_sha256, hex::encode(Sha256::digest(&data)));
    assert_eq!(*disk.lock().unwrap(), data);
    // Checkpoint is cleaned up after success.
    assert!(!engine.checkpoints().exists(&outcome.transfer_id));
}

#[tokio::test]
async fn corrupted_chunk_fails_permanently_and_keeps_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_in(dir.path());
    let data = payload(4 * 1024 * 1024);
    let disk = Arc::new(Mutex::new(Vec::new()));
    let mut channel = LoopbackChannel::new(disk);
    channel.corrupt_chunk = Some(2);

    let err = engine
        .send_resource(
            &mut channel,
            ResourceKind::Volume,
            "data",
            "peer-fp",
            &data[..],
            data.len() as u64,
            &CancellationToken::new(),
            |_, _| {},
        )
        .await
        .unwrap_err();

    match err {
        TransferError::Rejected { reason, .. } => {
            assert!(reason.contains("Checksum mismatch"), "reason: {reason}")
        }
        other => panic!("expected rejection, got {other:?}"),
    }

    let id = gantry_transfer::transfer_id(ResourceKind::Volume, "data", "peer-fp");
    assert!(engine.checkpoints().exists(&id));
    let snapshot = engine.snapshot(&id).unwrap();
    assert_eq!(
        snapshot.status,
        gantry_transfer::checkpoint::TransferStatus::Failed
    );
    // Two good chunks were acknowledged before the corruption.
    assert_eq!(snapshot.transferred_bytes, 2 * 1024 * 1024);
}

#[tokio::test]
async fn transport_loss_pauses_then_resume_completes_byte_identical() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_in(dir.path());
    let data = payload(10 * 1024 * 1024);
    let disk = Arc::new(Mutex::new(Vec::new()));
    let id = gantry_transfer::transfer_id(ResourceKind::Volume, "data", "peer-fp");

    // First attempt: the sixth ack is lost to a connection reset.
    let mut first = LoopbackChannel::new(disk.clone());
    first.fail_after_acks = Some(5);
    let err = engine
        .send_resource(
            &mut first,
            ResourceKind::Volume,
            "data",
            "peer-fp",
            &data[..],
            data.len() as u64,
            &CancellationToken::new(),
            |_, _| {},
        )
        .await
        .unwrap_err();
    assert!(matches!(err, TransferError::Transport(_)));

    let paused = engine.checkpoints().load(&id).unwrap().unwrap();
    assert_eq!(
        paused.status,
        gantry_transfer::checkpoint::TransferStatus::Paused
    );
    assert_eq!(paused.transferred_bytes, 5 * 1024 * 1024);
    // The receiver committed one chunk more than the sender saw acked.
    assert_eq!(disk.lock().unwrap().len(), 6 * 1024 * 1024);

    // Second attempt resumes from the checkpoint and completes.
    let mut second = LoopbackChannel::new(disk.clone());
    let outcome = engine
        .send_resource(
            &mut second,
            ResourceKind::Volume,
            "data",
            "peer-fp",
            &data[..],
            data.len() as u64,
            &CancellationToken::new(),
            |_, _| {},
        )
        .await
        .unwrap();

    assert_eq!(outcome.digest_sha256, hex::encode(Sha256::digest(&data)));
    assert_eq!(*disk.lock().unwrap(), data);
    assert!(!engine.checkpoints().exists(&id));
}

#[tokio::test]
async fn cancellation_pauses_with_checkpoint_retained() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_in(dir.path());
    let data = payload(2 * 1024 * 1024);
    let mut channel = LoopbackChannel::new(Arc::new(Mutex::new(Vec::new())));

    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = engine
        .send_resource(
            &mut channel,
            ResourceKind::Volume,
            "data",
            "peer-fp",
            &data[..],
            data.len() as u64,
            &cancel,
            |_, _| {},
        )
        .await
        .unwrap_err();
    assert!(matches!(err, TransferError::Cancelled));

    let id = gantry_transfer::transfer_id(ResourceKind::Volume, "data", "peer-fp");
    assert!(engine.checkpoints().exists(&id));
}

#[tokio::test]
async fn zero_length_resource_still_completes() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_in(dir.path());
    let disk = Arc::new(Mutex::new(Vec::new()));
    let mut channel = LoopbackChannel::new(disk.clone());

    let outcome = engine
        .send_resource(
            &mut channel,
            ResourceKind::Volume,
            "empty",
            "peer-fp",
            &[][..],
            0,
            &CancellationToken::new(),
            |_, _| {},
        )
        .await
        .unwrap();
    assert_eq!(outcome.bytes_sent, 0);
    assert_eq!(outcome.digest_sha256, hex::encode(Sha256::digest(b"")));
    assert!(disk.lock().unwrap().is_empty());
}

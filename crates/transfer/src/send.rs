// Path: crates/transfer/src/send.rs
//! The sending half of the transfer protocol.

use crate::channel::DataChannel;
use crate::checkpoint::{ChunkCheckpoint, TransferCheckpoint, TransferStatus};
use crate::chunk::{chunk_checksum, Chunk, ChunkReader};
use crate::engine::TransferEngine;
use crate::sizer::ChunkSizer;
use crate::CHECKPOINT_FLUSH_EVERY;
use gantry_ipc::v1::{ContainerBundle, LayerBlob, TransferAck, VolumeChunk};
use gantry_types::error::TransferError;
use gantry_types::model::ResourceKind;
use gantry_types::time::now_unix_ms;
use std::time::Instant;
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;

/// Result of a completed send.
#[derive(Debug, Clone)]
pub struct SendOutcome {
    /// The deterministic transfer id.
    pub transfer_id: String,
    /// Bytes acknowledged this run (excludes any resumed prefix).
    pub bytes_sent: u64,
    /// Total stream length.
    pub total_bytes: u64,
    /// Sender-side SHA-256 over the whole stream.
    pub digest_sha256: String,
}

impl TransferEngine {
    /// Streams one resource over the channel with the one-chunk-in-flight
    /// ack discipline, checkpointing acknowledged progress. Resumes from
    /// the previous checkpoint when one reconciles.
    ///
    /// `reader` must be positioned at the start of the resource stream;
    /// the engine skips and digests any resumed prefix itself.
    #[allow(clippy::too_many_arguments)]
    pub async fn send_resource<R>(
        &self,
        channel: &mut (dyn DataChannel + '_),
        kind: ResourceKind,
        resource_id: &str,
        destination: &str,
        reader: R,
        total_bytes: u64,
        cancel: &CancellationToken,
        mut on_progress: impl FnMut(u64, u64) + Send,
    ) -> Result<SendOutcome, TransferError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let _permit = self
            .limiter
            .acquire()
            .await
            .map_err(|_| TransferError::Internal("transfer limiter closed".into()))?;

        let transfer_id = crate::transfer_id(kind, resource_id, destination);

        // Reconcile any previous checkpoint for this transfer.
        let prior = self.store.load(&transfer_id)?;
        let (resume_offset, initial_chunk_size, prior_checkpoints) = match prior {
            Some(cp) if cp.resumable() && cp.total_bytes == total_bytes => {
                tracing::info!(
                    transfer = %transfer_id,
                    offset = cp.transferred_bytes,
                    "resuming transfer from checkpoint"
                );
                (cp.transferred_bytes, cp.chunk_size, cp.checkpoints)
            }
            Some(_) => {
                // Stale or irreconcilable checkpoint; start over.
                self.store.remove(&transfer_id)?;
                (0, self.config.chunk_size_default, Vec::new())
            }
            None => (0, self.config.chunk_size_default, Vec::new()),
        };

        let mut record = TransferCheckpoint {
            transfer_id: transfer_id.clone(),
            kind,
            resource_id: resource_id.to_string(),
            destination: destination.to_string(),
            total_bytes,
            transferred_bytes: resume_offset,
            chunk_size: initial_chunk_size,
            status: TransferStatus::Pending,
            checkpoints: prior_checkpoints,
            speed_bytes_per_sec: 0.0,
            updated_at_ms: now_unix_ms(),
        };
        self.track(&record);

        let mut reader = match ChunkReader::resume(reader, total_bytes, resume_offset).await {
            Ok(reader) => reader,
            Err(e) => return Err(self.settle_error(record, e)),
        };
        let started = Instant::now();
        let mut sizer = ChunkSizer::new(initial_chunk_size, Instant::now());
        let mut unflushed = 0u64;
        let mut sent_this_run = 0u64;
        record.status = TransferStatus::Active;
        self.track(&record);

        loop {
            if cancel.is_cancelled() {
                return Err(self.settle_error(record, TransferError::Cancelled));
            }
            if started.elapsed() > self.config.transfer_timeout {
                return Err(self.settle_error(
                    record,
                    TransferError::Transport("transfer timed out".into()),
                ));
            }

            let chunk = match next_chunk(&mut reader, sizer.current(), total_bytes).await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(e) => return Err(self.settle_error(record, e)),
            };
            let end_offset = chunk.end_offset();
            let chunk_len = chunk.data.len() as u64;
            let chunk_sum = chunk.checksum;
            let is_final = chunk.is_final;

            if let Err(e) = send_chunk(channel, kind, resource_id, total_bytes, chunk).await {
                return Err(self.settle_error(record, e));
            }

            let ack = tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(self.settle_error(record, TransferError::Cancelled));
                }
                ack = channel.recv_ack() => match ack {
                    Ok(ack) => ack,
                    Err(e) => return Err(self.settle_error(record, e)),
                },
            };

            if let Err(e) = validate_ack(&ack, end_offset) {
                return Err(self.settle_error(record, e));
            }

            record.checkpoints.push(ChunkCheckpoint {
                offset: end_offset,
                checksum: chunk_sum,
                timestamp_ms: now_unix_ms(),
                verified: true,
            });
            record.transferred_bytes = end_offset;
            record.chunk_size = sizer.current();
            record.updated_at_ms = now_unix_ms();
            sent_this_run += chunk_len;
            let elapsed = started.elapsed().as_secs_f64();
            if elapsed > 0.0 {
                record.speed_bytes_per_sec = sent_this_run as f64 / elapsed;
            }
            sizer.record_checkpoint(Instant::now());

            unflushed += 1;
            if unflushed >= CHECKPOINT_FLUSH_EVERY {
                self.flush(&record)?;
                unflushed = 0;
            } else {
                self.track(&record);
            }

            on_progress(end_offset, total_bytes);

            if is_final {
                if self.config.verify_checksums {
                    let local = reader.digest_hex();
                    if !ack.digest_sha256.is_empty() && ack.digest_sha256 != local {
                        return Err(self.settle_error(
                            record,
                            TransferError::DigestMismatch {
                                sender: local,
                                receiver: ack.digest_sha256,
                            },
                        ));
                    }
                }
                break;
            }
        }

        if record.transferred_bytes != total_bytes {
            let got = record.transferred_bytes;
            return Err(self.settle_error(
                record,
                TransferError::TruncatedStream {
                    expected: total_bytes,
                    got,
                },
            ));
        }

        record.status = TransferStatus::Completed;
        record.updated_at_ms = now_unix_ms();
        self.track(&record);
        self.store.remove(&transfer_id)?;

        Ok(SendOutcome {
            transfer_id,
            bytes_sent: sent_this_run,
            total_bytes,
            digest_sha256: reader.digest_hex(),
        })
    }
}

/// Produces the next chunk, synthesizing a single empty final chunk for
/// zero-length resources so the receiver still observes a stream end.
async fn next_chunk<R: AsyncRead + Unpin + Send>(
    reader: &mut ChunkReader<R>,
    chunk_size: usize,
    total_bytes: u64,
) -> Result<Option<Chunk>, TransferError> {
    if total_bytes == 0 && reader.offset() == 0 {
        return Ok(Some(Chunk {
            offset: 0,
            checksum: chunk_checksum(&[]),
            data: Vec::new(),
            is_final: true,
        }));
    }
    reader.next_chunk(chunk_size).await
}

async fn send_chunk(
    channel: &mut (dyn DataChannel + '_),
    kind: ResourceKind,
    resource_id: &str,
    total_bytes: u64,
    chunk: Chunk,
) -> Result<(), TransferError> {
    match kind {
        ResourceKind::Volume => {
            channel
                .send_volume_chunk(VolumeChunk {
                    volume_id: resource_id.to_string(),
                    offset: chunk.offset,
                    data: chunk.data,
                    checksum: chunk.checksum,
                    total_size: total_bytes,
                    is_final: chunk.is_final,
                })
                .await
        }
        ResourceKind::Image => {
            channel
                .send_image_blob(LayerBlob {
                    image_id: resource_id.to_string(),
                    layer_digest: String::new(),
                    offset: chunk.offset,
                    data: chunk.data,
                    checksum: chunk.checksum,
                    layer_size: total_bytes,
                    is_final: chunk.is_final,
                })
                .await
        }
        // Network definitions ride the container-bundle frame with a
        // prefixed id; the receiving store routes them by the prefix.
        ResourceKind::Container | ResourceKind::Network => {
            let container_id = match kind {
                ResourceKind::Network => format!("network/{resource_id}"),
                _ => resource_id.to_string(),
            };
            channel
                .send_container_bundle(ContainerBundle {
                    container_id,
                    offset: chunk.offset,
                    data: chunk.data,
                    checksum: chunk.checksum,
                    total_size: total_bytes,
                    is_final: chunk.is_final,
                })
                .await
        }
    }
}

fn validate_ack(ack: &TransferAck, expected_offset: u64) -> Result<(), TransferError> {
    if !ack.success {
        return Err(TransferError::Rejected {
            offset: expected_offset,
            reason: if ack.error.is_empty() {
                "receiver rejected chunk".to_string()
            } else {
                ack.error.clone()
            },
        });
    }
    if ack.offset != expected_offset {
        return Err(TransferError::OffsetDiscontinuity {
            expected: expected_offset,
            got: ack.offset,
        });
    }
    Ok(())
}

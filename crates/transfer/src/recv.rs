// Path: crates/transfer/src/recv.rs
//! The receiving half of the transfer protocol.
//!
//! A session covers one resource stream: it verifies offset continuity
//! and the per-chunk checksum before committing bytes, maintains the
//! running SHA-256, and produces the acknowledgement for each chunk.
//! Verification failures are permanent; the caller turns them into a
//! negative ack and tears the stream down.

use crate::chunk::chunk_checksum;
use gantry_types::error::TransferError;
use gantry_types::model::ResourceKind;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// A chunk as seen by the receiver, already stripped of its transport
/// envelope.
#[derive(Debug, Clone)]
pub struct InboundChunk {
    /// Offset the sender placed this chunk at.
    pub offset: u64,
    /// Payload bytes.
    pub data: Vec<u8>,
    /// Sender-computed XXH3-64 of the payload.
    pub checksum: u64,
    /// Total stream length claimed by the sender.
    pub total: u64,
    /// Set on the last chunk.
    pub is_final: bool,
}

/// Data for a positive acknowledgement.
#[derive(Debug, Clone)]
pub struct AckData {
    /// Next expected offset.
    pub offset: u64,
    /// Receiver's view of fraction complete, in [0, 1].
    pub progress: f64,
    /// Running SHA-256, present on the final ack only.
    pub digest_hex: Option<String>,
}

/// Receiving state for one resource stream.
pub struct ReceiveSession<W> {
    writer: W,
    kind: ResourceKind,
    resource_id: String,
    expected_offset: u64,
    total: u64,
    digest: Sha256,
    complete: bool,
}

impl<W: AsyncWrite + Unpin + Send> ReceiveSession<W> {
    /// A session writing from the start of the resource.
    pub fn new(writer: W, kind: ResourceKind, resource_id: String, total: u64) -> Self {
        Self {
            writer,
            kind,
            resource_id,
            expected_offset: 0,
            total,
            digest: Sha256::new(),
            complete: false,
        }
    }

    /// A session resuming at `resume_offset`. The already-committed
    /// prefix is read back from `existing` and folded into the digest so
    /// the final SHA-256 covers the whole stream.
    pub async fn resume<R: AsyncRead + Unpin + Send>(
        writer: W,
        mut existing: R,
        kind: ResourceKind,
        resource_id: String,
        total: u64,
        resume_offset: u64,
    ) -> Result<Self, TransferError> {
        let mut session = Self::new(writer, kind, resource_id, total);
        let mut remaining = resume_offset;
        let mut buf = vec![0u8; 64 * 1024];
        while remaining > 0 {
            let take = remaining.min(buf.len() as u64) as usize;
            existing
                .read_exact(&mut buf[..take])
                .await
                .map_err(|e| TransferError::Resource(format!("seeding resume digest: {e}")))?;
            session.digest.update(&buf[..take]);
            remaining -= take as u64;
        }
        session.expected_offset = resume_offset;
        Ok(session)
    }

    /// Verifies and commits one chunk, returning the ack to send back.
    pub async fn accept(&mut self, chunk: InboundChunk) -> Result<AckData, TransferError> {
        if self.complete {
            return Err(TransferError::Internal(format!(
                "chunk after final for {} {}",
                self.kind, self.resource_id
            )));
        }
        if chunk.offset != self.expected_offset {
            return Err(TransferError::OffsetDiscontinuity {
                expected: self.expected_offset,
                got: chunk.offset,
            });
        }
        if chunk_checksum(&chunk.data) != chunk.checksum {
            return Err(TransferError::ChecksumMismatch {
                offset: chunk.offset,
            });
        }

        self.writer
            .write_all(&chunk.data)
            .await
            .map_err(|e| TransferError::Resource(format!("writing resource stream: {e}")))?;
        self.digest.update(&chunk.data);
        self.expected_offset = chunk.offset + chunk.data.len() as u64;

        let digest_hex = if chunk.is_final {
            if self.expected_offset != chunk.total.max(self.total) {
                return Err(TransferError::TruncatedStream {
                    expected: self.total,
                    got: self.expected_offset,
                });
            }
            self.writer
                .flush()
                .await
                .map_err(|e| TransferError::Resource(format!("flushing resource stream: {e}")))?;
            self.complete = true;
            Some(hex::encode(self.digest.clone().finalize()))
        } else {
            None
        };

        let progress = if self.total == 0 {
            1.0
        } else {
            (self.expected_offset as f64 / self.total as f64).min(1.0)
        };

        Ok(AckData {
            offset: self.expected_offset,
            progress,
            digest_hex,
        })
    }

    /// Whether the final chunk has been committed.
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Bytes committed so far.
    pub fn committed(&self) -> u64 {
        self.expected_offset
    }

    /// Total stream length this session expects.
    pub fn total(&self) -> u64 {
        self.total
    }

    /// The resource this session writes.
    pub fn resource(&self) -> (ResourceKind, &str) {
        (self.kind, &self.resource_id)
    }

    /// Releases the inner writer, for finalization by the store.
    pub fn into_writer(self) -> W {
        self.writer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ChunkReader;
    use std::io::Cursor;

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 241) as u8).collect()
    }

    async fn drive(data: &[u8], chunk_size: usize) -> (Vec<u8>, String) {
        let mut reader = ChunkReader::new(data, data.len() as u64);
        let mut session = ReceiveSession::new(
            Cursor::new(Vec::new()),
            ResourceKind::Volume,
            "data".into(),
            data.len() as u64,
        );
        let mut digest = None;
        while let Some(chunk) = reader.next_chunk(chunk_size).await.unwrap() {
            let ack = session
                .accept(InboundChunk {
                    offset: chunk.offset,
                    checksum: chunk.checksum,
                    total: data.len() as u64,
                    is_final: chunk.is_final,
                    data: chunk.data,
                })
                .await
                .unwrap();
            if chunk_size > 0 {
                assert!(ack.progress > 0.0 && ack.progress <= 1.0);
            }
            digest = ack.digest_hex.or(digest);
        }
        assert!(session.is_complete());
        (session.into_writer().into_inner(), digest.unwrap())
    }

    #[tokio::test]
    async fn reassembles_byte_identical_stream() {
        let data = payload(1_000_000);
        let (written, digest) = drive(&data, 64 * 1024).await;
        assert_eq!(written, data);
        assert_eq!(digest, hex::encode(Sha256::digest(&data)));
    }

    #[tokio::test]
    async fn rejects_offset_discontinuity() {
        let mut session = ReceiveSession::new(
            Cursor::new(Vec::new()),
            ResourceKind::Volume,
            "data".into(),
            100,
        );
        let err = session
            .accept(InboundChunk {
                offset: 50,
                data: vec![0; 50],
                checksum: chunk_checksum(&vec![0; 50]),
                total: 100,
                is_final: true,
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TransferError::OffsetDiscontinuity { expected: 0, got: 50 }
        ));
    }

    #[tokio::test]
    async fn rejects_corrupted_payload() {
        let data = payload(4096);
        let mut session = ReceiveSession::new(
            Cursor::new(Vec::new()),
            ResourceKind::Volume,
            "data".into(),
            data.len() as u64,
        );
        let mut corrupted = data.clone();
        corrupted[17] ^= 0x01;
        let err = session
            .accept(InboundChunk {
                offset: 0,
                checksum: chunk_checksum(&data),
                data: corrupted,
                total: data.len() as u64,
                is_final: true,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::ChecksumMismatch { offset: 0 }));
        assert!(err.is_permanent());
    }

    #[tokio::test]
    async fn resumed_session_digest_matches_uninterrupted() {
        let data = payload(500_000);
        let split = 200_000usize;

        let mut writer = Cursor::new(data[..split].to_vec());
        writer.set_position(split as u64);
        let mut session = ReceiveSession::resume(
            writer,
            &data[..split],
            ResourceKind::Volume,
            "data".into(),
            data.len() as u64,
            split as u64,
        )
        .await
        .unwrap();

        let mut reader = ChunkReader::resume(&data[..], data.len() as u64, split as u64)
            .await
            .unwrap();
        let mut digest = None;
        while let Some(chunk) = reader.next_chunk(128 * 1024).await.unwrap() {
            let ack = session
                .accept(InboundChunk {
                    offset: chunk.offset,
                    checksum: chunk.checksum,
                    total: data.len() as u64,
                    is_final: chunk.is_final,
                    data: chunk.data,
                })
                .await
                .unwrap();
            digest = ack.digest_hex.or(digest);
        }

        assert_eq!(session.into_writer().into_inner(), data);
        assert_eq!(digest.unwrap(), hex::encode(Sha256::digest(&data)));
    }

    #[tokio::test]
    async fn truncated_final_chunk_is_rejected() {
        let mut session = ReceiveSession::new(
            Cursor::new(Vec::new()),
            ResourceKind::Volume,
            "data".into(),
            100,
        );
        let short = vec![7u8; 40];
        let err = session
            .accept(InboundChunk {
                offset: 0,
                checksum: chunk_checksum(&short),
                data: short,
                total: 100,
                is_final: true,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::TruncatedStream { .. }));
    }
}

// Path: crates/worker/src/receiver.rs
//! Target-side consumption of a chunk stream.
//!
//! The same loop serves both transports: the data listener feeds it
//! direct frames, the executor feeds it relay frames. Resources arrive
//! sequentially; each is verified chunk by chunk through a
//! `ReceiveSession` and finalized in the store when its final chunk
//! commits.

use crate::channel::RelayedChannel;
use crate::store::ResourceStore;
use gantry_ipc::v1 as proto;
use gantry_transfer::{InboundChunk, ReceiveSession};
use gantry_types::error::TransferError;
use gantry_types::model::ResourceKind;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

/// Transport seam for the receive loop: chunks in, acks out.
#[async_trait::async_trait]
pub trait ChunkStream: Send {
    /// Next chunk with its resource identity; `None` on clean close.
    async fn next_chunk(
        &mut self,
    ) -> Result<Option<(ResourceKind, String, InboundChunk)>, TransferError>;

    /// Sends an acknowledgement for the chunk in flight.
    async fn send_ack(&mut self, ack: proto::TransferAck) -> Result<(), TransferError>;
}

/// Routes a container-bundle id: network definitions ride the container
/// frame under a `network/` prefix.
pub(crate) fn route_bundle_id(raw: &str) -> (ResourceKind, String) {
    match raw.strip_prefix("network/") {
        Some(name) => (ResourceKind::Network, name.to_string()),
        None => (ResourceKind::Container, raw.to_string()),
    }
}

type BoxedSession = ReceiveSession<Box<dyn AsyncWrite + Send + Unpin>>;

async fn open_session(
    store: &Arc<dyn ResourceStore>,
    kind: ResourceKind,
    id: &str,
    chunk: &InboundChunk,
) -> Result<BoxedSession, TransferError> {
    let on_disk = store.partial_len(kind, id).await?;
    if chunk.offset > on_disk {
        return Err(TransferError::OffsetDiscontinuity {
            expected: on_disk,
            got: chunk.offset,
        });
    }
    let opened = store.open_writer(kind, id, chunk.offset).await?;
    ReceiveSession::resume(
        opened.writer,
        opened.existing,
        kind,
        id.to_string(),
        chunk.total,
        chunk.offset,
    )
    .await
}

/// Consumes chunk streams until the transport closes, acking each chunk.
/// A verification failure is reported to the sender as a negative ack
/// and then returned; the caller tears the transport down.
pub async fn receive_loop(
    store: Arc<dyn ResourceStore>,
    io: &mut (dyn ChunkStream + '_),
    cancel: &CancellationToken,
) -> Result<u64, TransferError> {
    let mut session: Option<BoxedSession> = None;
    let mut total_committed = 0u64;

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return Err(TransferError::Cancelled),
            next = io.next_chunk() => next?,
        };
        let Some((kind, id, chunk)) = next else {
            // Stream end mid-resource means the sender paused or died;
            // the partial file stays on disk for the resumed attempt.
            if let Some(open) = &session {
                if !open.is_complete() {
                    let (kind, id) = open.resource();
                    tracing::warn!(kind = %kind, resource = %id, "stream ended mid-resource");
                    return Err(TransferError::TruncatedStream {
                        expected: open.total(),
                        got: open.committed(),
                    });
                }
            }
            return Ok(total_committed);
        };

        // A chunk for a different resource starts the next stream; the
        // prior one must have finished.
        let needs_new = match &session {
            Some(open) => {
                let (open_kind, open_id) = open.resource();
                open_kind != kind || open_id != id
            }
            None => true,
        };
        if needs_new {
            if let Some(open) = session.take() {
                if !open.is_complete() {
                    let (stale_kind, stale_id) = open.resource();
                    let err = TransferError::Internal(format!(
                        "new stream for {kind} {id} while {stale_kind} {stale_id} is incomplete"
                    ));
                    nack(io, &err).await;
                    return Err(err);
                }
            }
            match open_session(&store, kind, &id, &chunk).await {
                Ok(open) => session = Some(open),
                Err(e) => {
                    nack(io, &e).await;
                    return Err(e);
                }
            }
        }

        let open = session.as_mut().ok_or_else(|| {
            TransferError::Internal("receive session missing after open".into())
        })?;
        let committed = chunk.data.len() as u64;
        match open.accept(chunk).await {
            Ok(ack) => {
                total_committed += committed;
                let finished = open.is_complete();
                io.send_ack(proto::TransferAck {
                    offset: ack.offset,
                    success: true,
                    error: String::new(),
                    progress: ack.progress,
                    digest_sha256: ack.digest_hex.unwrap_or_default(),
                })
                .await?;
                if finished {
                    session = None;
                    store.finalize(kind, &id).await?;
                    tracing::info!(kind = %kind, resource = %id, "resource received");
                }
            }
            Err(e) => {
                nack(io, &e).await;
                return Err(e);
            }
        }
    }
}

async fn nack(io: &mut (dyn ChunkStream + '_), error: &TransferError) {
    let _ = io
        .send_ack(proto::TransferAck {
            offset: 0,
            success: false,
            error: error.to_string(),
            progress: 0.0,
            digest_sha256: String::new(),
        })
        .await;
}

/// Adapts a direct mutual-TLS stream to the receive loop.
pub struct DirectChunkStream<S> {
    stream: S,
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> DirectChunkStream<S> {
    /// Wraps an accepted data-plane connection.
    pub fn new(stream: S) -> Self {
        Self { stream }
    }
}

#[async_trait::async_trait]
impl<S: AsyncRead + AsyncWrite + Unpin + Send> ChunkStream for DirectChunkStream<S> {
    async fn next_chunk(
        &mut self,
    ) -> Result<Option<(ResourceKind, String, InboundChunk)>, TransferError> {
        loop {
            let frame: proto::DataFrame = match crate::frames::read_frame(&mut self.stream).await? {
                Some(frame) => frame,
                None => return Ok(None),
            };
            return Ok(Some(match frame.payload {
                Some(proto::data_frame::Payload::Volume(c)) => (
                    ResourceKind::Volume,
                    c.volume_id,
                    InboundChunk {
                        offset: c.offset,
                        data: c.data,
                        checksum: c.checksum,
                        total: c.total_size,
                        is_final: c.is_final,
                    },
                ),
                Some(proto::data_frame::Payload::Image(b)) => (
                    ResourceKind::Image,
                    b.image_id,
                    InboundChunk {
                        offset: b.offset,
                        data: b.data,
                        checksum: b.checksum,
                        total: b.layer_size,
                        is_final: b.is_final,
                    },
                ),
                Some(proto::data_frame::Payload::Container(c)) => {
                    let (kind, id) = route_bundle_id(&c.container_id);
                    (
                        kind,
                        id,
                        InboundChunk {
                            offset: c.offset,
                            data: c.data,
                            checksum: c.checksum,
                            total: c.total_size,
                            is_final: c.is_final,
                        },
                    )
                }
                Some(proto::data_frame::Payload::Close(_)) | None => return Ok(None),
                Some(proto::data_frame::Payload::Ack(_)) => {
                    tracing::debug!("ignoring stray ack on receive side");
                    continue;
                }
            }));
        }
    }

    async fn send_ack(&mut self, ack: proto::TransferAck) -> Result<(), TransferError> {
        crate::frames::write_frame(
            &mut self.stream,
            &proto::DataFrame {
                payload: Some(proto::data_frame::Payload::Ack(ack)),
            },
        )
        .await
    }
}

/// Adapts the relayed channel's target side to the receive loop.
pub struct RelayChunkStream<'a> {
    channel: &'a mut RelayedChannel,
}

impl<'a> RelayChunkStream<'a> {
    /// Wraps a relayed channel handshaken as TARGET.
    pub fn new(channel: &'a mut RelayedChannel) -> Self {
        Self { channel }
    }
}

#[async_trait::async_trait]
impl ChunkStream for RelayChunkStream<'_> {
    async fn next_chunk(
        &mut self,
    ) -> Result<Option<(ResourceKind, String, InboundChunk)>, TransferError> {
        loop {
            let frame = match self.channel.recv_frame().await? {
                Some(frame) => frame,
                None => return Ok(None),
            };
            return Ok(Some(match frame.payload {
                Some(proto::proxy_frame::Payload::Volume(c)) => (
                    ResourceKind::Volume,
                    c.volume_id,
                    InboundChunk {
                        offset: c.offset,
                        data: c.data,
                        checksum: c.checksum,
                        total: c.total_size,
                        is_final: c.is_final,
                    },
                ),
                Some(proto::proxy_frame::Payload::Image(b)) => (
                    ResourceKind::Image,
                    b.image_id,
                    InboundChunk {
                        offset: b.offset,
                        data: b.data,
                        checksum: b.checksum,
                        total: b.layer_size,
                        is_final: b.is_final,
                    },
                ),
                Some(proto::proxy_frame::Payload::Container(c)) => {
                    let (kind, id) = route_bundle_id(&c.container_id);
                    (
                        kind,
                        id,
                        InboundChunk {
                            offset: c.offset,
                            data: c.data,
                            checksum: c.checksum,
                            total: c.total_size,
                            is_final: c.is_final,
                        },
                    )
                }
                Some(proto::proxy_frame::Payload::Close(_)) | None => return Ok(None),
                Some(proto::proxy_frame::Payload::Handshake(_))
                | Some(proto::proxy_frame::Payload::Ack(_)) => {
                    tracing::debug!("ignoring non-data relay frame on receive side");
                    continue;
                }
            }));
        }
    }

    async fn send_ack(&mut self, ack: proto::TransferAck) -> Result<(), TransferError> {
        self.channel.send_ack(ack).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bundle_routing_strips_network_prefix() {
        assert_eq!(
            route_bundle_id("network/frontend"),
            (ResourceKind::Network, "frontend".to_string())
        );
        assert_eq!(
            route_bundle_id("web-1"),
            (ResourceKind::Container, "web-1".to_string())
        );
    }
}

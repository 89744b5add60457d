// Path: crates/worker/src/channel.rs
//! The two concrete data channels: a direct mutual-TLS framed stream to
//! the peer worker, and a relayed stream spliced through the controller.

use crate::frames::{read_frame, write_frame};
use gantry_crypto::tls::{client_tls_config, data_plane_server_name, PinnedFingerprint};
use gantry_crypto::Identity;
use gantry_ipc::v1 as proto;
use gantry_ipc::v1::control_plane_client::ControlPlaneClient;
use gantry_transfer::DataChannel;
use gantry_types::error::TransferError;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::TlsConnector;
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::Channel as TonicChannel;
use tonic::Request;

// ---------------------------------------------------------------------------
// Direct channel
// ---------------------------------------------------------------------------

/// Mutual-TLS framed stream straight to the peer worker's data listener.
/// The peer certificate is pinned to the fingerprint named in the start
/// command.
pub struct DirectChannel {
    stream: tokio_rustls::client::TlsStream<TcpStream>,
}

impl DirectChannel {
    /// Dials the peer and completes the pinned mutual-TLS handshake.
    pub async fn connect(
        address: &str,
        identity: &Identity,
        expected_fingerprint: &str,
    ) -> Result<Self, TransferError> {
        let config = client_tls_config(
            identity,
            Arc::new(PinnedFingerprint(expected_fingerprint.to_string())),
        )
        .map_err(|e| TransferError::Transport(e.to_string()))?;
        let tcp = TcpStream::connect(address)
            .await
            .map_err(|e| TransferError::Transport(format!("{address}: {e}")))?;
        tcp.set_nodelay(true)
            .map_err(|e| TransferError::Transport(e.to_string()))?;
        let stream = TlsConnector::from(config)
            .connect(data_plane_server_name(), tcp)
            .await
            .map_err(|e| TransferError::Transport(format!("TLS handshake with {address}: {e}")))?;
        tracing::debug!(peer = %address, "direct data channel established");
        Ok(Self { stream })
    }

    async fn send(&mut self, payload: proto::data_frame::Payload) -> Result<(), TransferError> {
        write_frame(
            &mut self.stream,
            &proto::DataFrame {
                payload: Some(payload),
            },
        )
        .await
    }
}

#[async_trait::async_trait]
impl DataChannel for DirectChannel {
    async fn send_volume_chunk(&mut self, chunk: proto::VolumeChunk) -> Result<(), TransferError> {
        self.send(proto::data_frame::Payload::Volume(chunk)).await
    }

    async fn send_image_blob(&mut self, blob: proto::LayerBlob) -> Result<(), TransferError> {
        self.send(proto::data_frame::Payload::Image(blob)).await
    }

    async fn send_container_bundle(
        &mut self,
        bundle: proto::ContainerBundle,
    ) -> Result<(), TransferError> {
        self.send(proto::data_frame::Payload::Container(bundle)).await
    }

    async fn recv_ack(&mut self) -> Result<proto::TransferAck, TransferError> {
        loop {
            let frame: proto::DataFrame = read_frame(&mut self.stream)
                .await?
                .ok_or_else(|| TransferError::Transport("peer closed data stream".into()))?;
            match frame.payload {
                Some(proto::data_frame::Payload::Ack(ack)) => return Ok(ack),
                Some(proto::data_frame::Payload::Close(close)) => {
                    return Err(TransferError::Transport(format!(
                        "peer closed channel: {}",
                        close.reason
                    )));
                }
                other => {
                    tracing::debug!("ignoring non-ack frame while awaiting ack: {other:?}");
                }
            }
        }
    }

    async fn close(&mut self, reason: &str) -> Result<(), TransferError> {
        self.send(proto::data_frame::Payload::Close(proto::CloseChannel {
            reason: reason.to_string(),
        }))
        .await
    }
}

// ---------------------------------------------------------------------------
// Relayed channel
// ---------------------------------------------------------------------------

/// Data channel spliced through the controller relay. Used by both
/// roles: the source drives it through [`DataChannel`]; the target uses
/// the inherent receive/ack methods.
pub struct RelayedChannel {
    migration_id: String,
    worker_id: String,
    outbound: mpsc::Sender<proto::ProxyFrame>,
    inbound: tonic::Streaming<proto::ProxyFrame>,
}

impl RelayedChannel {
    /// Dials the relay and sends the role handshake. The handshake is
    /// queued before the call so the controller can read it while the
    /// response stream is still being established.
    pub async fn connect(
        proxy_url: &str,
        migration_id: &str,
        worker_id: &str,
        auth_token: &str,
        role: proto::MigrationRole,
    ) -> Result<Self, TransferError> {
        let channel = TonicChannel::from_shared(proxy_url.to_string())
            .map_err(|e| TransferError::Transport(format!("{proxy_url}: {e}")))?
            .connect()
            .await
            .map_err(|e| TransferError::Transport(format!("{proxy_url}: {e}")))?;
        let mut client = ControlPlaneClient::new(channel);

        let (outbound, rx) = mpsc::channel::<proto::ProxyFrame>(32);
        let handshake = proto::ProxyFrame {
            migration_id: migration_id.to_string(),
            worker_id: worker_id.to_string(),
            r#type: proto::ProxyFrameType::Handshake as i32,
            payload: Some(proto::proxy_frame::Payload::Handshake(
                proto::ProxyHandshake {
                    migration_id: migration_id.to_string(),
                    worker_id: worker_id.to_string(),
                    auth_token: auth_token.to_string(),
                    role: role as i32,
                },
            )),
        };
        outbound
            .send(handshake)
            .await
            .map_err(|e| TransferError::Transport(e.to_string()))?;

        let response = client
            .relay_channel(Request::new(ReceiverStream::new(rx)))
            .await
            .map_err(|status| {
                TransferError::Transport(format!("relay handshake rejected: {status}"))
            })?;

        tracing::debug!(
            migration = %migration_id,
            role = role.as_str_name(),
            "relayed data channel established"
        );

        Ok(Self {
            migration_id: migration_id.to_string(),
            worker_id: worker_id.to_string(),
            outbound,
            inbound: response.into_inner(),
        })
    }

    fn frame(
        &self,
        frame_type: proto::ProxyFrameType,
        payload: proto::proxy_frame::Payload,
    ) -> proto::ProxyFrame {
        proto::ProxyFrame {
            migration_id: self.migration_id.clone(),
            worker_id: self.worker_id.clone(),
            r#type: frame_type as i32,
            payload: Some(payload),
        }
    }

    async fn send(&mut self, frame: proto::ProxyFrame) -> Result<(), TransferError> {
        self.outbound
            .send(frame)
            .await
            .map_err(|_| TransferError::Transport("relay channel closed".into()))
    }

    /// Receives the next frame from the opposite side; `None` on clean
    /// stream end.
    pub async fn recv_frame(&mut self) -> Result<Option<proto::ProxyFrame>, TransferError> {
        self.inbound
            .message()
            .await
            .map_err(|status| TransferError::Transport(status.to_string()))
    }

    /// Sends an acknowledgement back through the relay (target role).
    pub async fn send_ack(&mut self, ack: proto::TransferAck) -> Result<(), TransferError> {
        let frame = self.frame(
            proto::ProxyFrameType::Ack,
            proto::proxy_frame::Payload::Ack(ack),
        );
        self.send(frame).await
    }
}

#[async_trait::async_trait]
impl DataChannel for RelayedChannel {
    async fn send_volume_chunk(&mut self, chunk: proto::VolumeChunk) -> Result<(), TransferError> {
        let frame = self.frame(
            proto::ProxyFrameType::Volume,
            proto::proxy_frame::Payload::Volume(chunk),
        );
        self.send(frame).await
    }

    async fn send_image_blob(&mut self, blob: proto::LayerBlob) -> Result<(), TransferError> {
        let frame = self.frame(
            proto::ProxyFrameType::Image,
            proto::proxy_frame::Payload::Image(blob),
        );
        self.send(frame).await
    }

    async fn send_container_bundle(
        &mut self,
        bundle: proto::ContainerBundle,
    ) -> Result<(), TransferError> {
        let frame = self.frame(
            proto::ProxyFrameType::Container,
            proto::proxy_frame::Payload::Container(bundle),
        );
        self.send(frame).await
    }

    async fn recv_ack(&mut self) -> Result<proto::TransferAck, TransferError> {
        loop {
            let frame = self
                .recv_frame()
                .await?
                .ok_or_else(|| TransferError::Transport("relay stream ended".into()))?;
            match frame.payload {
                Some(proto::proxy_frame::Payload::Ack(ack)) => return Ok(ack),
                Some(proto::proxy_frame::Payload::Close(close)) => {
                    return Err(TransferError::Transport(format!(
                        "peer closed channel: {}",
                        close.reason
                    )));
                }
                other => {
                    tracing::debug!("ignoring non-ack relay frame while awaiting ack: {other:?}");
                }
            }
        }
    }

    async fn close(&mut self, reason: &str) -> Result<(), TransferError> {
        let frame = self.frame(
            proto::ProxyFrameType::Close,
            proto::proxy_frame::Payload::Close(proto::CloseChannel {
                reason: reason.to_string(),
            }),
        );
        self.send(frame).await
    }
}

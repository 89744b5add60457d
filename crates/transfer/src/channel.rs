// Path: crates/transfer/src/channel.rs
//! The seam between the transfer engine and its transport.
//!
//! Two concrete channels exist in the worker: a direct mutual-TLS framed
//! stream to the peer, and a relayed stream spliced through the
//! controller. The engine treats both uniformly.

use gantry_ipc::v1::{ContainerBundle, LayerBlob, TransferAck, VolumeChunk};
use gantry_types::error::TransferError;

/// Send-side capability set over a data channel. One chunk is in flight
/// at a time: every send is followed by [`DataChannel::recv_ack`] before
/// the next chunk is produced.
#[async_trait::async_trait]
pub trait DataChannel: Send {
    /// Sends one volume chunk.
    async fn send_volume_chunk(&mut self, chunk: VolumeChunk) -> Result<(), TransferError>;

    /// Sends one image layer blob.
    async fn send_image_blob(&mut self, blob: LayerBlob) -> Result<(), TransferError>;

    /// Sends one container bundle chunk.
    async fn send_container_bundle(&mut self, bundle: ContainerBundle)
        -> Result<(), TransferError>;

    /// Awaits the acknowledgement for the chunk in flight.
    async fn recv_ack(&mut self) -> Result<TransferAck, TransferError>;

    /// Closes the channel, carrying a reason to the peer.
    async fn close(&mut self, reason: &str) -> Result<(), TransferError>;
}

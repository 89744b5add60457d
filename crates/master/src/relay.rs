// Path: crates/master/src/relay.rs
//! The controller-hosted relay: a byte-accurate splice between a SOURCE
//! and a TARGET worker that cannot reach each other directly.
//!
//! Each migration id owns at most one channel with one stream per role.
//! Once both handshakes have arrived, two pumps run concurrently:
//! source-to-target forwards data frames (counting payload bytes), and
//! target-to-source forwards acknowledgements. The relay never inspects
//! payload checksums.

use crate::registry::Registry;
use gantry_ipc::v1 as proto;
use gantry_types::error::RelayError;
use gantry_types::ErrorCode;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, RwLock};
use tokio_util::sync::CancellationToken;
use tonic::Status;

type FrameSender = mpsc::Sender<Result<proto::ProxyFrame, Status>>;

/// One live splice.
pub struct RelayChannel {
    migration_id: String,
    source: watch::Sender<Option<FrameSender>>,
    target: watch::Sender<Option<FrameSender>>,
    bytes_relayed: AtomicU64,
    cancel: CancellationToken,
}

impl RelayChannel {
    fn new(migration_id: String) -> Self {
        Self {
            migration_id,
            source: watch::channel(None).0,
            target: watch::channel(None).0,
            bytes_relayed: AtomicU64::new(0),
            cancel: CancellationToken::new(),
        }
    }

    fn side(&self, role: proto::MigrationRole) -> &watch::Sender<Option<FrameSender>> {
        match role {
            proto::MigrationRole::Source => &self.source,
            _ => &self.target,
        }
    }

    /// Claims a role slot. At most one stream per role per migration.
    fn attach(&self, role: proto::MigrationRole, sender: FrameSender) -> Result<(), RelayError> {
        let claimed = self.side(role).send_if_modified(|slot| {
            if slot.is_some() {
                false
            } else {
                *slot = Some(sender.clone());
                true
            }
        });
        if claimed {
            Ok(())
        } else {
            Err(RelayError::DuplicateRole {
                role: role_name(role).to_string(),
            })
        }
    }

    /// Waits until the opposite role has attached, then returns its
    /// outbound sender.
    async fn wait_peer(&self, role: proto::MigrationRole) -> Result<FrameSender, RelayError> {
        let peer = match role {
            proto::MigrationRole::Source => &self.target,
            _ => &self.source,
        };
        let mut rx = peer.subscribe();
        let sender = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| RelayError::ChannelClosed)?
            .clone();
        sender.ok_or(RelayError::ChannelClosed)
    }

    /// Bytes forwarded source-to-target so far.
    pub fn bytes_relayed(&self) -> u64 {
        self.bytes_relayed.load(Ordering::Relaxed)
    }
}

/// The table of live relay channels, plus byte counts of finished ones
/// for observability.
pub struct RelayTable {
    registry: Arc<Registry>,
    channels: RwLock<HashMap<String, Arc<RelayChannel>>>,
    finished: RwLock<HashMap<String, u64>>,
}

impl RelayTable {
    /// An empty relay bound to the registry for handshake auth.
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            channels: RwLock::new(HashMap::new()),
            finished: RwLock::new(HashMap::new()),
        }
    }

    async fn get_or_create(&self, migration_id: &str) -> Arc<RelayChannel> {
        let mut channels = self.channels.write().await;
        channels
            .entry(migration_id.to_string())
            .or_insert_with(|| Arc::new(RelayChannel::new(migration_id.to_string())))
            .clone()
    }

    /// Cancels a channel explicitly (operator cancel or job teardown).
    pub async fn cancel_channel(&self, migration_id: &str) {
        if let Some(channel) = self.channels.read().await.get(migration_id).cloned() {
            channel.cancel.cancel();
        }
    }

    /// Bytes relayed for a migration: live channel first, then the
    /// finished table.
    pub async fn bytes_relayed(&self, migration_id: &str) -> Option<u64> {
        if let Some(channel) = self.channels.read().await.get(migration_id) {
            return Some(channel.bytes_relayed());
        }
        self.finished.read().await.get(migration_id).copied()
    }

    /// Number of live channels.
    pub async fn live_channels(&self) -> usize {
        self.channels.read().await.len()
    }

    async fn cleanup(&self, channel: &RelayChannel) {
        channel.cancel.cancel();
        let removed = self
            .channels
            .write()
            .await
            .remove(&channel.migration_id)
            .is_some();
        if removed {
            let bytes = channel.bytes_relayed();
            self.finished
                .write()
                .await
                .insert(channel.migration_id.clone(), bytes);
            tracing::info!(
                migration = %channel.migration_id,
                bytes_relayed = bytes,
                "relay channel closed"
            );
        }
    }

    /// Handles one relay stream end to end: reads the handshake,
    /// authenticates it, claims the role slot, then pumps frames to the
    /// opposite side until EOF, error, CLOSE or cancellation.
    pub async fn serve_stream(
        self: Arc<Self>,
        mut inbound: tonic::Streaming<proto::ProxyFrame>,
    ) -> Result<mpsc::Receiver<Result<proto::ProxyFrame, Status>>, Status> {
        let first = inbound
            .message()
            .await
            .map_err(|e| Status::internal(e.to_string()))?
            .ok_or_else(|| relay_status(Status::invalid_argument, &RelayError::MissingHandshake))?;
        let handshake = match first.payload {
            Some(proto::proxy_frame::Payload::Handshake(h)) => h,
            _ => {
                return Err(relay_status(
                    Status::invalid_argument,
                    &RelayError::MissingHandshake,
                ))
            }
        };

        self.registry
            .authenticate(&handshake.worker_id, &handshake.auth_token)
            .await
            .map_err(|_| relay_status(Status::unauthenticated, &RelayError::Unauthenticated))?;

        let role = match proto::MigrationRole::try_from(handshake.role) {
            Ok(role @ (proto::MigrationRole::Source | proto::MigrationRole::Target)) => role,
            _ => {
                return Err(relay_status(
                    Status::invalid_argument,
                    &RelayError::UnexpectedFrame("handshake without a role".into()),
                ))
            }
        };

        let channel = self.get_or_create(&handshake.migration_id).await;
        let (tx, rx) = mpsc::channel(32);
        channel.attach(role, tx).map_err(|e| {
            tracing::warn!(
                migration = %handshake.migration_id,
                worker = %handshake.worker_id,
                role = role_name(role),
                "duplicate relay handshake rejected"
            );
            relay_status(Status::already_exists, &e)
        })?;

        tracing::info!(
            migration = %handshake.migration_id,
            worker = %handshake.worker_id,
            role = role_name(role),
            "relay handshake accepted"
        );

        let table = Arc::clone(&self);
        tokio::spawn(async move {
            table.pump(channel, role, inbound).await;
        });

        Ok(rx)
    }

    /// Forwards frames from one side to the other until the channel dies.
    async fn pump(
        &self,
        channel: Arc<RelayChannel>,
        role: proto::MigrationRole,
        mut inbound: tonic::Streaming<proto::ProxyFrame>,
    ) {
        let peer = tokio::select! {
            _ = channel.cancel.cancelled() => {
                self.cleanup(&channel).await;
                return;
            }
            peer = channel.wait_peer(role) => match peer {
                Ok(peer) => peer,
                Err(_) => {
                    self.cleanup(&channel).await;
                    return;
                }
            },
        };

        loop {
            let frame = tokio::select! {
                _ = channel.cancel.cancelled() => break,
                frame = inbound.message() => match frame {
                    Ok(Some(frame)) => frame,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::debug!(
                            migration = %channel.migration_id,
                            role = role_name(role),
                            error = %e,
                            "relay stream error"
                        );
                        break;
                    }
                },
            };

            let is_close = matches!(
                frame.payload,
                Some(proto::proxy_frame::Payload::Close(_))
            );
            if role == proto::MigrationRole::Source {
                channel
                    .bytes_relayed
                    .fetch_add(frame.payload_len(), Ordering::Relaxed);
            }
            if peer.send(Ok(frame)).await.is_err() {
                break;
            }
            if is_close {
                break;
            }
        }

        self.cleanup(&channel).await;
    }
}

fn role_name(role: proto::MigrationRole) -> &'static str {
    match role {
        proto::MigrationRole::Source => "source",
        proto::MigrationRole::Target => "target",
        _ => "unspecified",
    }
}

fn relay_status(make: impl Fn(String) -> Status, error: &RelayError) -> Status {
    make(format!("{}: {error}", error.code()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn role_slots_reject_duplicates() {
        let channel = RelayChannel::new("m1".into());
        let (tx1, _rx1) = mpsc::channel(1);
        let (tx2, _rx2) = mpsc::channel(1);

        channel.attach(proto::MigrationRole::Source, tx1).unwrap();
        let err = channel
            .attach(proto::MigrationRole::Source, tx2)
            .unwrap_err();
        assert!(matches!(err, RelayError::DuplicateRole { .. }));
        assert_eq!(err.code(), "RELAY_DUPLICATE_ROLE");

        // The opposite role is still free.
        let (tx3, _rx3) = mpsc::channel(1);
        channel.attach(proto::MigrationRole::Target, tx3).unwrap();
    }

    #[tokio::test]
    async fn wait_peer_resolves_once_both_sides_attach() {
        let channel = Arc::new(RelayChannel::new("m1".into()));
        let (source_tx, _a) = mpsc::channel(1);
        channel.attach(proto::MigrationRole::Source, source_tx).unwrap();

        let waiter = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.wait_peer(proto::MigrationRole::Source).await })
        };
        // Not resolved yet; attach the target.
        let (target_tx, _b) = mpsc::channel(1);
        channel.attach(proto::MigrationRole::Target, target_tx).unwrap();
        waiter.await.unwrap().unwrap();
    }
}

// Path: crates/types/src/model/mod.rs
//! The migration data model: workers, jobs, transfers and trusted peers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Reported operational state of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    /// Registered and accepting migrations.
    #[default]
    Idle,
    /// At least one migration is active on this worker.
    Busy,
    /// The worker reported an unrecoverable local error.
    Error,
    /// The worker is finishing active work and accepting nothing new.
    Draining,
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Error => "error",
            Self::Draining => "draining",
        };
        f.write_str(s)
    }
}

impl FromStr for WorkerStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "busy" => Ok(Self::Busy),
            "error" => Ok(Self::Error),
            "draining" => Ok(Self::Draining),
            other => Err(format!("unknown worker status: {other}")),
        }
    }
}

/// Lifecycle state of a migration job. Terminal states are sticky.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStatus {
    /// Accepted; start commands not yet acknowledged by data movement.
    Pending,
    /// Data is moving between the two workers.
    Running,
    /// The source worker reported successful completion.
    Completed,
    /// A worker reported failure, or a start command could not be sent.
    Failed,
    /// Cancelled by the operator or by liveness loss.
    Cancelled,
}

impl MigrationStatus {
    /// Terminal jobs are immutable except for read-only inspection.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Coarse progress phase of a migration, reported by the source worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationPhase {
    /// Start commands issued; data channel not yet open.
    Initializing,
    /// Volume data is streaming.
    Volumes,
    /// Image layers are streaming.
    Images,
    /// Container bundles (and their network definitions) are streaming.
    Containers,
    /// All resources delivered; digests verified.
    Finalizing,
}

impl fmt::Display for MigrationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Initializing => "initializing",
            Self::Volumes => "volumes",
            Self::Images => "images",
            Self::Containers => "containers",
            Self::Finalizing => "finalizing",
        };
        f.write_str(s)
    }
}

impl FromStr for MigrationPhase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initializing" => Ok(Self::Initializing),
            "volumes" => Ok(Self::Volumes),
            "images" => Ok(Self::Images),
            "containers" => Ok(Self::Containers),
            "finalizing" => Ok(Self::Finalizing),
            other => Err(format!("unknown migration phase: {other}")),
        }
    }
}

/// Whether source resources are retained after a successful migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MigrationMode {
    /// Resources remain on the source.
    #[default]
    Copy,
    /// Resources are removed from the source after verification.
    Move,
}

impl FromStr for MigrationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "copy" => Ok(Self::Copy),
            "move" => Ok(Self::Move),
            other => Err(format!("unknown migration mode: {other}")),
        }
    }
}

impl fmt::Display for MigrationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Copy => "copy",
            Self::Move => "move",
        })
    }
}

/// Named migration strategy. Strategies differ only in phase ordering;
/// their internal diff algorithms live behind the resource store seam.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStrategy {
    /// Workloads are stopped; everything moves in one pass.
    #[default]
    Cold,
    /// Images are pre-copied while workloads run; volumes follow.
    Warm,
    /// Container snapshots first, then their volumes and images.
    Snapshot,
}

impl MigrationStrategy {
    /// The resource phases this strategy walks, in order.
    pub fn phases(&self) -> &'static [MigrationPhase] {
        match self {
            Self::Cold => &[
                MigrationPhase::Volumes,
                MigrationPhase::Images,
                MigrationPhase::Containers,
            ],
            Self::Warm => &[
                MigrationPhase::Images,
                MigrationPhase::Volumes,
                MigrationPhase::Containers,
            ],
            Self::Snapshot => &[
                MigrationPhase::Containers,
                MigrationPhase::Volumes,
                MigrationPhase::Images,
            ],
        }
    }
}

impl FromStr for MigrationStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cold" => Ok(Self::Cold),
            "warm" => Ok(Self::Warm),
            "snapshot" => Ok(Self::Snapshot),
            other => Err(format!("unknown migration strategy: {other}")),
        }
    }
}

impl fmt::Display for MigrationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Cold => "cold",
            Self::Warm => "warm",
            Self::Snapshot => "snapshot",
        })
    }
}

/// The kinds of Docker resources a migration can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// A named volume, exported as a tar stream.
    Volume,
    /// An image, exported as a layer tar stream.
    Image,
    /// A container bundle: filesystem diff plus its config and networks.
    Container,
    /// A network definition; metadata only, carried with containers.
    Network,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Volume => "volume",
            Self::Image => "image",
            Self::Container => "container",
            Self::Network => "network",
        })
    }
}

/// The set of resources named by a migration request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRefs {
    /// Container ids or names.
    #[serde(default)]
    pub containers: Vec<String>,
    /// Image ids or references.
    #[serde(default)]
    pub images: Vec<String>,
    /// Volume names.
    #[serde(default)]
    pub volumes: Vec<String>,
    /// Network names.
    #[serde(default)]
    pub networks: Vec<String>,
}

impl ResourceRefs {
    /// True when no resource of any kind is named.
    pub fn is_empty(&self) -> bool {
        self.containers.is_empty()
            && self.images.is_empty()
            && self.volumes.is_empty()
            && self.networks.is_empty()
    }

    /// Total number of named resources.
    pub fn len(&self) -> usize {
        self.containers.len() + self.images.len() + self.volumes.len() + self.networks.len()
    }

    /// The resource ids belonging to one kind.
    pub fn of_kind(&self, kind: ResourceKind) -> &[String] {
        match kind {
            ResourceKind::Container => &self.containers,
            ResourceKind::Image => &self.images,
            ResourceKind::Volume => &self.volumes,
            ResourceKind::Network => &self.networks,
        }
    }
}

/// A migration job as owned by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationJob {
    /// Job identifier.
    pub id: Uuid,
    /// Worker the resources move from.
    pub source_worker_id: String,
    /// Worker the resources move to.
    pub target_worker_id: String,
    /// Resources named by the request.
    pub resources: ResourceRefs,
    /// Copy or move semantics.
    pub mode: MigrationMode,
    /// Phase-ordering strategy.
    pub strategy: MigrationStrategy,
    /// Lifecycle status.
    pub status: MigrationStatus,
    /// Current progress phase.
    pub phase: MigrationPhase,
    /// Fraction complete within the current phase, in [0, 1].
    pub progress: f64,
    /// Bytes acknowledged by the target so far.
    pub bytes_transferred: u64,
    /// Total bytes the source expects to move, once known.
    pub total_bytes: u64,
    /// Unix milliseconds at job creation.
    pub started_at: u64,
    /// Unix milliseconds at terminal transition; set exactly once.
    pub completed_at: Option<u64>,
    /// Human-readable cause on terminal failure or cancellation.
    pub error: Option<String>,
}

impl MigrationJob {
    /// A fresh pending job.
    pub fn new(
        source_worker_id: String,
        target_worker_id: String,
        resources: ResourceRefs,
        mode: MigrationMode,
        strategy: MigrationStrategy,
        started_at: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            source_worker_id,
            target_worker_id,
            resources,
            mode,
            strategy,
            status: MigrationStatus::Pending,
            phase: MigrationPhase::Initializing,
            progress: 0.0,
            bytes_transferred: 0,
            total_bytes: 0,
            started_at,
            completed_at: None,
            error: None,
        }
    }
}

/// A peer whose certificate fingerprint is accepted on the data plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustedPeer {
    /// Stable peer identifier (the fingerprint at first pairing).
    pub peer_id: String,
    /// Cosmetic name carried in the pairing message. Never used for
    /// trust decisions.
    pub display_name: String,
    /// Lowercase-hex SHA-256 of the peer's DER certificate.
    pub fingerprint: String,
    /// Where the peer was last seen, if known.
    pub last_known_address: Option<String>,
    /// Unix milliseconds at first pairing.
    pub first_seen: u64,
    /// Unix milliseconds at most recent contact.
    pub last_seen: u64,
    /// The peer's certificate, PEM-encoded.
    pub peer_cert_pem: String,
}

/// Persisted node state, stored at `<data_dir>/config.json`. Holds the
/// credentials a node must survive restarts with, plus the trusted-peer
/// table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeState {
    /// Fleet enrollment token (master only; generated on first start).
    #[serde(default)]
    pub enrollment_token: Option<String>,
    /// Worker id assigned at registration (worker only).
    #[serde(default)]
    pub worker_id: Option<String>,
    /// Auth token issued at registration (worker only).
    #[serde(default)]
    pub auth_token: Option<String>,
    /// Peers whose certificates are accepted on the data plane.
    #[serde(default)]
    pub trusted_peers: Vec<TrustedPeer>,
}

/// Coarse host statistics carried in heartbeats.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemStats {
    /// Logical CPU count.
    pub cpu_count: u32,
    /// Total memory in bytes, zero when unknown.
    pub memory_total_bytes: u64,
    /// Available memory in bytes, zero when unknown.
    pub memory_available_bytes: u64,
    /// One-minute load average, zero when unknown.
    pub load_average: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(!MigrationStatus::Pending.is_terminal());
        assert!(!MigrationStatus::Running.is_terminal());
        assert!(MigrationStatus::Completed.is_terminal());
        assert!(MigrationStatus::Failed.is_terminal());
        assert!(MigrationStatus::Cancelled.is_terminal());
    }

    #[test]
    fn strategy_phase_orderings() {
        assert_eq!(MigrationStrategy::Cold.phases()[0], MigrationPhase::Volumes);
        assert_eq!(MigrationStrategy::Warm.phases()[0], MigrationPhase::Images);
        assert_eq!(
            MigrationStrategy::Snapshot.phases()[0],
            MigrationPhase::Containers
        );
        for strategy in [
            MigrationStrategy::Cold,
            MigrationStrategy::Warm,
            MigrationStrategy::Snapshot,
        ] {
            assert_eq!(strategy.phases().len(), 3);
        }
    }

    #[test]
    fn resource_refs_emptiness() {
        let mut refs = ResourceRefs::default();
        assert!(refs.is_empty());
        refs.volumes.push("data".into());
        assert!(!refs.is_empty());
        assert_eq!(refs.len(), 1);
        assert_eq!(refs.of_kind(ResourceKind::Volume), &["data".to_string()]);
    }

    #[test]
    fn strategy_parse_roundtrip() {
        for s in ["cold", "warm", "snapshot"] {
            let parsed: MigrationStrategy = s.parse().unwrap();
            assert_eq!(parsed.to_string(), s);
        }
        assert!("hot".parse::<MigrationStrategy>().is_err());
    }
}

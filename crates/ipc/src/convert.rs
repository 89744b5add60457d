// Path: crates/ipc/src/convert.rs
//! Conversions between wire messages and the domain model.

use crate::v1;
use gantry_types::model::{MigrationJob, ResourceKind, ResourceRefs};

impl From<ResourceRefs> for v1::ResourceSet {
    fn from(refs: ResourceRefs) -> Self {
        Self {
            containers: refs.containers,
            images: refs.images,
            volumes: refs.volumes,
            networks: refs.networks,
        }
    }
}

impl From<v1::ResourceSet> for ResourceRefs {
    fn from(set: v1::ResourceSet) -> Self {
        Self {
            containers: set.containers,
            images: set.images,
            volumes: set.volumes,
            networks: set.networks,
        }
    }
}

impl From<ResourceKind> for v1::ResourceKind {
    fn from(kind: ResourceKind) -> Self {
        match kind {
            ResourceKind::Volume => Self::Volume,
            ResourceKind::Image => Self::Image,
            ResourceKind::Container => Self::Container,
            ResourceKind::Network => Self::Network,
        }
    }
}

impl From<gantry_types::model::SystemStats> for v1::SystemStats {
    fn from(stats: gantry_types::model::SystemStats) -> Self {
        Self {
            cpu_count: stats.cpu_count,
            memory_total_bytes: stats.memory_total_bytes,
            memory_available_bytes: stats.memory_available_bytes,
            load_average: stats.load_average,
        }
    }
}

impl From<v1::SystemStats> for gantry_types::model::SystemStats {
    fn from(stats: v1::SystemStats) -> Self {
        Self {
            cpu_count: stats.cpu_count,
            memory_total_bytes: stats.memory_total_bytes,
            memory_available_bytes: stats.memory_available_bytes,
            load_average: stats.load_average,
        }
    }
}

impl From<&MigrationJob> for v1::MigrationJobInfo {
    fn from(job: &MigrationJob) -> Self {
        Self {
            id: job.id.to_string(),
            source_worker_id: job.source_worker_id.clone(),
            target_worker_id: job.target_worker_id.clone(),
            resources: Some(job.resources.clone().into()),
            mode: job.mode.to_string(),
            strategy: job.strategy.to_string(),
            status: job.status.to_string(),
            phase: job.phase.to_string(),
            progress: job.progress,
            bytes_transferred: job.bytes_transferred,
            total_bytes: job.total_bytes,
            started_at_ms: job.started_at,
            completed_at_ms: job.completed_at.unwrap_or(0),
            error: job.error.clone().unwrap_or_default(),
        }
    }
}

impl v1::ProxyFrame {
    /// Size of the data payload this frame carries, for relay byte
    /// accounting. Handshake, ack and close frames count as zero.
    pub fn payload_len(&self) -> u64 {
        match &self.payload {
            Some(v1::proxy_frame::Payload::Volume(c)) => c.data.len() as u64,
            Some(v1::proxy_frame::Payload::Image(b)) => b.data.len() as u64,
            Some(v1::proxy_frame::Payload::Container(c)) => c.data.len() as u64,
            _ => 0,
        }
    }
}

impl v1::WorkerFrame {
    /// Short payload label used in log lines.
    pub fn payload_name(&self) -> &'static str {
        match &self.payload {
            Some(v1::worker_frame::Payload::Heartbeat(_)) => "heartbeat",
            Some(v1::worker_frame::Payload::Progress(_)) => "progress",
            Some(v1::worker_frame::Payload::Complete(_)) => "complete",
            Some(v1::worker_frame::Payload::Error(_)) => "error",
            None => "empty",
        }
    }
}

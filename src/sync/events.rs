//! Domain events emitted by the batch aggregate
//!
//! Every mutating call on [`Batch`](super::batch::Batch) returns the events it
//! produced. The engine never delivers them itself; callers hand them to an
//! [`EventPublisher`].

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::batch::{BatchStatus, ConflictStatus};
use super::types::{DeviceId, EntityReference, SyncVersion};

/// Something that happened to a batch
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BatchEvent {
    Submitted {
        batch_id: Uuid,
        device_id: DeviceId,
        at: DateTime<Utc>,
    },
    DeltaApplied {
        batch_id: Uuid,
        delta_id: Uuid,
        entity: EntityReference,
        version: SyncVersion,
    },
    ConflictDetected {
        batch_id: Uuid,
        conflict_id: Uuid,
        entity: EntityReference,
        client_version: SyncVersion,
        server_version: SyncVersion,
    },
    Processed {
        batch_id: Uuid,
        status: BatchStatus,
        applied: usize,
        conflicts: usize,
        at: DateTime<Utc>,
    },
    ConflictResolved {
        batch_id: Uuid,
        conflict_id: Uuid,
        entity: EntityReference,
        status: ConflictStatus,
        at: DateTime<Utc>,
    },
}

impl BatchEvent {
    pub fn batch_id(&self) -> Uuid {
        match self {
            BatchEvent::Submitted { batch_id, .. }
            | BatchEvent::DeltaApplied { batch_id, .. }
            | BatchEvent::ConflictDetected { batch_id, .. }
            | BatchEvent::Processed { batch_id, .. }
            | BatchEvent::ConflictResolved { batch_id, .. } => *batch_id,
        }
    }
}

/// Consumer of domain events
pub trait EventPublisher: Send + Sync {
    fn publish(&self, events: &[BatchEvent]);
}

/// Publishes events as structured log records
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingPublisher;

impl EventPublisher for TracingPublisher {
    fn publish(&self, events: &[BatchEvent]) {
        for event in events {
            match event {
                BatchEvent::Submitted {
                    batch_id,
                    device_id,
                    ..
                } => {
                    tracing::info!(batch_id = %batch_id, device_id = %device_id, "Batch submitted");
                }
                BatchEvent::DeltaApplied {
                    batch_id,
                    entity,
                    version,
                    ..
                } => {
                    tracing::debug!(batch_id = %batch_id, entity = %entity, version = %version, "Delta applied");
                }
                BatchEvent::ConflictDetected {
                    batch_id,
                    conflict_id,
                    entity,
                    client_version,
                    server_version,
                } => {
                    tracing::warn!(
                        batch_id = %batch_id,
                        conflict_id = %conflict_id,
                        entity = %entity,
                        client_version = %client_version,
                        server_version = %server_version,
                        "Conflict detected"
                    );
                }
                BatchEvent::Processed {
                    batch_id,
                    status,
                    applied,
                    conflicts,
                    ..
                } => {
                    tracing::info!(
                        batch_id = %batch_id,
                        status = status.as_str(),
                        applied = applied,
                        conflicts = conflicts,
                        "Batch processed"
                    );
                }
                BatchEvent::ConflictResolved {
                    batch_id,
                    conflict_id,
                    status,
                    ..
                } => {
                    tracing::info!(
                        batch_id = %batch_id,
                        conflict_id = %conflict_id,
                        status = status.as_str(),
                        "Conflict resolved"
                    );
                }
            }
        }
    }
}

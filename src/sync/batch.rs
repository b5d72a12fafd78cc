//! Batch aggregate
//!
//! A [`Batch`] records one client push: the deltas that were applied and the
//! conflicts that were detected. It starts `pending`, moves exactly once to a
//! terminal status and is never reopened. Conflicts inside a terminal batch
//! can still be resolved, each exactly once.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::{SyncError, SyncResult};
use super::events::BatchEvent;
use super::types::{
    DeltaOperation, DeltaPayload, DeviceId, EntityReference, ResolveRequest, StrategyKind,
    SyncVersion,
};

/// Lifecycle status of a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Completed,
    PartialConflict,
    Failed,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Pending => "pending",
            BatchStatus::Completed => "completed",
            BatchStatus::PartialConflict => "partial_conflict",
            BatchStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> SyncResult<Self> {
        match s {
            "pending" => Ok(BatchStatus::Pending),
            "completed" => Ok(BatchStatus::Completed),
            "partial_conflict" => Ok(BatchStatus::PartialConflict),
            "failed" => Ok(BatchStatus::Failed),
            other => Err(SyncError::Corrupt(format!("unknown batch status: {}", other))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, BatchStatus::Pending)
    }

    /// Terminal status for a batch with the given outcome counts
    pub fn for_outcome(applied: usize, conflicts: usize) -> Self {
        if conflicts == 0 && applied > 0 {
            BatchStatus::Completed
        } else if applied > 0 {
            BatchStatus::PartialConflict
        } else {
            // Nothing applied, whether because everything conflicted or
            // because nothing was submitted.
            BatchStatus::Failed
        }
    }
}

/// Resolution status of a conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStatus {
    Unresolved,
    ClientWins,
    ServerWins,
    ManualMerge,
}

impl ConflictStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictStatus::Unresolved => "unresolved",
            ConflictStatus::ClientWins => "client_wins",
            ConflictStatus::ServerWins => "server_wins",
            ConflictStatus::ManualMerge => "manual_merge",
        }
    }

    pub fn parse(s: &str) -> SyncResult<Self> {
        match s {
            "unresolved" => Ok(ConflictStatus::Unresolved),
            "client_wins" => Ok(ConflictStatus::ClientWins),
            "server_wins" => Ok(ConflictStatus::ServerWins),
            "manual_merge" => Ok(ConflictStatus::ManualMerge),
            other => Err(SyncError::Corrupt(format!("unknown conflict status: {}", other))),
        }
    }
}

/// Decision applied to a conflict
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    ClientWins,
    ServerWins,
    ManualMerge(DeltaPayload),
}

impl Resolution {
    /// Build a resolution from a request, requiring a payload for manual merges
    pub fn from_request(request: ResolveRequest) -> SyncResult<Self> {
        match (request.strategy, request.merged_payload) {
            (StrategyKind::ClientWins, _) => Ok(Resolution::ClientWins),
            (StrategyKind::ServerWins, _) => Ok(Resolution::ServerWins),
            (StrategyKind::ManualMerge, Some(merged)) => {
                Ok(Resolution::ManualMerge(DeltaPayload::new(merged)))
            }
            (StrategyKind::ManualMerge, None) => Err(SyncError::Validation(
                "manual_merge requires mergedPayload".to_string(),
            )),
        }
    }

    pub fn status(&self) -> ConflictStatus {
        match self {
            Resolution::ClientWins => ConflictStatus::ClientWins,
            Resolution::ServerWins => ConflictStatus::ServerWins,
            Resolution::ManualMerge(_) => ConflictStatus::ManualMerge,
        }
    }
}

/// A delta that was applied and advanced the entity's version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncDelta {
    pub id: Uuid,
    pub entity: EntityReference,
    pub operation: DeltaOperation,
    pub base_version: SyncVersion,
    pub server_version: SyncVersion,
    pub payload: DeltaPayload,
    pub client_timestamp: DateTime<Utc>,
}

/// A delta rejected because its base version was stale
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictRecord {
    pub id: Uuid,
    pub entity: EntityReference,
    pub operation: DeltaOperation,
    pub client_payload: DeltaPayload,
    pub server_payload: DeltaPayload,
    pub client_version: SyncVersion,
    pub server_version: SyncVersion,
    pub status: ConflictStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_payload: Option<DeltaPayload>,
    pub detected_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl ConflictRecord {
    /// A freshly detected, unresolved conflict
    pub fn detected(
        entity: EntityReference,
        operation: DeltaOperation,
        client_payload: DeltaPayload,
        server_payload: DeltaPayload,
        client_version: SyncVersion,
        server_version: SyncVersion,
        detected_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            entity,
            operation,
            client_payload,
            server_payload,
            client_version,
            server_version,
            status: ConflictStatus::Unresolved,
            resolved_payload: None,
            detected_at,
            resolved_at: None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.status != ConflictStatus::Unresolved
    }
}

/// One client submission and everything it produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Batch {
    id: Uuid,
    device_id: DeviceId,
    status: BatchStatus,
    submitted_at: DateTime<Utc>,
    processed_at: Option<DateTime<Utc>>,
    deltas: Vec<SyncDelta>,
    conflicts: Vec<ConflictRecord>,
}

impl Batch {
    /// Open a new pending batch
    pub fn submit(device_id: DeviceId, submitted_at: DateTime<Utc>) -> (Self, Vec<BatchEvent>) {
        let batch = Self {
            id: Uuid::new_v4(),
            device_id,
            status: BatchStatus::Pending,
            submitted_at,
            processed_at: None,
            deltas: Vec::new(),
            conflicts: Vec::new(),
        };
        let events = vec![BatchEvent::Submitted {
            batch_id: batch.id,
            device_id: batch.device_id.clone(),
            at: submitted_at,
        }];
        (batch, events)
    }

    /// Rebuild a batch from persisted parts
    pub fn restore(
        id: Uuid,
        device_id: DeviceId,
        status: BatchStatus,
        submitted_at: DateTime<Utc>,
        processed_at: Option<DateTime<Utc>>,
        deltas: Vec<SyncDelta>,
        conflicts: Vec<ConflictRecord>,
    ) -> Self {
        Self {
            id,
            device_id,
            status,
            submitted_at,
            processed_at,
            deltas,
            conflicts,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    pub fn status(&self) -> BatchStatus {
        self.status
    }

    pub fn submitted_at(&self) -> DateTime<Utc> {
        self.submitted_at
    }

    pub fn processed_at(&self) -> Option<DateTime<Utc>> {
        self.processed_at
    }

    pub fn deltas(&self) -> &[SyncDelta] {
        &self.deltas
    }

    pub fn conflicts(&self) -> &[ConflictRecord] {
        &self.conflicts
    }

    pub fn applied_count(&self) -> usize {
        self.deltas.len()
    }

    pub fn conflict(&self, conflict_id: Uuid) -> Option<&ConflictRecord> {
        self.conflicts.iter().find(|c| c.id == conflict_id)
    }

    fn ensure_pending(&self, action: &str) -> SyncResult<()> {
        if self.status.is_terminal() {
            return Err(SyncError::InvalidState(format!(
                "cannot {} on batch {} in status {}",
                action,
                self.id,
                self.status.as_str()
            )));
        }
        Ok(())
    }

    /// Record an applied delta
    pub fn add_delta(&mut self, delta: SyncDelta) -> SyncResult<Vec<BatchEvent>> {
        self.ensure_pending("add delta")?;
        let event = BatchEvent::DeltaApplied {
            batch_id: self.id,
            delta_id: delta.id,
            entity: delta.entity.clone(),
            version: delta.server_version,
        };
        self.deltas.push(delta);
        Ok(vec![event])
    }

    /// Record a detected conflict
    pub fn add_conflict(&mut self, conflict: ConflictRecord) -> SyncResult<Vec<BatchEvent>> {
        self.ensure_pending("add conflict")?;
        let event = BatchEvent::ConflictDetected {
            batch_id: self.id,
            conflict_id: conflict.id,
            entity: conflict.entity.clone(),
            client_version: conflict.client_version,
            server_version: conflict.server_version,
        };
        self.conflicts.push(conflict);
        Ok(vec![event])
    }

    /// All deltas applied, no conflicts
    pub fn mark_completed(&mut self, at: DateTime<Utc>) -> SyncResult<Vec<BatchEvent>> {
        if !self.conflicts.is_empty() {
            return Err(SyncError::InvalidState(format!(
                "batch {} has {} conflicts and cannot complete",
                self.id,
                self.conflicts.len()
            )));
        }
        self.transition(BatchStatus::Completed, at)
    }

    /// Some deltas applied, some conflicted
    pub fn mark_partial_conflict(&mut self, at: DateTime<Utc>) -> SyncResult<Vec<BatchEvent>> {
        if self.deltas.is_empty() || self.conflicts.is_empty() {
            return Err(SyncError::InvalidState(format!(
                "batch {} needs applied deltas and conflicts for partial_conflict",
                self.id
            )));
        }
        self.transition(BatchStatus::PartialConflict, at)
    }

    /// Nothing applied
    pub fn mark_failed(&mut self, at: DateTime<Utc>) -> SyncResult<Vec<BatchEvent>> {
        if !self.deltas.is_empty() {
            return Err(SyncError::InvalidState(format!(
                "batch {} applied {} deltas and cannot fail",
                self.id,
                self.deltas.len()
            )));
        }
        self.transition(BatchStatus::Failed, at)
    }

    /// Move to the terminal status implied by what was recorded
    pub fn finalize(&mut self, at: DateTime<Utc>) -> SyncResult<Vec<BatchEvent>> {
        match BatchStatus::for_outcome(self.deltas.len(), self.conflicts.len()) {
            BatchStatus::Completed => self.mark_completed(at),
            BatchStatus::PartialConflict => self.mark_partial_conflict(at),
            _ => self.mark_failed(at),
        }
    }

    fn transition(&mut self, status: BatchStatus, at: DateTime<Utc>) -> SyncResult<Vec<BatchEvent>> {
        self.ensure_pending("finish")?;
        self.status = status;
        self.processed_at = Some(at);
        Ok(vec![BatchEvent::Processed {
            batch_id: self.id,
            status,
            applied: self.deltas.len(),
            conflicts: self.conflicts.len(),
            at,
        }])
    }

    /// Apply a decision to one of this batch's conflicts
    ///
    /// Returns the updated conflict. Resolving twice is an error.
    pub fn resolve_conflict(
        &mut self,
        conflict_id: Uuid,
        resolution: &Resolution,
        at: DateTime<Utc>,
    ) -> SyncResult<(ConflictRecord, Vec<BatchEvent>)> {
        let batch_id = self.id;
        let conflict = self
            .conflicts
            .iter_mut()
            .find(|c| c.id == conflict_id)
            .ok_or_else(|| {
                SyncError::NotFound(format!("conflict {} in batch {}", conflict_id, batch_id))
            })?;

        if conflict.is_resolved() {
            return Err(SyncError::InvalidState(format!(
                "conflict {} already resolved as {}",
                conflict_id,
                conflict.status.as_str()
            )));
        }

        conflict.resolved_payload = match resolution {
            Resolution::ClientWins => Some(conflict.client_payload.clone()),
            Resolution::ServerWins => None,
            Resolution::ManualMerge(merged) => Some(merged.clone()),
        };
        conflict.status = resolution.status();
        conflict.resolved_at = Some(at);

        let event = BatchEvent::ConflictResolved {
            batch_id,
            conflict_id,
            entity: conflict.entity.clone(),
            status: conflict.status,
            at,
        };
        Ok((conflict.clone(), vec![event]))
    }
}

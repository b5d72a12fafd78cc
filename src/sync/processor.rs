//! Batch processor
//!
//! Applies each delta of a push independently with an optimistic
//! check-and-set against the version store:
//!
//! 1. Read the entity's current version
//! 2. If the client's base version matches, write `current + 1` and record
//!    the delta in one ledger transaction
//! 3. Otherwise, or if the write loses to a concurrent writer, record a
//!    conflict carrying both payloads and both versions
//!
//! There is no cross-delta atomicity. A push that is interrupted keeps the
//! deltas already applied, and its batch stays `pending` in the ledger.

use uuid::Uuid;

use super::batch::{Batch, ConflictRecord, SyncDelta};
use super::clock::Clock;
use super::error::{SyncError, SyncResult};
use super::events::BatchEvent;
use super::ledger::BatchLedger;
use super::types::{ClientDelta, DeltaPayload, DeviceId, PushResponse, SyncVersion};
use super::version_store::{VersionStore, VersionWrite};

/// Result of processing one push
#[derive(Debug, Clone)]
pub struct PushOutcome {
    pub batch: Batch,
    pub events: Vec<BatchEvent>,
}

impl PushOutcome {
    pub fn response(&self) -> PushResponse {
        PushResponse::from_batch(&self.batch)
    }
}

/// Apply-or-conflict processing of client batches
pub struct BatchProcessor<'a> {
    store: &'a dyn VersionStore,
    ledger: &'a dyn BatchLedger,
    clock: &'a dyn Clock,
}

impl<'a> BatchProcessor<'a> {
    pub fn new(store: &'a dyn VersionStore, ledger: &'a dyn BatchLedger, clock: &'a dyn Clock) -> Self {
        Self {
            store,
            ledger,
            clock,
        }
    }

    /// Process a validated push from `device_id`
    pub async fn process(
        &self,
        device_id: DeviceId,
        deltas: Vec<ClientDelta>,
    ) -> SyncResult<PushOutcome> {
        let (mut batch, mut events) = Batch::submit(device_id, self.clock.now());
        self.ledger.create_batch(&batch).await?;

        for delta in deltas {
            if let Some(applied) = self.try_apply(&batch, &delta).await? {
                events.extend(batch.add_delta(applied)?);
            } else {
                let conflict = self.detect_conflict(delta).await?;
                let seq = batch.conflicts().len();
                events.extend(batch.add_conflict(conflict.clone())?);
                self.ledger.record_conflict(batch.id(), seq, &conflict).await?;
            }
        }

        events.extend(batch.finalize(self.clock.now())?);
        match self.ledger.finish_batch(&batch).await {
            Ok(()) => {}
            Err(SyncError::InvalidState(_)) => {
                tracing::warn!(
                    batch_id = %batch.id(),
                    status = batch.status().as_str(),
                    "Batch was swept while in flight, storing its real status"
                );
                self.ledger.reconcile_batch(&batch).await?;
            }
            Err(e) => return Err(e),
        }

        Ok(PushOutcome { batch, events })
    }

    /// Check-and-set one delta, recording it in the ledger in the same step
    ///
    /// `None` means it must become a conflict.
    async fn try_apply(
        &self,
        batch: &Batch,
        delta: &ClientDelta,
    ) -> SyncResult<Option<SyncDelta>> {
        let current = self.store.get_current_version(&delta.entity).await?;
        if delta.base_version != current {
            return Ok(None);
        }

        let new_version = current.increment();
        let write = VersionWrite {
            entity: delta.entity.clone(),
            version: new_version,
            payload: delta.payload.clone(),
            operation: delta.operation,
            device_id: batch.device_id().clone(),
            modified_at: self.clock.now(),
        };
        let applied = SyncDelta {
            id: Uuid::new_v4(),
            entity: delta.entity.clone(),
            operation: delta.operation,
            base_version: delta.base_version,
            server_version: new_version,
            payload: delta.payload.clone(),
            client_timestamp: delta.client_timestamp,
        };

        let seq = batch.deltas().len();
        if !self.ledger.apply_delta(batch.id(), seq, &write, &applied).await? {
            tracing::warn!(
                entity = %delta.entity,
                base_version = %delta.base_version,
                "Lost version race to a concurrent writer"
            );
            return Ok(None);
        }

        Ok(Some(applied))
    }

    /// Build a conflict against whatever the store holds now
    async fn detect_conflict(&self, delta: ClientDelta) -> SyncResult<ConflictRecord> {
        let (server_version, server_payload) = match self.store.get_entry(&delta.entity).await? {
            Some(entry) => (entry.version, entry.payload),
            None => (SyncVersion::INITIAL, DeltaPayload::empty_object()),
        };

        Ok(ConflictRecord::detected(
            delta.entity,
            delta.operation,
            delta.payload,
            server_payload,
            delta.base_version,
            server_version,
            self.clock.now(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use crate::sync::batch::{BatchStatus, ConflictStatus};
    use crate::sync::clock::SystemClock;
    use crate::sync::ledger::SqliteLedger;
    use crate::sync::types::{
        ChangeCursor, ConflictSummary, DeltaOperation, EntityKind, EntityReference,
    };
    use crate::sync::version_store::SqliteVersionStore;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use std::sync::atomic::{AtomicBool, Ordering};

    fn project(id: Uuid) -> EntityReference {
        EntityReference::new(EntityKind::new("project").unwrap(), id)
    }

    fn delta(entity: &EntityReference, base: u64, payload: &str) -> ClientDelta {
        ClientDelta {
            entity: entity.clone(),
            operation: if base == 0 { DeltaOperation::Create } else { DeltaOperation::Update },
            base_version: SyncVersion::new(base),
            payload: DeltaPayload::new(payload),
            client_timestamp: SystemClock.now(),
        }
    }

    fn device(name: &str) -> DeviceId {
        DeviceId::new(name).unwrap()
    }

    #[tokio::test]
    async fn test_create_then_stale_update() {
        let pool = test_pool().await;
        let store = SqliteVersionStore::new(pool.clone());
        let ledger = SqliteLedger::new(pool);
        let processor = BatchProcessor::new(&store, &ledger, &SystemClock);
        let entity = project(Uuid::new_v4());

        let first = processor
            .process(device("A"), vec![delta(&entity, 0, r#"{"name":"X"}"#)])
            .await
            .unwrap();
        assert_eq!(first.batch.status(), BatchStatus::Completed);
        assert_eq!(first.batch.deltas()[0].server_version, SyncVersion::new(1));

        let entry = store.get_entry(&entity).await.unwrap().unwrap();
        assert_eq!(entry.version, SyncVersion::new(1));
        assert_eq!(entry.payload.as_str(), r#"{"name":"X"}"#);
        assert_eq!(entry.last_device_id.as_str(), "A");

        let second = processor
            .process(device("B"), vec![delta(&entity, 0, r#"{"name":"Y"}"#)])
            .await
            .unwrap();
        assert_eq!(second.batch.status(), BatchStatus::Failed);
        let conflict = &second.batch.conflicts()[0];
        assert_eq!(conflict.client_version, SyncVersion::new(0));
        assert_eq!(conflict.server_version, SyncVersion::new(1));
        assert_eq!(conflict.server_payload.as_str(), r#"{"name":"X"}"#);
        assert_eq!(conflict.client_payload.as_str(), r#"{"name":"Y"}"#);

        // Unchanged by the conflict.
        let entry = store.get_entry(&entity).await.unwrap().unwrap();
        assert_eq!(entry.version, SyncVersion::new(1));
        assert_eq!(entry.payload.as_str(), r#"{"name":"X"}"#);
    }

    #[tokio::test]
    async fn test_partial_conflict_batch() {
        let pool = test_pool().await;
        let store = SqliteVersionStore::new(pool.clone());
        let ledger = SqliteLedger::new(pool);
        let processor = BatchProcessor::new(&store, &ledger, &SystemClock);

        let taken_a = project(Uuid::new_v4());
        let taken_b = project(Uuid::new_v4());
        processor
            .process(device("A"), vec![delta(&taken_a, 0, "{}"), delta(&taken_b, 0, "{}")])
            .await
            .unwrap();

        let fresh = project(Uuid::new_v4());
        let outcome = processor
            .process(
                device("B"),
                vec![
                    delta(&fresh, 0, "{}"),
                    delta(&taken_a, 0, "{}"),
                    delta(&taken_b, 0, "{}"),
                ],
            )
            .await
            .unwrap();

        let response = outcome.response();
        assert_eq!(response.status, BatchStatus::PartialConflict);
        assert_eq!(response.applied_count, 1);
        assert_eq!(response.conflict_count, 2);
        assert_eq!(response.conflicts.len(), 2);

        let stored = ledger.get_batch(outcome.batch.id()).await.unwrap().unwrap();
        assert_eq!(stored, outcome.batch);
    }

    #[tokio::test]
    async fn test_sequential_updates_in_one_batch() {
        let pool = test_pool().await;
        let store = SqliteVersionStore::new(pool.clone());
        let ledger = SqliteLedger::new(pool);
        let processor = BatchProcessor::new(&store, &ledger, &SystemClock);
        let entity = project(Uuid::new_v4());

        let outcome = processor
            .process(
                device("A"),
                vec![delta(&entity, 0, "{\"v\":1}"), delta(&entity, 1, "{\"v\":2}")],
            )
            .await
            .unwrap();

        assert_eq!(outcome.batch.status(), BatchStatus::Completed);
        assert_eq!(store.get_current_version(&entity).await.unwrap(), SyncVersion::new(2));
    }

    #[tokio::test]
    async fn test_events_cover_lifecycle() {
        let pool = test_pool().await;
        let store = SqliteVersionStore::new(pool.clone());
        let ledger = SqliteLedger::new(pool);
        let processor = BatchProcessor::new(&store, &ledger, &SystemClock);
        let entity = project(Uuid::new_v4());

        let outcome = processor
            .process(device("A"), vec![delta(&entity, 0, "{}"), delta(&entity, 0, "{}")])
            .await
            .unwrap();

        let kinds: Vec<&str> = outcome
            .events
            .iter()
            .map(|e| match e {
                BatchEvent::Submitted { .. } => "submitted",
                BatchEvent::DeltaApplied { .. } => "applied",
                BatchEvent::ConflictDetected { .. } => "conflict",
                BatchEvent::Processed { .. } => "processed",
                BatchEvent::ConflictResolved { .. } => "resolved",
            })
            .collect();
        assert_eq!(kinds, vec!["submitted", "applied", "conflict", "processed"]);
        assert!(outcome.events.iter().all(|e| e.batch_id() == outcome.batch.id()));
    }

    /// Lets a rival write land between the processor's read and its write
    struct RacingStore {
        inner: SqliteVersionStore,
        rival: VersionWrite,
        fired: AtomicBool,
    }

    #[async_trait]
    impl VersionStore for RacingStore {
        async fn get_current_version(&self, entity: &EntityReference) -> SyncResult<SyncVersion> {
            let version = self.inner.get_current_version(entity).await?;
            if !self.fired.swap(true, Ordering::SeqCst) {
                assert!(self.inner.set_version(&self.rival).await?);
            }
            Ok(version)
        }

        async fn get_current_payload(
            &self,
            entity: &EntityReference,
        ) -> SyncResult<Option<DeltaPayload>> {
            self.inner.get_current_payload(entity).await
        }

        async fn get_entry(
            &self,
            entity: &EntityReference,
        ) -> SyncResult<Option<crate::sync::EntityVersionEntry>> {
            self.inner.get_entry(entity).await
        }

        async fn set_version(&self, write: &VersionWrite) -> SyncResult<bool> {
            self.inner.set_version(write).await
        }

        async fn get_changed_since(
            &self,
            since: Option<DateTime<Utc>>,
            after: Option<&ChangeCursor>,
            exclude_device: &DeviceId,
            limit: usize,
        ) -> SyncResult<Vec<crate::sync::EntityVersionEntry>> {
            self.inner
                .get_changed_since(since, after, exclude_device, limit)
                .await
        }
    }

    #[tokio::test]
    async fn test_lost_race_becomes_conflict_against_winner() {
        let pool = test_pool().await;
        let entity = project(Uuid::new_v4());
        let store = RacingStore {
            inner: SqliteVersionStore::new(pool.clone()),
            rival: VersionWrite {
                entity: entity.clone(),
                version: SyncVersion::new(1),
                payload: DeltaPayload::new(r#"{"winner":"B"}"#),
                operation: DeltaOperation::Create,
                device_id: device("B"),
                modified_at: SystemClock.now(),
            },
            fired: AtomicBool::new(false),
        };
        let ledger = SqliteLedger::new(pool);
        let processor = BatchProcessor::new(&store, &ledger, &SystemClock);

        let outcome = processor
            .process(device("A"), vec![delta(&entity, 0, r#"{"loser":"A"}"#)])
            .await
            .unwrap();

        assert_eq!(outcome.batch.status(), BatchStatus::Failed);
        let conflict = &outcome.batch.conflicts()[0];
        assert_eq!(conflict.server_version, SyncVersion::new(1));
        assert_eq!(conflict.server_payload.as_str(), r#"{"winner":"B"}"#);

        let entry = store.get_entry(&entity).await.unwrap().unwrap();
        assert_eq!(entry.last_device_id.as_str(), "B");
    }

    /// Finalizes the batch behind the processor's back, as the sweeper
    /// would, before the first delta is applied
    struct SweepingLedger {
        inner: SqliteLedger,
        swept: AtomicBool,
    }

    #[async_trait]
    impl BatchLedger for SweepingLedger {
        async fn create_batch(&self, batch: &Batch) -> SyncResult<()> {
            self.inner.create_batch(batch).await
        }

        async fn apply_delta(
            &self,
            batch_id: Uuid,
            seq: usize,
            write: &VersionWrite,
            delta: &SyncDelta,
        ) -> SyncResult<bool> {
            if !self.swept.swap(true, Ordering::SeqCst) {
                let mut stored = self.inner.get_batch(batch_id).await?.unwrap();
                stored.finalize(SystemClock.now())?;
                self.inner.finish_batch(&stored).await?;
            }
            self.inner.apply_delta(batch_id, seq, write, delta).await
        }

        async fn record_conflict(
            &self,
            batch_id: Uuid,
            seq: usize,
            conflict: &ConflictRecord,
        ) -> SyncResult<()> {
            self.inner.record_conflict(batch_id, seq, conflict).await
        }

        async fn finish_batch(&self, batch: &Batch) -> SyncResult<()> {
            self.inner.finish_batch(batch).await
        }

        async fn reconcile_batch(&self, batch: &Batch) -> SyncResult<()> {
            self.inner.reconcile_batch(batch).await
        }

        async fn get_batch(&self, batch_id: Uuid) -> SyncResult<Option<Batch>> {
            self.inner.get_batch(batch_id).await
        }

        async fn find_batch_for_conflict(&self, conflict_id: Uuid) -> SyncResult<Option<Batch>> {
            self.inner.find_batch_for_conflict(conflict_id).await
        }

        async fn commit_resolution(
            &self,
            conflict: &ConflictRecord,
            write: Option<&VersionWrite>,
        ) -> SyncResult<bool> {
            self.inner.commit_resolution(conflict, write).await
        }

        async fn list_conflicts(
            &self,
            device_id: Option<&DeviceId>,
            status: Option<ConflictStatus>,
        ) -> SyncResult<Vec<ConflictSummary>> {
            self.inner.list_conflicts(device_id, status).await
        }

        async fn list_pending_batches(
            &self,
            submitted_before: DateTime<Utc>,
            limit: usize,
        ) -> SyncResult<Vec<Batch>> {
            self.inner.list_pending_batches(submitted_before, limit).await
        }
    }

    #[tokio::test]
    async fn test_batch_swept_in_flight_keeps_its_outcome() {
        let pool = test_pool().await;
        let store = SqliteVersionStore::new(pool.clone());
        let ledger = SweepingLedger {
            inner: SqliteLedger::new(pool),
            swept: AtomicBool::new(false),
        };
        let processor = BatchProcessor::new(&store, &ledger, &SystemClock);
        let entity = project(Uuid::new_v4());

        let outcome = processor
            .process(device("A"), vec![delta(&entity, 0, "{}")])
            .await
            .unwrap();
        assert_eq!(outcome.batch.status(), BatchStatus::Completed);

        let stored = ledger.get_batch(outcome.batch.id()).await.unwrap().unwrap();
        assert_eq!(stored.status(), BatchStatus::Completed);
        assert_eq!(stored.deltas().len(), 1);
        assert_eq!(stored, outcome.batch);
    }
}

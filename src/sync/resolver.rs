//! Conflict resolution
//!
//! A conflict is resolved once. The decision and the version write it
//! implies are committed in one ledger transaction, guarded on the conflict
//! still being unresolved, so two concurrent resolutions cannot both write
//! and a failed write leaves the conflict open for a retry. `client_wins`
//! and `manual_merge` write the chosen payload as the entity's next
//! version. `server_wins` leaves the version store untouched.

use uuid::Uuid;

use super::batch::{ConflictRecord, Resolution};
use super::clock::Clock;
use super::error::{SyncError, SyncResult};
use super::events::BatchEvent;
use super::ledger::BatchLedger;
use super::types::{DeltaOperation, DeviceId, SyncVersion};
use super::version_store::{VersionStore, VersionWrite};

/// Check-and-set retries before giving up on a busy entity
pub const MAX_RESOLVE_ATTEMPTS: usize = 5;

/// Result of resolving one conflict
#[derive(Debug, Clone)]
pub struct ResolveOutcome {
    pub conflict: ConflictRecord,
    /// Version written to the store, if the resolution wrote one
    pub written_version: Option<SyncVersion>,
    pub events: Vec<BatchEvent>,
}

pub struct ConflictResolver<'a> {
    store: &'a dyn VersionStore,
    ledger: &'a dyn BatchLedger,
    clock: &'a dyn Clock,
}

impl<'a> ConflictResolver<'a> {
    pub fn new(store: &'a dyn VersionStore, ledger: &'a dyn BatchLedger, clock: &'a dyn Clock) -> Self {
        Self {
            store,
            ledger,
            clock,
        }
    }

    pub async fn resolve(
        &self,
        conflict_id: Uuid,
        resolution: Resolution,
    ) -> SyncResult<ResolveOutcome> {
        let mut batch = self
            .ledger
            .find_batch_for_conflict(conflict_id)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("conflict {}", conflict_id)))?;

        let (conflict, events) =
            batch.resolve_conflict(conflict_id, &resolution, self.clock.now())?;

        let operation = match resolution {
            Resolution::ClientWins => conflict.operation,
            Resolution::ManualMerge(_) => DeltaOperation::Update,
            Resolution::ServerWins => {
                self.ledger.commit_resolution(&conflict, None).await?;
                return Ok(ResolveOutcome {
                    conflict,
                    written_version: None,
                    events,
                });
            }
        };

        let written_version = self
            .commit_with_write(&conflict, operation, batch.device_id())
            .await?;

        tracing::info!(
            conflict_id = %conflict_id,
            entity = %conflict.entity,
            version = %written_version,
            status = conflict.status.as_str(),
            "Resolved conflict"
        );

        Ok(ResolveOutcome {
            conflict,
            written_version: Some(written_version),
            events,
        })
    }

    /// Commit the resolution with its payload written on top of whatever
    /// version is current
    async fn commit_with_write(
        &self,
        conflict: &ConflictRecord,
        operation: DeltaOperation,
        device_id: &DeviceId,
    ) -> SyncResult<SyncVersion> {
        let payload = conflict.resolved_payload.clone().ok_or_else(|| {
            SyncError::InvalidState(format!("conflict {} has no resolved payload", conflict.id))
        })?;

        for attempt in 1..=MAX_RESOLVE_ATTEMPTS {
            let current = self.store.get_current_version(&conflict.entity).await?;
            let write = VersionWrite {
                entity: conflict.entity.clone(),
                version: current.increment(),
                payload: payload.clone(),
                operation,
                device_id: device_id.clone(),
                modified_at: self.clock.now(),
            };
            if self.ledger.commit_resolution(conflict, Some(&write)).await? {
                return Ok(write.version);
            }
            tracing::debug!(
                entity = %conflict.entity,
                attempt = attempt,
                "Resolution write lost a version race, retrying"
            );
        }

        Err(SyncError::Contention(conflict.entity.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use crate::sync::batch::{BatchStatus, ConflictStatus};
    use crate::sync::clock::SystemClock;
    use crate::sync::ledger::SqliteLedger;
    use crate::sync::processor::BatchProcessor;
    use crate::sync::types::{
        ChangeCursor, ClientDelta, DeltaPayload, EntityKind, EntityReference,
    };
    use crate::sync::version_store::SqliteVersionStore;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};

    struct Fixture {
        store: SqliteVersionStore,
        ledger: SqliteLedger,
        entity: EntityReference,
        conflict_id: Uuid,
    }

    fn delta(entity: &EntityReference, payload: &str) -> ClientDelta {
        ClientDelta {
            entity: entity.clone(),
            operation: DeltaOperation::Create,
            base_version: SyncVersion::INITIAL,
            payload: DeltaPayload::new(payload),
            client_timestamp: SystemClock.now(),
        }
    }

    /// Device A creates the entity, device B conflicts with it
    async fn fixture() -> Fixture {
        let pool = test_pool().await;
        let store = SqliteVersionStore::new(pool.clone());
        let ledger = SqliteLedger::new(pool);
        let entity = EntityReference::new(EntityKind::new("project").unwrap(), Uuid::new_v4());

        let processor = BatchProcessor::new(&store, &ledger, &SystemClock);
        processor
            .process(DeviceId::new("A").unwrap(), vec![delta(&entity, r#"{"name":"X"}"#)])
            .await
            .unwrap();
        let outcome = processor
            .process(DeviceId::new("B").unwrap(), vec![delta(&entity, r#"{"name":"Y"}"#)])
            .await
            .unwrap();
        assert_eq!(outcome.batch.status(), BatchStatus::Failed);
        let conflict_id = outcome.batch.conflicts()[0].id;

        Fixture {
            store,
            ledger,
            entity,
            conflict_id,
        }
    }

    #[tokio::test]
    async fn test_client_wins_writes_next_version() {
        let f = fixture().await;
        let resolver = ConflictResolver::new(&f.store, &f.ledger, &SystemClock);

        let outcome = resolver
            .resolve(f.conflict_id, Resolution::ClientWins)
            .await
            .unwrap();
        assert_eq!(outcome.conflict.status, ConflictStatus::ClientWins);
        assert_eq!(outcome.written_version, Some(SyncVersion::new(2)));

        let entry = f.store.get_entry(&f.entity).await.unwrap().unwrap();
        assert_eq!(entry.version, SyncVersion::new(2));
        assert_eq!(entry.payload.as_str(), r#"{"name":"Y"}"#);
        assert_eq!(entry.last_device_id.as_str(), "B");
        assert_eq!(entry.last_operation, DeltaOperation::Create);

        let err = resolver
            .resolve(f.conflict_id, Resolution::ServerWins)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidState(_)));
        assert_eq!(
            f.store.get_current_version(&f.entity).await.unwrap(),
            SyncVersion::new(2)
        );
    }

    #[tokio::test]
    async fn test_server_wins_leaves_store_alone() {
        let f = fixture().await;
        let resolver = ConflictResolver::new(&f.store, &f.ledger, &SystemClock);

        let outcome = resolver
            .resolve(f.conflict_id, Resolution::ServerWins)
            .await
            .unwrap();
        assert_eq!(outcome.conflict.status, ConflictStatus::ServerWins);
        assert_eq!(outcome.conflict.resolved_payload, None);
        assert_eq!(outcome.written_version, None);

        let entry = f.store.get_entry(&f.entity).await.unwrap().unwrap();
        assert_eq!(entry.version, SyncVersion::new(1));
        assert_eq!(entry.payload.as_str(), r#"{"name":"X"}"#);

        let stored = f.ledger.find_batch_for_conflict(f.conflict_id).await.unwrap().unwrap();
        let conflict = stored.conflict(f.conflict_id).unwrap();
        assert_eq!(conflict.status, ConflictStatus::ServerWins);
        assert!(conflict.resolved_at.is_some());
    }

    #[tokio::test]
    async fn test_manual_merge_writes_update() {
        let f = fixture().await;
        let resolver = ConflictResolver::new(&f.store, &f.ledger, &SystemClock);
        let merged = DeltaPayload::new(r#"{"name":"XY"}"#);

        let outcome = resolver
            .resolve(f.conflict_id, Resolution::ManualMerge(merged.clone()))
            .await
            .unwrap();
        assert_eq!(outcome.conflict.status, ConflictStatus::ManualMerge);
        assert_eq!(outcome.conflict.resolved_payload, Some(merged.clone()));
        assert!(matches!(
            outcome.events.as_slice(),
            [BatchEvent::ConflictResolved { .. }]
        ));

        let entry = f.store.get_entry(&f.entity).await.unwrap().unwrap();
        assert_eq!(entry.version, SyncVersion::new(2));
        assert_eq!(entry.payload, merged);
        assert_eq!(entry.last_operation, DeltaOperation::Update);
    }

    #[tokio::test]
    async fn test_unknown_conflict() {
        let f = fixture().await;
        let resolver = ConflictResolver::new(&f.store, &f.ledger, &SystemClock);

        let err = resolver
            .resolve(Uuid::new_v4(), Resolution::ClientWins)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::NotFound(_)));
    }

    /// A store that always reports the entity as never written, so every
    /// write computed from it loses the compare-and-swap
    struct StaleStore(SqliteVersionStore);

    #[async_trait]
    impl VersionStore for StaleStore {
        async fn get_current_version(&self, _entity: &EntityReference) -> SyncResult<SyncVersion> {
            Ok(SyncVersion::INITIAL)
        }

        async fn get_current_payload(
            &self,
            entity: &EntityReference,
        ) -> SyncResult<Option<DeltaPayload>> {
            self.0.get_current_payload(entity).await
        }

        async fn get_entry(
            &self,
            entity: &EntityReference,
        ) -> SyncResult<Option<crate::sync::EntityVersionEntry>> {
            self.0.get_entry(entity).await
        }

        async fn set_version(&self, write: &VersionWrite) -> SyncResult<bool> {
            self.0.set_version(write).await
        }

        async fn get_changed_since(
            &self,
            since: Option<DateTime<Utc>>,
            after: Option<&ChangeCursor>,
            exclude_device: &DeviceId,
            limit: usize,
        ) -> SyncResult<Vec<crate::sync::EntityVersionEntry>> {
            self.0.get_changed_since(since, after, exclude_device, limit).await
        }
    }

    #[tokio::test]
    async fn test_persistent_contention_is_reported() {
        let f = fixture().await;
        let stale = StaleStore(f.store.clone());
        let resolver = ConflictResolver::new(&stale, &f.ledger, &SystemClock);

        let err = resolver
            .resolve(f.conflict_id, Resolution::ClientWins)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Contention(_)));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_contention_leaves_conflict_open_for_retry() {
        let f = fixture().await;
        let stale = StaleStore(f.store.clone());

        let err = ConflictResolver::new(&stale, &f.ledger, &SystemClock)
            .resolve(f.conflict_id, Resolution::ClientWins)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Contention(_)));

        let stored = f.ledger.find_batch_for_conflict(f.conflict_id).await.unwrap().unwrap();
        let conflict = stored.conflict(f.conflict_id).unwrap();
        assert_eq!(conflict.status, ConflictStatus::Unresolved);
        assert_eq!(conflict.resolved_payload, None);
        let entry = f.store.get_entry(&f.entity).await.unwrap().unwrap();
        assert_eq!(entry.version, SyncVersion::new(1));
        assert_eq!(entry.payload.as_str(), r#"{"name":"X"}"#);

        // The client's retry goes through once the entity is writable.
        let outcome = ConflictResolver::new(&f.store, &f.ledger, &SystemClock)
            .resolve(f.conflict_id, Resolution::ClientWins)
            .await
            .unwrap();
        assert_eq!(outcome.written_version, Some(SyncVersion::new(2)));
        let entry = f.store.get_entry(&f.entity).await.unwrap().unwrap();
        assert_eq!(entry.payload.as_str(), r#"{"name":"Y"}"#);
        assert_eq!(entry.last_device_id.as_str(), "B");
    }
}

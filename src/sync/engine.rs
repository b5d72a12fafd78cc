//! Sync engine facade
//!
//! Owns the storage adapters and exposes the request-level operations used
//! by the HTTP layer. Each call builds a short-lived processor, resolver or
//! feed over the shared adapters.

use std::sync::Arc;

use sqlx::SqlitePool;
use uuid::Uuid;

use super::batch::{Batch, Resolution};
use super::clock::{Clock, SystemClock};
use super::error::{SyncError, SyncResult};
use super::events::EventPublisher;
use super::feed::{ChangeFeed, PullLimits};
use super::ledger::{BatchLedger, SqliteLedger};
use super::processor::{BatchProcessor, PushOutcome};
use super::resolver::{ConflictResolver, ResolveOutcome};
use super::scheduler::PendingBatchSweeper;
use super::types::{
    ConflictQuery, ConflictSummary, DeviceId, EntityKind, EntityReference, PullQuery,
    PullResponse, PushRequest, ResolveRequest,
};
use super::validation::{validate_push, SyncLimits};
use super::version_store::{EntityVersionEntry, SqliteVersionStore, VersionStore};

#[derive(Clone)]
pub struct SyncEngine {
    store: Arc<dyn VersionStore>,
    ledger: Arc<dyn BatchLedger>,
    clock: Arc<dyn Clock>,
    limits: SyncLimits,
    pull_limits: PullLimits,
}

impl SyncEngine {
    pub fn new(
        store: Arc<dyn VersionStore>,
        ledger: Arc<dyn BatchLedger>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            ledger,
            clock,
            limits: SyncLimits::default(),
            pull_limits: PullLimits::default(),
        }
    }

    /// Engine over SQLite storage and the system clock
    pub fn sqlite(pool: SqlitePool) -> Self {
        Self::new(
            Arc::new(SqliteVersionStore::new(pool.clone())),
            Arc::new(SqliteLedger::new(pool)),
            Arc::new(SystemClock),
        )
    }

    pub fn with_limits(mut self, limits: SyncLimits, pull_limits: PullLimits) -> Self {
        self.limits = limits;
        self.pull_limits = pull_limits;
        self
    }

    /// Validate and process a client batch
    pub async fn push_batch(&self, request: PushRequest) -> SyncResult<PushOutcome> {
        let (device_id, deltas) = validate_push(request, &self.limits)?;
        let count = deltas.len();

        let outcome = BatchProcessor::new(&*self.store, &*self.ledger, &*self.clock)
            .process(device_id, deltas)
            .await?;

        tracing::info!(
            batch_id = %outcome.batch.id(),
            device_id = %outcome.batch.device_id(),
            deltas = count,
            applied = outcome.batch.applied_count(),
            conflicts = outcome.batch.conflicts().len(),
            status = outcome.batch.status().as_str(),
            "Processed push"
        );

        Ok(outcome)
    }

    /// Changes made by other devices since the query's cursor
    pub async fn pull_changes(&self, query: PullQuery) -> SyncResult<PullResponse> {
        let device_id = DeviceId::new(query.device_id)?;
        let limit = self.pull_limits.effective(query.limit);

        ChangeFeed::new(&*self.store, &*self.clock)
            .pull(&device_id, query.since, query.after.as_ref(), limit)
            .await
    }

    pub async fn list_conflicts(&self, query: ConflictQuery) -> SyncResult<Vec<ConflictSummary>> {
        let device_id = query.device_id.map(DeviceId::new).transpose()?;
        self.ledger
            .list_conflicts(device_id.as_ref(), query.status)
            .await
    }

    pub async fn resolve_conflict(
        &self,
        conflict_id: Uuid,
        request: ResolveRequest,
    ) -> SyncResult<ResolveOutcome> {
        let resolution = Resolution::from_request(request)?;
        if let Resolution::ManualMerge(merged) = &resolution {
            if merged.len() > self.limits.max_payload_bytes {
                return Err(SyncError::Validation(format!(
                    "merged payload is {} bytes (max: {})",
                    merged.len(),
                    self.limits.max_payload_bytes
                )));
            }
        }

        ConflictResolver::new(&*self.store, &*self.ledger, &*self.clock)
            .resolve(conflict_id, resolution)
            .await
    }

    pub async fn get_batch(&self, batch_id: Uuid) -> SyncResult<Batch> {
        self.ledger
            .get_batch(batch_id)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("batch {}", batch_id)))
    }

    /// Current server-side state of one entity
    pub async fn get_entity(&self, kind: &str, entity_id: Uuid) -> SyncResult<EntityVersionEntry> {
        let entity = EntityReference::new(EntityKind::new(kind)?, entity_id);
        self.store
            .get_entry(&entity)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("entity {}", entity)))
    }

    /// Sweeper over this engine's ledger and clock
    pub fn sweeper(
        &self,
        publisher: Arc<dyn EventPublisher>,
        grace: chrono::Duration,
        interval: std::time::Duration,
    ) -> PendingBatchSweeper {
        PendingBatchSweeper::new(
            self.ledger.clone(),
            self.clock.clone(),
            publisher,
            grace,
            interval,
        )
    }
}

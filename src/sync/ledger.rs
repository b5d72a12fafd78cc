//! Batch and conflict ledger
//!
//! Durable audit record of every push. Batches are written incrementally:
//! the pending row first, then each delta or conflict as the processor
//! records it, then the terminal status. An applied delta is committed in
//! the same transaction as its version write, and a resolution in the same
//! transaction as the write it makes. Nothing here is ever deleted.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use super::batch::{Batch, BatchStatus, ConflictRecord, ConflictStatus, SyncDelta};
use super::clock::{format_timestamp, parse_timestamp};
use super::error::{SyncError, SyncResult};
use super::types::{
    ConflictSummary, DeltaOperation, DeltaPayload, DeviceId, EntityKind, EntityReference,
    SyncVersion,
};
use super::version_store::{compare_and_swap, VersionWrite};

/// Storage contract for batch aggregates
#[async_trait]
pub trait BatchLedger: Send + Sync {
    /// Persist a newly submitted, still pending batch
    async fn create_batch(&self, batch: &Batch) -> SyncResult<()>;

    /// Write `write` to the version store and append `delta` at position
    /// `seq`, both or neither
    ///
    /// Returns `false`, recording nothing, when the compare-and-swap loses.
    async fn apply_delta(
        &self,
        batch_id: Uuid,
        seq: usize,
        write: &VersionWrite,
        delta: &SyncDelta,
    ) -> SyncResult<bool>;

    /// Append a detected conflict at position `seq`
    async fn record_conflict(
        &self,
        batch_id: Uuid,
        seq: usize,
        conflict: &ConflictRecord,
    ) -> SyncResult<()>;

    /// Store the terminal status of a batch that is still pending in storage
    async fn finish_batch(&self, batch: &Batch) -> SyncResult<()>;

    /// Overwrite the stored status with the one computed by the request
    /// that ran the batch
    ///
    /// Used when the sweeper finished the batch while it was still in flight.
    async fn reconcile_batch(&self, batch: &Batch) -> SyncResult<()>;

    async fn get_batch(&self, batch_id: Uuid) -> SyncResult<Option<Batch>>;

    /// The batch owning a conflict
    async fn find_batch_for_conflict(&self, conflict_id: Uuid) -> SyncResult<Option<Batch>>;

    /// Persist a resolution together with its version write, if any
    ///
    /// Fails with `InvalidState` if the stored conflict is already resolved.
    /// Returns `false`, leaving the conflict unresolved, when the write's
    /// compare-and-swap loses.
    async fn commit_resolution(
        &self,
        conflict: &ConflictRecord,
        write: Option<&VersionWrite>,
    ) -> SyncResult<bool>;

    async fn list_conflicts(
        &self,
        device_id: Option<&DeviceId>,
        status: Option<ConflictStatus>,
    ) -> SyncResult<Vec<ConflictSummary>>;

    /// Batches still pending that were submitted before `submitted_before`
    async fn list_pending_batches(
        &self,
        submitted_before: DateTime<Utc>,
        limit: usize,
    ) -> SyncResult<Vec<Batch>>;
}

/// SQLite-backed ledger
#[derive(Clone)]
pub struct SqliteLedger {
    pool: SqlitePool,
}

impl SqliteLedger {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn load_children(&self, row: BatchRow) -> SyncResult<Batch> {
        let deltas = sqlx::query_as::<_, DeltaRow>(
            r#"
            SELECT id, entity_kind, entity_id, operation, base_version,
                   server_version, payload, client_timestamp
            FROM sync_deltas
            WHERE batch_id = ?
            ORDER BY seq ASC
            "#,
        )
        .bind(&row.id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|r| r.into_delta())
        .collect::<SyncResult<Vec<_>>>()?;

        let conflicts = sqlx::query_as::<_, ConflictRow>(&format!(
            "{} WHERE c.batch_id = ? ORDER BY c.seq ASC",
            CONFLICT_SELECT
        ))
        .bind(&row.id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|r| r.into_record())
        .collect::<SyncResult<Vec<_>>>()?;

        Ok(Batch::restore(
            parse_uuid(&row.id)?,
            device_from_db(row.device_id)?,
            BatchStatus::parse(&row.status)?,
            parse_timestamp(&row.submitted_at)?,
            row.processed_at.as_deref().map(parse_timestamp).transpose()?,
            deltas,
            conflicts,
        ))
    }
}

const CONFLICT_SELECT: &str = r#"
    SELECT c.id, c.batch_id, b.device_id, c.entity_kind, c.entity_id, c.operation,
           c.client_payload, c.server_payload, c.client_version, c.server_version,
           c.status, c.resolved_payload, c.detected_at, c.resolved_at
    FROM sync_conflicts c
    JOIN sync_batches b ON b.id = c.batch_id
"#;

#[async_trait]
impl BatchLedger for SqliteLedger {
    async fn create_batch(&self, batch: &Batch) -> SyncResult<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_batches (id, device_id, status, submitted_at, processed_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(batch.id().to_string())
        .bind(batch.device_id().as_str())
        .bind(batch.status().as_str())
        .bind(format_timestamp(batch.submitted_at()))
        .bind(batch.processed_at().map(format_timestamp))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn apply_delta(
        &self,
        batch_id: Uuid,
        seq: usize,
        write: &VersionWrite,
        delta: &SyncDelta,
    ) -> SyncResult<bool> {
        let mut tx = self.pool.begin().await?;

        if !compare_and_swap(&mut *tx, write).await? {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            r#"
            INSERT INTO sync_deltas (
                id, batch_id, seq, entity_kind, entity_id, operation,
                base_version, server_version, payload, client_timestamp
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(delta.id.to_string())
        .bind(batch_id.to_string())
        .bind(seq as i64)
        .bind(delta.entity.entity_kind.as_str())
        .bind(delta.entity.entity_id.to_string())
        .bind(delta.operation.as_str())
        .bind(delta.base_version.to_db())
        .bind(delta.server_version.to_db())
        .bind(delta.payload.as_str())
        .bind(format_timestamp(delta.client_timestamp))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn record_conflict(
        &self,
        batch_id: Uuid,
        seq: usize,
        conflict: &ConflictRecord,
    ) -> SyncResult<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_conflicts (
                id, batch_id, seq, entity_kind, entity_id, operation,
                client_payload, server_payload, client_version, server_version,
                status, resolved_payload, detected_at, resolved_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(conflict.id.to_string())
        .bind(batch_id.to_string())
        .bind(seq as i64)
        .bind(conflict.entity.entity_kind.as_str())
        .bind(conflict.entity.entity_id.to_string())
        .bind(conflict.operation.as_str())
        .bind(conflict.client_payload.as_str())
        .bind(conflict.server_payload.as_str())
        .bind(conflict.client_version.to_db())
        .bind(conflict.server_version.to_db())
        .bind(conflict.status.as_str())
        .bind(conflict.resolved_payload.as_ref().map(|p| p.as_str().to_string()))
        .bind(format_timestamp(conflict.detected_at))
        .bind(conflict.resolved_at.map(format_timestamp))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn finish_batch(&self, batch: &Batch) -> SyncResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE sync_batches SET status = ?, processed_at = ?
            WHERE id = ? AND status = 'pending'
            "#,
        )
        .bind(batch.status().as_str())
        .bind(batch.processed_at().map(format_timestamp))
        .bind(batch.id().to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(SyncError::InvalidState(format!(
                "batch {} is missing or already finished",
                batch.id()
            )));
        }
        Ok(())
    }

    async fn reconcile_batch(&self, batch: &Batch) -> SyncResult<()> {
        let result =
            sqlx::query("UPDATE sync_batches SET status = ?, processed_at = ? WHERE id = ?")
                .bind(batch.status().as_str())
                .bind(batch.processed_at().map(format_timestamp))
                .bind(batch.id().to_string())
                .execute(&self.pool)
                .await?;

        if result.rows_affected() == 0 {
            return Err(SyncError::NotFound(format!("batch {}", batch.id())));
        }
        Ok(())
    }

    async fn get_batch(&self, batch_id: Uuid) -> SyncResult<Option<Batch>> {
        let row = sqlx::query_as::<_, BatchRow>(
            "SELECT id, device_id, status, submitted_at, processed_at FROM sync_batches WHERE id = ?",
        )
        .bind(batch_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(self.load_children(row).await?)),
            None => Ok(None),
        }
    }

    async fn find_batch_for_conflict(&self, conflict_id: Uuid) -> SyncResult<Option<Batch>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT batch_id FROM sync_conflicts WHERE id = ?")
                .bind(conflict_id.to_string())
                .fetch_optional(&self.pool)
                .await?;

        match row {
            Some((batch_id,)) => self.get_batch(parse_uuid(&batch_id)?).await,
            None => Ok(None),
        }
    }

    async fn commit_resolution(
        &self,
        conflict: &ConflictRecord,
        write: Option<&VersionWrite>,
    ) -> SyncResult<bool> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE sync_conflicts SET status = ?, resolved_payload = ?, resolved_at = ?
            WHERE id = ? AND status = 'unresolved'
            "#,
        )
        .bind(conflict.status.as_str())
        .bind(conflict.resolved_payload.as_ref().map(|p| p.as_str().to_string()))
        .bind(conflict.resolved_at.map(format_timestamp))
        .bind(conflict.id.to_string())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(SyncError::InvalidState(format!(
                "conflict {} already resolved",
                conflict.id
            )));
        }

        if let Some(write) = write {
            if !compare_and_swap(&mut *tx, write).await? {
                tx.rollback().await?;
                return Ok(false);
            }
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn list_conflicts(
        &self,
        device_id: Option<&DeviceId>,
        status: Option<ConflictStatus>,
    ) -> SyncResult<Vec<ConflictSummary>> {
        let mut sql = format!("{} WHERE 1=1", CONFLICT_SELECT);
        if device_id.is_some() {
            sql.push_str(" AND b.device_id = ?");
        }
        if status.is_some() {
            sql.push_str(" AND c.status = ?");
        }
        sql.push_str(" ORDER BY c.detected_at ASC, c.seq ASC");

        let mut q = sqlx::query_as::<_, ConflictRow>(&sql);
        if let Some(device_id) = device_id {
            q = q.bind(device_id.as_str());
        }
        if let Some(status) = status {
            q = q.bind(status.as_str());
        }

        let rows = q.fetch_all(&self.pool).await?;

        rows.into_iter().map(|r| r.into_summary()).collect()
    }

    async fn list_pending_batches(
        &self,
        submitted_before: DateTime<Utc>,
        limit: usize,
    ) -> SyncResult<Vec<Batch>> {
        let rows = sqlx::query_as::<_, BatchRow>(
            r#"
            SELECT id, device_id, status, submitted_at, processed_at
            FROM sync_batches
            WHERE status = 'pending' AND submitted_at < ?
            ORDER BY submitted_at ASC
            LIMIT ?
            "#,
        )
        .bind(format_timestamp(submitted_before))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        let mut batches = Vec::with_capacity(rows.len());
        for row in rows {
            batches.push(self.load_children(row).await?);
        }
        Ok(batches)
    }
}

fn parse_uuid(raw: &str) -> SyncResult<Uuid> {
    Uuid::parse_str(raw).map_err(|e| SyncError::Corrupt(format!("bad uuid {}: {}", raw, e)))
}

fn device_from_db(raw: String) -> SyncResult<DeviceId> {
    DeviceId::new(raw).map_err(|_| SyncError::Corrupt("empty device id in storage".to_string()))
}

fn entity_from_db(kind: String, id: &str) -> SyncResult<EntityReference> {
    let kind = EntityKind::new(kind)
        .map_err(|_| SyncError::Corrupt("empty entity kind in storage".to_string()))?;
    Ok(EntityReference::new(kind, parse_uuid(id)?))
}

fn operation_from_db(raw: &str) -> SyncResult<DeltaOperation> {
    raw.parse()
        .map_err(|_| SyncError::Corrupt(format!("bad operation {}", raw)))
}

#[derive(sqlx::FromRow)]
struct BatchRow {
    id: String,
    device_id: String,
    status: String,
    submitted_at: String,
    processed_at: Option<String>,
}

#[derive(sqlx::FromRow)]
struct DeltaRow {
    id: String,
    entity_kind: String,
    entity_id: String,
    operation: String,
    base_version: i64,
    server_version: i64,
    payload: String,
    client_timestamp: String,
}

impl DeltaRow {
    fn into_delta(self) -> SyncResult<SyncDelta> {
        Ok(SyncDelta {
            id: parse_uuid(&self.id)?,
            operation: operation_from_db(&self.operation)?,
            entity: entity_from_db(self.entity_kind, &self.entity_id)?,
            base_version: SyncVersion::from_db(self.base_version)?,
            server_version: SyncVersion::from_db(self.server_version)?,
            payload: DeltaPayload::new(self.payload),
            client_timestamp: parse_timestamp(&self.client_timestamp)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ConflictRow {
    id: String,
    batch_id: String,
    device_id: String,
    entity_kind: String,
    entity_id: String,
    operation: String,
    client_payload: String,
    server_payload: String,
    client_version: i64,
    server_version: i64,
    status: String,
    resolved_payload: Option<String>,
    detected_at: String,
    resolved_at: Option<String>,
}

impl ConflictRow {
    fn into_record(self) -> SyncResult<ConflictRecord> {
        Ok(ConflictRecord {
            id: parse_uuid(&self.id)?,
            operation: operation_from_db(&self.operation)?,
            entity: entity_from_db(self.entity_kind, &self.entity_id)?,
            client_payload: DeltaPayload::new(self.client_payload),
            server_payload: DeltaPayload::new(self.server_payload),
            client_version: SyncVersion::from_db(self.client_version)?,
            server_version: SyncVersion::from_db(self.server_version)?,
            status: ConflictStatus::parse(&self.status)?,
            resolved_payload: self.resolved_payload.map(DeltaPayload::new),
            detected_at: parse_timestamp(&self.detected_at)?,
            resolved_at: self.resolved_at.as_deref().map(parse_timestamp).transpose()?,
        })
    }

    fn into_summary(self) -> SyncResult<ConflictSummary> {
        let batch_id = parse_uuid(&self.batch_id)?;
        let device_id = device_from_db(self.device_id.clone())?;
        let record = self.into_record()?;
        Ok(ConflictSummary::from_record(batch_id, &device_id, &record))
    }
}

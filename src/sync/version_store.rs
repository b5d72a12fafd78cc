//! Version store
//!
//! Authoritative current version and payload per entity. Writes are a
//! compare-and-swap on the previous version, so two writers that read the
//! same version can never both advance it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{Sqlite, SqlitePool};
use uuid::Uuid;

use super::clock::{format_timestamp, parse_timestamp};
use super::error::{SyncError, SyncResult};
use super::types::{
    ChangeCursor, ChangeEntry, DeltaOperation, DeltaPayload, DeviceId, EntityKind,
    EntityReference, SyncVersion,
};

/// The store's row for one entity
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityVersionEntry {
    #[serde(flatten)]
    pub entity: EntityReference,
    pub version: SyncVersion,
    pub payload: DeltaPayload,
    pub last_operation: DeltaOperation,
    pub last_modified: DateTime<Utc>,
    pub last_device_id: DeviceId,
}

impl EntityVersionEntry {
    /// Position of this row in the changed-since ordering
    pub fn cursor(&self) -> ChangeCursor {
        ChangeCursor {
            timestamp: self.last_modified,
            entity_kind: self.entity.entity_kind.clone(),
            entity_id: self.entity.entity_id,
        }
    }

    pub fn into_change(self) -> ChangeEntry {
        ChangeEntry {
            entity_kind: self.entity.entity_kind,
            entity_id: self.entity.entity_id,
            operation: self.last_operation,
            version: self.version,
            payload: self.payload,
            timestamp: self.last_modified,
        }
    }
}

/// A conditional write of a new version
#[derive(Debug, Clone)]
pub struct VersionWrite {
    pub entity: EntityReference,
    /// Must be exactly one past the stored version
    pub version: SyncVersion,
    pub payload: DeltaPayload,
    pub operation: DeltaOperation,
    pub device_id: DeviceId,
    pub modified_at: DateTime<Utc>,
}

/// Storage contract for per-entity versions
#[async_trait]
pub trait VersionStore: Send + Sync {
    /// Current version, or `INITIAL` if never written
    async fn get_current_version(&self, entity: &EntityReference) -> SyncResult<SyncVersion>;

    /// Current payload, if any
    async fn get_current_payload(&self, entity: &EntityReference)
        -> SyncResult<Option<DeltaPayload>>;

    /// Full row for an entity
    async fn get_entry(&self, entity: &EntityReference) -> SyncResult<Option<EntityVersionEntry>>;

    /// Write `write.version` only if the stored version is `write.version - 1`
    ///
    /// Returns `false` when another writer got there first.
    async fn set_version(&self, write: &VersionWrite) -> SyncResult<bool>;

    /// Rows modified after `since` by devices other than `exclude_device`,
    /// at most `limit`
    ///
    /// Ordered by `(last_modified, entity_kind, entity_id)`. `after` skips
    /// every row at or before that position in the ordering.
    async fn get_changed_since(
        &self,
        since: Option<DateTime<Utc>>,
        after: Option<&ChangeCursor>,
        exclude_device: &DeviceId,
        limit: usize,
    ) -> SyncResult<Vec<EntityVersionEntry>>;
}

/// SQLite-backed version store
#[derive(Clone)]
pub struct SqliteVersionStore {
    pool: SqlitePool,
}

impl SqliteVersionStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl VersionStore for SqliteVersionStore {
    async fn get_current_version(&self, entity: &EntityReference) -> SyncResult<SyncVersion> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT version FROM entity_versions WHERE entity_kind = ? AND entity_id = ?",
        )
        .bind(entity.entity_kind.as_str())
        .bind(entity.entity_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some((v,)) => SyncVersion::from_db(v),
            None => Ok(SyncVersion::INITIAL),
        }
    }

    async fn get_current_payload(
        &self,
        entity: &EntityReference,
    ) -> SyncResult<Option<DeltaPayload>> {
        let row: Option<(Option<String>,)> = sqlx::query_as(
            "SELECT payload FROM entity_versions WHERE entity_kind = ? AND entity_id = ?",
        )
        .bind(entity.entity_kind.as_str())
        .bind(entity.entity_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.and_then(|(p,)| p).map(DeltaPayload::new))
    }

    async fn get_entry(&self, entity: &EntityReference) -> SyncResult<Option<EntityVersionEntry>> {
        let row = sqlx::query_as::<_, EntityVersionRow>(
            r#"
            SELECT entity_kind, entity_id, version, payload, last_operation,
                   last_modified, last_device_id
            FROM entity_versions
            WHERE entity_kind = ? AND entity_id = ?
            "#,
        )
        .bind(entity.entity_kind.as_str())
        .bind(entity.entity_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| r.into_entry()).transpose()
    }

    async fn set_version(&self, write: &VersionWrite) -> SyncResult<bool> {
        compare_and_swap(&self.pool, write).await
    }

    async fn get_changed_since(
        &self,
        since: Option<DateTime<Utc>>,
        after: Option<&ChangeCursor>,
        exclude_device: &DeviceId,
        limit: usize,
    ) -> SyncResult<Vec<EntityVersionEntry>> {
        let mut sql = String::from(
            r#"
            SELECT entity_kind, entity_id, version, payload, last_operation,
                   last_modified, last_device_id
            FROM entity_versions
            WHERE last_device_id <> ?
            "#,
        );
        if since.is_some() {
            sql.push_str(" AND last_modified > ?");
        }
        if after.is_some() {
            sql.push_str(" AND (last_modified, entity_kind, entity_id) > (?, ?, ?)");
        }
        sql.push_str(" ORDER BY last_modified ASC, entity_kind ASC, entity_id ASC LIMIT ?");

        let mut q = sqlx::query_as::<_, EntityVersionRow>(&sql).bind(exclude_device.as_str());
        if let Some(since) = since {
            q = q.bind(format_timestamp(since));
        }
        if let Some(after) = after {
            q = q
                .bind(format_timestamp(after.timestamp))
                .bind(after.entity_kind.as_str())
                .bind(after.entity_id.to_string());
        }
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let rows = q.bind(limit).fetch_all(&self.pool).await?;

        rows.into_iter().map(|r| r.into_entry()).collect()
    }
}

/// Compare-and-swap of one entity row on any SQLite executor
///
/// Shared by the store and by ledger transactions that must record the
/// write and its audit row together.
pub(crate) async fn compare_and_swap<'e, E>(executor: E, write: &VersionWrite) -> SyncResult<bool>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let modified = format_timestamp(write.modified_at);

    let result = if write.version == SyncVersion::INITIAL.increment() {
        sqlx::query(
            r#"
            INSERT INTO entity_versions (
                entity_kind, entity_id, version, payload, last_operation,
                last_modified, last_device_id
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(entity_kind, entity_id) DO NOTHING
            "#,
        )
        .bind(write.entity.entity_kind.as_str())
        .bind(write.entity.entity_id.to_string())
        .bind(write.version.to_db())
        .bind(write.payload.as_str())
        .bind(write.operation.as_str())
        .bind(&modified)
        .bind(write.device_id.as_str())
        .execute(executor)
        .await?
    } else {
        sqlx::query(
            r#"
            UPDATE entity_versions SET
                version = ?,
                payload = ?,
                last_operation = ?,
                last_modified = ?,
                last_device_id = ?
            WHERE entity_kind = ? AND entity_id = ? AND version = ?
            "#,
        )
        .bind(write.version.to_db())
        .bind(write.payload.as_str())
        .bind(write.operation.as_str())
        .bind(&modified)
        .bind(write.device_id.as_str())
        .bind(write.entity.entity_kind.as_str())
        .bind(write.entity.entity_id.to_string())
        .bind(write.version.to_db() - 1)
        .execute(executor)
        .await?
    };

    Ok(result.rows_affected() == 1)
}

#[derive(sqlx::FromRow)]
struct EntityVersionRow {
    entity_kind: String,
    entity_id: String,
    version: i64,
    payload: Option<String>,
    last_operation: String,
    last_modified: String,
    last_device_id: String,
}

impl EntityVersionRow {
    fn into_entry(self) -> SyncResult<EntityVersionEntry> {
        let entity_id = Uuid::parse_str(&self.entity_id)
            .map_err(|e| SyncError::Corrupt(format!("bad entity id {}: {}", self.entity_id, e)))?;
        let entity_kind = EntityKind::new(self.entity_kind)
            .map_err(|_| SyncError::Corrupt("empty entity kind in storage".to_string()))?;
        let last_operation = self
            .last_operation
            .parse()
            .map_err(|_| SyncError::Corrupt(format!("bad operation {}", self.last_operation)))?;
        let last_device_id = DeviceId::new(self.last_device_id)
            .map_err(|_| SyncError::Corrupt("empty device id in storage".to_string()))?;

        Ok(EntityVersionEntry {
            entity: EntityReference::new(entity_kind, entity_id),
            version: SyncVersion::from_db(self.version)?,
            payload: self
                .payload
                .map(DeltaPayload::new)
                .unwrap_or_else(DeltaPayload::empty_object),
            last_operation,
            last_modified: parse_timestamp(&self.last_modified)?,
            last_device_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use chrono::Duration;

    fn project(id: Uuid) -> EntityReference {
        EntityReference::new(EntityKind::new("project").unwrap(), id)
    }

    fn write(entity: &EntityReference, version: u64, payload: &str, device: &str) -> VersionWrite {
        VersionWrite {
            entity: entity.clone(),
            version: SyncVersion::new(version),
            payload: DeltaPayload::new(payload),
            operation: DeltaOperation::Update,
            device_id: DeviceId::new(device).unwrap(),
            modified_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_unknown_entity_is_initial() {
        let store = SqliteVersionStore::new(test_pool().await);
        let entity = project(Uuid::new_v4());

        assert_eq!(store.get_current_version(&entity).await.unwrap(), SyncVersion::INITIAL);
        assert!(store.get_current_payload(&entity).await.unwrap().is_none());
        assert!(store.get_entry(&entity).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_compare_and_swap() {
        let store = SqliteVersionStore::new(test_pool().await);
        let entity = project(Uuid::new_v4());

        assert!(store.set_version(&write(&entity, 1, "{\"v\":1}", "a")).await.unwrap());
        // A second creator loses.
        assert!(!store.set_version(&write(&entity, 1, "{\"v\":\"b\"}", "b")).await.unwrap());
        assert!(store.set_version(&write(&entity, 2, "{\"v\":2}", "a")).await.unwrap());
        // Skipping a version or replaying an old one is rejected.
        assert!(!store.set_version(&write(&entity, 4, "{}", "a")).await.unwrap());
        assert!(!store.set_version(&write(&entity, 2, "{}", "b")).await.unwrap());

        let entry = store.get_entry(&entity).await.unwrap().unwrap();
        assert_eq!(entry.version, SyncVersion::new(2));
        assert_eq!(entry.payload.as_str(), "{\"v\":2}");
        assert_eq!(entry.last_device_id.as_str(), "a");
    }

    #[tokio::test]
    async fn test_versions_never_decrease() {
        let store = SqliteVersionStore::new(test_pool().await);
        let entity = project(Uuid::new_v4());

        let mut last = SyncVersion::INITIAL;
        for attempt in [1u64, 1, 2, 1, 3, 2, 4] {
            let _ = store.set_version(&write(&entity, attempt, "{}", "a")).await.unwrap();
            let current = store.get_current_version(&entity).await.unwrap();
            assert!(current >= last);
            last = current;
        }
        assert_eq!(last, SyncVersion::new(4));
    }

    #[tokio::test]
    async fn test_changed_since_filters_and_orders() {
        let store = SqliteVersionStore::new(test_pool().await);
        let base = Utc::now();

        let mine = project(Uuid::new_v4());
        let theirs_old = project(Uuid::new_v4());
        let theirs_new = project(Uuid::new_v4());

        let mut w = write(&theirs_new, 1, "{}", "b");
        w.modified_at = base + Duration::seconds(2);
        store.set_version(&w).await.unwrap();

        let mut w = write(&theirs_old, 1, "{}", "b");
        w.modified_at = base;
        store.set_version(&w).await.unwrap();

        let mut w = write(&mine, 1, "{}", "a");
        w.modified_at = base + Duration::seconds(1);
        store.set_version(&w).await.unwrap();

        let device_a = DeviceId::new("a").unwrap();

        let all = store.get_changed_since(None, None, &device_a, 10).await.unwrap();
        let ids: Vec<Uuid> = all.iter().map(|e| e.entity.entity_id).collect();
        assert_eq!(ids, vec![theirs_old.entity_id, theirs_new.entity_id]);

        // `since` is exclusive.
        let after = store.get_changed_since(Some(base), None, &device_a, 10).await.unwrap();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].entity.entity_id, theirs_new.entity_id);

        let limited = store.get_changed_since(None, None, &device_a, 1).await.unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn test_changed_after_cursor_breaks_timestamp_ties() {
        let store = SqliteVersionStore::new(test_pool().await);
        let at = Utc::now();

        let mut ids = Vec::new();
        for _ in 0..3 {
            let entity = project(Uuid::new_v4());
            let mut w = write(&entity, 1, "{}", "b");
            w.modified_at = at;
            store.set_version(&w).await.unwrap();
            ids.push(entity.entity_id);
        }
        ids.sort_by_key(|id| id.to_string());

        let device_a = DeviceId::new("a").unwrap();
        let first = store.get_changed_since(None, None, &device_a, 1).await.unwrap();
        assert_eq!(first[0].entity.entity_id, ids[0]);

        let cursor = first[0].cursor();
        let rest = store
            .get_changed_since(None, Some(&cursor), &device_a, 10)
            .await
            .unwrap();
        let rest: Vec<Uuid> = rest.iter().map(|e| e.entity.entity_id).collect();
        assert_eq!(rest, vec![ids[1], ids[2]]);
    }

    #[tokio::test]
    async fn test_compare_and_swap_inside_transaction() {
        let pool = test_pool().await;
        let store = SqliteVersionStore::new(pool.clone());
        let entity = project(Uuid::new_v4());

        let mut tx = pool.begin().await.unwrap();
        assert!(compare_and_swap(&mut *tx, &write(&entity, 1, "{}", "a")).await.unwrap());
        tx.rollback().await.unwrap();

        assert_eq!(store.get_current_version(&entity).await.unwrap(), SyncVersion::INITIAL);
    }
}

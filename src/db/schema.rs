//! Database schema initialization

use sqlx::SqlitePool;

use crate::error::Result;

/// Initialize the database schema
pub async fn initialize_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(SCHEMA_SQL).execute(pool).await?;

    Ok(())
}

const SCHEMA_SQL: &str = r#"
-- Current version per entity (one row per entity_kind/entity_id)
CREATE TABLE IF NOT EXISTS entity_versions (
    entity_kind TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    version INTEGER NOT NULL,
    payload TEXT,
    last_operation TEXT NOT NULL,
    last_modified TEXT NOT NULL,
    last_device_id TEXT NOT NULL,

    PRIMARY KEY (entity_kind, entity_id)
);

CREATE INDEX IF NOT EXISTS idx_entity_versions_modified ON entity_versions(last_modified);

-- One row per client push
CREATE TABLE IF NOT EXISTS sync_batches (
    id TEXT PRIMARY KEY,
    device_id TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    submitted_at TEXT NOT NULL,
    processed_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_sync_batches_status ON sync_batches(status, submitted_at);
CREATE INDEX IF NOT EXISTS idx_sync_batches_device ON sync_batches(device_id);

-- Applied deltas
CREATE TABLE IF NOT EXISTS sync_deltas (
    id TEXT PRIMARY KEY,
    batch_id TEXT NOT NULL REFERENCES sync_batches(id),
    seq INTEGER NOT NULL,
    entity_kind TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    operation TEXT NOT NULL,
    base_version INTEGER NOT NULL,
    server_version INTEGER NOT NULL,
    payload TEXT NOT NULL,
    client_timestamp TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sync_deltas_batch ON sync_deltas(batch_id, seq);

-- Detected conflicts
CREATE TABLE IF NOT EXISTS sync_conflicts (
    id TEXT PRIMARY KEY,
    batch_id TEXT NOT NULL REFERENCES sync_batches(id),
    seq INTEGER NOT NULL,
    entity_kind TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    operation TEXT NOT NULL,
    client_payload TEXT NOT NULL,
    server_payload TEXT NOT NULL,
    client_version INTEGER NOT NULL,
    server_version INTEGER NOT NULL,
    status TEXT NOT NULL DEFAULT 'unresolved',
    resolved_payload TEXT,
    detected_at TEXT NOT NULL,
    resolved_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_sync_conflicts_batch ON sync_conflicts(batch_id, seq);
CREATE INDEX IF NOT EXISTS idx_sync_conflicts_status ON sync_conflicts(status);
"#;

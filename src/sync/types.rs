//! Sync data types
//!
//! Defines the value types shared by every sync component:
//! - Entity references and per-entity versions
//! - Opaque delta payloads and operations
//! - Push/pull request and response shapes

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::batch::{Batch, BatchStatus, ConflictRecord, ConflictStatus};
use super::clock::format_timestamp;
use super::error::SyncError;

/// Kind of syncable business object, e.g. `project` or `site_visit`
///
/// The engine does not know the set of kinds; it only requires a
/// non-empty identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityKind(String);

impl EntityKind {
    pub fn new(kind: impl Into<String>) -> Result<Self, SyncError> {
        let kind = kind.into();
        let trimmed = kind.trim();
        if trimmed.is_empty() {
            return Err(SyncError::Validation("entity kind must not be empty".to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Composite key identifying one syncable entity
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityReference {
    pub entity_kind: EntityKind,
    pub entity_id: Uuid,
}

impl EntityReference {
    pub fn new(entity_kind: EntityKind, entity_id: Uuid) -> Self {
        Self {
            entity_kind,
            entity_id,
        }
    }
}

impl fmt::Display for EntityReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.entity_kind, self.entity_id)
    }
}

/// Monotonic per-entity version counter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SyncVersion(u64);

impl SyncVersion {
    /// Version of an entity that has never been written
    pub const INITIAL: SyncVersion = SyncVersion(0);

    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(self) -> u64 {
        self.0
    }

    /// The next version; versions are never reused or decremented
    pub fn increment(self) -> Self {
        Self(self.0 + 1)
    }

    pub(crate) fn from_db(value: i64) -> Result<Self, SyncError> {
        u64::try_from(value)
            .map(Self)
            .map_err(|_| SyncError::Corrupt(format!("negative version in storage: {}", value)))
    }

    pub(crate) fn to_db(self) -> i64 {
        self.0 as i64
    }
}

impl fmt::Display for SyncVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Serialized snapshot of an entity after an operation
///
/// Stored and returned verbatim; the engine never inspects it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeltaPayload(String);

impl DeltaPayload {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Placeholder for an entity that has a version but no stored payload
    pub fn empty_object() -> Self {
        Self("{}".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Types of delta operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeltaOperation {
    Create,
    Update,
    Delete,
}

impl DeltaOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeltaOperation::Create => "create",
            DeltaOperation::Update => "update",
            DeltaOperation::Delete => "delete",
        }
    }
}

impl FromStr for DeltaOperation {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(DeltaOperation::Create),
            "update" => Ok(DeltaOperation::Update),
            "delete" => Ok(DeltaOperation::Delete),
            "" => Err(SyncError::Validation("operation must not be empty".to_string())),
            other => Err(SyncError::Validation(format!("unknown operation: {}", other))),
        }
    }
}

impl fmt::Display for DeltaOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque name of a client installation
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Result<Self, SyncError> {
        let id = id.into();
        let trimmed = id.trim();
        if trimmed.is_empty() {
            return Err(SyncError::Validation("device id must not be empty".to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A validated client-proposed change, ready for the batch processor
#[derive(Debug, Clone, PartialEq)]
pub struct ClientDelta {
    pub entity: EntityReference,
    pub operation: DeltaOperation,
    pub base_version: SyncVersion,
    pub payload: DeltaPayload,
    pub client_timestamp: DateTime<Utc>,
}

/// One delta as sent over the wire, before validation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientDeltaRequest {
    pub entity_kind: String,
    pub entity_id: String,
    pub operation: String,
    pub base_version: i64,
    pub payload: String,
    pub timestamp: DateTime<Utc>,
}

/// Request to push a batch of local changes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushRequest {
    pub device_id: String,
    pub deltas: Vec<ClientDeltaRequest>,
}

/// Conflict as reported to clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictSummary {
    pub conflict_id: Uuid,
    pub batch_id: Uuid,
    pub device_id: DeviceId,
    pub entity_kind: EntityKind,
    pub entity_id: Uuid,
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

impl ConflictSummary {
    pub fn from_record(batch_id: Uuid, device_id: &DeviceId, record: &ConflictRecord) -> Self {
        Self {
            conflict_id: record.id,
            batch_id,
            device_id: device_id.clone(),
            entity_kind: record.entity.entity_kind.clone(),
            entity_id: record.entity.entity_id,
            operation: record.operation,
            client_payload: record.client_payload.clone(),
            server_payload: record.server_payload.clone(),
            client_version: record.client_version,
            server_version: record.server_version,
            status: record.status,
            resolved_payload: record.resolved_payload.clone(),
            detected_at: record.detected_at,
            resolved_at: record.resolved_at,
        }
    }
}

/// Response from a push
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushResponse {
    pub batch_id: Uuid,
    pub status: BatchStatus,
    pub applied_count: usize,
    pub conflict_count: usize,
    pub conflicts: Vec<ConflictSummary>,
}

impl PushResponse {
    pub fn from_batch(batch: &Batch) -> Self {
        Self {
            batch_id: batch.id(),
            status: batch.status(),
            applied_count: batch.applied_count(),
            conflict_count: batch.conflicts().len(),
            conflicts: batch
                .conflicts()
                .iter()
                .map(|c| ConflictSummary::from_record(batch.id(), batch.device_id(), c))
                .collect(),
        }
    }
}

/// Filters for listing conflicts
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictQuery {
    pub device_id: Option<String>,
    pub status: Option<ConflictStatus>,
}

/// Query for pulling changes made elsewhere
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullQuery {
    pub device_id: String,
    pub since: Option<DateTime<Utc>>,
    /// Resume after this `nextCursor` of a previous page
    pub after: Option<ChangeCursor>,
    pub limit: Option<u32>,
}

/// Position in the pull ordering, `(timestamp, entityKind, entityId)`
///
/// Written on the wire as `<timestamp>,<entityKind>,<entityId>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeCursor {
    pub timestamp: DateTime<Utc>,
    pub entity_kind: EntityKind,
    pub entity_id: Uuid,
}

impl fmt::Display for ChangeCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{},{}",
            format_timestamp(self.timestamp),
            self.entity_kind,
            self.entity_id
        )
    }
}

impl FromStr for ChangeCursor {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || SyncError::Validation(format!("invalid cursor: {}", s));

        let (timestamp, rest) = s.split_once(',').ok_or_else(invalid)?;
        let (kind, id) = rest.rsplit_once(',').ok_or_else(invalid)?;

        Ok(Self {
            timestamp: DateTime::parse_from_rfc3339(timestamp)
                .map_err(|_| invalid())?
                .with_timezone(&Utc),
            entity_kind: EntityKind::new(kind).map_err(|_| invalid())?,
            entity_id: Uuid::parse_str(id).map_err(|_| invalid())?,
        })
    }
}

impl Serialize for ChangeCursor {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ChangeCursor {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// One changed entity in a pull response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEntry {
    pub entity_kind: EntityKind,
    pub entity_id: Uuid,
    pub operation: DeltaOperation,
    pub version: SyncVersion,
    pub payload: DeltaPayload,
    pub timestamp: DateTime<Utc>,
}

/// Response from a pull
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullResponse {
    pub changes: Vec<ChangeEntry>,
    /// Use as `since` once a pull returns no further pages
    pub server_timestamp: DateTime<Utc>,
    pub has_more: bool,
    /// Pass as `after` to fetch the next page; set only when `has_more`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<ChangeCursor>,
}

/// Strategy named by a resolve request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    ClientWins,
    ServerWins,
    ManualMerge,
}

/// Request to resolve a conflict
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveRequest {
    pub strategy: StrategyKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merged_payload: Option<String>,
}

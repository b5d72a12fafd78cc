//! Sync API endpoints
//!
//! Push, pull and conflict resolution for offline clients.

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use uuid::Uuid;

use crate::error::Result;
use crate::state::AppState;
use crate::sync::{
    Batch, ConflictQuery, ConflictSummary, EntityVersionEntry, PullQuery, PullResponse,
    PushRequest, PushResponse, ResolveRequest,
};

/// Create the sync router
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/push", post(push_batch))
        .route("/pull", get(pull_changes))
        .route("/conflicts", get(list_conflicts))
        .route("/conflicts/:conflict_id/resolve", post(resolve_conflict))
        .route("/batches/:batch_id", get(get_batch))
        .route("/entities/:entity_kind/:entity_id", get(get_entity))
}

/// Push a batch of offline changes
async fn push_batch(
    State(state): State<AppState>,
    req: std::result::Result<Json<PushRequest>, JsonRejection>,
) -> Result<Json<PushResponse>> {
    let Json(req) = req?;
    let outcome = state.engine().push_batch(req).await?;
    state.publisher().publish(&outcome.events);
    Ok(Json(outcome.response()))
}

/// Pull changes made by other devices
async fn pull_changes(
    State(state): State<AppState>,
    query: std::result::Result<Query<PullQuery>, QueryRejection>,
) -> Result<Json<PullResponse>> {
    let Query(query) = query?;
    let response = state.engine().pull_changes(query).await?;
    Ok(Json(response))
}

/// List conflicts, optionally by device and status
async fn list_conflicts(
    State(state): State<AppState>,
    query: std::result::Result<Query<ConflictQuery>, QueryRejection>,
) -> Result<Json<Vec<ConflictSummary>>> {
    let Query(query) = query?;
    let conflicts = state.engine().list_conflicts(query).await?;
    Ok(Json(conflicts))
}

/// Resolve a conflict with the given strategy
async fn resolve_conflict(
    State(state): State<AppState>,
    Path(conflict_id): Path<Uuid>,
    req: std::result::Result<Json<ResolveRequest>, JsonRejection>,
) -> Result<StatusCode> {
    let Json(req) = req?;
    let outcome = state.engine().resolve_conflict(conflict_id, req).await?;
    state.publisher().publish(&outcome.events);
    Ok(StatusCode::NO_CONTENT)
}

/// Get a batch with its applied deltas and conflicts
async fn get_batch(
    State(state): State<AppState>,
    Path(batch_id): Path<Uuid>,
) -> Result<Json<Batch>> {
    let batch = state.engine().get_batch(batch_id).await?;
    Ok(Json(batch))
}

/// Current server state of one entity
async fn get_entity(
    State(state): State<AppState>,
    Path((entity_kind, entity_id)): Path<(String, Uuid)>,
) -> Result<Json<EntityVersionEntry>> {
    let entry = state.engine().get_entity(&entity_kind, entity_id).await?;
    Ok(Json(entry))
}

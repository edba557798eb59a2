use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, patch, post, put},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tiermatrix_catalog::{CommonRange, Grid, TypeGroup};
use tiermatrix_session::{BoundaryOp, EditSession, FlushReport, NewVariant, SessionError};
use tiermatrix_shared::{CellKey, MatrixFlushedEvent, ServiceId, VariantId, VariantPatch};
use tracing::info;
use uuid::Uuid;

use crate::error::AppError;
use crate::state::AppState;

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct OpenSessionResponse {
    pub session_id: Uuid,
    pub service_id: ServiceId,
    pub grid: Grid,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BoundaryResponse {
    pub changed: bool,
    pub columns: Vec<CommonRange>,
}

#[derive(Debug, Deserialize)]
pub struct SetPriceRequest {
    pub variant_id: VariantId,
    pub min_quantity: u32,
    pub price_cents: i64,
    /// Persist through the debounced editor instead of the next flush.
    #[serde(default)]
    pub debounce: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateVariantResponse {
    pub variant_id: VariantId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionStatus {
    pub dirty: bool,
    pub pending_changes: usize,
    pub unsynced_cells: usize,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/v1/services/{service_id}/sessions", post(open_session))
        .route("/v1/sessions/{session_id}", get(session_status).delete(close_session))
        .route("/v1/sessions/{session_id}/grid", get(get_grid))
        .route("/v1/sessions/{session_id}/hierarchy", get(get_hierarchy))
        .route("/v1/sessions/{session_id}/columns", get(get_columns))
        .route("/v1/sessions/{session_id}/boundaries", post(apply_boundary))
        .route("/v1/sessions/{session_id}/prices", put(set_price))
        .route("/v1/sessions/{session_id}/variants", post(create_variant))
        .route(
            "/v1/sessions/{session_id}/variants/{variant_id}",
            patch(update_variant).delete(delete_variant),
        )
        .route("/v1/sessions/{session_id}/flush", post(flush_session))
        .route("/v1/sessions/{session_id}/cancel", post(cancel_session))
}

async fn open_session(
    State(state): State<AppState>,
    Path(service_id): Path<ServiceId>,
) -> Result<(StatusCode, Json<OpenSessionResponse>), AppError> {
    let session = EditSession::open(state.store.as_ref(), service_id, state.settings.hierarchy.clone()).await?;
    let grid = session.grid();
    let (session_id, _) = state.register(session).await;
    info!("Session {} opened for service {}", session_id, service_id);

    Ok((
        StatusCode::CREATED,
        Json(OpenSessionResponse { session_id, service_id, grid }),
    ))
}

async fn session_status(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> Result<Json<SessionStatus>, AppError> {
    let handle = state.session(session_id).await?;
    let session = handle.session.lock().await;
    Ok(Json(SessionStatus {
        dirty: session.is_dirty(),
        pending_changes: session.changelog().len(),
        unsynced_cells: session.unsynced().len(),
    }))
}

async fn close_session(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    state.close(session_id).await?;
    info!("Session {} closed", session_id);
    Ok(StatusCode::NO_CONTENT)
}

async fn get_grid(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> Result<Json<Grid>, AppError> {
    let handle = state.session(session_id).await?;
    let grid = handle.session.lock().await.grid();
    Ok(Json(grid))
}

async fn get_hierarchy(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> Result<Json<Vec<TypeGroup>>, AppError> {
    let handle = state.session(session_id).await?;
    let tree = handle.session.lock().await.hierarchy();
    Ok(Json(tree))
}

async fn get_columns(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> Result<Json<Vec<CommonRange>>, AppError> {
    let handle = state.session(session_id).await?;
    let columns = handle.session.lock().await.common_ranges();
    Ok(Json(columns))
}

async fn apply_boundary(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
    Json(op): Json<BoundaryOp>,
) -> Result<Json<BoundaryResponse>, AppError> {
    let handle = state.session(session_id).await?;
    let mut session = handle.session.lock().await;
    let changed = session.apply_boundary_op(op)?;
    Ok(Json(BoundaryResponse {
        changed,
        columns: session.common_ranges(),
    }))
}

async fn set_price(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
    Json(req): Json<SetPriceRequest>,
) -> Result<StatusCode, AppError> {
    let handle = state.session(session_id).await?;
    if req.debounce {
        handle
            .editor
            .edit(CellKey::new(req.variant_id, req.min_quantity), req.price_cents)
            .await?;
        return Ok(StatusCode::ACCEPTED);
    }
    handle
        .session
        .lock()
        .await
        .set_price(req.variant_id, req.min_quantity, req.price_cents)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn create_variant(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
    Json(req): Json<NewVariant>,
) -> Result<(StatusCode, Json<CreateVariantResponse>), AppError> {
    if req.display_name.trim().is_empty() {
        return Err(AppError::ValidationError("display_name must not be empty".to_string()));
    }
    let handle = state.session(session_id).await?;
    let variant_id = handle.session.lock().await.create_variant_in(req)?;
    Ok((StatusCode::CREATED, Json(CreateVariantResponse { variant_id })))
}

async fn update_variant(
    State(state): State<AppState>,
    Path((session_id, variant_id)): Path<(Uuid, VariantId)>,
    Json(patch): Json<VariantPatch>,
) -> Result<StatusCode, AppError> {
    let handle = state.session(session_id).await?;
    handle.session.lock().await.update_variant(variant_id, patch)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_variant(
    State(state): State<AppState>,
    Path((session_id, variant_id)): Path<(Uuid, VariantId)>,
) -> Result<StatusCode, AppError> {
    let handle = state.session(session_id).await?;
    handle.session.lock().await.delete_variant(variant_id)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Partial failures answer 207 with the full report so the client can show
/// which cells stayed unsynced.
async fn flush_session(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let handle = state.session(session_id).await?;
    let reconciler = state.reconciler();
    let mut session = handle.session.lock().await;

    let (status, report): (StatusCode, FlushReport) = match session.flush(&reconciler).await {
        Ok(report) => (StatusCode::OK, report),
        Err(SessionError::FlushFailed(report)) => (StatusCode::MULTI_STATUS, *report),
        Err(e) => return Err(e.into()),
    };

    if report.total() > 0 {
        let event = MatrixFlushedEvent {
            service_id: session.service_id(),
            applied: report.applied.len(),
            failed: report.failed.len(),
            timestamp: Utc::now().timestamp(),
        };
        // no subscribers is fine
        let _ = state.flush_tx.send(event);
    }
    Ok((status, Json(report)))
}

async fn cancel_session(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> Result<Json<Grid>, AppError> {
    let handle = state.session(session_id).await?;
    let mut session = handle.session.lock().await;
    session.cancel();
    Ok(Json(session.grid()))
}

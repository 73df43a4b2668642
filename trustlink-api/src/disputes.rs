use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use escrow_engine::{
    models::{AdminAlert, DisputeOpener, Ruling, TelegramId},
    transaction_manager::Resolution,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::{error::ApiError, ApiState};

#[derive(Debug, Deserialize)]
pub struct OpenDisputeBody {
    pub transaction_id: Uuid,
    pub opened_by: TelegramId,
    pub reason: String,
    #[serde(default)]
    pub evidence: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct ResolveDisputeBody {
    pub ruling: Ruling,
    pub arbitrator: String,
    pub notes: Option<String>,
}

pub async fn open_dispute(
    State(state): State<ApiState>,
    Json(body): Json<OpenDisputeBody>,
) -> Result<impl IntoResponse, ApiError> {
    let dispute = state
        .node
        .manager()
        .open_dispute(
            body.transaction_id,
            DisputeOpener::Party(body.opened_by),
            body.reason,
            body.evidence,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(dispute)))
}

pub async fn resolve_dispute(
    State(state): State<ApiState>,
    Path(transaction_id): Path<Uuid>,
    Json(body): Json<ResolveDisputeBody>,
) -> Result<Json<Resolution>, ApiError> {
    let resolution = state
        .node
        .manager()
        .resolve_dispute(transaction_id, body.ruling, body.arbitrator, body.notes)
        .await?;
    Ok(Json(resolution))
}

pub async fn list_alerts(State(state): State<ApiState>) -> Json<Vec<AdminAlert>> {
    Json(state.node.manager().admin_alerts().await)
}

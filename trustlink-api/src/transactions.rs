use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use escrow_engine::{
    models::{AuditEntry, Dispute, TelegramId, Transaction, TransactionStatus},
    payment_gateway::ChargeStatus,
    transaction_manager::{CreateTransactionRequest, TransactionQuery},
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{error::ApiError, ApiState};

#[derive(Debug, Deserialize)]
pub struct TransactionParams {
    pub party: Option<TelegramId>,
    pub status: Option<TransactionStatus>,
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct StartTransferBody {
    pub seller_id: TelegramId,
}

/// Transaction with its dispute and audit trail
#[derive(Debug, Serialize)]
pub struct TransactionDetail {
    pub transaction: Transaction,
    pub dispute: Option<Dispute>,
    pub audit: Vec<AuditEntry>,
}

pub async fn list_transactions(
    State(state): State<ApiState>,
    Query(params): Query<TransactionParams>,
) -> Json<Vec<Transaction>> {
    let query = TransactionQuery {
        party: params.party,
        status: params.status,
        limit: params.limit,
    };
    Json(state.node.manager().list_transactions(&query).await)
}

pub async fn create_transaction(
    State(state): State<ApiState>,
    Json(req): Json<CreateTransactionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let tx = state.node.manager().create_transaction(req).await?;
    Ok((StatusCode::CREATED, Json(tx)))
}

pub async fn get_transaction(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<Json<TransactionDetail>, ApiError> {
    let manager = state.node.manager();
    let transaction = manager.get_transaction(id).await?;
    let dispute = manager.get_dispute(id).await.ok();
    let audit = manager.transaction_audit(id).await;

    Ok(Json(TransactionDetail {
        transaction,
        dispute,
        audit,
    }))
}

pub async fn start_transfer(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    Json(body): Json<StartTransferBody>,
) -> Result<Json<Transaction>, ApiError> {
    Ok(Json(
        state.node.manager().start_transfer(id, body.seller_id).await?,
    ))
}

pub async fn confirm_transfer(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Transaction>, ApiError> {
    Ok(Json(state.node.manager().confirm_transfer(id).await?))
}

/// Hosted charge as the gateway sees it
pub async fn charge_status(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ChargeStatus>, ApiError> {
    Ok(Json(state.node.charge_status(id).await?))
}

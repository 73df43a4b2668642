use axum::{body::Bytes, extract::State, http::HeaderMap, Json};
use escrow_engine::{error::EscrowError, payment_gateway::SIGNATURE_HEADER};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::{error::ApiError, ApiState};

/// Coinbase Commerce delivery endpoint.
///
/// Repeated deliveries are acknowledged with 200 so the gateway stops
/// retrying. Payments for purchases that can no longer complete are
/// refunded by the engine and acknowledged the same way; a refund the rail
/// could not pay returns an error so the gateway tries again later.
pub async fn coinbase(
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());

    match state.node.ingest_webhook(&body, signature).await {
        Ok(tx) => Ok(Json(json!({
            "status": "applied",
            "transaction_id": tx.id,
            "transaction_status": tx.status,
        }))),
        Err(EscrowError::DuplicateEvent {
            transaction_id,
            event,
        }) => {
            info!("Acknowledged duplicate {} for {}", event, transaction_id);
            Ok(Json(json!({
                "status": "duplicate",
                "transaction_id": transaction_id,
            })))
        }
        Err(e) => {
            warn!("Webhook rejected: {}", e);
            Err(e.into())
        }
    }
}

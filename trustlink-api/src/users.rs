use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use escrow_engine::models::{TelegramId, User};
use serde::Deserialize;

use crate::{error::ApiError, ApiState};

#[derive(Debug, Deserialize)]
pub struct RegisterUserBody {
    pub telegram_id: TelegramId,
    pub username: Option<String>,
}

pub async fn register_user(
    State(state): State<ApiState>,
    Json(body): Json<RegisterUserBody>,
) -> Result<impl IntoResponse, ApiError> {
    let user = state
        .node
        .users()
        .register(body.telegram_id, body.username)
        .await?;
    Ok((StatusCode::CREATED, Json(user)))
}

/// Bar a user from trading
pub async fn suspend_user(
    State(state): State<ApiState>,
    Path(telegram_id): Path<TelegramId>,
) -> Result<Json<User>, ApiError> {
    Ok(Json(state.node.users().suspend(telegram_id).await?))
}

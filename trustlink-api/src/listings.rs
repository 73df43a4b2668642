use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use escrow_engine::{
    group_monitor::MonitorFlag,
    listing_registry::{CreateListingRequest, ListingQuery},
    models::{Category, Listing, TelegramId},
};
use serde::Deserialize;
use uuid::Uuid;

use crate::{error::ApiError, ApiState};

#[derive(Debug, Deserialize)]
pub struct ListingParams {
    pub category: Option<Category>,
    pub search: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct VerifyListingBody {
    pub owner_id: TelegramId,
}

pub async fn list_listings(
    State(state): State<ApiState>,
    Query(params): Query<ListingParams>,
) -> Json<Vec<Listing>> {
    let query = ListingQuery {
        category: params.category,
        search: params.search,
        limit: params.limit,
    };
    Json(state.node.listings().list_active(&query).await)
}

pub async fn get_listing(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Listing>, ApiError> {
    Ok(Json(state.node.listings().get_listing(id).await?))
}

pub async fn create_listing(
    State(state): State<ApiState>,
    Json(req): Json<CreateListingRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let listing = state.node.listings().create_listing(req).await?;
    Ok((StatusCode::CREATED, Json(listing)))
}

/// Ask the oracle whether the owner created the group; activates on success
pub async fn verify_listing(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    Json(body): Json<VerifyListingBody>,
) -> Result<Json<Listing>, ApiError> {
    Ok(Json(
        state.node.listings().verify_listing(id, body.owner_id).await?,
    ))
}

/// Take a listing off the market
pub async fn suspend_listing(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Listing>, ApiError> {
    Ok(Json(state.node.listings().suspend(id).await?))
}

/// Changes the group monitor noticed, oldest first
pub async fn monitor_flags(State(state): State<ApiState>) -> Json<Vec<MonitorFlag>> {
    let flags = match state.node.monitor() {
        Some(monitor) => monitor.flags().await,
        None => Vec::new(),
    };
    Json(flags)
}

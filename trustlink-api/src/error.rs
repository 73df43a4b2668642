use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use escrow_engine::error::EscrowError;
use serde_json::json;
use tracing::error;

/// Engine error rendered as `{error, kind}` with a matching status code
#[derive(Debug)]
pub struct ApiError(pub EscrowError);

impl From<EscrowError> for ApiError {
    fn from(err: EscrowError) -> Self {
        Self(err)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            EscrowError::InvalidSignature(_) => StatusCode::UNAUTHORIZED,
            EscrowError::Unauthorized(_) => StatusCode::FORBIDDEN,
            EscrowError::NotFound(_) => StatusCode::NOT_FOUND,
            EscrowError::Validation(_) | EscrowError::Serialization(_) | EscrowError::Uuid(_) => {
                StatusCode::BAD_REQUEST
            }
            EscrowError::StateConflict { .. } | EscrowError::DuplicateEvent { .. } => {
                StatusCode::CONFLICT
            }
            EscrowError::OwnershipUnverified(_) | EscrowError::DeadlineExceeded(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            EscrowError::ExternalApi { .. } | EscrowError::Settlement(_) => StatusCode::BAD_GATEWAY,
            EscrowError::Config(_) | EscrowError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("Request failed: {}", self.0);
        }

        let body = Json(json!({
            "error": self.0.to_string(),
            "kind": self.0.kind(),
        }));
        (status, body).into_response()
    }
}

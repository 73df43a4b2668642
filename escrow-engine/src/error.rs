//! Error types for the escrow system
//!
//! Covers state machine conflicts, gateway authenticity failures, oracle
//! outcomes and the plumbing errors surrounding them.

use thiserror::Error;

/// Main error type for escrow operations
#[derive(Error, Debug)]
pub enum EscrowError {
    /// Webhook or contract event failed authenticity checks
    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    /// Oracle did not confirm the expected owner
    #[error("Ownership unverified: {0}")]
    OwnershipUnverified(String),

    /// Event already applied to this transaction
    #[error("Duplicate event {event} for transaction {transaction_id}")]
    DuplicateEvent {
        transaction_id: String,
        event: String,
    },

    /// Action arrived after the transfer deadline
    #[error("Deadline exceeded: {0}")]
    DeadlineExceeded(String),

    /// Illegal transition attempted
    #[error("State conflict: {trigger} not allowed from {from_state}: {reason}")]
    StateConflict {
        from_state: String,
        trigger: String,
        reason: String,
    },

    /// Entity lookup failed
    #[error("Not found: {0}")]
    NotFound(String),

    /// Request validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    /// Caller is not allowed to perform the action
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// External API errors (Telegram, Coinbase)
    #[error("External API error: {message}")]
    ExternalApi { message: String, transient: bool },

    /// Settlement rail errors
    #[error("Settlement error: {0}")]
    Settlement(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// UUID parsing errors
    #[error("UUID parsing error: {0}")]
    Uuid(#[from] uuid::Error),

    /// General internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl EscrowError {
    /// Create an invalid signature error
    pub fn invalid_signature<S: Into<String>>(msg: S) -> Self {
        Self::InvalidSignature(msg.into())
    }

    /// Create an ownership error
    pub fn ownership_unverified<S: Into<String>>(msg: S) -> Self {
        Self::OwnershipUnverified(msg.into())
    }

    /// Create a duplicate event error
    pub fn duplicate_event<S: Into<String>>(transaction_id: S, event: S) -> Self {
        Self::DuplicateEvent {
            transaction_id: transaction_id.into(),
            event: event.into(),
        }
    }

    /// Create a deadline error
    pub fn deadline_exceeded<S: Into<String>>(msg: S) -> Self {
        Self::DeadlineExceeded(msg.into())
    }

    /// Create a state conflict error
    pub fn state_conflict<S: Into<String>>(from_state: S, trigger: S, reason: S) -> Self {
        Self::StateConflict {
            from_state: from_state.into(),
            trigger: trigger.into(),
            reason: reason.into(),
        }
    }

    /// Create a not found error
    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a validation error
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }

    /// Create an unauthorized error
    pub fn unauthorized<S: Into<String>>(msg: S) -> Self {
        Self::Unauthorized(msg.into())
    }

    /// External API failure that is worth retrying
    pub fn transient<S: Into<String>>(msg: S) -> Self {
        Self::ExternalApi {
            message: msg.into(),
            transient: true,
        }
    }

    /// External API failure that will not succeed on retry
    pub fn external_api<S: Into<String>>(msg: S) -> Self {
        Self::ExternalApi {
            message: msg.into(),
            transient: false,
        }
    }

    /// Create a settlement error
    pub fn settlement<S: Into<String>>(msg: S) -> Self {
        Self::Settlement(msg.into())
    }

    /// Create a configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether a retry could change the outcome
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ExternalApi { transient: true, .. })
    }

    /// Short machine-readable name, used in API responses and alerts
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidSignature(_) => "invalid_signature",
            Self::OwnershipUnverified(_) => "ownership_unverified",
            Self::DuplicateEvent { .. } => "duplicate_event",
            Self::DeadlineExceeded(_) => "deadline_exceeded",
            Self::StateConflict { .. } => "state_conflict",
            Self::NotFound(_) => "not_found",
            Self::Validation(_) => "validation",
            Self::Unauthorized(_) => "unauthorized",
            Self::ExternalApi { .. } => "external_api",
            Self::Settlement(_) => "settlement",
            Self::Config(_) => "config",
            Self::Serialization(_) => "serialization",
            Self::Uuid(_) => "uuid",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<config::ConfigError> for EscrowError {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

impl From<reqwest::Error> for EscrowError {
    fn from(err: reqwest::Error) -> Self {
        let transient = !err.is_decode()
            && (err.is_timeout()
                || err.is_connect()
                || err
                    .status()
                    .map(|s| s.is_server_error() || s.as_u16() == 429)
                    .unwrap_or(true));
        Self::ExternalApi {
            message: err.to_string(),
            transient,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(EscrowError::transient("timeout").is_transient());
        assert!(!EscrowError::external_api("bad request").is_transient());
        assert!(!EscrowError::validation("nope").is_transient());
    }

    #[test]
    fn test_state_conflict_message() {
        let err = EscrowError::state_conflict("Released", "DisputeOpened", "terminal");
        assert_eq!(err.kind(), "state_conflict");
        assert!(err.to_string().contains("DisputeOpened not allowed from Released"));
    }
}

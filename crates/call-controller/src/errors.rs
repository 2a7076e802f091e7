//! Call Controller error types.
//!
//! Every public operation returns either a success payload or a `CcError`.
//! The gateway turns errors into frames using [`CcError::kind`] and
//! [`CcError::client_message`]; database and internal details are logged
//! server-side but never sent to clients.

use thiserror::Error;

/// Call Controller error type.
///
/// Kinds, as reported to clients:
/// - `NotFound`: `not_found`
/// - `InvalidState`: `invalid_state`
/// - `CapacityExceeded`: `capacity`
/// - `Unauthorized`: `authorization`
/// - `Expired`: `expired`
/// - `Validation`: `validation`
/// - `Database`, `Internal`, `Draining`: `internal`
#[derive(Debug, Error)]
pub enum CcError {
    /// Unknown call, participant, invitation or recording.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Operation is not valid for the current lifecycle state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Call is at its participant limit.
    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// Actor is not a participant or moderator where required, or an
    /// invitation was answered by someone other than the invitee.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Acting on an expired invitation.
    #[error("Invitation expired")]
    Expired,

    /// Malformed input.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Registry (durable store) operation failed.
    #[error("Database error: {0}")]
    Database(String),

    /// Internal error (channel failures, poisoned state).
    #[error("Internal error: {0}")]
    Internal(String),

    /// Controller is shutting down and refuses new work.
    #[error("Controller is draining")]
    Draining,
}

impl CcError {
    /// Machine-readable error kind for clients and metric labels.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            CcError::NotFound(_) => "not_found",
            CcError::InvalidState(_) => "invalid_state",
            CcError::CapacityExceeded(_) => "capacity",
            CcError::Unauthorized(_) => "authorization",
            CcError::Expired => "expired",
            CcError::Validation(_) => "validation",
            CcError::Database(_) | CcError::Internal(_) | CcError::Draining => "internal",
        }
    }

    /// Returns a client-safe error message (no internal details).
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            CcError::Database(_) | CcError::Internal(_) => "An internal error occurred".to_string(),
            CcError::Draining => "Server is shutting down, please reconnect".to_string(),
            CcError::Expired => "Invitation has expired".to_string(),
            CcError::NotFound(msg)
            | CcError::InvalidState(msg)
            | CcError::CapacityExceeded(msg)
            | CcError::Unauthorized(msg)
            | CcError::Validation(msg) => msg.clone(),
        }
    }
}

impl From<sqlx::Error> for CcError {
    fn from(err: sqlx::Error) -> Self {
        CcError::Database(err.to_string())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds() {
        assert_eq!(CcError::NotFound("call".into()).kind(), "not_found");
        assert_eq!(CcError::InvalidState("ended".into()).kind(), "invalid_state");
        assert_eq!(CcError::CapacityExceeded("full".into()).kind(), "capacity");
        assert_eq!(CcError::Unauthorized("no".into()).kind(), "authorization");
        assert_eq!(CcError::Expired.kind(), "expired");
        assert_eq!(CcError::Validation("kind".into()).kind(), "validation");
        assert_eq!(CcError::Database("x".into()).kind(), "internal");
        assert_eq!(CcError::Internal("x".into()).kind(), "internal");
        assert_eq!(CcError::Draining.kind(), "internal");
    }

    #[test]
    fn test_client_message_hides_internal_details() {
        let err = CcError::Database("connection refused to 10.0.0.5:5432".to_string());
        let msg = err.client_message();
        assert!(!msg.contains("10.0.0.5"));
        assert_eq!(msg, "An internal error occurred");

        let err = CcError::Internal("channel send failed: closed".to_string());
        assert!(!err.client_message().contains("channel"));
    }

    #[test]
    fn test_client_message_passes_through_user_errors() {
        let err = CcError::CapacityExceeded("Call is at capacity".to_string());
        assert_eq!(err.client_message(), "Call is at capacity");
        assert_eq!(CcError::Expired.client_message(), "Invitation has expired");
    }

    #[test]
    fn test_display() {
        let err = CcError::NotFound("call_abc".to_string());
        assert_eq!(format!("{err}"), "Not found: call_abc");
    }
}

//! Service error taxonomy.

use thiserror::Error;

use compute_core::ValidationError;
use compute_quota::QuotaError;
use compute_state::StateError;
use compute_watch::WatchError;

/// Errors returned by every resource service.
///
/// Validation and quota failures are raised before any write. Conflicts
/// are raised by the store's compare-and-swap and are never retried here.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Stale resource version.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        ServiceError::InvalidArgument(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        ServiceError::NotFound(msg.into())
    }

    pub fn precondition(msg: impl Into<String>) -> Self {
        ServiceError::FailedPrecondition(msg.into())
    }

    /// Stable code used by the HTTP layer.
    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::InvalidArgument(_) => "InvalidArgument",
            ServiceError::NotFound(_) => "NotFound",
            ServiceError::AlreadyExists(_) => "AlreadyExists",
            ServiceError::Conflict(_) => "Conflict",
            ServiceError::FailedPrecondition(_) => "FailedPrecondition",
            ServiceError::PermissionDenied(_) => "PermissionDenied",
            ServiceError::Internal(_) => "Internal",
        }
    }
}

impl From<StateError> for ServiceError {
    fn from(err: StateError) -> Self {
        match err {
            StateError::NotFound(msg) => ServiceError::NotFound(msg),
            StateError::AlreadyExists(msg) => ServiceError::AlreadyExists(msg),
            StateError::VersionConflict { expected, actual } => ServiceError::Conflict(format!(
                "stored resource version {actual} does not match requested resource version {expected}"
            )),
            other => ServiceError::Internal(other.to_string()),
        }
    }
}

impl From<ValidationError> for ServiceError {
    fn from(err: ValidationError) -> Self {
        match err {
            ValidationError::Pattern(e) => ServiceError::Internal(e.to_string()),
            other => ServiceError::InvalidArgument(other.to_string()),
        }
    }
}

impl From<QuotaError> for ServiceError {
    fn from(err: QuotaError) -> Self {
        ServiceError::Internal(err.to_string())
    }
}

impl From<WatchError> for ServiceError {
    fn from(err: WatchError) -> Self {
        match err {
            WatchError::FutureResourceVersion { .. } => ServiceError::InvalidArgument(err.to_string()),
            WatchError::TooOldResourceVersion { .. } => ServiceError::FailedPrecondition(err.to_string()),
            WatchError::State(e) => e.into(),
            WatchError::Encode(msg) => ServiceError::Internal(msg),
        }
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_map_onto_taxonomy() {
        let conflict: ServiceError = StateError::VersionConflict {
            expected: 3,
            actual: 4,
        }
        .into();
        assert!(matches!(conflict, ServiceError::Conflict(_)));

        let missing: ServiceError = StateError::NotFound("instance x".into()).into();
        assert_eq!(missing.code(), "NotFound");

        let io: ServiceError = StateError::Write("disk full".into()).into();
        assert_eq!(io.code(), "Internal");
    }

    #[test]
    fn validation_errors_are_invalid_argument() {
        let err: ServiceError = ValidationError::InvalidCloudAccountId.into();
        assert_eq!(err.to_string(), "invalid argument: invalid CloudAccountId");
    }
}

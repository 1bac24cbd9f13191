//! Crate-wide error taxonomy.
//!
//! Foghorn's error handling policy (see the component design notes) groups
//! failures into a small number of kinds that callers actually branch on,
//! rather than one string-bag variant per failure site. Internal callers
//! (federation, provisioning) match on the specific kind; user-facing paths
//! collapse everything but `NotFound`/`Capacity` into a generic
//! "temporarily unavailable".

use thiserror::Error;

#[derive(Error, Debug)]
pub enum FoghornError {
    /// Network timeout, SharedKV unavailable, peer RPC deadline exceeded.
    /// Retryable with jittered backoff bounded to the caller's deadline.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Unknown stream, unknown artifact, unknown peer. Not retried.
    #[error("not found: {0}")]
    NotFound(String),

    /// A cross-cluster origin-pull would form a replication cycle.
    #[error("loop detected: {0}")]
    LoopDetected(String),

    /// No eligible node passed the balancer's filters.
    #[error("no capacity: rejected by {rejected_by:?}")]
    Capacity { rejected_by: Vec<String> },

    /// Leader lease lost, duplicate task name, or similar local conflict
    /// that is recovered from without surfacing to the caller.
    #[error("conflict: {0}")]
    Conflict(String),

    /// SharedKV permanently unreachable, invalid manifest, or another
    /// condition the process supervisor needs to know about.
    #[error("fatal: {0}")]
    Fatal(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl FoghornError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn loop_detected(msg: impl Into<String>) -> Self {
        Self::LoopDetected(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    /// Collapse to the three kinds a viewer-facing response is allowed to
    /// distinguish: not-found, capacity, or a generic unavailable. Everything
    /// else is logged by the caller before this conversion erases detail.
    pub fn to_user_facing(&self) -> UserFacingError {
        match self {
            FoghornError::NotFound(_) => UserFacingError::NotFound,
            FoghornError::Capacity { rejected_by } => UserFacingError::Capacity {
                rejected_by: rejected_by.clone(),
            },
            _ => UserFacingError::Unavailable,
        }
    }
}

/// What a viewer-facing HTTP handler is allowed to distinguish, per the
/// propagation policy: not-found, capacity, or a generic unavailable.
#[derive(Debug, Clone)]
pub enum UserFacingError {
    NotFound,
    Capacity { rejected_by: Vec<String> },
    Unavailable,
}

pub type Result<T> = std::result::Result<T, FoghornError>;

impl axum::response::IntoResponse for UserFacingError {
    fn into_response(self) -> axum::response::Response {
        use axum::http::{header, StatusCode};
        match self {
            UserFacingError::NotFound => {
                (StatusCode::NOT_FOUND, "not found".to_string()).into_response()
            }
            UserFacingError::Capacity { rejected_by } => (
                StatusCode::SERVICE_UNAVAILABLE,
                [(header::RETRY_AFTER, "5")],
                format!("no capacity: rejected by {rejected_by:?}"),
            )
                .into_response(),
            UserFacingError::Unavailable => {
                (StatusCode::SERVICE_UNAVAILABLE, "temporarily unavailable".to_string())
                    .into_response()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_facing_collapses_transient_to_unavailable() {
        let e = FoghornError::transient("kv timeout");
        assert!(matches!(e.to_user_facing(), UserFacingError::Unavailable));
    }

    #[test]
    fn user_facing_preserves_not_found() {
        let e = FoghornError::not_found("stream live+x");
        assert!(matches!(e.to_user_facing(), UserFacingError::NotFound));
    }

    #[test]
    fn user_facing_preserves_capacity_detail() {
        let e = FoghornError::Capacity {
            rejected_by: vec!["bandwidth".to_string(), "maintenance".to_string()],
        };
        match e.to_user_facing() {
            UserFacingError::Capacity { rejected_by } => assert_eq!(rejected_by.len(), 2),
            _ => panic!("expected capacity"),
        }
    }
}

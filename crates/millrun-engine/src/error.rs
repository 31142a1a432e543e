//! Engine error types

use millrun_store::StoreError;

/// Errors from EMM operations and everything built on them
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// A referenced entity does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// The requested transition would break a state-machine invariant
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// A retry was requested that conflicts with the workflow's pending
    /// retry bookkeeping
    #[error("conflicting retry: {0}")]
    ConflictingRetry(String),

    /// A batch reservation hit an event that was not pending; the caller
    /// must re-peek the topic
    #[error("reservation conflict: {0}")]
    Reservation(String),

    /// The store failed; nothing was written
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::WorkflowNotFound(_)
            | StoreError::ScriptNotFound(_)
            | StoreError::SessionNotFound(_)
            | StoreError::RunNotFound(_)
            | StoreError::MutationNotFound(_) => Self::NotFound(err.to_string()),
            StoreError::EventNotReservable { .. } => Self::Reservation(err.to_string()),
            StoreError::Database(_) | StoreError::Serialization(_) => {
                Self::StoreUnavailable(err.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn store_error_mapping() {
        let id = Uuid::now_v7();
        assert!(matches!(
            EngineError::from(StoreError::RunNotFound(id)),
            EngineError::NotFound(_)
        ));
        assert!(matches!(
            EngineError::from(StoreError::EventNotReservable {
                topic: "t".into(),
                message_id: "m".into()
            }),
            EngineError::Reservation(_)
        ));
        assert!(matches!(
            EngineError::from(StoreError::Database("boom".into())),
            EngineError::StoreUnavailable(_)
        ));
    }
}

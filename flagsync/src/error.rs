use crate::types::ChangeNumber;

/// Failures of the synchronization engine.
///
/// These never reach evaluation callers. Periodic tasks log them and retry on the
/// next tick, streaming turns them into status transitions.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    #[error("authentication rejected: {0}")]
    AuthRejected(String),

    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error("change number gap: cache is at {expected}, delta starts at {got}")]
    GapDetected {
        expected: ChangeNumber,
        got: ChangeNumber,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("cache is frozen")]
    Frozen,
}

impl SyncError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::TransientNetwork(_) | SyncError::GapDetected { .. }
        )
    }
}

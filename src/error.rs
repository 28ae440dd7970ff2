use thiserror::Error;

use crate::config::StagehandConfigError;
use crate::executor::ExecutionError;
use crate::extraction::ExtractionError;
use crate::observer::ObservationError;
use crate::resolver::ResolutionError;
use crate::session::SessionError;

/// Error returned by the public session operations.
#[derive(Debug, Error)]
pub enum StagehandError {
    #[error(transparent)]
    Observation(#[from] ObservationError),
    #[error(transparent)]
    Resolution(#[from] ResolutionError),
    #[error(transparent)]
    Execution(#[from] ExecutionError),
    #[error(transparent)]
    Extraction(#[from] ExtractionError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Config(#[from] StagehandConfigError),
    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout {
        operation: &'static str,
        timeout_ms: u64,
    },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl StagehandError {
    /// True for failures tied to page timing that a caller may retry after a
    /// settle wait.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StagehandError::Observation(_)
                | StagehandError::Execution(ExecutionError::TargetDetached { .. })
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, StagehandError::Execution(ExecutionError::Cancelled))
    }
}

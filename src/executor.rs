//! Action Executor: performs a resolved action and waits for the page to settle.

use std::time::Duration;

use thiserror::Error;

use crate::browser::{BrowserDriver, DriverError};
use crate::config::DEFAULT_DOM_SETTLE_TIMEOUT_MS;
use crate::types::page::{ExecutionOutcome, ResolvedAction, SettleState};

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("target `{locator}` is no longer attached to the document")]
    TargetDetached { locator: String },
    #[error("operation was cancelled")]
    Cancelled,
    #[error("browser driver failed: {0}")]
    DriverFailure(String),
}

impl From<DriverError> for ExecutionError {
    fn from(err: DriverError) -> Self {
        match err {
            DriverError::TargetDetached(locator) => ExecutionError::TargetDetached { locator },
            other => ExecutionError::DriverFailure(other.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ActionExecutor {
    settle_timeout: Duration,
}

impl Default for ActionExecutor {
    fn default() -> Self {
        Self::new(Duration::from_millis(DEFAULT_DOM_SETTLE_TIMEOUT_MS))
    }
}

impl ActionExecutor {
    pub fn new(settle_timeout: Duration) -> Self {
        Self { settle_timeout }
    }

    pub fn settle_timeout(&self) -> Duration {
        self.settle_timeout
    }

    /// Dispatch `action` and wait for network quiescence, bounded by the
    /// settle timeout. Every candidate snapshot taken before this call is
    /// stale once it returns.
    pub async fn execute(
        &self,
        driver: &dyn BrowserDriver,
        action: ResolvedAction,
    ) -> Result<ExecutionOutcome, ExecutionError> {
        match driver
            .dispatch_input(action.locator(), action.operation(), action.parameters())
            .await
        {
            Ok(()) => {}
            // The input itself started a navigation; the settle wait covers it.
            Err(DriverError::Navigating) => {}
            Err(err) => return Err(err.into()),
        }

        let settle = match driver.wait_for_stability(self.settle_timeout).await {
            Ok(state) => state,
            Err(DriverError::Navigating) => SettleState::IdleTimeout,
            Err(err) => return Err(ExecutionError::DriverFailure(err.to_string())),
        };

        Ok(ExecutionOutcome {
            target: action.target(),
            operation: action.operation(),
            settle,
        })
    }
}

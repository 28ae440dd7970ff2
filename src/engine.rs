//! The act and extract pipelines shared by every session.
//!
//! `act` runs observe, resolve and execute against one page; `extract` runs
//! observe and extraction. Failures tied to page timing get one automatic
//! retry each: an [`ObservationError`] after a settle wait, and a detached
//! target with a fresh observation. Everything else is reported unchanged.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use crate::backend::ReasoningBackend;
use crate::browser::BrowserDriver;
use crate::config::StagehandConfig;
use crate::error::StagehandError;
use crate::executor::{ActionExecutor, ExecutionError};
use crate::extraction::{ExtractionEngine, ExtractionError};
use crate::logging::StagehandLogger;
use crate::observer::{ObservationError, PageObserver};
use crate::resolver::InstructionResolver;
use crate::types::page::{
    ActOutcome, ActionRequest, CandidateSnapshot, ExtractionRequest, ExtractionResult,
};

pub struct EngineContext {
    backend: Arc<dyn ReasoningBackend>,
    logger: Arc<StagehandLogger>,
    observer: PageObserver,
    resolver: InstructionResolver,
    executor: ActionExecutor,
    extraction: ExtractionEngine,
    settle_timeout: Duration,
}

impl EngineContext {
    pub fn new(
        backend: Arc<dyn ReasoningBackend>,
        logger: Arc<StagehandLogger>,
        config: &StagehandConfig,
    ) -> Self {
        let settle_timeout = Duration::from_millis(config.dom_settle_timeout_ms);
        Self {
            backend,
            logger,
            observer: PageObserver::new(config.max_candidates),
            resolver: InstructionResolver::new(config.confidence_threshold),
            executor: ActionExecutor::new(settle_timeout),
            extraction: ExtractionEngine::new(),
            settle_timeout,
        }
    }

    pub fn logger(&self) -> &StagehandLogger {
        &self.logger
    }

    pub fn settle_timeout(&self) -> Duration {
        self.settle_timeout
    }

    pub async fn observe(
        &self,
        driver: &dyn BrowserDriver,
    ) -> Result<CandidateSnapshot, StagehandError> {
        let snapshot = match self.observer.observe(driver).await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                self.note_observation_retry(&err);
                self.settle(driver).await;
                self.observer.observe(driver).await?
            }
        };
        self.logger.debug(
            "observed page",
            Some("observe"),
            Some(json!({ "url": snapshot.url, "candidates": snapshot.len() })),
        );
        Ok(snapshot)
    }

    pub async fn act(
        &self,
        driver: &dyn BrowserDriver,
        request: &ActionRequest,
    ) -> Result<ActOutcome, StagehandError> {
        self.logger.info(
            "running act",
            Some("act"),
            Some(json!({
                "instruction": request.instruction,
                "selectorHint": request.selector_hint,
            })),
        );

        let mut attempts = 0u32;
        let mut observation_retried = false;
        let mut detach_retried = false;
        loop {
            attempts += 1;
            let snapshot = match self.observer.observe(driver).await {
                Ok(snapshot) => snapshot,
                Err(err) if !observation_retried => {
                    observation_retried = true;
                    self.note_observation_retry(&err);
                    self.settle(driver).await;
                    continue;
                }
                Err(err) => return Err(err.into()),
            };

            let action = self
                .resolver
                .resolve(self.backend.as_ref(), request, &snapshot)
                .await
                .inspect_err(|err| {
                    self.logger.error(
                        "resolution failed",
                        Some("resolve"),
                        Some(json!({ "instruction": request.instruction, "error": err.to_string() })),
                    )
                })?;
            let confidence = action.confidence();
            let description = action.description().to_string();
            self.logger.debug(
                "resolved action",
                Some("resolve"),
                Some(json!({
                    "target": action.target(),
                    "operation": action.operation(),
                    "confidence": confidence,
                    "description": description,
                })),
            );
            drop(snapshot);

            match self.executor.execute(driver, action).await {
                Ok(execution) => {
                    self.logger.info(
                        "act completed",
                        Some("act"),
                        Some(json!({ "attempts": attempts, "settle": execution.settle })),
                    );
                    return Ok(ActOutcome {
                        execution,
                        confidence,
                        attempts,
                        description,
                    });
                }
                Err(ExecutionError::TargetDetached { locator }) if !detach_retried => {
                    detach_retried = true;
                    self.logger.info(
                        "target detached, re-observing once",
                        Some("act"),
                        Some(json!({ "locator": locator })),
                    );
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    pub async fn extract(
        &self,
        driver: &dyn BrowserDriver,
        request: &ExtractionRequest,
    ) -> Result<ExtractionResult, StagehandError> {
        self.logger.info(
            "running extract",
            Some("extract"),
            Some(json!({ "instruction": request.instruction, "mode": request.mode })),
        );

        let outcome = match self
            .extraction
            .extract(driver, self.backend.as_ref(), request)
            .await
        {
            Err(ExtractionError::Observation(err)) => {
                self.note_observation_retry(&err);
                self.settle(driver).await;
                self.extraction
                    .extract(driver, self.backend.as_ref(), request)
                    .await
            }
            other => other,
        };
        let result = outcome?;

        if result.is_valid() {
            self.logger
                .info("extraction validated", Some("extract"), None);
        } else {
            self.logger.error(
                "extraction output failed validation",
                Some("extract"),
                Some(json!({ "validationErrors": result.validation_errors })),
            );
        }
        Ok(result)
    }

    /// Navigate and wait for the page to come to rest.
    pub async fn goto(&self, driver: &dyn BrowserDriver, url: &str) -> Result<(), StagehandError> {
        self.logger
            .info("navigating", Some("session"), Some(json!({ "url": url })));
        driver
            .navigate(url)
            .await
            .map_err(|err| ExecutionError::DriverFailure(err.to_string()))?;
        self.settle(driver).await;
        Ok(())
    }

    async fn settle(&self, driver: &dyn BrowserDriver) {
        match driver.wait_for_stability(self.settle_timeout).await {
            Ok(state) => {
                self.logger
                    .debug("page settled", Some("settle"), Some(json!({ "state": state })))
            }
            Err(err) => self.logger.debug(
                "settle wait failed",
                Some("settle"),
                Some(json!({ "error": err.to_string() })),
            ),
        }
    }

    fn note_observation_retry(&self, err: &ObservationError) {
        self.logger.info(
            "page not observable, retrying after settle",
            Some("observe"),
            Some(json!({ "error": err.to_string() })),
        );
    }
}

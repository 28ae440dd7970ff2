//! Top-level facade.
//!
//! [`StagehandBuilder`] wires configuration, the reasoning backend, the browser
//! launcher and the remote session host into one [`Stagehand`], which then
//! opens and closes [`Session`]s. Every collaborator can be swapped before
//! `build`; anything left unset is derived from the configuration.

use std::sync::{Arc, Mutex};

use serde_json::json;
use thiserror::Error;

use crate::backend::{ConcurrencyLimitedBackend, ReasoningBackend};
use crate::browser::{BrowserError, BrowserLauncher, LocalPlan};
use crate::config::{Environment, StagehandConfig, StagehandConfigError};
use crate::engine::EngineContext;
use crate::llm::{LlmReasoningBackend, StagehandLlmClient, StagehandLlmError};
use crate::logging::StagehandLogger;
use crate::metrics::{SharedMetrics, StagehandMetrics};
use crate::remote::{BrowserbaseSessionHost, RemoteHostError, RemoteSessionHost};
use crate::runtime::ChromiumoxideLauncher;
use crate::session::{CloseOutcome, OperationTimeouts, Session, SessionError, SessionManager};

#[derive(Debug, Error)]
pub enum StagehandBuildError {
    #[error(transparent)]
    Config(#[from] StagehandConfigError),
    #[error("failed to set up the reasoning backend: {0}")]
    Backend(#[from] StagehandLlmError),
    #[error(transparent)]
    Remote(#[from] RemoteHostError),
    #[error(transparent)]
    Browser(#[from] BrowserError),
}

pub struct StagehandBuilder {
    config: StagehandConfig,
    backend: Option<Arc<dyn ReasoningBackend>>,
    launcher: Option<Arc<dyn BrowserLauncher>>,
    remote_host: Option<Arc<dyn RemoteSessionHost>>,
}

impl StagehandBuilder {
    pub fn new(config: StagehandConfig) -> Self {
        Self {
            config,
            backend: None,
            launcher: None,
            remote_host: None,
        }
    }

    /// Use `backend` instead of the configured chat model. It is still wrapped
    /// in the shared concurrency limit.
    pub fn backend(mut self, backend: Arc<dyn ReasoningBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn launcher(mut self, launcher: Arc<dyn BrowserLauncher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    pub fn remote_host(mut self, host: Arc<dyn RemoteSessionHost>) -> Self {
        self.remote_host = Some(host);
        self
    }

    pub fn build(self) -> Result<Stagehand, StagehandBuildError> {
        let StagehandBuilder {
            config,
            backend,
            launcher,
            remote_host,
        } = self;
        config.validate()?;

        let logger = Arc::new(StagehandLogger::from_config(&config));
        let metrics: SharedMetrics = Arc::new(Mutex::new(StagehandMetrics::default()));

        let backend: Arc<dyn ReasoningBackend> = match backend {
            Some(backend) => backend,
            None => {
                let client = StagehandLlmClient::from_config(&config, Arc::clone(&logger))?
                    .with_metrics(Arc::clone(&metrics));
                Arc::new(
                    LlmReasoningBackend::new(client)
                        .with_system_prompt(config.system_prompt.clone()),
                )
            }
        };
        let backend: Arc<dyn ReasoningBackend> = Arc::new(ConcurrencyLimitedBackend::new(
            backend,
            config.backend_concurrency,
        ));

        let launcher = launcher
            .unwrap_or_else(|| Arc::new(ChromiumoxideLauncher::new(Arc::clone(&logger))));
        let remote_host = match remote_host {
            Some(host) => Some(host),
            None => default_remote_host(&config, &logger)?,
        };
        let local_plan = LocalPlan::from_config(&config)?;

        let ctx = Arc::new(EngineContext::new(backend, Arc::clone(&logger), &config));
        let manager = SessionManager::new(
            ctx,
            launcher,
            remote_host,
            local_plan,
            OperationTimeouts::from_config(&config),
        );

        logger.debug(
            "stagehand initialised",
            Some("session"),
            Some(json!({
                "env": config.env.as_str(),
                "model": config.model_name.as_str(),
                "backendConcurrency": config.backend_concurrency,
            })),
        );

        Ok(Stagehand {
            config,
            logger,
            metrics,
            manager,
        })
    }
}

/// Remote sessions need Browserbase credentials. They are mandatory when the
/// configured environment is remote and optional otherwise.
fn default_remote_host(
    config: &StagehandConfig,
    logger: &StagehandLogger,
) -> Result<Option<Arc<dyn RemoteSessionHost>>, RemoteHostError> {
    match BrowserbaseSessionHost::from_config(config) {
        Ok(host) => Ok(Some(Arc::new(host))),
        Err(err) if config.env == Environment::Remote => Err(err),
        Err(err) => {
            logger.debug(
                "remote sessions unavailable",
                Some("remote"),
                Some(json!({ "reason": err.to_string() })),
            );
            Ok(None)
        }
    }
}

pub struct Stagehand {
    config: StagehandConfig,
    logger: Arc<StagehandLogger>,
    metrics: SharedMetrics,
    manager: SessionManager,
}

impl Stagehand {
    pub fn builder(config: StagehandConfig) -> StagehandBuilder {
        StagehandBuilder::new(config)
    }

    /// Load configuration from `.env` and the environment, then build with the
    /// default collaborators.
    pub fn from_env() -> Result<Self, StagehandBuildError> {
        StagehandBuilder::new(StagehandConfig::from_env()?).build()
    }

    pub fn config(&self) -> &StagehandConfig {
        &self.config
    }

    pub fn logger(&self) -> &StagehandLogger {
        &self.logger
    }

    /// Open a session in the configured environment.
    pub async fn open_session(&self) -> Result<Session, SessionError> {
        self.manager.open(self.config.env).await
    }

    pub async fn open_session_in(&self, environment: Environment) -> Result<Session, SessionError> {
        self.manager.open(environment).await
    }

    pub async fn close_session(&self, session: &Session) -> Result<CloseOutcome, SessionError> {
        self.manager.close(session).await
    }

    /// Cumulative backend usage across every session opened by this instance.
    pub fn metrics(&self) -> StagehandMetrics {
        match self.metrics.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;

    use crate::backend::{
        BackendError, ExtractQuery, ExtractResponse, ResolveQuery, ResolveResponse,
    };

    struct NoBackend;

    #[async_trait]
    impl ReasoningBackend for NoBackend {
        async fn resolve_action(
            &self,
            _query: &ResolveQuery<'_>,
        ) -> Result<ResolveResponse, BackendError> {
            Ok(ResolveResponse::default())
        }

        async fn extract_structured(
            &self,
            _query: &ExtractQuery<'_>,
        ) -> Result<ExtractResponse, BackendError> {
            Ok(ExtractResponse {
                raw: "{}".to_string(),
            })
        }
    }

    #[test]
    fn remote_env_requires_credentials() {
        let config = StagehandConfig {
            env: Environment::Remote,
            ..StagehandConfig::default()
        };
        let err = Stagehand::builder(config)
            .backend(Arc::new(NoBackend))
            .build()
            .err()
            .expect("missing api key");
        assert!(matches!(
            err,
            StagehandBuildError::Remote(RemoteHostError::MissingApiKey)
        ));
    }

    #[test]
    fn local_env_builds_without_remote_credentials() {
        let stagehand = Stagehand::builder(StagehandConfig::default())
            .backend(Arc::new(NoBackend))
            .build()
            .expect("build");
        assert_eq!(stagehand.config().env, Environment::Local);
        assert_eq!(stagehand.metrics(), StagehandMetrics::default());
    }

    #[test]
    fn invalid_threshold_is_rejected_before_wiring() {
        let config = StagehandConfig {
            confidence_threshold: 1.5,
            ..StagehandConfig::default()
        };
        let err = Stagehand::builder(config)
            .backend(Arc::new(NoBackend))
            .build()
            .err()
            .expect("invalid config");
        assert!(matches!(err, StagehandBuildError::Config(_)));
    }
}

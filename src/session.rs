//! Session Manager and the per-session operation envelope.
//!
//! A [`Session`] owns one browser page. Operations on a session run one at a
//! time through its queue; each may carry a timeout, and closing the session
//! cancels whatever is in flight before the browser is released.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::browser::{BrowserDriver, BrowserError, BrowserLauncher, DriverError, LocalPlan};
use crate::config::{Environment, StagehandConfig};
use crate::engine::EngineContext;
use crate::error::StagehandError;
use crate::executor::ExecutionError;
use crate::remote::{RemoteHostError, RemoteSessionHost};
use crate::types::page::{
    ActOutcome, ActionRequest, CandidateSnapshot, ExtractionRequest, ExtractionResult,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Uninitialized,
    Open,
    Closed,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session {0} is not open")]
    NotOpen(String),
    #[error("session {0} is closed")]
    Closed(String),
    #[error("failed to start browser: {0}")]
    Launch(#[source] DriverError),
    #[error("no remote session host is configured")]
    NoRemoteHost,
    #[error(transparent)]
    Remote(#[from] RemoteHostError),
    #[error(transparent)]
    Browser(#[from] BrowserError),
}

/// Default per-operation timeouts, used when a request carries none.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OperationTimeouts {
    pub act_ms: Option<u64>,
    pub extract_ms: Option<u64>,
    pub observe_ms: Option<u64>,
}

impl OperationTimeouts {
    pub fn from_config(config: &StagehandConfig) -> Self {
        Self {
            act_ms: config.act_timeout_ms,
            extract_ms: config.extract_timeout_ms,
            observe_ms: config.observe_timeout_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseOutcome {
    pub session_id: String,
    pub recording_ref: Option<String>,
    /// The session had already been closed; nothing was done.
    pub already_closed: bool,
}

struct SessionInner {
    id: String,
    environment: Environment,
    recording_ref: Option<String>,
    /// Cleared once the remote host confirms the release.
    remote_id: tokio::sync::Mutex<Option<String>>,
    state: Mutex<SessionState>,
    driver: Arc<dyn BrowserDriver>,
    remote_host: Option<Arc<dyn RemoteSessionHost>>,
    cancel: CancellationToken,
    op_lock: tokio::sync::Mutex<()>,
    ctx: Arc<EngineContext>,
    timeouts: OperationTimeouts,
}

/// Handle to one open browsing context. Clones share the same session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("environment", &self.inner.environment)
            .field("state", &self.state())
            .field("recording_ref", &self.inner.recording_ref)
            .finish()
    }
}

impl Session {
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn environment(&self) -> Environment {
        self.inner.environment
    }

    pub fn state(&self) -> SessionState {
        *self.lock_state()
    }

    pub fn recording_ref(&self) -> Option<&str> {
        self.inner.recording_ref.as_deref()
    }

    pub fn is_open(&self) -> bool {
        self.state() == SessionState::Open
    }

    pub async fn goto(&self, url: &str) -> Result<(), StagehandError> {
        let inner = &self.inner;
        self.run("goto", None, inner.ctx.goto(inner.driver.as_ref(), url))
            .await
    }

    pub async fn observe(&self) -> Result<CandidateSnapshot, StagehandError> {
        let inner = &self.inner;
        self.run(
            "observe",
            inner.timeouts.observe_ms,
            inner.ctx.observe(inner.driver.as_ref()),
        )
        .await
    }

    pub async fn act(&self, request: &ActionRequest) -> Result<ActOutcome, StagehandError> {
        if request.instruction.trim().is_empty() {
            return Err(StagehandError::InvalidRequest(
                "act instruction must not be empty".to_string(),
            ));
        }
        let inner = &self.inner;
        self.run(
            "act",
            request.timeout_ms.or(inner.timeouts.act_ms),
            inner.ctx.act(inner.driver.as_ref(), request),
        )
        .await
    }

    pub async fn extract(
        &self,
        request: &ExtractionRequest,
    ) -> Result<ExtractionResult, StagehandError> {
        if request.instruction.trim().is_empty() {
            return Err(StagehandError::InvalidRequest(
                "extract instruction must not be empty".to_string(),
            ));
        }
        let inner = &self.inner;
        self.run(
            "extract",
            request.timeout_ms.or(inner.timeouts.extract_ms),
            inner.ctx.extract(inner.driver.as_ref(), request),
        )
        .await
    }

    /// Close the session.
    ///
    /// Any in-flight operation is cancelled and allowed to unwind before the
    /// driver shuts down and the remote session, if any, is released. A second
    /// close does not touch the driver again but retries a remote release that
    /// previously failed.
    pub async fn close(&self) -> Result<CloseOutcome, SessionError> {
        let inner = &self.inner;
        let already_closed = {
            let mut state = self.lock_state();
            let closed = *state == SessionState::Closed;
            *state = SessionState::Closed;
            closed
        };

        let logger = inner.ctx.logger();
        if !already_closed {
            inner.cancel.cancel();
            let _queue = inner.op_lock.lock().await;
            if let Err(err) = inner.driver.shutdown().await {
                logger.error(
                    "browser shutdown failed",
                    Some("session"),
                    Some(json!({ "sessionId": inner.id, "error": err.to_string() })),
                );
            }
        }

        self.release_remote().await?;
        if !already_closed {
            logger.info(
                "session closed",
                Some("session"),
                Some(json!({ "sessionId": inner.id, "recordingRef": inner.recording_ref })),
            );
        }
        Ok(CloseOutcome {
            session_id: inner.id.clone(),
            recording_ref: inner.recording_ref.clone(),
            already_closed,
        })
    }

    async fn release_remote(&self) -> Result<(), SessionError> {
        let inner = &self.inner;
        let mut pending = inner.remote_id.lock().await;
        if let (Some(host), Some(remote_id)) = (&inner.remote_host, pending.as_deref()) {
            if let Err(err) = host.close_remote_session(remote_id).await {
                inner.ctx.logger().error(
                    "remote session release failed",
                    Some("remote"),
                    Some(json!({ "sessionId": remote_id, "error": err.to_string() })),
                );
                return Err(err.into());
            }
            *pending = None;
        }
        Ok(())
    }

    async fn run<T>(
        &self,
        operation: &'static str,
        timeout_ms: Option<u64>,
        work: impl Future<Output = Result<T, StagehandError>>,
    ) -> Result<T, StagehandError> {
        match self.state() {
            SessionState::Open => {}
            SessionState::Closed => return Err(SessionError::Closed(self.inner.id.clone()).into()),
            SessionState::Uninitialized => {
                return Err(SessionError::NotOpen(self.inner.id.clone()).into());
            }
        }

        let queued = async {
            let _turn = self.inner.op_lock.lock().await;
            work.await
        };
        let bounded = async {
            match timeout_ms {
                Some(ms) => tokio::time::timeout(Duration::from_millis(ms), queued)
                    .await
                    .unwrap_or(Err(StagehandError::Timeout {
                        operation,
                        timeout_ms: ms,
                    })),
                None => queued.await,
            }
        };

        tokio::select! {
            biased;
            _ = self.inner.cancel.cancelled() => Err(ExecutionError::Cancelled.into()),
            result = bounded => result,
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        match self.inner.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn transition(&self, next: SessionState) {
        let mut state = self.lock_state();
        if *state != SessionState::Closed {
            *state = next;
        }
    }
}

/// Opens and closes sessions. Sessions opened by one manager share the engine
/// context (and so the reasoning backend) but nothing else.
pub struct SessionManager {
    ctx: Arc<EngineContext>,
    launcher: Arc<dyn BrowserLauncher>,
    remote_host: Option<Arc<dyn RemoteSessionHost>>,
    local_plan: LocalPlan,
    timeouts: OperationTimeouts,
    counter: AtomicU64,
}

impl SessionManager {
    pub fn new(
        ctx: Arc<EngineContext>,
        launcher: Arc<dyn BrowserLauncher>,
        remote_host: Option<Arc<dyn RemoteSessionHost>>,
        local_plan: LocalPlan,
        timeouts: OperationTimeouts,
    ) -> Self {
        Self {
            ctx,
            launcher,
            remote_host,
            local_plan,
            timeouts,
            counter: AtomicU64::new(0),
        }
    }

    pub async fn open(&self, environment: Environment) -> Result<Session, SessionError> {
        let logger = self.ctx.logger();
        let (id, driver, remote_id, recording_ref, remote_host) = match environment {
            Environment::Local => {
                let driver = self
                    .launcher
                    .launch_local(&self.local_plan)
                    .await
                    .map_err(SessionError::Launch)?;
                (self.next_local_id(), driver, None, None, None)
            }
            Environment::Remote => {
                let host = self
                    .remote_host
                    .as_ref()
                    .ok_or(SessionError::NoRemoteHost)?;
                let remote = host.open_remote_session().await?;
                let driver = match self.launcher.connect_remote(&remote.connect_url).await {
                    Ok(driver) => driver,
                    Err(err) => {
                        if let Err(release) = host.close_remote_session(&remote.id).await {
                            logger.error(
                                "failed to release remote session after connect error",
                                Some("remote"),
                                Some(json!({ "sessionId": remote.id, "error": release.to_string() })),
                            );
                        }
                        return Err(SessionError::Launch(err));
                    }
                };
                (
                    remote.id.clone(),
                    driver,
                    Some(remote.id),
                    remote.recording_ref,
                    Some(Arc::clone(host)),
                )
            }
        };

        let session = Session {
            inner: Arc::new(SessionInner {
                id,
                environment,
                recording_ref,
                remote_id: tokio::sync::Mutex::new(remote_id),
                state: Mutex::new(SessionState::Uninitialized),
                driver,
                remote_host,
                cancel: CancellationToken::new(),
                op_lock: tokio::sync::Mutex::new(()),
                ctx: Arc::clone(&self.ctx),
                timeouts: self.timeouts,
            }),
        };
        session.transition(SessionState::Open);

        logger.info(
            "session opened",
            Some("session"),
            Some(json!({
                "sessionId": session.id(),
                "environment": environment.as_str(),
                "recordingRef": session.recording_ref(),
            })),
        );
        Ok(session)
    }

    pub async fn close(&self, session: &Session) -> Result<CloseOutcome, SessionError> {
        session.close().await
    }

    fn next_local_id(&self) -> String {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis())
            .unwrap_or_default();
        let sequence = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("local-{millis}-{sequence}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    use async_trait::async_trait;

    use crate::backend::{
        BackendError, ExtractQuery, ExtractResponse, ReasoningBackend, ResolveQuery,
        ResolveResponse,
    };
    use crate::logging::StagehandLogger;
    use crate::remote::RemoteSession;
    use crate::types::dom::{DomSnapshot, RawDomNode};
    use crate::types::page::{ActionKind, SettleState};

    #[derive(Default)]
    struct IdleDriver {
        shut_down: AtomicBool,
    }

    #[async_trait]
    impl BrowserDriver for IdleDriver {
        async fn navigate(&self, _url: &str) -> Result<(), DriverError> {
            Ok(())
        }

        async fn dispatch_input(
            &self,
            _locator: &str,
            _operation: ActionKind,
            _parameters: &[String],
        ) -> Result<(), DriverError> {
            Ok(())
        }

        async fn wait_for_stability(
            &self,
            _idle_timeout: Duration,
        ) -> Result<SettleState, DriverError> {
            Ok(SettleState::Quiescent)
        }

        async fn current_dom_snapshot(&self) -> Result<DomSnapshot, DriverError> {
            Ok(DomSnapshot::new("about:blank", RawDomNode::element("body")))
        }

        async fn shutdown(&self) -> Result<(), DriverError> {
            self.shut_down.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Launcher {
        driver: Arc<IdleDriver>,
        fail_connect: bool,
    }

    #[async_trait]
    impl BrowserLauncher for Launcher {
        async fn launch_local(
            &self,
            _plan: &LocalPlan,
        ) -> Result<Arc<dyn BrowserDriver>, DriverError> {
            Ok(self.driver.clone())
        }

        async fn connect_remote(
            &self,
            connect_url: &str,
        ) -> Result<Arc<dyn BrowserDriver>, DriverError> {
            if self.fail_connect {
                return Err(DriverError::Unreachable(connect_url.to_string()));
            }
            Ok(self.driver.clone())
        }
    }

    #[derive(Default)]
    struct Host {
        released: Mutex<Vec<String>>,
        release_attempts: AtomicUsize,
        failing_releases: AtomicUsize,
    }

    #[async_trait]
    impl RemoteSessionHost for Host {
        async fn open_remote_session(&self) -> Result<RemoteSession, RemoteHostError> {
            Ok(RemoteSession {
                id: "bb-1".to_string(),
                connect_url: "wss://remote/bb-1".to_string(),
                recording_ref: Some("https://browserbase.com/sessions/bb-1".to_string()),
            })
        }

        async fn close_remote_session(&self, session_id: &str) -> Result<(), RemoteHostError> {
            self.release_attempts.fetch_add(1, Ordering::SeqCst);
            let failing = self.failing_releases.load(Ordering::SeqCst);
            if failing > 0 {
                self.failing_releases.store(failing - 1, Ordering::SeqCst);
                return Err(RemoteHostError::Http("503 Service Unavailable".to_string()));
            }
            self.released.lock().unwrap().push(session_id.to_string());
            Ok(())
        }
    }

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
            Err(BackendError::Unavailable("test".into()))
        }
    }

    fn manager(fail_connect: bool) -> (SessionManager, Arc<IdleDriver>, Arc<Host>) {
        let config = StagehandConfig::default();
        let ctx = Arc::new(EngineContext::new(
            Arc::new(NoBackend),
            Arc::new(StagehandLogger::default()),
            &config,
        ));
        let driver = Arc::new(IdleDriver::default());
        let host = Arc::new(Host::default());
        let manager = SessionManager::new(
            ctx,
            Arc::new(Launcher {
                driver: driver.clone(),
                fail_connect,
            }),
            Some(host.clone()),
            LocalPlan::from_overrides(Default::default(), true),
            OperationTimeouts::default(),
        );
        (manager, driver, host)
    }

    #[tokio::test]
    async fn local_sessions_get_distinct_ids_and_no_recording() {
        let (manager, _, _) = manager(false);
        let first = manager.open(Environment::Local).await.expect("open");
        let second = manager.open(Environment::Local).await.expect("open");

        assert!(first.id().starts_with("local-"));
        assert_ne!(first.id(), second.id());
        assert_eq!(first.state(), SessionState::Open);
        assert!(first.recording_ref().is_none());
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (manager, driver, host) = manager(false);
        let session = manager.open(Environment::Remote).await.expect("open");
        assert_eq!(session.id(), "bb-1");

        let first = manager.close(&session).await.expect("close");
        assert!(!first.already_closed);
        assert_eq!(
            first.recording_ref.as_deref(),
            Some("https://browserbase.com/sessions/bb-1")
        );
        assert!(driver.shut_down.load(Ordering::SeqCst));

        let second = manager.close(&session).await.expect("second close");
        assert!(second.already_closed);
        assert_eq!(*host.released.lock().unwrap(), vec!["bb-1".to_string()]);
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn failed_remote_release_is_retried_by_the_next_close() {
        let (manager, driver, host) = manager(false);
        host.failing_releases.store(1, Ordering::SeqCst);
        let session = manager.open(Environment::Remote).await.expect("open");

        let err = session.close().await.unwrap_err();
        assert!(matches!(err, SessionError::Remote(RemoteHostError::Http(_))));
        assert_eq!(session.state(), SessionState::Closed);
        assert!(driver.shut_down.load(Ordering::SeqCst));
        assert!(host.released.lock().unwrap().is_empty());

        let retried = session.close().await.expect("release retried");
        assert!(retried.already_closed);
        assert_eq!(host.release_attempts.load(Ordering::SeqCst), 2);
        assert_eq!(*host.released.lock().unwrap(), vec!["bb-1".to_string()]);

        session.close().await.expect("nothing left to release");
        assert_eq!(host.release_attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn operations_on_a_closed_session_fail() {
        let (manager, _, _) = manager(false);
        let session = manager.open(Environment::Local).await.expect("open");
        session.close().await.expect("close");

        let err = session.observe().await.unwrap_err();
        assert!(matches!(err, StagehandError::Session(SessionError::Closed(_))));
    }

    #[tokio::test]
    async fn remote_session_is_released_when_connect_fails() {
        let (manager, _, host) = manager(true);
        let err = manager.open(Environment::Remote).await.unwrap_err();
        assert!(matches!(err, SessionError::Launch(_)));
        assert_eq!(*host.released.lock().unwrap(), vec!["bb-1".to_string()]);
    }

    #[tokio::test]
    async fn empty_instructions_are_invalid_requests() {
        let (manager, _, _) = manager(false);
        let session = manager.open(Environment::Local).await.expect("open");
        let err = session.act(&ActionRequest::new("   ")).await.unwrap_err();
        assert!(matches!(err, StagehandError::InvalidRequest(_)));
    }
}

//! Chromiumoxide-based browser driver.
//!
//! [`ChromiumoxideLauncher`] starts or attaches to Chrome over CDP and hands
//! out one [`ChromiumoxideDriver`] per session. The driver reads the page
//! through an injected snapshot script, dispatches input with xpath-addressed
//! scripts, and waits for network quiescence from CDP network events.

use std::sync::Arc;

use async_trait::async_trait;
use chromiumoxide::cdp::IntoEventKind;
use chromiumoxide::cdp::browser_protocol::network::{
    self, EventLoadingFailed, EventLoadingFinished, EventRequestServedFromCache,
    EventRequestWillBeSent, EventResponseReceived, ResourceType,
};
use chromiumoxide::cdp::browser_protocol::page::EventFrameStoppedLoading;
use chromiumoxide::listeners::EventStream;
use chromiumoxide::{
    browser::{Browser, BrowserConfig},
    page::Page as ChromiumPage,
};
use futures_util::StreamExt;
use serde_json::json;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Duration;

use crate::browser::{BrowserDriver, BrowserLauncher, DriverError, LocalLaunchStrategy, LocalPlan};
use crate::logging::StagehandLogger;
use crate::types::dom::DomSnapshot;
use crate::types::page::{ActionKind, SettleState};

mod scripts;
mod settle;

use scripts::{DOM_SNAPSHOT_SCRIPT, classify_script_error, input_script};
use settle::{NetworkEvent, wait_for_quiet};

/// Opens chromiumoxide-backed drivers.
pub struct ChromiumoxideLauncher {
    logger: Arc<StagehandLogger>,
}

impl ChromiumoxideLauncher {
    pub fn new(logger: Arc<StagehandLogger>) -> Self {
        Self { logger }
    }

    async fn attach(
        &self,
        url: &str,
        owns_process: bool,
    ) -> Result<Arc<dyn BrowserDriver>, DriverError> {
        let (browser, handler) = Browser::connect(url).await.map_err(unreachable_error)?;
        self.finish_open(browser, handler, owns_process).await
    }

    async fn finish_open(
        &self,
        browser: Browser,
        handler: chromiumoxide::handler::Handler,
        owns_process: bool,
    ) -> Result<Arc<dyn BrowserDriver>, DriverError> {
        let handler = spawn_handler(handler, Arc::clone(&self.logger));

        let existing = browser.pages().await.map_err(unreachable_error)?;
        let page = match existing.into_iter().next() {
            Some(page) => page,
            None => browser
                .new_page("about:blank")
                .await
                .map_err(unreachable_error)?,
        };

        Ok(Arc::new(ChromiumoxideDriver {
            browser: Mutex::new(Some(browser)),
            handler,
            page,
            owns_process,
            logger: Arc::clone(&self.logger),
        }))
    }
}

#[async_trait]
impl BrowserLauncher for ChromiumoxideLauncher {
    async fn launch_local(&self, plan: &LocalPlan) -> Result<Arc<dyn BrowserDriver>, DriverError> {
        match &plan.strategy {
            LocalLaunchStrategy::AttachCdp { url } => {
                self.logger.info(
                    "attaching to local browser",
                    Some("runtime"),
                    Some(json!({ "cdpUrl": url })),
                );
                self.attach(url, false).await
            }
            LocalLaunchStrategy::Launch { .. } => {
                let config = build_config(plan)?;
                self.logger.info(
                    "launching local browser",
                    Some("runtime"),
                    Some(json!({ "headless": plan.launch_options.headless })),
                );
                let (browser, handler) = Browser::launch(config)
                    .await
                    .map_err(unreachable_error)?;
                self.finish_open(browser, handler, true).await
            }
        }
    }

    async fn connect_remote(&self, connect_url: &str) -> Result<Arc<dyn BrowserDriver>, DriverError> {
        self.logger
            .info("connecting to remote browser", Some("runtime"), None);
        self.attach(connect_url, false).await
    }
}

pub struct ChromiumoxideDriver {
    browser: Mutex<Option<Browser>>,
    handler: JoinHandle<()>,
    page: ChromiumPage,
    owns_process: bool,
    logger: Arc<StagehandLogger>,
}

impl ChromiumoxideDriver {
    async fn network_events(
        &self,
    ) -> Result<(mpsc::UnboundedReceiver<NetworkEvent>, Vec<JoinHandle<()>>), DriverError> {
        self.page
            .execute(network::EnableParams::default())
            .await
            .map_err(cdp_error)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let page = &self.page;
        let handles = vec![
            spawn_event_listener(
                page.event_listener::<EventRequestWillBeSent>()
                    .await
                    .map_err(cdp_error)?,
                tx.clone(),
                |ev| {
                    if matches!(
                        ev.r#type.as_ref(),
                        Some(ResourceType::WebSocket | ResourceType::EventSource)
                    ) {
                        return None;
                    }
                    let document_frame = matches!(ev.r#type.as_ref(), Some(ResourceType::Document))
                        .then(|| ev.frame_id.as_ref().map(|id| id.as_ref().to_string()))
                        .flatten();
                    Some(NetworkEvent::RequestStarted {
                        request_id: ev.request_id.as_ref().to_string(),
                        url: ev.request.url.clone(),
                        document_frame,
                    })
                },
            ),
            spawn_event_listener(
                page.event_listener::<EventLoadingFinished>()
                    .await
                    .map_err(cdp_error)?,
                tx.clone(),
                |ev| Some(finished(ev.request_id.as_ref())),
            ),
            spawn_event_listener(
                page.event_listener::<EventLoadingFailed>()
                    .await
                    .map_err(cdp_error)?,
                tx.clone(),
                |ev| Some(finished(ev.request_id.as_ref())),
            ),
            spawn_event_listener(
                page.event_listener::<EventRequestServedFromCache>()
                    .await
                    .map_err(cdp_error)?,
                tx.clone(),
                |ev| Some(finished(ev.request_id.as_ref())),
            ),
            spawn_event_listener(
                page.event_listener::<EventResponseReceived>()
                    .await
                    .map_err(cdp_error)?,
                tx.clone(),
                |ev| {
                    ev.response
                        .url
                        .starts_with("data:")
                        .then(|| finished(ev.request_id.as_ref()))
                },
            ),
            spawn_event_listener(
                page.event_listener::<EventFrameStoppedLoading>()
                    .await
                    .map_err(cdp_error)?,
                tx,
                |ev| {
                    Some(NetworkEvent::FrameStopped {
                        frame_id: ev.frame_id.as_ref().to_string(),
                    })
                },
            ),
        ];
        Ok((rx, handles))
    }
}

#[async_trait]
impl BrowserDriver for ChromiumoxideDriver {
    async fn navigate(&self, url: &str) -> Result<(), DriverError> {
        self.page
            .goto(url)
            .await
            .map_err(|err| classify_script_error(None, err.to_string()))?;
        Ok(())
    }

    async fn dispatch_input(
        &self,
        locator: &str,
        operation: ActionKind,
        parameters: &[String],
    ) -> Result<(), DriverError> {
        let script = input_script(locator, operation, parameters)?;
        self.logger.debug(
            "dispatching input",
            Some("runtime"),
            Some(json!({ "locator": locator, "operation": operation })),
        );
        self.page
            .evaluate(script)
            .await
            .map_err(|err| classify_script_error(Some(locator), err.to_string()))?;
        Ok(())
    }

    async fn wait_for_stability(&self, idle_timeout: Duration) -> Result<SettleState, DriverError> {
        let (mut events, listeners) = self.network_events().await?;
        let state = wait_for_quiet(&mut events, idle_timeout, &self.logger).await;
        for listener in listeners {
            listener.abort();
        }
        Ok(state)
    }

    async fn current_dom_snapshot(&self) -> Result<DomSnapshot, DriverError> {
        let raw: String = self
            .page
            .evaluate(DOM_SNAPSHOT_SCRIPT)
            .await
            .map_err(|err| classify_script_error(None, err.to_string()))?
            .into_value()
            .map_err(|err| DriverError::Message(format!("snapshot was not a string: {err}")))?;
        serde_json::from_str(&raw)
            .map_err(|err| DriverError::Message(format!("malformed DOM snapshot: {err}")))
    }

    async fn shutdown(&self) -> Result<(), DriverError> {
        let Some(mut browser) = self.browser.lock().await.take() else {
            return Ok(());
        };
        let result = if self.owns_process {
            browser.close().await.map(|_| ()).map_err(cdp_error)
        } else {
            Ok(())
        };
        self.handler.abort();
        result
    }
}

fn finished(request_id: &str) -> NetworkEvent {
    NetworkEvent::RequestFinished {
        request_id: request_id.to_string(),
    }
}

fn spawn_event_listener<T, F>(
    mut stream: EventStream<T>,
    tx: mpsc::UnboundedSender<NetworkEvent>,
    map: F,
) -> JoinHandle<()>
where
    T: IntoEventKind + Unpin + Send + Sync + 'static,
    F: Fn(&T) -> Option<NetworkEvent> + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(event) = stream.next().await {
            if let Some(mapped) = map(event.as_ref()) {
                if tx.send(mapped).is_err() {
                    break;
                }
            }
        }
    })
}

fn spawn_handler(
    mut handler: chromiumoxide::handler::Handler,
    logger: Arc<StagehandLogger>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(result) = handler.next().await {
            if let Err(err) = result {
                logger.debug(
                    "chromiumoxide handler error",
                    Some("runtime"),
                    Some(json!({ "error": err.to_string() })),
                );
            }
        }
    })
}

fn build_config(plan: &LocalPlan) -> Result<BrowserConfig, DriverError> {
    let launch = &plan.launch_options;

    let viewport = chromiumoxide::handler::viewport::Viewport {
        width: launch.viewport.width,
        height: launch.viewport.height,
        device_scale_factor: None,
        emulating_mobile: false,
        is_landscape: launch.viewport.width >= launch.viewport.height,
        has_touch: false,
    };

    let mut builder = BrowserConfig::builder();
    if let Some(path) = &plan.chrome_executable {
        builder = builder.chrome_executable(path);
    }
    let mut builder = builder.viewport(viewport).args(launch.args.clone());
    if !launch.headless {
        builder = builder.with_head();
    }
    if !launch.ignore_https_errors {
        builder = builder.respect_https_errors();
    }
    if let LocalLaunchStrategy::Launch {
        user_data_dir: Some(dir),
    } = &plan.strategy
    {
        builder = builder.user_data_dir(dir);
    }
    if !launch.locale.is_empty() {
        builder = builder.arg(format!("--lang={}", launch.locale));
    }
    if !launch.timezone_id.is_empty() {
        builder = builder.arg(format!("--timezone={}", launch.timezone_id));
    }

    builder.build().map_err(DriverError::Unsupported)
}

fn cdp_error(err: impl std::fmt::Display) -> DriverError {
    DriverError::Message(err.to_string())
}

fn unreachable_error(err: impl std::fmt::Display) -> DriverError {
    DriverError::Unreachable(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::LocalLaunchOverrides;

    #[test]
    fn launch_config_builds_from_plan() {
        let overrides = LocalLaunchOverrides {
            headless: Some(true),
            locale: Some("de-DE".to_string()),
            ..Default::default()
        };
        let plan = LocalPlan::from_overrides(overrides, true);
        assert!(build_config(&plan).is_ok());
    }
}

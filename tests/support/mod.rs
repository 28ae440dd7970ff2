//! Scripted collaborators shared by the integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use stagehand_grounding::backend::{
    BackendError, BackendMatch, ExtractQuery, ExtractResponse, ReasoningBackend, ResolveQuery,
    ResolveResponse,
};
use stagehand_grounding::browser::{BrowserDriver, BrowserLauncher, DriverError, LocalPlan};
use stagehand_grounding::config::{StagehandConfig, Verbosity};
use stagehand_grounding::types::dom::{BoundingBox, DomSnapshot, RawDomNode, ViewportSize};
use stagehand_grounding::types::page::{ActionKind, CandidateId, SettleState};
use stagehand_grounding::{Stagehand, StagehandBuilder};

pub const GIFT_CARD_URL: &str = "https://shop.test/gift-cards/amazon_com-usa/";

fn denomination(label: &str, x: f64) -> RawDomNode {
    RawDomNode::element("button")
        .with_text(label)
        .with_attr("class", "package-select-button")
        .with_box(BoundingBox::new(x, 200.0, 80.0, 40.0))
        .with_locator(format!("xpath=/html[1]/body[1]/div[1]/button[.='{label}']"))
}

/// Gift card product page.
///
/// Pre-order ids: 0 body, 1 h1, 2 div, 3 "$25", 4 "$50" (disabled),
/// 5 "$100", 6 add-to-cart, 7 cart status.
pub fn gift_card_page(cart_status: &str) -> DomSnapshot {
    let root = RawDomNode::element("body").with_children(vec![
        RawDomNode::element("h1")
            .with_text("Amazon.com USA")
            .with_box(BoundingBox::new(0.0, 0.0, 600.0, 60.0)),
        RawDomNode::element("div")
            .with_attr("class", "packages")
            .with_box(BoundingBox::new(0.0, 180.0, 600.0, 80.0))
            .with_children(vec![
                denomination("$25", 0.0),
                denomination("$50", 100.0).with_attr("disabled", ""),
                denomination("$100", 200.0),
            ]),
        RawDomNode::element("button")
            .with_text("Add to cart")
            .with_attr("data-testid", "add-to-cart-button")
            .with_box(BoundingBox::new(0.0, 300.0, 160.0, 40.0))
            .with_locator("xpath=/html[1]/body[1]/button[1]"),
        RawDomNode::element("p")
            .with_text(cart_status)
            .with_box(BoundingBox::new(0.0, 360.0, 400.0, 20.0)),
    ]);
    let mut dom = DomSnapshot::new(GIFT_CARD_URL, root);
    dom.title = "Amazon.com USA gift card".to_string();
    dom.viewport = ViewportSize {
        width: 1288.0,
        height: 711.0,
    };
    dom
}

#[derive(Debug, Clone, PartialEq)]
pub struct Dispatch {
    pub locator: String,
    pub operation: ActionKind,
    pub parameters: Vec<String>,
}

/// Driver serving a fixed page. Dispatch results can be scripted, and a
/// dispatch delay makes operations slow enough to time out or cancel.
pub struct ScriptedDriver {
    page: Mutex<DomSnapshot>,
    page_after_dispatch: Mutex<Option<DomSnapshot>>,
    dispatch_results: Mutex<VecDeque<Result<(), DriverError>>>,
    dispatch_delay: Mutex<Option<Duration>>,
    pub dispatches: Mutex<Vec<Dispatch>>,
    pub navigations: Mutex<Vec<String>>,
    pub in_flight: AtomicUsize,
    pub peak_in_flight: AtomicUsize,
    pub shutdowns: AtomicUsize,
}

impl ScriptedDriver {
    pub fn new(page: DomSnapshot) -> Arc<Self> {
        Arc::new(Self {
            page: Mutex::new(page),
            page_after_dispatch: Mutex::new(None),
            dispatch_results: Mutex::new(VecDeque::new()),
            dispatch_delay: Mutex::new(None),
            dispatches: Mutex::new(Vec::new()),
            navigations: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
            shutdowns: AtomicUsize::new(0),
        })
    }

    /// Serve `page` once the next dispatch succeeds.
    pub fn then_show(&self, page: DomSnapshot) {
        *self.page_after_dispatch.lock().unwrap() = Some(page);
    }

    pub fn push_dispatch_result(&self, result: Result<(), DriverError>) {
        self.dispatch_results.lock().unwrap().push_back(result);
    }

    pub fn set_dispatch_delay(&self, delay: Duration) {
        *self.dispatch_delay.lock().unwrap() = Some(delay);
    }

    pub fn dispatched(&self) -> Vec<Dispatch> {
        self.dispatches.lock().unwrap().clone()
    }
}

#[async_trait]
impl BrowserDriver for ScriptedDriver {
    async fn navigate(&self, url: &str) -> Result<(), DriverError> {
        self.navigations.lock().unwrap().push(url.to_string());
        Ok(())
    }

    async fn dispatch_input(
        &self,
        locator: &str,
        operation: ActionKind,
        parameters: &[String],
    ) -> Result<(), DriverError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        let delay = *self.dispatch_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let result = self
            .dispatch_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(()));
        if result.is_ok() {
            self.dispatches.lock().unwrap().push(Dispatch {
                locator: locator.to_string(),
                operation,
                parameters: parameters.to_vec(),
            });
            if let Some(next) = self.page_after_dispatch.lock().unwrap().take() {
                *self.page.lock().unwrap() = next;
            }
        }
        result
    }

    async fn wait_for_stability(&self, _idle_timeout: Duration) -> Result<SettleState, DriverError> {
        Ok(SettleState::Quiescent)
    }

    async fn current_dom_snapshot(&self) -> Result<DomSnapshot, DriverError> {
        Ok(self.page.lock().unwrap().clone())
    }

    async fn shutdown(&self) -> Result<(), DriverError> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Launcher handing out one prepared driver per session, in order.
#[derive(Default)]
pub struct QueueLauncher {
    drivers: Mutex<VecDeque<Arc<ScriptedDriver>>>,
}

impl QueueLauncher {
    pub fn with(drivers: Vec<Arc<ScriptedDriver>>) -> Arc<Self> {
        Arc::new(Self {
            drivers: Mutex::new(drivers.into()),
        })
    }

    fn next(&self) -> Result<Arc<dyn BrowserDriver>, DriverError> {
        self.drivers
            .lock()
            .unwrap()
            .pop_front()
            .map(|driver| driver as Arc<dyn BrowserDriver>)
            .ok_or_else(|| DriverError::Unreachable("no driver prepared".to_string()))
    }
}

#[async_trait]
impl BrowserLauncher for QueueLauncher {
    async fn launch_local(&self, _plan: &LocalPlan) -> Result<Arc<dyn BrowserDriver>, DriverError> {
        self.next()
    }

    async fn connect_remote(&self, _connect_url: &str) -> Result<Arc<dyn BrowserDriver>, DriverError> {
        self.next()
    }
}

#[derive(Debug, Clone)]
pub struct SeenResolve {
    pub instruction: String,
    pub selector_hint: Option<String>,
    pub candidate_ids: Vec<CandidateId>,
    pub variable_names: Vec<String>,
}

type Resolver = dyn Fn(&ResolveQuery<'_>) -> Result<ResolveResponse, BackendError> + Send + Sync;

/// Backend driven by a resolve closure and a queue of extraction replies.
pub struct ScriptedBackend {
    resolver: Box<Resolver>,
    extract_replies: Mutex<VecDeque<Result<String, BackendError>>>,
    pub resolves: Mutex<Vec<SeenResolve>>,
    pub extract_contents: Mutex<Vec<String>>,
}

impl ScriptedBackend {
    pub fn resolving_with(
        resolver: impl Fn(&ResolveQuery<'_>) -> Result<ResolveResponse, BackendError>
        + Send
        + Sync
        + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            resolver: Box::new(resolver),
            extract_replies: Mutex::new(VecDeque::new()),
            resolves: Mutex::new(Vec::new()),
            extract_contents: Mutex::new(Vec::new()),
        })
    }

    /// Picks the candidate whose text matches `label`, if it was offered.
    pub fn picking_text(label: &'static str, confidence: f64) -> Arc<Self> {
        Self::resolving_with(move |query| {
            Ok(ResolveResponse {
                matches: query
                    .candidates
                    .iter()
                    .filter(|candidate| candidate.visible_text == label)
                    .map(|candidate| matched(candidate.id, confidence))
                    .collect(),
            })
        })
    }

    /// Proposes every offered candidate with the same confidence.
    pub fn picking_all(confidence: f64) -> Arc<Self> {
        Self::resolving_with(move |query| {
            Ok(ResolveResponse {
                matches: query
                    .candidates
                    .iter()
                    .map(|candidate| matched(candidate.id, confidence))
                    .collect(),
            })
        })
    }

    pub fn push_extract_reply(&self, reply: Result<&str, BackendError>) {
        self.extract_replies
            .lock()
            .unwrap()
            .push_back(reply.map(str::to_string));
    }

    pub fn seen_resolves(&self) -> Vec<SeenResolve> {
        self.resolves.lock().unwrap().clone()
    }
}

pub fn matched(id: CandidateId, confidence: f64) -> BackendMatch {
    BackendMatch {
        candidate_id: id,
        operation: None,
        arguments: Vec::new(),
        confidence,
        description: String::new(),
    }
}

#[async_trait]
impl ReasoningBackend for ScriptedBackend {
    async fn resolve_action(
        &self,
        query: &ResolveQuery<'_>,
    ) -> Result<ResolveResponse, BackendError> {
        self.resolves.lock().unwrap().push(SeenResolve {
            instruction: query.instruction.to_string(),
            selector_hint: query.selector_hint.map(str::to_string),
            candidate_ids: query.candidates.iter().map(|c| c.id).collect(),
            variable_names: query.variable_names.to_vec(),
        });
        (self.resolver)(query)
    }

    async fn extract_structured(
        &self,
        query: &ExtractQuery<'_>,
    ) -> Result<ExtractResponse, BackendError> {
        self.extract_contents
            .lock()
            .unwrap()
            .push(query.content.to_string());
        let reply = self
            .extract_replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(BackendError::Unavailable("no reply scripted".to_string())));
        reply.map(|raw| ExtractResponse { raw })
    }
}

pub fn test_config() -> StagehandConfig {
    StagehandConfig {
        verbose: Verbosity::Minimal,
        ..StagehandConfig::default()
    }
}

pub fn stagehand_with(
    backend: Arc<ScriptedBackend>,
    drivers: Vec<Arc<ScriptedDriver>>,
) -> Stagehand {
    builder_with(test_config(), backend, drivers)
        .build()
        .expect("build stagehand")
}

pub fn builder_with(
    config: StagehandConfig,
    backend: Arc<ScriptedBackend>,
    drivers: Vec<Arc<ScriptedDriver>>,
) -> StagehandBuilder {
    Stagehand::builder(config)
        .backend(backend)
        .launcher(QueueLauncher::with(drivers))
}

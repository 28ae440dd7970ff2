//! Network-quiescence wait.
//!
//! CDP network and frame events are reduced to [`NetworkEvent`]s and fed to
//! [`wait_for_quiet`], which returns once no request has been in flight for
//! the quiet window, or when the idle bound elapses. Requests running longer
//! than the stall threshold are forced complete so long polls cannot hold the
//! wait open.

use std::collections::HashMap;
use std::pin::Pin;

use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::{self, Duration, Instant, MissedTickBehavior, Sleep};

use crate::logging::StagehandLogger;
use crate::types::page::SettleState;

pub(crate) const QUIET_WINDOW: Duration = Duration::from_millis(500);
pub(crate) const STALL_THRESHOLD: Duration = Duration::from_secs(2);
const STALL_SWEEP_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum NetworkEvent {
    RequestStarted {
        request_id: String,
        url: String,
        /// Frame whose document this request loads, if it is a navigation.
        document_frame: Option<String>,
    },
    RequestFinished {
        request_id: String,
    },
    FrameStopped {
        frame_id: String,
    },
}

#[derive(Debug, Clone)]
struct RequestMeta {
    url: String,
    started_at: Instant,
}

#[derive(Debug, Default)]
pub(crate) struct NetworkTracker {
    inflight: HashMap<String, RequestMeta>,
    doc_by_frame: HashMap<String, String>,
}

impl NetworkTracker {
    /// Apply one event. Returns true when the in-flight set changed.
    pub(crate) fn apply(&mut self, event: NetworkEvent, now: Instant) -> bool {
        match event {
            NetworkEvent::RequestStarted {
                request_id,
                url,
                document_frame,
            } => {
                if let Some(frame_id) = document_frame {
                    self.doc_by_frame.insert(frame_id, request_id.clone());
                }
                self.inflight.insert(
                    request_id,
                    RequestMeta {
                        url,
                        started_at: now,
                    },
                );
                true
            }
            NetworkEvent::RequestFinished { request_id } => self.finish(&request_id),
            NetworkEvent::FrameStopped { frame_id } => match self.doc_by_frame.remove(&frame_id) {
                Some(request_id) => self.finish(&request_id),
                None => false,
            },
        }
    }

    fn finish(&mut self, request_id: &str) -> bool {
        self.doc_by_frame.retain(|_, rid| rid != request_id);
        self.inflight.remove(request_id).is_some()
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.inflight.is_empty()
    }

    pub(crate) fn inflight_count(&self) -> usize {
        self.inflight.len()
    }

    /// Force-complete requests older than `threshold`, returning their URLs.
    pub(crate) fn sweep_stalled(&mut self, now: Instant, threshold: Duration) -> Vec<String> {
        let stalled: Vec<String> = self
            .inflight
            .iter()
            .filter(|(_, meta)| now.duration_since(meta.started_at) > threshold)
            .map(|(request_id, _)| request_id.clone())
            .collect();
        stalled
            .into_iter()
            .filter_map(|request_id| {
                let url = self.inflight.get(&request_id).map(|meta| meta.url.clone());
                self.finish(&request_id);
                url
            })
            .collect()
    }
}

fn reset_quiet_timer(timer: &mut Option<Pin<Box<Sleep>>>, tracker: &NetworkTracker) {
    *timer = tracker
        .is_idle()
        .then(|| Box::pin(time::sleep(QUIET_WINDOW)));
}

pub(crate) async fn wait_for_quiet(
    events: &mut mpsc::UnboundedReceiver<NetworkEvent>,
    idle_timeout: Duration,
    logger: &StagehandLogger,
) -> SettleState {
    let mut tracker = NetworkTracker::default();
    let mut quiet_timer: Option<Pin<Box<Sleep>>> = Some(Box::pin(time::sleep(QUIET_WINDOW)));
    let deadline = time::sleep(idle_timeout);
    tokio::pin!(deadline);
    let mut stall_tick = time::interval(STALL_SWEEP_INTERVAL);
    stall_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut listening = true;

    loop {
        tokio::select! {
            maybe_event = events.recv(), if listening => {
                match maybe_event {
                    Some(event) => {
                        if tracker.apply(event, Instant::now()) {
                            reset_quiet_timer(&mut quiet_timer, &tracker);
                        }
                    }
                    None => listening = false,
                }
            }
            _ = async {
                if let Some(timer) = quiet_timer.as_mut() {
                    timer.as_mut().await;
                }
            }, if quiet_timer.is_some() => {
                return SettleState::Quiescent;
            }
            _ = stall_tick.tick() => {
                let forced = tracker.sweep_stalled(Instant::now(), STALL_THRESHOLD);
                if !forced.is_empty() {
                    logger.debug(
                        "forcing completion of stalled requests",
                        Some("settle"),
                        Some(json!({ "urls": forced })),
                    );
                    reset_quiet_timer(&mut quiet_timer, &tracker);
                }
            }
            _ = &mut deadline => {
                if !tracker.is_idle() {
                    logger.debug(
                        format!(
                            "settle bound reached with {} requests in flight",
                            tracker.inflight_count()
                        ),
                        Some("settle"),
                        None,
                    );
                }
                return SettleState::IdleTimeout;
            }
        }
    }
}

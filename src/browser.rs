//! Browser collaborator traits and local launch planning.
//!
//! The engine reaches the page only through [`BrowserDriver`]. A
//! [`BrowserLauncher`] produces drivers, either by starting or attaching to a
//! local browser described by a [`LocalPlan`], or by connecting to a remote
//! session's CDP endpoint.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use thiserror::Error;

use crate::config::StagehandConfig;
use crate::types::dom::DomSnapshot;
use crate::types::page::{ActionKind, SettleState};

type JsonObject = JsonMap<String, JsonValue>;

#[derive(Debug, Error)]
pub enum DriverError {
    /// The page is mid-navigation and cannot be inspected yet.
    #[error("page is navigating")]
    Navigating,
    #[error("element `{0}` is no longer attached to the document")]
    TargetDetached(String),
    #[error("browser is unreachable: {0}")]
    Unreachable(String),
    #[error("operation not supported by this driver: {0}")]
    Unsupported(String),
    #[error("browser driver error: {0}")]
    Message(String),
}

/// Low-level access to one page.
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    async fn navigate(&self, url: &str) -> Result<(), DriverError>;

    /// Perform `operation` on the element addressed by `locator`.
    async fn dispatch_input(
        &self,
        locator: &str,
        operation: ActionKind,
        parameters: &[String],
    ) -> Result<(), DriverError>;

    /// Wait until network activity is quiet, or until `idle_timeout` passes.
    async fn wait_for_stability(&self, idle_timeout: Duration)
    -> Result<SettleState, DriverError>;

    async fn current_dom_snapshot(&self) -> Result<DomSnapshot, DriverError>;

    /// Release the page and any browser process the driver owns.
    async fn shutdown(&self) -> Result<(), DriverError> {
        Ok(())
    }
}

/// Produces drivers for new sessions.
#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn launch_local(&self, plan: &LocalPlan) -> Result<Arc<dyn BrowserDriver>, DriverError>;

    async fn connect_remote(&self, connect_url: &str) -> Result<Arc<dyn BrowserDriver>, DriverError>;
}

#[derive(Debug, Error)]
pub enum BrowserError {
    #[error("failed to parse local browser launch options: {source}")]
    InvalidLocalOptions {
        #[source]
        source: serde_json::Error,
    },
}

/// Viewport dimensions in CSS pixels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Default for Viewport {
    fn default() -> Self {
        Viewport {
            width: 1288,
            height: 711,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LocalLaunchOptions {
    pub headless: bool,
    pub args: Vec<String>,
    pub viewport: Viewport,
    pub locale: String,
    pub timezone_id: String,
    pub ignore_https_errors: bool,
}

/// `localBrowserLaunchOptions` as written in configuration. Every key is
/// optional; missing keys fall back to defaults in [`LocalPlan::from_config`].
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct LocalLaunchOverrides {
    #[serde(alias = "cdp_url")]
    pub cdp_url: Option<String>,
    #[serde(alias = "user_data_dir")]
    pub user_data_dir: Option<String>,
    #[serde(alias = "chrome_executable")]
    pub chrome_executable: Option<String>,
    pub headless: Option<bool>,
    #[serde(alias = "ignore_https_errors")]
    pub ignore_https_errors: Option<bool>,
    pub locale: Option<String>,
    #[serde(alias = "timezone_id")]
    pub timezone_id: Option<String>,
    pub args: Option<Vec<String>>,
    pub viewport: Option<Viewport>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LocalLaunchStrategy {
    /// Attach to a browser already exposing a DevTools endpoint.
    AttachCdp { url: String },
    /// Start a browser process owned by the session.
    Launch { user_data_dir: Option<PathBuf> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct LocalPlan {
    pub strategy: LocalLaunchStrategy,
    pub launch_options: LocalLaunchOptions,
    pub chrome_executable: Option<PathBuf>,
}

impl LocalPlan {
    pub fn from_config(config: &StagehandConfig) -> Result<Self, BrowserError> {
        let overrides: LocalLaunchOverrides = serde_json::from_value(JsonValue::Object(
            config.local_browser_launch_options.clone(),
        ))
        .map_err(|source| BrowserError::InvalidLocalOptions { source })?;
        Ok(Self::from_overrides(overrides, config.headless))
    }

    pub fn from_overrides(overrides: LocalLaunchOverrides, default_headless: bool) -> Self {
        let strategy = match overrides.cdp_url {
            Some(url) => LocalLaunchStrategy::AttachCdp { url },
            None => LocalLaunchStrategy::Launch {
                user_data_dir: overrides.user_data_dir.map(PathBuf::from),
            },
        };

        let launch_options = LocalLaunchOptions {
            headless: overrides.headless.unwrap_or(default_headless),
            args: overrides
                .args
                .unwrap_or_else(|| vec!["--disable-blink-features=AutomationControlled".to_string()]),
            viewport: overrides.viewport.unwrap_or_default(),
            locale: overrides.locale.unwrap_or_else(|| "en-US".to_string()),
            timezone_id: overrides
                .timezone_id
                .unwrap_or_else(|| "America/New_York".to_string()),
            ignore_https_errors: overrides.ignore_https_errors.unwrap_or(true),
        };

        LocalPlan {
            strategy,
            launch_options,
            chrome_executable: overrides.chrome_executable.map(PathBuf::from),
        }
    }
}

/// Recursively overlay `overlay` onto `base`. Objects merge key by key; any
/// other value replaces what was there.
pub(crate) fn merge_json_values(base: &mut JsonValue, overlay: &JsonValue) {
    match (base, overlay) {
        (JsonValue::Object(base_map), JsonValue::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(key) {
                    Some(existing) => merge_json_values(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base_slot, overlay_value) => {
            *base_slot = overlay_value.clone();
        }
    }
}

pub(crate) fn merge_json_objects(base: JsonObject, overlay: &JsonObject) -> JsonObject {
    let mut merged = JsonValue::Object(base);
    merge_json_values(&mut merged, &JsonValue::Object(overlay.clone()));
    match merged {
        JsonValue::Object(map) => map,
        _ => JsonObject::new(),
    }
}

//! Remote session hosting.
//!
//! A [`RemoteSessionHost`] hands out browser sessions that live elsewhere and
//! are reached over CDP. [`BrowserbaseSessionHost`] talks to the Browserbase
//! REST API: it either reuses a running session or creates a new one, and
//! releases it on close.

use async_trait::async_trait;
use reqwest::Client as HttpClient;
use serde::Deserialize;
use serde_json::{Map as JsonMap, Value as JsonValue, json};
use thiserror::Error;

use crate::browser::{Viewport, merge_json_objects};
use crate::config::StagehandConfig;

type JsonObject = JsonMap<String, JsonValue>;

const RECORDING_BASE_URL: &str = "https://browserbase.com/sessions";

#[derive(Debug, Error)]
pub enum RemoteHostError {
    #[error("Browserbase API key is required to open a remote session")]
    MissingApiKey,
    #[error("Browserbase project id is required to create a remote session")]
    MissingProjectId,
    #[error("remote session {session_id} is not running (status: {status})")]
    NotRunning { session_id: String, status: String },
    #[error("remote session {0} did not include a connect URL")]
    MissingConnectUrl(String),
    #[error("remote host request failed: {0}")]
    Http(String),
    #[error("remote host API call to {context} failed ({status}): {body}")]
    Api {
        context: String,
        status: u16,
        body: String,
    },
}

/// A session opened on the remote host.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteSession {
    pub id: String,
    /// CDP websocket endpoint for the session's browser.
    pub connect_url: String,
    /// Where the session recording can be replayed.
    pub recording_ref: Option<String>,
}

#[async_trait]
pub trait RemoteSessionHost: Send + Sync {
    async fn open_remote_session(&self) -> Result<RemoteSession, RemoteHostError>;

    async fn close_remote_session(&self, session_id: &str) -> Result<(), RemoteHostError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum BrowserbaseSessionStrategy {
    UseExisting { session_id: String },
    CreateNew { params: JsonObject },
}

pub fn recording_url(session_id: &str) -> String {
    format!("{RECORDING_BASE_URL}/{session_id}")
}

#[derive(Debug, Clone)]
struct BrowserbaseSessionInfo {
    id: String,
    status: Option<String>,
    connect_url: String,
}

impl BrowserbaseSessionInfo {
    fn is_running(&self) -> bool {
        self.status
            .as_deref()
            .is_some_and(|status| status.eq_ignore_ascii_case("running"))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BrowserbaseSessionResponse {
    id: String,
    status: Option<String>,
    #[serde(alias = "connect_url")]
    connect_url: Option<String>,
}

impl TryFrom<BrowserbaseSessionResponse> for BrowserbaseSessionInfo {
    type Error = RemoteHostError;

    fn try_from(value: BrowserbaseSessionResponse) -> Result<Self, Self::Error> {
        let connect_url = value
            .connect_url
            .ok_or_else(|| RemoteHostError::MissingConnectUrl(value.id.clone()))?;
        Ok(Self {
            id: value.id,
            status: value.status,
            connect_url,
        })
    }
}

pub struct BrowserbaseSessionHost {
    client: HttpClient,
    api_key: String,
    project_id: Option<String>,
    base_url: String,
    strategy: BrowserbaseSessionStrategy,
}

impl std::fmt::Debug for BrowserbaseSessionHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrowserbaseSessionHost")
            .field("api_key", &"<redacted>")
            .field("project_id", &self.project_id)
            .field("base_url", &self.base_url)
            .field("strategy", &self.strategy)
            .finish()
    }
}

impl BrowserbaseSessionHost {
    pub fn from_config(config: &StagehandConfig) -> Result<Self, RemoteHostError> {
        let api_key = config
            .api_key
            .clone()
            .filter(|key| !key.is_empty())
            .ok_or(RemoteHostError::MissingApiKey)?;

        let strategy = match &config.browserbase_session_id {
            Some(session_id) => BrowserbaseSessionStrategy::UseExisting {
                session_id: session_id.clone(),
            },
            None => {
                let project_id = config
                    .project_id
                    .as_ref()
                    .ok_or(RemoteHostError::MissingProjectId)?;
                let defaults = default_create_params(project_id);
                let params = match config.browserbase_session_create_params() {
                    Some(overlay) => merge_json_objects(defaults, &overlay),
                    None => defaults,
                };
                BrowserbaseSessionStrategy::CreateNew { params }
            }
        };

        let client = HttpClient::builder().build().map_err(|err| {
            RemoteHostError::Http(format!("failed to construct Browserbase HTTP client: {err}"))
        })?;

        Ok(Self {
            client,
            api_key,
            project_id: config.project_id.clone(),
            base_url: config.api_url.clone(),
            strategy,
        })
    }

    pub fn strategy(&self) -> &BrowserbaseSessionStrategy {
        &self.strategy
    }

    fn endpoint(&self, path: &str) -> String {
        let base = self.base_url.trim_end_matches('/');
        let path = path.trim_start_matches('/');
        format!("{base}/{path}")
    }

    async fn retrieve_session(
        &self,
        session_id: &str,
    ) -> Result<BrowserbaseSessionInfo, RemoteHostError> {
        let response = self
            .client
            .get(self.endpoint(&format!("sessions/{session_id}")))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|err| RemoteHostError::Http(err.to_string()))?;

        self.handle_session_response(response, &format!("retrieve session {session_id}"))
            .await
    }

    async fn create_session(
        &self,
        params: &JsonObject,
    ) -> Result<BrowserbaseSessionInfo, RemoteHostError> {
        let response = self
            .client
            .post(self.endpoint("sessions"))
            .bearer_auth(&self.api_key)
            .json(params)
            .send()
            .await
            .map_err(|err| RemoteHostError::Http(err.to_string()))?;

        self.handle_session_response(response, "create session")
            .await
    }

    async fn handle_session_response(
        &self,
        response: reqwest::Response,
        context: &str,
    ) -> Result<BrowserbaseSessionInfo, RemoteHostError> {
        let response = check_status(response, context).await?;
        let parsed: BrowserbaseSessionResponse = response.json().await.map_err(|err| {
            RemoteHostError::Http(format!(
                "failed to parse Browserbase response while attempting to {context}: {err}"
            ))
        })?;
        BrowserbaseSessionInfo::try_from(parsed)
    }
}

async fn check_status(
    response: reqwest::Response,
    context: &str,
) -> Result<reqwest::Response, RemoteHostError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status().as_u16();
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "<unavailable>".to_string());
    Err(RemoteHostError::Api {
        context: context.to_string(),
        status,
        body,
    })
}

fn default_create_params(project_id: &str) -> JsonObject {
    let viewport = Viewport::default();
    let value = json!({
        "projectId": project_id,
        "browserSettings": {
            "viewport": { "width": viewport.width, "height": viewport.height }
        }
    });
    match value {
        JsonValue::Object(map) => map,
        _ => JsonObject::new(),
    }
}

#[async_trait]
impl RemoteSessionHost for BrowserbaseSessionHost {
    async fn open_remote_session(&self) -> Result<RemoteSession, RemoteHostError> {
        let info = match &self.strategy {
            BrowserbaseSessionStrategy::UseExisting { session_id } => {
                let info = self.retrieve_session(session_id).await?;
                if !info.is_running() {
                    return Err(RemoteHostError::NotRunning {
                        session_id: session_id.clone(),
                        status: info.status.unwrap_or_else(|| "UNKNOWN".to_string()),
                    });
                }
                info
            }
            BrowserbaseSessionStrategy::CreateNew { params } => self.create_session(params).await?,
        };

        Ok(RemoteSession {
            recording_ref: Some(recording_url(&info.id)),
            id: info.id,
            connect_url: info.connect_url,
        })
    }

    async fn close_remote_session(&self, session_id: &str) -> Result<(), RemoteHostError> {
        let mut body = JsonObject::new();
        body.insert(
            "status".to_string(),
            JsonValue::String("REQUEST_RELEASE".to_string()),
        );
        if let Some(project_id) = &self.project_id {
            body.insert("projectId".to_string(), JsonValue::String(project_id.clone()));
        }

        let context = format!("release session {session_id}");
        let response = self
            .client
            .post(self.endpoint(&format!("sessions/{session_id}")))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|err| RemoteHostError::Http(err.to_string()))?;
        check_status(response, &context).await?;
        Ok(())
    }
}

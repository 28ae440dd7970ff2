//! Strongly-typed configuration for the grounding engine.
//!
//! Values come from defaults, from environment variables (after loading a
//! `.env` file if one exists), or from explicit overrides applied on top of an
//! existing configuration. [`StagehandConfig::validate`] rejects settings the
//! engine cannot run with.

use std::env;
use std::fmt;
use std::num::{ParseFloatError, ParseIntError};

use dotenvy::dotenv;
use serde::de::{Deserialize, Deserializer, Error as DeError};
use serde::ser::{Serialize, Serializer};
use serde::{Deserialize as DeriveDeserialize, Serialize as DeriveSerialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use thiserror::Error;

use crate::logging::LogCallback;

type JsonObject = JsonMap<String, JsonValue>;

/// Default Browserbase REST endpoint used for remote sessions.
pub const DEFAULT_API_URL: &str = "https://api.browserbase.com/v1";

pub const DEFAULT_DOM_SETTLE_TIMEOUT_MS: u64 = 3_000;
pub const DEFAULT_MAX_CANDIDATES: usize = 200;
pub const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 0.5;
pub const DEFAULT_BACKEND_CONCURRENCY: usize = 4;

/// Where sessions run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, DeriveSerialize, DeriveDeserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Environment {
    /// A browser process launched or attached to on this machine.
    #[default]
    Local,
    /// A hosted browser session (Browserbase).
    #[serde(alias = "BROWSERBASE")]
    Remote,
}

impl Environment {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "LOCAL" => Some(Environment::Local),
            "REMOTE" | "BROWSERBASE" => Some(Environment::Remote),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Environment::Local => "LOCAL",
            Environment::Remote => "REMOTE",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Verbosity level for engine logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Verbosity {
    Minimal,
    #[default]
    Medium,
    Detailed,
}

impl Verbosity {
    pub fn as_u8(self) -> u8 {
        match self {
            Verbosity::Minimal => 0,
            Verbosity::Medium => 1,
            Verbosity::Detailed => 2,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Verbosity::Minimal),
            1 => Some(Verbosity::Medium),
            2 => Some(Verbosity::Detailed),
            _ => None,
        }
    }
}

impl Serialize for Verbosity {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u8(self.as_u8())
    }
}

impl<'de> Deserialize<'de> for Verbosity {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = u8::deserialize(deserializer)?;
        Verbosity::from_u8(value).ok_or_else(|| {
            DeError::custom(format!(
                "invalid verbosity value {value}; expected 0, 1, or 2"
            ))
        })
    }
}

/// Models known to work with the prompts in [`crate::llm::prompts`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, DeriveSerialize, DeriveDeserialize)]
pub enum ModelName {
    #[default]
    #[serde(rename = "gpt-4o")]
    Gpt4o,
    #[serde(rename = "gpt-4o-mini")]
    Gpt4oMini,
    #[serde(rename = "gpt-4.1-mini")]
    Gpt41Mini,
    #[serde(rename = "claude-3-5-sonnet-latest")]
    Claude35SonnetLatest,
    #[serde(rename = "claude-3-7-sonnet-latest")]
    Claude37SonnetLatest,
    #[serde(rename = "gemini-2.0-flash")]
    Gemini20Flash,
}

impl ModelName {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "gpt-4o" => Some(ModelName::Gpt4o),
            "gpt-4o-mini" => Some(ModelName::Gpt4oMini),
            "gpt-4.1-mini" => Some(ModelName::Gpt41Mini),
            "claude-3-5-sonnet-latest" => Some(ModelName::Claude35SonnetLatest),
            "claude-3-7-sonnet-latest" => Some(ModelName::Claude37SonnetLatest),
            "gemini-2.0-flash" => Some(ModelName::Gemini20Flash),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ModelName::Gpt4o => "gpt-4o",
            ModelName::Gpt4oMini => "gpt-4o-mini",
            ModelName::Gpt41Mini => "gpt-4.1-mini",
            ModelName::Claude35SonnetLatest => "claude-3-5-sonnet-latest",
            ModelName::Claude37SonnetLatest => "claude-3-7-sonnet-latest",
            ModelName::Gemini20Flash => "gemini-2.0-flash",
        }
    }
}

#[derive(DeriveSerialize, DeriveDeserialize, Clone)]
#[serde(default)]
pub struct StagehandConfig {
    pub env: Environment,
    #[serde(alias = "apiKey")]
    pub api_key: Option<String>,
    #[serde(alias = "projectId")]
    pub project_id: Option<String>,
    #[serde(alias = "apiUrl")]
    pub api_url: String,
    #[serde(alias = "browserbaseSessionCreateParams")]
    pub browserbase_session_create_params: Option<JsonObject>,
    #[serde(alias = "browserbaseSessionID")]
    pub browserbase_session_id: Option<String>,
    #[serde(alias = "modelName")]
    pub model_name: ModelName,
    #[serde(alias = "modelApiKey")]
    pub model_api_key: Option<String>,
    #[serde(alias = "modelClientOptions")]
    pub model_client_options: Option<JsonObject>,
    #[serde(skip_serializing, skip_deserializing)]
    pub logger: Option<LogCallback>,
    pub verbose: Verbosity,
    /// Idle bound for post-action and post-navigation settle waits.
    #[serde(alias = "domSettleTimeoutMs")]
    pub dom_settle_timeout_ms: u64,
    #[serde(alias = "actTimeoutMs")]
    pub act_timeout_ms: Option<u64>,
    #[serde(alias = "extractTimeoutMs")]
    pub extract_timeout_ms: Option<u64>,
    #[serde(alias = "observeTimeoutMs")]
    pub observe_timeout_ms: Option<u64>,
    /// Upper bound on candidates returned by one observation.
    #[serde(alias = "maxCandidates")]
    pub max_candidates: usize,
    /// Minimum backend confidence for a match to be acted on.
    #[serde(alias = "confidenceThreshold")]
    pub confidence_threshold: f64,
    /// Permits for concurrent reasoning backend calls across sessions.
    #[serde(alias = "backendConcurrency")]
    pub backend_concurrency: usize,
    #[serde(alias = "systemPrompt")]
    pub system_prompt: Option<String>,
    #[serde(alias = "localBrowserLaunchOptions")]
    pub local_browser_launch_options: JsonObject,
    pub headless: bool,
}

impl Default for StagehandConfig {
    fn default() -> Self {
        StagehandConfig {
            env: Environment::default(),
            api_key: None,
            project_id: None,
            api_url: DEFAULT_API_URL.to_string(),
            browserbase_session_create_params: None,
            browserbase_session_id: None,
            model_name: ModelName::default(),
            model_api_key: None,
            model_client_options: None,
            logger: None,
            verbose: Verbosity::default(),
            dom_settle_timeout_ms: DEFAULT_DOM_SETTLE_TIMEOUT_MS,
            act_timeout_ms: None,
            extract_timeout_ms: None,
            observe_timeout_ms: None,
            max_candidates: DEFAULT_MAX_CANDIDATES,
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            backend_concurrency: DEFAULT_BACKEND_CONCURRENCY,
            system_prompt: None,
            local_browser_launch_options: JsonObject::new(),
            headless: false,
        }
    }
}

impl StagehandConfig {
    /// Construct a configuration by reading relevant environment variables, after
    /// loading a `.env` file if present.
    pub fn from_env() -> Result<Self, StagehandConfigError> {
        let _ = dotenv();
        let mut config = StagehandConfig::default();

        if let Some(value) = env_var("STAGEHAND_ENV") {
            config.env = Environment::parse(&value).ok_or_else(|| {
                StagehandConfigError::invalid_enum("STAGEHAND_ENV", value.clone())
            })?;
        }

        if let Some(value) = env_var("BROWSERBASE_API_KEY") {
            config.api_key = Some(value);
        }

        if let Some(value) = env_var("BROWSERBASE_PROJECT_ID") {
            config.project_id = Some(value);
        }

        if let Some(value) = env_var("BROWSERBASE_API_URL") {
            config.api_url = value;
        }

        if let Some(value) = env_var("BROWSERBASE_SESSION_ID") {
            config.browserbase_session_id = Some(value);
        }

        if let Some(value) = env_var("BROWSERBASE_SESSION_CREATE_PARAMS") {
            config.browserbase_session_create_params = Some(parse_json_object(
                "BROWSERBASE_SESSION_CREATE_PARAMS",
                &value,
            )?);
        }

        if let Some(value) = env_var("MODEL_NAME") {
            config.model_name = ModelName::parse(&value)
                .ok_or_else(|| StagehandConfigError::invalid_enum("MODEL_NAME", value.clone()))?;
        }

        if let Some(value) = env_var("MODEL_API_KEY") {
            config.model_api_key = Some(value);
        }

        if let Some(value) = env_var("STAGEHAND_MODEL_CLIENT_OPTIONS") {
            config.model_client_options =
                Some(parse_json_object("STAGEHAND_MODEL_CLIENT_OPTIONS", &value)?);
        }

        if let Some(value) = env_var("STAGEHAND_VERBOSE") {
            let parsed = parse_u8("STAGEHAND_VERBOSE", &value)?;
            config.verbose = Verbosity::from_u8(parsed).ok_or_else(|| {
                StagehandConfigError::invalid_enum("STAGEHAND_VERBOSE", parsed.to_string())
            })?;
        }

        if let Some(value) = env_var("STAGEHAND_DOM_SETTLE_TIMEOUT_MS") {
            config.dom_settle_timeout_ms = parse_u64("STAGEHAND_DOM_SETTLE_TIMEOUT_MS", &value)?;
        }

        if let Some(value) = env_var("STAGEHAND_ACT_TIMEOUT_MS") {
            config.act_timeout_ms = Some(parse_u64("STAGEHAND_ACT_TIMEOUT_MS", &value)?);
        }

        if let Some(value) = env_var("STAGEHAND_EXTRACT_TIMEOUT_MS") {
            config.extract_timeout_ms = Some(parse_u64("STAGEHAND_EXTRACT_TIMEOUT_MS", &value)?);
        }

        if let Some(value) = env_var("STAGEHAND_OBSERVE_TIMEOUT_MS") {
            config.observe_timeout_ms = Some(parse_u64("STAGEHAND_OBSERVE_TIMEOUT_MS", &value)?);
        }

        if let Some(value) = env_var("STAGEHAND_MAX_CANDIDATES") {
            config.max_candidates = parse_usize("STAGEHAND_MAX_CANDIDATES", &value)?;
        }

        if let Some(value) = env_var("STAGEHAND_CONFIDENCE_THRESHOLD") {
            config.confidence_threshold = parse_f64("STAGEHAND_CONFIDENCE_THRESHOLD", &value)?;
        }

        if let Some(value) = env_var("STAGEHAND_BACKEND_CONCURRENCY") {
            config.backend_concurrency = parse_usize("STAGEHAND_BACKEND_CONCURRENCY", &value)?;
        }

        if let Some(value) = env_var("STAGEHAND_SYSTEM_PROMPT") {
            config.system_prompt = Some(value);
        }

        if let Some(value) = env_var("STAGEHAND_LOCAL_BROWSER_LAUNCH_OPTIONS") {
            config.local_browser_launch_options =
                parse_json_object("STAGEHAND_LOCAL_BROWSER_LAUNCH_OPTIONS", &value)?;
        }

        if let Some(value) = env_var("STAGEHAND_HEADLESS") {
            config.headless = parse_bool("STAGEHAND_HEADLESS", &value)?;
        }

        config.ensure_session_project_id();
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot operate with.
    pub fn validate(&self) -> Result<(), StagehandConfigError> {
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(StagehandConfigError::OutOfRange {
                field: "confidence_threshold",
                value: self.confidence_threshold.to_string(),
                expected: "a value between 0 and 1",
            });
        }
        if self.max_candidates == 0 {
            return Err(StagehandConfigError::OutOfRange {
                field: "max_candidates",
                value: "0".to_string(),
                expected: "at least 1",
            });
        }
        if self.backend_concurrency == 0 {
            return Err(StagehandConfigError::OutOfRange {
                field: "backend_concurrency",
                value: "0".to_string(),
                expected: "at least 1",
            });
        }
        Ok(())
    }

    /// Browserbase session parameters with `projectId` injected when the
    /// configuration defines one and the params omit it.
    pub fn browserbase_session_create_params(&self) -> Option<JsonObject> {
        let mut params = self.browserbase_session_create_params.clone()?;
        if params.get("projectId").is_none() {
            if let Some(project_id) = &self.project_id {
                params.insert(
                    "projectId".to_string(),
                    JsonValue::String(project_id.clone()),
                );
            }
        }
        Some(params)
    }

    /// Create a new configuration with explicit field overrides applied.
    pub fn with_overrides(&self, overrides: StagehandConfigOverrides) -> StagehandConfig {
        let mut next = self.clone();

        if let Some(env) = overrides.env {
            next.env = env;
        }
        if let Some(value) = overrides.api_key {
            next.api_key = value;
        }
        if let Some(value) = overrides.project_id {
            next.project_id = value;
        }
        if let Some(value) = overrides.api_url {
            next.api_url = value;
        }
        if let Some(value) = overrides.browserbase_session_create_params {
            next.browserbase_session_create_params = value;
        }
        if let Some(value) = overrides.browserbase_session_id {
            next.browserbase_session_id = value;
        }
        if let Some(value) = overrides.model_name {
            next.model_name = value;
        }
        if let Some(value) = overrides.model_api_key {
            next.model_api_key = value;
        }
        if let Some(value) = overrides.model_client_options {
            next.model_client_options = value;
        }
        if let Some(value) = overrides.logger {
            next.logger = value;
        }
        if let Some(value) = overrides.verbose {
            next.verbose = value;
        }
        if let Some(value) = overrides.dom_settle_timeout_ms {
            next.dom_settle_timeout_ms = value;
        }
        if let Some(value) = overrides.act_timeout_ms {
            next.act_timeout_ms = value;
        }
        if let Some(value) = overrides.extract_timeout_ms {
            next.extract_timeout_ms = value;
        }
        if let Some(value) = overrides.observe_timeout_ms {
            next.observe_timeout_ms = value;
        }
        if let Some(value) = overrides.max_candidates {
            next.max_candidates = value;
        }
        if let Some(value) = overrides.confidence_threshold {
            next.confidence_threshold = value;
        }
        if let Some(value) = overrides.backend_concurrency {
            next.backend_concurrency = value;
        }
        if let Some(value) = overrides.system_prompt {
            next.system_prompt = value;
        }
        if let Some(value) = overrides.local_browser_launch_options {
            next.local_browser_launch_options = value;
        }
        if let Some(value) = overrides.headless {
            next.headless = value;
        }

        next.ensure_session_project_id();
        next
    }

    fn ensure_session_project_id(&mut self) {
        if let Some(project_id) = self.project_id.clone() {
            if let Some(params) = self.browserbase_session_create_params.as_mut() {
                params
                    .entry("projectId".to_string())
                    .or_insert(JsonValue::String(project_id));
            }
        }
    }
}

/// Field-level overrides for [`StagehandConfig::with_overrides`].
///
/// `Some(None)` clears an optional field, `None` leaves it untouched.
#[derive(Default, Clone)]
pub struct StagehandConfigOverrides {
    pub env: Option<Environment>,
    pub api_key: Option<Option<String>>,
    pub project_id: Option<Option<String>>,
    pub api_url: Option<String>,
    pub browserbase_session_create_params: Option<Option<JsonObject>>,
    pub browserbase_session_id: Option<Option<String>>,
    pub model_name: Option<ModelName>,
    pub model_api_key: Option<Option<String>>,
    pub model_client_options: Option<Option<JsonObject>>,
    pub logger: Option<Option<LogCallback>>,
    pub verbose: Option<Verbosity>,
    pub dom_settle_timeout_ms: Option<u64>,
    pub act_timeout_ms: Option<Option<u64>>,
    pub extract_timeout_ms: Option<Option<u64>>,
    pub observe_timeout_ms: Option<Option<u64>>,
    pub max_candidates: Option<usize>,
    pub confidence_threshold: Option<f64>,
    pub backend_concurrency: Option<usize>,
    pub system_prompt: Option<Option<String>>,
    pub local_browser_launch_options: Option<JsonObject>,
    pub headless: Option<bool>,
}

impl fmt::Debug for StagehandConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StagehandConfig")
            .field("env", &self.env)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("project_id", &self.project_id)
            .field("api_url", &self.api_url)
            .field(
                "browserbase_session_create_params",
                &self.browserbase_session_create_params,
            )
            .field("browserbase_session_id", &self.browserbase_session_id)
            .field("model_name", &self.model_name)
            .field(
                "model_api_key",
                &self.model_api_key.as_ref().map(|_| "<redacted>"),
            )
            .field("model_client_options", &self.model_client_options)
            .field("verbose", &self.verbose)
            .field("dom_settle_timeout_ms", &self.dom_settle_timeout_ms)
            .field("act_timeout_ms", &self.act_timeout_ms)
            .field("extract_timeout_ms", &self.extract_timeout_ms)
            .field("observe_timeout_ms", &self.observe_timeout_ms)
            .field("max_candidates", &self.max_candidates)
            .field("confidence_threshold", &self.confidence_threshold)
            .field("backend_concurrency", &self.backend_concurrency)
            .field("system_prompt", &self.system_prompt)
            .field(
                "local_browser_launch_options",
                &self.local_browser_launch_options,
            )
            .field("headless", &self.headless)
            .field("logger_present", &self.logger.is_some())
            .finish()
    }
}

impl fmt::Debug for StagehandConfigOverrides {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StagehandConfigOverrides")
            .field("env", &self.env)
            .field("project_id", &self.project_id)
            .field("api_url", &self.api_url)
            .field("browserbase_session_id", &self.browserbase_session_id)
            .field("model_name", &self.model_name)
            .field("logger", &self.logger.as_ref().map(|inner| inner.is_some()))
            .field("verbose", &self.verbose)
            .field("dom_settle_timeout_ms", &self.dom_settle_timeout_ms)
            .field("act_timeout_ms", &self.act_timeout_ms)
            .field("extract_timeout_ms", &self.extract_timeout_ms)
            .field("observe_timeout_ms", &self.observe_timeout_ms)
            .field("max_candidates", &self.max_candidates)
            .field("confidence_threshold", &self.confidence_threshold)
            .field("backend_concurrency", &self.backend_concurrency)
            .field("headless", &self.headless)
            .finish_non_exhaustive()
    }
}

impl StagehandConfigOverrides {
    pub fn env(mut self, env: Environment) -> Self {
        self.env = Some(env);
        self
    }

    pub fn api_key<T: Into<Option<String>>>(mut self, api_key: T) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn headless(mut self, headless: bool) -> Self {
        self.headless = Some(headless);
        self
    }

    pub fn confidence_threshold(mut self, threshold: f64) -> Self {
        self.confidence_threshold = Some(threshold);
        self
    }
}

#[derive(Debug, Error)]
pub enum StagehandConfigError {
    #[error("invalid value '{value}' for {field}")]
    InvalidEnumVariant { field: &'static str, value: String },
    #[error("invalid boolean '{value}' for {field}")]
    InvalidBool { field: &'static str, value: String },
    #[error("invalid number '{value}' for {field}: {source}")]
    InvalidNumber {
        field: &'static str,
        value: String,
        #[source]
        source: ParseIntError,
    },
    #[error("invalid decimal '{value}' for {field}: {source}")]
    InvalidFloat {
        field: &'static str,
        value: String,
        #[source]
        source: ParseFloatError,
    },
    #[error("{field} must be a JSON object")]
    InvalidJsonType { field: &'static str },
    #[error("invalid JSON for {field}: {source}")]
    InvalidJson {
        field: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("{field} is {value}; expected {expected}")]
    OutOfRange {
        field: &'static str,
        value: String,
        expected: &'static str,
    },
}

impl StagehandConfigError {
    fn invalid_enum(field: &'static str, value: String) -> Self {
        StagehandConfigError::InvalidEnumVariant { field, value }
    }
}

fn env_var(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_bool(field: &'static str, value: &str) -> Result<bool, StagehandConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(StagehandConfigError::InvalidBool {
            field,
            value: value.to_string(),
        }),
    }
}

fn parse_u8(field: &'static str, value: &str) -> Result<u8, StagehandConfigError> {
    value
        .trim()
        .parse::<u8>()
        .map_err(|source| StagehandConfigError::InvalidNumber {
            field,
            value: value.to_string(),
            source,
        })
}

fn parse_u64(field: &'static str, value: &str) -> Result<u64, StagehandConfigError> {
    value
        .trim()
        .parse::<u64>()
        .map_err(|source| StagehandConfigError::InvalidNumber {
            field,
            value: value.to_string(),
            source,
        })
}

fn parse_usize(field: &'static str, value: &str) -> Result<usize, StagehandConfigError> {
    value
        .trim()
        .parse::<usize>()
        .map_err(|source| StagehandConfigError::InvalidNumber {
            field,
            value: value.to_string(),
            source,
        })
}

fn parse_f64(field: &'static str, value: &str) -> Result<f64, StagehandConfigError> {
    value
        .trim()
        .parse::<f64>()
        .map_err(|source| StagehandConfigError::InvalidFloat {
            field,
            value: value.to_string(),
            source,
        })
}

fn parse_json_object(field: &'static str, value: &str) -> Result<JsonObject, StagehandConfigError> {
    let parsed: JsonValue = serde_json::from_str(value)
        .map_err(|source| StagehandConfigError::InvalidJson { field, source })?;
    match parsed {
        JsonValue::Object(map) => Ok(map),
        _ => Err(StagehandConfigError::InvalidJsonType { field }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Mutex, OnceLock};

    fn env_lock() -> &'static Mutex<()> {
        static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        LOCK.get_or_init(|| Mutex::new(()))
    }

    struct EnvGuard {
        saved: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new(vars: &[(&str, Option<&str>)]) -> Self {
            let saved = vars
                .iter()
                .map(|(key, value)| {
                    let original = env::var(key).ok();
                    match value {
                        Some(v) => unsafe {
                            env::set_var(key, v);
                        },
                        None => unsafe {
                            env::remove_var(key);
                        },
                    };
                    ((*key).to_string(), original)
                })
                .collect();
            EnvGuard { saved }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.saved.drain(..) {
                match value {
                    Some(v) => unsafe {
                        env::set_var(&key, v);
                    },
                    None => unsafe {
                        env::remove_var(&key);
                    },
                }
            }
        }
    }

    fn with_env<F, T>(vars: &[(&str, Option<&str>)], f: F) -> T
    where
        F: FnOnce() -> T,
    {
        let lock = env_lock().lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let guard = EnvGuard::new(vars);
        let result = f();
        drop(guard);
        drop(lock);
        result
    }

    const ALL_VARS: [&str; 20] = [
        "STAGEHAND_ENV",
        "BROWSERBASE_API_KEY",
        "BROWSERBASE_PROJECT_ID",
        "BROWSERBASE_API_URL",
        "BROWSERBASE_SESSION_ID",
        "BROWSERBASE_SESSION_CREATE_PARAMS",
        "MODEL_NAME",
        "MODEL_API_KEY",
        "STAGEHAND_MODEL_CLIENT_OPTIONS",
        "STAGEHAND_VERBOSE",
        "STAGEHAND_DOM_SETTLE_TIMEOUT_MS",
        "STAGEHAND_ACT_TIMEOUT_MS",
        "STAGEHAND_EXTRACT_TIMEOUT_MS",
        "STAGEHAND_OBSERVE_TIMEOUT_MS",
        "STAGEHAND_MAX_CANDIDATES",
        "STAGEHAND_CONFIDENCE_THRESHOLD",
        "STAGEHAND_BACKEND_CONCURRENCY",
        "STAGEHAND_SYSTEM_PROMPT",
        "STAGEHAND_LOCAL_BROWSER_LAUNCH_OPTIONS",
        "STAGEHAND_HEADLESS",
    ];

    fn cleared_with(set: &[(&'static str, &'static str)]) -> Vec<(&'static str, Option<&'static str>)> {
        ALL_VARS
            .iter()
            .map(|key| {
                let value = set.iter().find(|(k, _)| k == key).map(|(_, v)| *v);
                (*key, value)
            })
            .collect()
    }

    #[test]
    fn defaults() {
        let config = StagehandConfig::default();
        assert_eq!(config.env, Environment::Local);
        assert!(config.api_key.is_none());
        assert_eq!(config.api_url, DEFAULT_API_URL);
        assert_eq!(config.model_name, ModelName::Gpt4o);
        assert_eq!(config.verbose, Verbosity::Medium);
        assert_eq!(config.dom_settle_timeout_ms, 3_000);
        assert_eq!(config.max_candidates, 200);
        assert_eq!(config.confidence_threshold, 0.5);
        assert_eq!(config.backend_concurrency, 4);
        assert!(config.local_browser_launch_options.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn environment_accepts_browserbase_alias() {
        assert_eq!(Environment::parse("browserbase"), Some(Environment::Remote));
        assert_eq!(Environment::parse("REMOTE"), Some(Environment::Remote));
        assert_eq!(Environment::parse(" local "), Some(Environment::Local));
        assert_eq!(Environment::parse("cloud"), None);
        let parsed: Environment = serde_json::from_str("\"BROWSERBASE\"").expect("env");
        assert_eq!(parsed, Environment::Remote);
    }

    #[test]
    fn from_env_parses_and_normalises_values() {
        let vars = cleared_with(&[
            ("STAGEHAND_ENV", "browserbase"),
            ("BROWSERBASE_API_KEY", "key-123"),
            ("BROWSERBASE_PROJECT_ID", "proj-abc"),
            ("BROWSERBASE_API_URL", "https://bb.internal/v1"),
            ("BROWSERBASE_SESSION_ID", "session-1"),
            ("BROWSERBASE_SESSION_CREATE_PARAMS", r#"{"region":"us-east-1"}"#),
            ("MODEL_NAME", "gpt-4o-mini"),
            ("MODEL_API_KEY", "model-key"),
            ("STAGEHAND_MODEL_CLIENT_OPTIONS", r#"{"api_base":"https://foo"}"#),
            ("STAGEHAND_VERBOSE", "2"),
            ("STAGEHAND_DOM_SETTLE_TIMEOUT_MS", "5000"),
            ("STAGEHAND_ACT_TIMEOUT_MS", "1234"),
            ("STAGEHAND_EXTRACT_TIMEOUT_MS", "4321"),
            ("STAGEHAND_MAX_CANDIDATES", "50"),
            ("STAGEHAND_CONFIDENCE_THRESHOLD", "0.75"),
            ("STAGEHAND_BACKEND_CONCURRENCY", "2"),
            ("STAGEHAND_SYSTEM_PROMPT", "custom prompt"),
            ("STAGEHAND_LOCAL_BROWSER_LAUNCH_OPTIONS", r#"{"headless":true}"#),
            ("STAGEHAND_HEADLESS", "true"),
        ]);

        with_env(&vars, || {
            let config = StagehandConfig::from_env().expect("config from env");
            assert_eq!(config.env, Environment::Remote);
            assert_eq!(config.api_key.as_deref(), Some("key-123"));
            assert_eq!(config.project_id.as_deref(), Some("proj-abc"));
            assert_eq!(config.api_url, "https://bb.internal/v1");
            assert_eq!(config.browserbase_session_id.as_deref(), Some("session-1"));
            assert_eq!(config.model_name, ModelName::Gpt4oMini);
            assert_eq!(config.model_api_key.as_deref(), Some("model-key"));
            assert_eq!(config.verbose, Verbosity::Detailed);
            assert_eq!(config.dom_settle_timeout_ms, 5_000);
            assert_eq!(config.act_timeout_ms, Some(1_234));
            assert_eq!(config.extract_timeout_ms, Some(4_321));
            assert_eq!(config.observe_timeout_ms, None);
            assert_eq!(config.max_candidates, 50);
            assert_eq!(config.confidence_threshold, 0.75);
            assert_eq!(config.backend_concurrency, 2);
            assert_eq!(config.system_prompt.as_deref(), Some("custom prompt"));
            assert!(config.headless);

            let client_options = config
                .model_client_options
                .as_ref()
                .expect("model client options present");
            assert_eq!(
                client_options.get("api_base"),
                Some(&JsonValue::String("https://foo".to_string()))
            );

            let params = config
                .browserbase_session_create_params()
                .expect("session params");
            assert_eq!(
                params.get("projectId"),
                Some(&JsonValue::String("proj-abc".to_string()))
            );
            assert_eq!(
                params.get("region"),
                Some(&JsonValue::String("us-east-1".to_string()))
            );
        });
    }

    #[test]
    fn from_env_rejects_bad_values() {
        let vars = cleared_with(&[("STAGEHAND_CONFIDENCE_THRESHOLD", "high")]);
        with_env(&vars, || {
            let err = StagehandConfig::from_env().unwrap_err();
            assert!(matches!(err, StagehandConfigError::InvalidFloat { .. }));
        });

        let vars = cleared_with(&[("STAGEHAND_CONFIDENCE_THRESHOLD", "1.5")]);
        with_env(&vars, || {
            let err = StagehandConfig::from_env().unwrap_err();
            assert!(matches!(
                err,
                StagehandConfigError::OutOfRange {
                    field: "confidence_threshold",
                    ..
                }
            ));
        });

        let vars = cleared_with(&[("STAGEHAND_LOCAL_BROWSER_LAUNCH_OPTIONS", "[1,2]")]);
        with_env(&vars, || {
            let err = StagehandConfig::from_env().unwrap_err();
            assert!(matches!(err, StagehandConfigError::InvalidJsonType { .. }));
        });
    }

    #[test]
    fn counts_that_do_not_fit_usize_are_rejected() {
        let too_large = format!("{}0", usize::MAX);
        for key in ["STAGEHAND_MAX_CANDIDATES", "STAGEHAND_BACKEND_CONCURRENCY"] {
            for value in [too_large.as_str(), "-1"] {
                let vars: Vec<(&str, Option<&str>)> = ALL_VARS
                    .iter()
                    .map(|name| (*name, (*name == key).then_some(value)))
                    .collect();
                with_env(&vars, || {
                    let err = StagehandConfig::from_env().unwrap_err();
                    assert!(
                        matches!(err, StagehandConfigError::InvalidNumber { field, .. } if field == key),
                        "{key}={value}: {err:?}"
                    );
                });
            }
        }
    }

    #[test]
    fn validate_rejects_zero_permits() {
        let config = StagehandConfig {
            backend_concurrency: 0,
            ..StagehandConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(StagehandConfigError::OutOfRange {
                field: "backend_concurrency",
                ..
            })
        ));
    }

    #[test]
    fn overrides_support_setting_values_to_none() {
        let base = StagehandConfig {
            browserbase_session_id: Some("old".into()),
            ..StagehandConfig::default()
        };
        let overrides = StagehandConfigOverrides::default()
            .env(Environment::Remote)
            .api_key(Some("overridden".to_string()))
            .confidence_threshold(0.8);
        let overrides = StagehandConfigOverrides {
            browserbase_session_id: Some(None),
            act_timeout_ms: Some(Some(1_000)),
            ..overrides
        };

        let updated = base.with_overrides(overrides);
        assert_eq!(updated.env, Environment::Remote);
        assert_eq!(updated.api_key.as_deref(), Some("overridden"));
        assert!(updated.browserbase_session_id.is_none());
        assert_eq!(updated.act_timeout_ms, Some(1_000));
        assert_eq!(updated.confidence_threshold, 0.8);
    }

    #[test]
    fn debug_redacts_keys() {
        let config = StagehandConfig {
            api_key: Some("secret".into()),
            model_api_key: Some("also-secret".into()),
            ..StagehandConfig::default()
        };
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("secret"));
        assert!(rendered.contains("<redacted>"));
    }
}

//! Structured logging for the grounding engine.
//!
//! Components log through [`StagehandLogger`] with a category and optional
//! JSON auxiliary data. Records go to an external callback when one is
//! configured, otherwise they are forwarded to the `log` facade under the
//! target `stagehand::<category>`.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::{StagehandConfig, Verbosity};

/// Convenience alias for external logging callbacks.
pub type LogCallback = Arc<dyn Fn(&StagehandLogRecord) + Send + Sync + 'static>;

#[derive(Clone, Default)]
pub struct LogConfig {
    pub verbose: Verbosity,
    pub external_logger: Option<LogCallback>,
}

impl LogConfig {
    pub fn new(verbose: Verbosity) -> Self {
        Self {
            verbose,
            external_logger: None,
        }
    }

    pub fn should_log(&self, level: LogLevel) -> bool {
        level == LogLevel::Error || level.as_u8() <= self.verbose.as_u8()
    }
}

/// Log severity used across the engine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error = 0,
    Info = 1,
    Debug = 2,
}

impl LogLevel {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn label(self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
        }
    }

    fn as_log_level(self) -> log::Level {
        match self {
            LogLevel::Error => log::Level::Error,
            LogLevel::Info => log::Level::Info,
            LogLevel::Debug => log::Level::Debug,
        }
    }
}

/// Structured log entry shared with external callbacks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StagehandLogRecord {
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub level: LogLevel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auxiliary: Option<Value>,
}

impl StagehandLogRecord {
    pub fn new(
        message: impl Into<String>,
        level: LogLevel,
        category: Option<String>,
        auxiliary: Option<Value>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            message: message.into(),
            level,
            category,
            auxiliary,
        }
    }
}

/// Sink used when no external logger is configured.
pub fn default_log_handler(record: &StagehandLogRecord) {
    let target = match &record.category {
        Some(category) => format!("stagehand::{category}"),
        None => "stagehand".to_string(),
    };
    match record.auxiliary.as_ref().filter(|aux| !aux.is_null()) {
        Some(aux) => log::log!(
            target: target.as_str(),
            record.level.as_log_level(),
            "{} {}",
            record.message,
            aux
        ),
        None => log::log!(
            target: target.as_str(),
            record.level.as_log_level(),
            "{}",
            record.message
        ),
    }
}

pub struct StagehandLogger {
    config: LogConfig,
    default_handler: LogCallback,
}

impl fmt::Debug for StagehandLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StagehandLogger")
            .field("verbosity", &self.config.verbose)
            .field("external_logger", &self.config.external_logger.is_some())
            .finish()
    }
}

impl Default for StagehandLogger {
    fn default() -> Self {
        Self::new(Verbosity::default())
    }
}

impl StagehandLogger {
    pub fn with_config(config: LogConfig) -> Self {
        Self {
            config,
            default_handler: Arc::new(default_log_handler),
        }
    }

    pub fn new(verbose: Verbosity) -> Self {
        Self::with_config(LogConfig::new(verbose))
    }

    /// Logger honouring the verbosity and callback of a [`StagehandConfig`].
    pub fn from_config(config: &StagehandConfig) -> Self {
        Self::with_config(LogConfig {
            verbose: config.verbose,
            external_logger: config.logger.clone(),
        })
    }

    pub fn config(&self) -> &LogConfig {
        &self.config
    }

    pub fn set_external_logger(&mut self, logger: Option<LogCallback>) {
        self.config.external_logger = logger;
    }

    pub fn log(
        &self,
        message: impl Into<String>,
        level: LogLevel,
        category: Option<&str>,
        auxiliary: Option<Value>,
    ) {
        if !self.config.should_log(level) {
            return;
        }

        let record =
            StagehandLogRecord::new(message, level, category.map(|c| c.to_string()), auxiliary);

        if let Some(callback) = &self.config.external_logger {
            callback(&record);
        } else {
            (self.default_handler)(&record);
        }
    }

    pub fn error(
        &self,
        message: impl Into<String>,
        category: Option<&str>,
        auxiliary: Option<Value>,
    ) {
        self.log(message, LogLevel::Error, category, auxiliary);
    }

    pub fn info(
        &self,
        message: impl Into<String>,
        category: Option<&str>,
        auxiliary: Option<Value>,
    ) {
        self.log(message, LogLevel::Info, category, auxiliary);
    }

    pub fn debug(
        &self,
        message: impl Into<String>,
        category: Option<&str>,
        auxiliary: Option<Value>,
    ) {
        self.log(message, LogLevel::Debug, category, auxiliary);
    }
}

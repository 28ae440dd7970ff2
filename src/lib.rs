//! Instruction grounding and structured extraction for browser automation.
//!
//! A [`Stagehand`](stagehand::Stagehand) opens [`Session`](session::Session)s
//! against a local or remote browser. Each session routes `act` requests
//! through the observer, resolver and executor, and `extract` requests through
//! the observer and the extraction engine. Browser drivers, reasoning backends
//! and remote session hosts are pluggable traits.

pub mod a11y;
pub mod backend;
pub mod browser;
pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod extraction;
pub mod llm;
pub mod logging;
pub mod metrics;
pub mod observer;
pub mod remote;
pub mod resolver;
pub mod runtime;
pub mod schema;
pub mod selector;
pub mod session;
pub mod stagehand;
pub mod types;

pub use error::StagehandError;
pub use session::Session;
pub use stagehand::{Stagehand, StagehandBuildError, StagehandBuilder};

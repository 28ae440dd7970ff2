//! Chat-model reasoning backend.
//!
//! [`LlmReasoningBackend`] turns resolve and extract queries into chat
//! completion requests through a provider-agnostic [`StagehandLlmClient`]. The
//! OpenAI-compatible provider is built on the `async-openai` crate.

pub mod backend;
pub mod client;
pub mod error;
pub mod openai;
pub mod prompts;
pub mod provider;

pub use backend::LlmReasoningBackend;
pub use client::{ChatCompletionOptions, StagehandLlmClient};
pub use error::StagehandLlmError;
pub use openai::OpenAiChatProvider;
pub use provider::ChatCompletionProvider;

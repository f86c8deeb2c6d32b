//! The model capability consumed by agents.
//!
//! An [`Engine`] turns a message history plus a set of function schemas into a
//! completion. Nothing in this crate looks behind that contract.

use async_trait::async_trait;

use crate::error::EngineError;
use crate::message::ChatMessage;
use crate::tool::FunctionSpec;

/// A model completion
#[derive(Debug, Clone)]
pub struct Completion {
    pub message: ChatMessage,
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
}

impl Completion {
    pub fn new(message: ChatMessage) -> Self {
        Self {
            message,
            prompt_tokens: None,
            completion_tokens: None,
        }
    }

    pub fn with_usage(mut self, prompt: u64, completion: u64) -> Self {
        self.prompt_tokens = Some(prompt);
        self.completion_tokens = Some(completion);
        self
    }
}

/// Receives streamed text as an engine produces it
pub type DeltaSink<'a> = &'a mut (dyn FnMut(&str) + Send);

#[async_trait]
pub trait Engine: Send + Sync {
    /// Largest prompt, in [`Engine::message_len`] units, the model accepts
    fn max_context_size(&self) -> usize;

    /// Length of one message in the same units as [`Engine::max_context_size`]
    fn message_len(&self, message: &ChatMessage) -> usize;

    async fn predict(
        &self,
        messages: &[ChatMessage],
        functions: &[FunctionSpec],
    ) -> Result<Completion, EngineError>;

    /// Stream a completion, feeding text deltas to `on_delta`.
    ///
    /// Engines without native streaming emit the whole text as one delta.
    async fn stream(
        &self,
        messages: &[ChatMessage],
        functions: &[FunctionSpec],
        on_delta: DeltaSink<'_>,
    ) -> Result<Completion, EngineError> {
        let completion = self.predict(messages, functions).await?;
        if let Some(text) = completion.message.text() {
            on_delta(text);
        }
        Ok(completion)
    }
}

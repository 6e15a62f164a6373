//! High-level chat client mirrored by UI layers.

use tracing::debug;

use sotto_engines::{
    Backend, EngineConfig, GenerateError, InferenceService, InitError, ProgressFn, TokenFn,
};

use crate::{context::build_context, session::StoredMessage};

/// Wraps the inference service with conversation assembly.
#[derive(Clone)]
pub struct ChatClient {
    service: InferenceService,
    config: EngineConfig,
    history_window: usize,
}

impl ChatClient {
    pub fn new(service: InferenceService, config: EngineConfig, history_window: usize) -> Self {
        Self {
            service,
            config,
            history_window,
        }
    }

    /// The underlying orchestrator, for status subscriptions.
    pub fn service(&self) -> &InferenceService {
        &self.service
    }

    /// Initialize the configured model.
    pub async fn initialize(&self, on_progress: ProgressFn) -> Result<(), InitError> {
        self.service
            .initialize(self.config.clone(), on_progress)
            .await
    }

    /// Generate a reply for the conversation so far, streaming tokens through
    /// `on_token`. History is truncated to the configured window and prefixed
    /// with the synthesized system message.
    pub async fn send_message(
        &self,
        history: &[StoredMessage],
        summary: Option<&str>,
        on_token: TokenFn,
    ) -> Result<String, GenerateError> {
        let messages = build_context(
            &self.config.system_prompt,
            summary,
            history,
            self.history_window,
        );
        debug!(turns = messages.len() - 1, "sending conversation window");
        self.service.generate_response(&messages, on_token).await
    }

    pub fn stop_generation(&self) {
        self.service.stop_generation();
    }

    pub fn cancel_download(&self) {
        self.service.cancel_initialization();
    }

    pub fn is_model_cached(&self, backend: Option<Backend>) -> bool {
        self.service.is_model_cached(backend)
    }

    pub async fn clear_cache(&self) -> usize {
        self.service.clear_cache().await
    }

    pub async fn unload(&self) {
        self.service.unload().await;
    }
}

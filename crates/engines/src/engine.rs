//! The uniform engine contract shared by both inference backends.

use std::{path::PathBuf, sync::Arc};

use {
    async_trait::async_trait,
    serde::{Deserialize, Serialize},
    tokio_util::sync::CancellationToken,
};

use crate::{
    error::{GenerateError, InitError},
    models,
};

/// The two engine families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Runs the model with hardware acceleration on the calling runtime.
    Accelerated,
    /// Runs the model on a dedicated worker thread, CPU only.
    Cpu,
}

impl Backend {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accelerated => "accelerated",
            Self::Cpu => "cpu",
        }
    }

    /// Parse from config/CLI input.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "accelerated" | "gpu" => Some(Self::Accelerated),
            "cpu" => Some(Self::Cpu),
            _ => None,
        }
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Immutable configuration for one inference session.
///
/// Created by the orchestrator per `initialize` call and passed by value into
/// the chosen engine's constructor; never mutated afterwards.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Model ID from the registry.
    pub model_id: String,
    /// Base persona injected as the system message by the chat layer.
    pub system_prompt: String,
    pub temperature: f32,
    pub top_p: f32,
    pub max_tokens: u32,
    /// Pin a backend instead of detecting one.
    pub backend: Option<Backend>,
    /// Layers offloaded to the GPU on the accelerated path. `None` = all.
    pub gpu_layers: Option<u32>,
    /// Directory for cached model artifacts.
    pub cache_dir: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            model_id: models::DEFAULT_MODEL_ID.into(),
            system_prompt: sotto_config::schema::DEFAULT_SYSTEM_PROMPT.into(),
            temperature: 0.7,
            top_p: 0.9,
            max_tokens: 1024,
            backend: None,
            gpu_layers: None,
            cache_dir: models::default_models_dir(),
        }
    }
}

impl EngineConfig {
    /// Build an engine config from the loaded application config.
    #[must_use]
    pub fn from_settings(config: &sotto_config::SottoConfig) -> Self {
        Self {
            model_id: config.model.id.clone(),
            system_prompt: config.model.system_prompt.clone(),
            temperature: config.model.temperature,
            top_p: config.model.top_p,
            max_tokens: config.model.max_tokens,
            backend: config.engine.backend.as_deref().and_then(Backend::parse),
            gpu_layers: config.engine.gpu_layers,
            cache_dir: config
                .engine
                .cache_dir
                .clone()
                .unwrap_or_else(models::default_models_dir),
        }
    }
}

/// Initialization progress: completion fraction plus human-readable status.
///
/// Ephemeral; consumed immediately by the progress callback. Fractions are
/// monotonically non-decreasing within one initialization.
#[derive(Debug, Clone)]
pub struct ProgressReport {
    /// 0.0–1.0.
    pub fraction: f32,
    pub text: String,
}

impl ProgressReport {
    #[must_use]
    pub fn new(fraction: f32, text: impl Into<String>) -> Self {
        Self {
            fraction,
            text: text.into(),
        }
    }
}

/// Engine-facing chat message role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// Engine-facing chat message, built fresh per generation call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Callback receiving progress reports during initialization.
pub type ProgressFn = Arc<dyn Fn(ProgressReport) + Send + Sync>;

/// Callback receiving text fragments as they are generated.
pub type TokenFn = Arc<dyn Fn(&str) + Send + Sync>;

/// The capability set both concrete engines implement.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Which engine family this is.
    fn backend(&self) -> Backend;

    /// Load the model, reporting progress. Idempotent once ready; concurrent
    /// calls on one engine never start a second download. `cancel` is checked
    /// at every suspension point; a cancelled initialization fails with
    /// [`InitError::Cancelled`] and leaves the engine cleanly discardable.
    async fn initialize(
        &self,
        on_progress: ProgressFn,
        cancel: CancellationToken,
    ) -> Result<(), InitError>;

    /// Stream a response for `messages`, invoking `on_token` for each text
    /// fragment in generation order, and resolve with the concatenated text.
    /// Fails with [`GenerateError::Aborted`] when stopped mid-stream;
    /// fragments already emitted are never retracted.
    async fn generate(
        &self,
        messages: &[ChatMessage],
        on_token: TokenFn,
    ) -> Result<String, GenerateError>;

    /// Request cancellation of any in-flight generation. Synchronous,
    /// idempotent, no-op when nothing is running.
    fn stop(&self);

    /// Release model memory and background resources. Idempotent; afterwards
    /// `is_ready()` returns false.
    async fn unload(&self);

    /// Whether model weights are loaded and generation can be served.
    fn is_ready(&self) -> bool;
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_parse() {
        assert_eq!(Backend::parse("cpu"), Some(Backend::Cpu));
        assert_eq!(Backend::parse("accelerated"), Some(Backend::Accelerated));
        assert_eq!(Backend::parse("GPU"), Some(Backend::Accelerated));
        assert_eq!(Backend::parse("webgpu"), None);
    }

    #[test]
    fn backend_display_roundtrips() {
        for backend in [Backend::Accelerated, Backend::Cpu] {
            assert_eq!(Backend::parse(backend.as_str()), Some(backend));
        }
    }

    #[test]
    fn message_constructors() {
        let msg = ChatMessage::system("persona");
        assert_eq!(msg.role, Role::System);
        assert_eq!(msg.content, "persona");
        assert_eq!(ChatMessage::user("hi").role, Role::User);
        assert_eq!(ChatMessage::assistant("hello").role, Role::Assistant);
    }

    #[test]
    fn config_from_settings() {
        let mut settings = sotto_config::SottoConfig::default();
        settings.engine.backend = Some("cpu".into());
        settings.model.max_tokens = 256;
        let config = EngineConfig::from_settings(&settings);
        assert_eq!(config.backend, Some(Backend::Cpu));
        assert_eq!(config.max_tokens, 256);
        assert_eq!(config.model_id, settings.model.id);
    }
}

//! Config schema types (model, engine, chat).

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Persona injected as the system message when the config doesn't set one.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are Sotto, a warm and attentive companion that runs \
     entirely on this device. Keep replies short, conversational, and supportive. Two paragraphs \
     at most.";

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SottoConfig {
    pub model: ModelSettings,
    pub engine: EngineSettings,
    pub chat: ChatSettings,
}

/// Model selection and sampling parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    /// Model ID from the registry.
    pub id: String,
    /// Base persona injected as the system message.
    pub system_prompt: String,
    pub temperature: f32,
    pub top_p: f32,
    pub max_tokens: u32,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            id: "llama-3.2-1b-instruct-q4_k_m".into(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.into(),
            temperature: 0.7,
            top_p: 0.9,
            max_tokens: 1024,
        }
    }
}

/// Engine selection and cache placement.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Persisted backend preference: "accelerated" or "cpu". `None` = detect.
    pub backend: Option<String>,
    /// Hard override forcing the CPU engine regardless of preference or probe.
    pub force_cpu: bool,
    /// Layers offloaded to the GPU on the accelerated path. `None` = all.
    pub gpu_layers: Option<u32>,
    /// Model cache directory. `None` = `<data_dir>/models`.
    pub cache_dir: Option<PathBuf>,
}

/// Conversation assembly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatSettings {
    /// How many recent turns ride along with each generation.
    pub history_window: usize,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self { history_window: 10 }
    }
}

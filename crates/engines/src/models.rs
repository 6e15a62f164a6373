//! Registry of known local chat models.
//!
//! Every model ships GGUF artifacts from Hugging Face. The accelerated and
//! CPU engines pull different quantizations of the same model: the
//! accelerated path takes the higher-precision artifact, the worker path a
//! smaller one that fits comfortably in system RAM.

use std::path::PathBuf;

use crate::{detect::MemoryTier, engine::Backend, prompt::TemplateHint};

/// Model used when the config doesn't pick one.
pub const DEFAULT_MODEL_ID: &str = "llama-3.2-1b-instruct-q4_k_m";

/// Definition of a chat model the engines know how to fetch and run.
#[derive(Debug, Clone)]
pub struct ModelDef {
    /// Model identifier (e.g., "llama-3.2-1b-instruct-q4_k_m").
    pub id: &'static str,
    /// Human-readable display name.
    pub display_name: &'static str,
    /// Hugging Face repository holding the GGUF artifacts.
    pub repo: &'static str,
    /// Artifact used by the accelerated engine.
    pub accelerated_filename: &'static str,
    /// Smaller artifact used by the CPU/worker engine.
    pub cpu_filename: &'static str,
    /// Minimum RAM required in GB.
    pub min_ram_gb: u32,
    /// Context window size in tokens.
    pub context_window: u32,
    /// Chat template hint for formatting messages.
    pub template: TemplateHint,
}

impl ModelDef {
    /// Artifact filename for the given backend.
    #[must_use]
    pub fn artifact(&self, backend: Backend) -> &'static str {
        match backend {
            Backend::Accelerated => self.accelerated_filename,
            Backend::Cpu => self.cpu_filename,
        }
    }

    /// Hugging Face download URL for the given backend's artifact.
    #[must_use]
    pub fn artifact_url(&self, backend: Backend) -> String {
        format!(
            "https://huggingface.co/{}/resolve/main/{}",
            self.repo,
            self.artifact(backend)
        )
    }
}

/// Model registry — all known local models.
pub static MODEL_REGISTRY: &[ModelDef] = &[
    // ── 4GB tier ───────────────────────────────────────────────────────────
    ModelDef {
        id: "llama-3.2-1b-instruct-q4_k_m",
        display_name: "Llama 3.2 1B Instruct (Q4_K_M)",
        repo: "bartowski/Llama-3.2-1B-Instruct-GGUF",
        accelerated_filename: "Llama-3.2-1B-Instruct-Q4_K_M.gguf",
        cpu_filename: "Llama-3.2-1B-Instruct-Q3_K_L.gguf",
        min_ram_gb: 4,
        context_window: 8_192,
        template: TemplateHint::Llama3,
    },
    ModelDef {
        id: "qwen2.5-1.5b-instruct-q4_k_m",
        display_name: "Qwen 2.5 1.5B Instruct (Q4_K_M)",
        repo: "Qwen/Qwen2.5-1.5B-Instruct-GGUF",
        accelerated_filename: "qwen2.5-1.5b-instruct-q4_k_m.gguf",
        cpu_filename: "qwen2.5-1.5b-instruct-q3_k_m.gguf",
        min_ram_gb: 4,
        context_window: 8_192,
        template: TemplateHint::ChatML,
    },
    // ── 8GB tier ───────────────────────────────────────────────────────────
    ModelDef {
        id: "llama-3.2-3b-instruct-q4_k_m",
        display_name: "Llama 3.2 3B Instruct (Q4_K_M)",
        repo: "bartowski/Llama-3.2-3B-Instruct-GGUF",
        accelerated_filename: "Llama-3.2-3B-Instruct-Q4_K_M.gguf",
        cpu_filename: "Llama-3.2-3B-Instruct-Q3_K_L.gguf",
        min_ram_gb: 8,
        context_window: 8_192,
        template: TemplateHint::Llama3,
    },
    // ── 16GB tier ──────────────────────────────────────────────────────────
    ModelDef {
        id: "qwen2.5-7b-instruct-q4_k_m",
        display_name: "Qwen 2.5 7B Instruct (Q4_K_M)",
        repo: "Qwen/Qwen2.5-7B-Instruct-GGUF",
        accelerated_filename: "qwen2.5-7b-instruct-q4_k_m.gguf",
        cpu_filename: "qwen2.5-7b-instruct-q3_k_m.gguf",
        min_ram_gb: 16,
        context_window: 32_768,
        template: TemplateHint::ChatML,
    },
];

/// Find a model definition by ID.
#[must_use]
pub fn find_model(id: &str) -> Option<&'static ModelDef> {
    MODEL_REGISTRY.iter().find(|m| m.id == id)
}

/// Get models suitable for a given memory tier.
#[must_use]
pub fn models_for_tier(tier: MemoryTier) -> Vec<&'static ModelDef> {
    let max_ram = match tier {
        MemoryTier::Tiny => 4,
        MemoryTier::Small => 8,
        MemoryTier::Medium => 16,
        MemoryTier::Large => u32::MAX,
    };
    MODEL_REGISTRY
        .iter()
        .filter(|m| m.min_ram_gb <= max_ram)
        .collect()
}

/// Suggest the largest model that fits a memory tier.
#[must_use]
pub fn suggest_model(tier: MemoryTier) -> Option<&'static ModelDef> {
    models_for_tier(tier).into_iter().max_by_key(|m| m.min_ram_gb)
}

/// Default cache directory for downloaded model artifacts.
#[must_use]
pub fn default_models_dir() -> PathBuf {
    sotto_config::data_dir().join("models")
}

//! The seam between the engines and the loaded model pipeline.
//!
//! Both engines drive a [`ModelRuntime`], the wrapped token-producing
//! pipeline, and differ only in where they run it: the accelerated engine on
//! blocking tasks of the calling runtime, the CPU engine inside its worker
//! thread. The production implementation lives in [`crate::llama`] behind the
//! `runtime-llama` feature.

use std::{ops::ControlFlow, path::Path};

use crate::engine::{Backend, EngineConfig};

/// Sampling parameters handed to the runtime per generation.
#[derive(Debug, Clone, Copy)]
pub struct SamplingParams {
    pub temperature: f32,
    pub top_p: f32,
    pub max_tokens: u32,
}

impl SamplingParams {
    #[must_use]
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            temperature: config.temperature,
            top_p: config.top_p,
            max_tokens: config.max_tokens,
        }
    }
}

/// Whether a generation ran to completion or was stopped by the emit callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationOutcome {
    Finished,
    Stopped,
}

/// A loaded model pipeline that turns a formatted prompt into streamed text.
///
/// `emit` is called once per decoded piece, in generation order; returning
/// `ControlFlow::Break` stops production after the current piece, which bounds
/// abort latency to one piece.
pub trait ModelRuntime: Send {
    fn generate(
        &mut self,
        prompt: &str,
        params: &SamplingParams,
        emit: &mut dyn FnMut(&str) -> ControlFlow<()>,
    ) -> anyhow::Result<GenerationOutcome>;
}

/// Loads model weights from a cached artifact for a given backend.
///
/// Loading blocks; engines call it from a worker thread or a blocking task.
pub trait RuntimeLoader: Send + Sync {
    fn load(
        &self,
        artifact: &Path,
        config: &EngineConfig,
        backend: Backend,
    ) -> anyhow::Result<Box<dyn ModelRuntime>>;
}

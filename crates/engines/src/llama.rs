//! Production model runtime backed by llama-cpp-2.
//!
//! Loads GGUF artifacts and produces tokens piece by piece. The accelerated
//! backend offloads layers to the GPU (Metal/CUDA depending on the build
//! features); the CPU backend keeps everything on the host.

use std::{num::NonZeroU32, ops::ControlFlow, path::Path};

use {
    anyhow::{Context, Result, bail},
    llama_cpp_2::{
        context::params::LlamaContextParams,
        llama_backend::LlamaBackend,
        llama_batch::LlamaBatch,
        model::{AddBos, LlamaModel, params::LlamaModelParams},
        sampling::LlamaSampler,
    },
    tracing::{debug, info},
};

use crate::{
    engine::{Backend, EngineConfig},
    models,
    runtime::{GenerationOutcome, ModelRuntime, RuntimeLoader, SamplingParams},
};

const BATCH_SIZE: usize = 512;

/// Layers offloaded on the accelerated path when the config doesn't say.
const ALL_GPU_LAYERS: u32 = 1_000;

/// Wrapper around `LlamaBackend` that opts into `Send + Sync`.
struct SendSyncBackend(LlamaBackend);

// SAFETY: LlamaBackend is an immutable init handle with no thread-local state.
unsafe impl Send for SendSyncBackend {}
unsafe impl Sync for SendSyncBackend {}

/// Loads GGUF models through llama.cpp.
pub struct LlamaRuntimeLoader;

impl RuntimeLoader for LlamaRuntimeLoader {
    fn load(
        &self,
        artifact: &Path,
        config: &EngineConfig,
        backend: Backend,
    ) -> Result<Box<dyn ModelRuntime>> {
        if !artifact.exists() {
            bail!("model file not found: {}", artifact.display());
        }

        let llama = LlamaBackend::init().context("initializing llama backend")?;

        let gpu_layers = match backend {
            Backend::Accelerated => config.gpu_layers.unwrap_or(ALL_GPU_LAYERS),
            Backend::Cpu => 0,
        };
        let mut model_params = LlamaModelParams::default();
        if gpu_layers > 0 {
            model_params = model_params.with_n_gpu_layers(gpu_layers);
            info!(gpu_layers, "GPU offloading enabled");
        }

        let model = LlamaModel::load_from_file(&llama, artifact, &model_params)
            .map_err(|e| anyhow::anyhow!("failed to load GGUF model: {e}"))?;

        let context_size = models::find_model(&config.model_id)
            .map(|m| m.context_window)
            .unwrap_or(8192);

        info!(
            path = %artifact.display(),
            model = %config.model_id,
            context_size,
            "loaded GGUF model"
        );

        Ok(Box::new(LlamaRuntime {
            backend: SendSyncBackend(llama),
            model,
            context_size,
        }))
    }
}

/// A loaded GGUF model pipeline.
pub struct LlamaRuntime {
    backend: SendSyncBackend,
    model: LlamaModel,
    context_size: u32,
}

impl ModelRuntime for LlamaRuntime {
    fn generate(
        &mut self,
        prompt: &str,
        params: &SamplingParams,
        emit: &mut dyn FnMut(&str) -> ControlFlow<()>,
    ) -> Result<GenerationOutcome> {
        let ctx_params = LlamaContextParams::default()
            .with_n_ctx(NonZeroU32::new(self.context_size))
            .with_n_batch(BATCH_SIZE as u32);
        let mut ctx = self
            .model
            .new_context(&self.backend.0, ctx_params)
            .map_err(|e| anyhow::anyhow!("failed to create llama context: {e}"))?;

        let tokens = self
            .model
            .str_to_token(prompt, AddBos::Always)
            .map_err(|e| anyhow::anyhow!("tokenization failed: {e}"))?;
        if tokens.is_empty() {
            bail!("empty token sequence");
        }
        debug!(input_tokens = tokens.len(), "tokenized prompt");

        // Feed the prompt in batches.
        let mut batch = LlamaBatch::new(BATCH_SIZE, 1);
        for (chunk_idx, chunk) in tokens.chunks(BATCH_SIZE).enumerate() {
            batch.clear();
            let chunk_start = chunk_idx * BATCH_SIZE;
            let is_last_chunk = chunk_start + chunk.len() == tokens.len();

            for (i, &token) in chunk.iter().enumerate() {
                let pos = (chunk_start + i) as i32;
                let is_last = is_last_chunk && i == chunk.len() - 1;
                batch
                    .add(token, pos, &[0], is_last)
                    .map_err(|e| anyhow::anyhow!("batch add failed: {e}"))?;
            }

            ctx.decode(&mut batch)
                .map_err(|e| anyhow::anyhow!("prompt decode failed: {e}"))?;
        }

        let mut sampler = LlamaSampler::chain_simple([
            LlamaSampler::top_p(params.top_p, 1),
            LlamaSampler::temp(params.temperature),
            LlamaSampler::dist(42),
        ]);

        let mut decoder = encoding_rs::UTF_8.new_decoder();
        let eos = self.model.token_eos();
        let mut pos = tokens.len() as i32;

        for _ in 0..params.max_tokens {
            let token = sampler.sample(&ctx, batch.n_tokens() - 1);
            if token == eos {
                debug!("reached EOS token");
                break;
            }
            sampler.accept(token);

            let piece = self
                .model
                .token_to_piece(token, &mut decoder, true, None)
                .map_err(|e| anyhow::anyhow!("detokenization failed: {e}"))?;
            if let ControlFlow::Break(()) = emit(&piece) {
                return Ok(GenerationOutcome::Stopped);
            }

            batch.clear();
            batch
                .add(token, pos, &[0], true)
                .map_err(|e| anyhow::anyhow!("batch add token failed: {e}"))?;
            ctx.decode(&mut batch)
                .map_err(|e| anyhow::anyhow!("token decode failed: {e}"))?;

            pos += 1;
        }

        Ok(GenerationOutcome::Finished)
    }
}

//! The hardware-accelerated engine.
//!
//! Runs the model runtime with GPU layer offload. Orchestration stays on the
//! async runtime; the model arithmetic runs on blocking tasks, with the
//! generation cancellation token checked on every decoded piece.

use std::{
    ops::ControlFlow,
    sync::{
        Arc, Mutex as StdMutex,
        atomic::{AtomicBool, Ordering},
    },
};

use {
    async_trait::async_trait,
    tokio::sync::Mutex,
    tokio_util::sync::CancellationToken,
    tracing::info,
};

use crate::{
    cache,
    engine::{Backend, ChatMessage, Engine, EngineConfig, ProgressFn, ProgressReport, TokenFn},
    error::{GenerateError, InitError},
    lock, models,
    prompt::{self, TemplateHint},
    runtime::{GenerationOutcome, ModelRuntime, RuntimeLoader, SamplingParams},
};

struct Loaded {
    runtime: Box<dyn ModelRuntime>,
    template: TemplateHint,
}

/// Engine that runs the model with hardware acceleration.
pub struct AcceleratedEngine {
    config: EngineConfig,
    loader: Arc<dyn RuntimeLoader>,
    loaded: Arc<Mutex<Option<Loaded>>>,
    ready: AtomicBool,
    /// Serializes concurrent `initialize` calls so only one downloads.
    init_lock: Mutex<()>,
    /// One generation in flight at a time.
    gen_lock: Mutex<()>,
    gen_cancel: StdMutex<CancellationToken>,
}

impl AcceleratedEngine {
    pub fn new(config: EngineConfig, loader: Arc<dyn RuntimeLoader>) -> Self {
        Self {
            config,
            loader,
            loaded: Arc::new(Mutex::new(None)),
            ready: AtomicBool::new(false),
            init_lock: Mutex::new(()),
            gen_lock: Mutex::new(()),
            gen_cancel: StdMutex::new(CancellationToken::new()),
        }
    }
}

#[async_trait]
impl Engine for AcceleratedEngine {
    fn backend(&self) -> Backend {
        Backend::Accelerated
    }

    async fn initialize(
        &self,
        on_progress: ProgressFn,
        cancel: CancellationToken,
    ) -> Result<(), InitError> {
        let _init = self.init_lock.lock().await;

        if cancel.is_cancelled() {
            return Err(InitError::Cancelled);
        }
        if self.is_ready() {
            on_progress(ProgressReport::new(1.0, "Ready"));
            return Ok(());
        }

        let model = models::find_model(&self.config.model_id)
            .ok_or_else(|| InitError::Load(format!("unknown model '{}'", self.config.model_id)))?;

        on_progress(ProgressReport::new(0.0, "Preparing accelerated engine"));
        let artifact = cache::ensure_artifact(
            model,
            Backend::Accelerated,
            &self.config.cache_dir,
            &mut |progress| on_progress(cache::download_report(progress)),
            &cancel,
        )
        .await?;

        if cancel.is_cancelled() {
            return Err(InitError::Cancelled);
        }
        on_progress(ProgressReport::new(0.9, "Loading model weights"));

        let loader = Arc::clone(&self.loader);
        let config = self.config.clone();
        let runtime = tokio::task::spawn_blocking(move || {
            loader.load(&artifact, &config, Backend::Accelerated)
        })
        .await
        .map_err(|e| InitError::Load(format!("load task panicked: {e}")))?
        .map_err(|e| InitError::Load(e.to_string()))?;

        if cancel.is_cancelled() {
            // Cancelled while the weights were loading: discard them cleanly.
            return Err(InitError::Cancelled);
        }

        *self.loaded.lock().await = Some(Loaded {
            runtime,
            template: model.template,
        });
        self.ready.store(true, Ordering::SeqCst);
        info!(model = model.id, "accelerated engine ready");
        on_progress(ProgressReport::new(1.0, "Ready"));
        Ok(())
    }

    async fn generate(
        &self,
        messages: &[ChatMessage],
        on_token: TokenFn,
    ) -> Result<String, GenerateError> {
        if !self.is_ready() {
            return Err(GenerateError::NotReady);
        }
        let _turn = self.gen_lock.lock().await;

        let cancel = CancellationToken::new();
        *lock(&self.gen_cancel) = cancel.clone();

        let loaded = Arc::clone(&self.loaded);
        let params = SamplingParams::from_config(&self.config);
        let messages = messages.to_vec();

        let result = tokio::task::spawn_blocking(move || {
            let mut guard = loaded.blocking_lock();
            let Some(loaded) = guard.as_mut() else {
                return Err(GenerateError::NotReady);
            };
            let rendered = prompt::format_messages(&messages, loaded.template);
            let mut full = String::new();
            let outcome = loaded
                .runtime
                .generate(&rendered, &params, &mut |piece| {
                    if cancel.is_cancelled() {
                        return ControlFlow::Break(());
                    }
                    full.push_str(piece);
                    on_token(piece);
                    ControlFlow::Continue(())
                })
                .map_err(|e| GenerateError::Runtime(e.to_string()))?;
            Ok((outcome, full))
        })
        .await
        .map_err(|e| GenerateError::Runtime(format!("generation task panicked: {e}")))?;

        match result? {
            (GenerationOutcome::Finished, full) => Ok(full),
            (GenerationOutcome::Stopped, _) => Err(GenerateError::Aborted),
        }
    }

    fn stop(&self) {
        lock(&self.gen_cancel).cancel();
    }

    async fn unload(&self) {
        self.stop();
        // Wait for an in-flight generation to observe the cancellation.
        let _turn = self.gen_lock.lock().await;
        self.ready.store(false, Ordering::SeqCst);
        self.loaded.lock().await.take();
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use super::*;
    use crate::testing::{self, ScriptedLoader};

    fn ready_engine(loader: Arc<ScriptedLoader>, dir: &std::path::Path) -> AcceleratedEngine {
        let model = models::find_model(models::DEFAULT_MODEL_ID).unwrap();
        testing::seed_artifact(model, Backend::Accelerated, dir);
        AcceleratedEngine::new(testing::test_config(dir), loader)
    }

    fn collecting_token_fn() -> (TokenFn, Arc<StdMutex<Vec<String>>>) {
        let collected = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&collected);
        let on_token: TokenFn = Arc::new(move |piece: &str| {
            lock(&sink).push(piece.to_string());
        });
        (on_token, collected)
    }

    fn noop_progress() -> ProgressFn {
        Arc::new(|_| {})
    }

    #[tokio::test]
    async fn initialize_then_generate_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let loader = Arc::new(ScriptedLoader::new(&["Hi", " there", "!"]));
        let engine = ready_engine(Arc::clone(&loader), dir.path());

        let reports = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&reports);
        let on_progress: ProgressFn = Arc::new(move |report| {
            lock(&sink).push(report);
        });

        engine
            .initialize(on_progress, CancellationToken::new())
            .await
            .unwrap();
        assert!(engine.is_ready());

        // Fractions never go backwards and end at 1.0 / "Ready".
        let reports = lock(&reports);
        for pair in reports.windows(2) {
            assert!(pair[1].fraction >= pair[0].fraction);
        }
        let last = reports.last().unwrap();
        assert_eq!(last.fraction, 1.0);
        assert_eq!(last.text, "Ready");
        drop(reports);

        let (on_token, collected) = collecting_token_fn();
        let full = engine
            .generate(&[ChatMessage::user("Hello")], on_token)
            .await
            .unwrap();

        assert_eq!(full, "Hi there!");
        assert_eq!(*lock(&collected), vec!["Hi", " there", "!"]);
        assert!(engine.is_ready(), "engine returns to Ready after a turn");
    }

    #[tokio::test]
    async fn initialize_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let loader = Arc::new(ScriptedLoader::new(&["ok"]));
        let engine = ready_engine(Arc::clone(&loader), dir.path());

        engine
            .initialize(noop_progress(), CancellationToken::new())
            .await
            .unwrap();
        engine
            .initialize(noop_progress(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(loader.load_count(), 1);
    }

    #[tokio::test]
    async fn pre_cancelled_initialize_fails_with_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let loader = Arc::new(ScriptedLoader::new(&["ok"]));
        let engine = ready_engine(Arc::clone(&loader), dir.path());

        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = engine.initialize(noop_progress(), cancel).await;

        assert_eq!(result, Err(InitError::Cancelled));
        assert!(!engine.is_ready());
    }

    #[tokio::test]
    async fn unknown_model_fails_load() {
        let dir = tempfile::tempdir().unwrap();
        let loader = Arc::new(ScriptedLoader::new(&["ok"]));
        let mut config = testing::test_config(dir.path());
        config.model_id = "nonexistent-model".into();
        let engine = AcceleratedEngine::new(config, loader);

        let result = engine
            .initialize(noop_progress(), CancellationToken::new())
            .await;
        assert!(matches!(result, Err(InitError::Load(_))));
    }

    #[tokio::test]
    async fn generate_before_initialize_is_not_ready() {
        let dir = tempfile::tempdir().unwrap();
        let loader = Arc::new(ScriptedLoader::new(&["ok"]));
        let engine = AcceleratedEngine::new(testing::test_config(dir.path()), loader);

        let (on_token, _) = collecting_token_fn();
        let result = engine.generate(&[ChatMessage::user("hi")], on_token).await;
        assert_eq!(result, Err(GenerateError::NotReady));
    }

    #[tokio::test]
    async fn stop_mid_generation_keeps_partial_tokens() {
        let dir = tempfile::tempdir().unwrap();
        let loader = Arc::new(ScriptedLoader::new(&["He", "llo", "!"]));
        let engine = Arc::new(ready_engine(Arc::clone(&loader), dir.path()));
        engine
            .initialize(noop_progress(), CancellationToken::new())
            .await
            .unwrap();

        let collected = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&collected);
        let stopper = Arc::clone(&engine);
        let on_token: TokenFn = Arc::new(move |piece: &str| {
            let mut seen = lock(&sink);
            seen.push(piece.to_string());
            if seen.len() == 2 {
                // Second piece arrived; stop before "!" is produced.
                stopper.stop();
            }
        });

        let result = engine.generate(&[ChatMessage::user("Hello")], on_token).await;

        assert_eq!(result, Err(GenerateError::Aborted));
        assert_eq!(*lock(&collected), vec!["He", "llo"]);
        assert!(engine.is_ready(), "post-load cancel returns engine to Ready");
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_safe_when_idle() {
        let dir = tempfile::tempdir().unwrap();
        let loader = Arc::new(ScriptedLoader::new(&["ok"]));
        let engine = ready_engine(Arc::clone(&loader), dir.path());

        // No generation running: both calls are no-ops.
        engine.stop();
        engine.stop();

        engine
            .initialize(noop_progress(), CancellationToken::new())
            .await
            .unwrap();
        let (on_token, _) = collecting_token_fn();
        // A fresh generation gets a fresh cancellation token.
        let full = engine
            .generate(&[ChatMessage::user("hi")], on_token)
            .await
            .unwrap();
        assert_eq!(full, "ok");
    }

    #[tokio::test]
    async fn unload_releases_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let loader = Arc::new(ScriptedLoader::new(&["ok"]));
        let engine = ready_engine(Arc::clone(&loader), dir.path());

        engine
            .initialize(noop_progress(), CancellationToken::new())
            .await
            .unwrap();
        let dropped = loader.last_dropped().unwrap();

        engine.unload().await;
        assert!(!engine.is_ready());
        assert!(dropped.load(Ordering::SeqCst));

        // Unload twice is fine; re-initialize loads again.
        engine.unload().await;
        engine
            .initialize(noop_progress(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(loader.load_count(), 2);
    }
}

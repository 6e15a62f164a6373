//! The inference orchestrator.
//!
//! Owns at most one engine instance, detects the backend, shares one
//! in-flight initialization among concurrent callers, falls back from the
//! accelerated engine to CPU at most once per call, and broadcasts a reactive
//! status surface for UI layers.

use std::sync::{
    Arc, Mutex as StdMutex, RwLock,
    atomic::{AtomicU64, Ordering},
};

use {
    futures::{
        FutureExt,
        future::{BoxFuture, Shared},
    },
    serde::Serialize,
    tokio::sync::watch,
    tokio_util::sync::CancellationToken,
    tracing::{info, warn},
};

use crate::{
    cache,
    cpu::CpuEngine,
    detect::{self, DetectionPrefs},
    engine::{Backend, ChatMessage, Engine, EngineConfig, ProgressFn, TokenFn},
    error::{GenerateError, InitError},
    gpu::AcceleratedEngine,
    lock, models, read, write,
    runtime::RuntimeLoader,
};

/// Reactive state surface consumed by UI layers.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EngineStatus {
    pub is_ready: bool,
    pub is_loading: bool,
    /// 0–100.
    pub progress: f32,
    pub progress_text: String,
    pub error: Option<String>,
    pub is_cached: bool,
    pub active_engine: Option<Backend>,
}

type InitFuture = Shared<BoxFuture<'static, Result<Backend, InitError>>>;

struct ActiveEngine {
    engine: Arc<dyn Engine>,
    backend: Backend,
}

struct Inner {
    config: RwLock<EngineConfig>,
    prefs: DetectionPrefs,
    loader: Arc<dyn RuntimeLoader>,
    active: RwLock<Option<ActiveEngine>>,
    /// In-flight initialization, tagged so stale completions don't clobber a
    /// newer attempt after cancellation.
    inflight: StdMutex<Option<(u64, InitFuture)>>,
    init_cancel: StdMutex<Option<(u64, CancellationToken)>>,
    init_seq: AtomicU64,
    status: watch::Sender<EngineStatus>,
}

/// Cheaply clonable orchestrator handle; create one at the composition root.
#[derive(Clone)]
pub struct InferenceService {
    inner: Arc<Inner>,
}

impl InferenceService {
    pub fn new(
        config: EngineConfig,
        prefs: DetectionPrefs,
        loader: Arc<dyn RuntimeLoader>,
    ) -> Self {
        let is_cached = models::find_model(&config.model_id)
            .is_some_and(|model| cache::is_cached_any(model, &config.cache_dir));
        let (status, _) = watch::channel(EngineStatus {
            is_cached,
            ..EngineStatus::default()
        });
        Self {
            inner: Arc::new(Inner {
                config: RwLock::new(config),
                prefs,
                loader,
                active: RwLock::new(None),
                inflight: StdMutex::new(None),
                init_cancel: StdMutex::new(None),
                init_seq: AtomicU64::new(0),
                status,
            }),
        }
    }

    /// Subscribe to the reactive status surface.
    pub fn status(&self) -> watch::Receiver<EngineStatus> {
        self.inner.status.subscribe()
    }

    /// Snapshot of the current status.
    pub fn current_status(&self) -> EngineStatus {
        self.inner.status.borrow().clone()
    }

    pub fn is_ready(&self) -> bool {
        read(&self.inner.active)
            .as_ref()
            .is_some_and(|active| active.engine.is_ready())
    }

    pub fn active_backend(&self) -> Option<Backend> {
        read(&self.inner.active).as_ref().map(|active| active.backend)
    }

    /// Initialize the configured model, sharing one in-flight operation among
    /// concurrent callers: the second caller awaits the same future and
    /// receives the same resolved outcome.
    pub async fn initialize(
        &self,
        config: EngineConfig,
        on_progress: ProgressFn,
    ) -> Result<(), InitError> {
        if let Some(active_backend) = self.active_backend()
            && self.is_ready()
        {
            // Ready with a compatible engine: nothing to do. A different
            // pinned backend falls through and swaps engines below.
            match config.backend {
                None => return Ok(()),
                Some(requested) if requested == active_backend => return Ok(()),
                Some(_) => {},
            }
        }

        let future = {
            let mut inflight = lock(&self.inner.inflight);
            if let Some((_, future)) = inflight.as_ref() {
                future.clone()
            } else {
                let id = self.inner.init_seq.fetch_add(1, Ordering::SeqCst);
                let cancel = CancellationToken::new();
                *lock(&self.inner.init_cancel) = Some((id, cancel.clone()));
                let service = self.clone();
                let future: InitFuture = async move {
                    service.run_initialize(id, config, on_progress, cancel).await
                }
                .boxed()
                .shared();
                *inflight = Some((id, future.clone()));
                future
            }
        };

        future.await.map(|_| ())
    }

    async fn run_initialize(
        self,
        id: u64,
        config: EngineConfig,
        on_progress: ProgressFn,
        cancel: CancellationToken,
    ) -> Result<Backend, InitError> {
        let result = self.do_initialize(config, &on_progress, &cancel).await;

        // Release the in-flight slot unless a newer attempt already took it.
        {
            let mut inflight = lock(&self.inner.inflight);
            if matches!(inflight.as_ref(), Some((current, _)) if *current == id) {
                *inflight = None;
            }
        }
        {
            let mut init_cancel = lock(&self.inner.init_cancel);
            if matches!(init_cancel.as_ref(), Some((current, _)) if *current == id) {
                *init_cancel = None;
            }
        }

        match &result {
            Ok(backend) => {
                let backend = *backend;
                self.update_status(|status| {
                    status.is_ready = true;
                    status.is_loading = false;
                    status.progress = 100.0;
                    status.progress_text = "Ready".into();
                    status.error = None;
                    status.is_cached = true;
                    status.active_engine = Some(backend);
                });
            },
            Err(InitError::Cancelled) => {
                // User-initiated: informational, not an error.
                self.update_status(|status| {
                    status.is_loading = false;
                    status.progress = 0.0;
                    status.progress_text = "Download cancelled".into();
                    status.error = None;
                });
            },
            Err(e) => {
                let message = e.to_string();
                self.update_status(|status| {
                    status.is_loading = false;
                    status.error = Some(message);
                });
            },
        }

        result
    }

    async fn do_initialize(
        &self,
        config: EngineConfig,
        on_progress: &ProgressFn,
        cancel: &CancellationToken,
    ) -> Result<Backend, InitError> {
        self.update_status(|status| {
            status.is_loading = true;
            status.progress = 0.0;
            status.progress_text = "Initializing".into();
            status.error = None;
        });

        let backend = match config.backend {
            Some(pinned) => pinned,
            None => detect::detect_backend(self.inner.prefs).await,
        };
        info!(backend = %backend, model = %config.model_id, "initializing inference engine");

        *write(&self.inner.config) = config.clone();

        // Single-active-engine invariant: a resident engine of another family
        // releases its model memory before the new one loads.
        let previous = write(&self.inner.active).take();
        if let Some(previous) = previous {
            info!(from = %previous.backend, to = %backend, "switching engines");
            previous.engine.unload().await;
        }

        // Relay progress to the caller and mirror it onto the status surface.
        let relay: ProgressFn = {
            let service = self.clone();
            let user = Arc::clone(on_progress);
            Arc::new(move |report| {
                service.update_status(|status| {
                    status.progress = report.fraction * 100.0;
                    status.progress_text = report.text.clone();
                });
                user(report);
            })
        };

        match self.try_backend(backend, &config, &relay, cancel).await {
            Ok(engine) => {
                self.set_active(engine, backend);
                Ok(backend)
            },
            // A user cancel is not a device failure; no fallback.
            Err(InitError::Cancelled) => Err(InitError::Cancelled),
            Err(e) if backend == Backend::Accelerated => {
                warn!(error = %e, "accelerated engine failed, falling back to CPU");
                let engine = self
                    .try_backend(Backend::Cpu, &config, &relay, cancel)
                    .await?;
                self.set_active(engine, Backend::Cpu);
                Ok(Backend::Cpu)
            },
            Err(e) => Err(e),
        }
    }

    async fn try_backend(
        &self,
        backend: Backend,
        config: &EngineConfig,
        on_progress: &ProgressFn,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn Engine>, InitError> {
        let engine = build_engine(backend, config.clone(), Arc::clone(&self.inner.loader));
        engine
            .initialize(Arc::clone(on_progress), cancel.clone())
            .await?;
        Ok(engine)
    }

    /// Cancel the in-flight initialization, if any. Resource release follows
    /// the engine's own abort semantics; this cancels loading only.
    pub fn cancel_initialization(&self) {
        if let Some((_, token)) = lock(&self.inner.init_cancel).take() {
            token.cancel();
        }
        *lock(&self.inner.inflight) = None;
    }

    /// Delegate a generation to the active engine. Errors pass through
    /// unchanged; [`GenerateError::Aborted`] is kept off the error surface so
    /// user-initiated stops don't read as failures.
    pub async fn generate_response(
        &self,
        messages: &[ChatMessage],
        on_token: TokenFn,
    ) -> Result<String, GenerateError> {
        let engine = read(&self.inner.active)
            .as_ref()
            .map(|active| Arc::clone(&active.engine))
            .ok_or(GenerateError::NotReady)?;

        let result = engine.generate(messages, on_token).await;
        if let Err(e) = &result
            && *e != GenerateError::Aborted
        {
            let message = e.to_string();
            self.update_status(|status| status.error = Some(message));
        }
        result
    }

    /// Stop any in-flight generation. Synchronous, idempotent.
    pub fn stop_generation(&self) {
        if let Some(active) = read(&self.inner.active).as_ref() {
            active.engine.stop();
        }
    }

    /// Whether the configured model's artifact completed downloading, without
    /// loading an engine. `None` checks both backends.
    pub fn is_model_cached(&self, backend: Option<Backend>) -> bool {
        let config = read(&self.inner.config);
        let Some(model) = models::find_model(&config.model_id) else {
            return false;
        };
        match backend {
            Some(backend) => cache::is_model_cached(model, backend, &config.cache_dir),
            None => cache::is_cached_any(model, &config.cache_dir),
        }
    }

    /// Unload the active engine and delete all cached artifacts, best effort
    /// per entry. Safe when nothing was ever initialized.
    pub async fn clear_cache(&self) -> usize {
        self.unload().await;
        let cache_dir = read(&self.inner.config).cache_dir.clone();
        let removed = cache::clear_cache(&cache_dir).await;
        self.update_status(|status| status.is_cached = false);
        removed
    }

    /// Cancel any initialization and release the active engine.
    pub async fn unload(&self) {
        self.cancel_initialization();
        let active = write(&self.inner.active).take();
        if let Some(active) = active {
            active.engine.unload().await;
        }
        self.update_status(|status| {
            status.is_ready = false;
            status.is_loading = false;
            status.progress = 0.0;
            status.progress_text.clear();
            status.active_engine = None;
        });
    }

    fn set_active(&self, engine: Arc<dyn Engine>, backend: Backend) {
        *write(&self.inner.active) = Some(ActiveEngine { engine, backend });
    }

    fn update_status(&self, apply: impl FnOnce(&mut EngineStatus)) {
        self.inner.status.send_modify(apply);
    }
}

/// Construct the engine implementation for a backend.
fn build_engine(
    backend: Backend,
    config: EngineConfig,
    loader: Arc<dyn RuntimeLoader>,
) -> Arc<dyn Engine> {
    match backend {
        Backend::Accelerated => Arc::new(AcceleratedEngine::new(config, loader)),
        Backend::Cpu => Arc::new(CpuEngine::new(config, loader)),
    }
}

//! The CPU engine.
//!
//! CPU-bound model execution would starve the async runtime, so this engine
//! delegates all heavy work to the dedicated worker thread in
//! [`crate::worker`] and talks to it only through message passing. Generation
//! updates arrive as cumulative text; the engine diffs them against the
//! previously seen length before forwarding, so tokens are never duplicated
//! or reordered.

use std::sync::{
    Arc, Mutex as StdMutex,
    atomic::{AtomicBool, Ordering},
    mpsc,
};

use {
    async_trait::async_trait,
    tokio::sync::Mutex,
    tokio_util::sync::CancellationToken,
    tracing::{debug, info},
};

use crate::{
    engine::{Backend, ChatMessage, Engine, EngineConfig, ProgressFn, ProgressReport, TokenFn},
    error::{GenerateError, InitError},
    lock,
    runtime::RuntimeLoader,
    worker::{self, Command, Event, WorkerHandle},
};

const WORKER_GONE: &str = "worker terminated unexpectedly";

/// Engine that runs the model on a background worker thread.
pub struct CpuEngine {
    config: EngineConfig,
    loader: Arc<dyn RuntimeLoader>,
    /// Worker channels; the lock also serializes init and generation turns.
    worker: Mutex<Option<WorkerHandle>>,
    /// Command sender kept outside the async lock so `stop()` stays sync.
    commands: StdMutex<Option<mpsc::Sender<Command>>>,
    ready: AtomicBool,
}

impl CpuEngine {
    pub fn new(config: EngineConfig, loader: Arc<dyn RuntimeLoader>) -> Self {
        Self {
            config,
            loader,
            worker: Mutex::new(None),
            commands: StdMutex::new(None),
            ready: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Engine for CpuEngine {
    fn backend(&self) -> Backend {
        Backend::Cpu
    }

    async fn initialize(
        &self,
        on_progress: ProgressFn,
        cancel: CancellationToken,
    ) -> Result<(), InitError> {
        let mut guard = self.worker.lock().await;

        if cancel.is_cancelled() {
            return Err(InitError::Cancelled);
        }
        if self.is_ready() {
            on_progress(ProgressReport::new(1.0, "Ready"));
            return Ok(());
        }

        if guard.is_none() {
            let handle = worker::spawn(self.config.clone(), Arc::clone(&self.loader));
            *lock(&self.commands) = Some(handle.commands.clone());
            *guard = Some(handle);
        }
        let Some(handle) = guard.as_mut() else {
            return Err(InitError::Worker(WORKER_GONE.into()));
        };

        handle
            .send(Command::Init {
                cancel: cancel.clone(),
            })
            .map_err(|_| InitError::Worker(WORKER_GONE.into()))?;

        loop {
            match handle.events.recv().await {
                Some(Event::Progress { fraction, text }) => {
                    on_progress(ProgressReport::new(fraction, text));
                },
                Some(Event::Ready) => {
                    self.ready.store(true, Ordering::SeqCst);
                    info!(model = %self.config.model_id, "cpu engine ready");
                    on_progress(ProgressReport::new(1.0, "Ready"));
                    return Ok(());
                },
                Some(Event::Error { message }) => {
                    return Err(if cancel.is_cancelled() {
                        InitError::Cancelled
                    } else {
                        InitError::Worker(message)
                    });
                },
                Some(_) => {},
                None => return Err(InitError::Worker(WORKER_GONE.into())),
            }
        }
    }

    async fn generate(
        &self,
        messages: &[ChatMessage],
        on_token: TokenFn,
    ) -> Result<String, GenerateError> {
        if !self.is_ready() {
            return Err(GenerateError::NotReady);
        }
        let mut guard = self.worker.lock().await;
        let Some(handle) = guard.as_mut() else {
            return Err(GenerateError::NotReady);
        };

        handle
            .send(Command::Generate {
                messages: messages.to_vec(),
            })
            .map_err(|_| GenerateError::Worker(WORKER_GONE.into()))?;

        let mut seen = 0usize;
        let mut full = String::new();

        loop {
            match handle.events.recv().await {
                Some(Event::Update { text }) => {
                    if let Some(delta) = text.get(seen..)
                        && !delta.is_empty()
                    {
                        on_token(delta);
                        seen = text.len();
                        full = text;
                    }
                },
                Some(Event::Complete { text }) => {
                    if let Some(delta) = text.get(seen..)
                        && !delta.is_empty()
                    {
                        on_token(delta);
                    }
                    return Ok(if text.is_empty() { full } else { text });
                },
                Some(Event::Interrupted) => return Err(GenerateError::Aborted),
                Some(Event::InterruptAck) => {
                    debug!("worker acknowledged interrupt");
                },
                Some(Event::Error { message }) => return Err(GenerateError::Worker(message)),
                Some(_) => {},
                None => return Err(GenerateError::Worker(WORKER_GONE.into())),
            }
        }
    }

    fn stop(&self) {
        if let Some(commands) = lock(&self.commands).as_ref() {
            let _ = commands.send(Command::Interrupt);
        }
    }

    async fn unload(&self) {
        self.stop();
        self.ready.store(false, Ordering::SeqCst);
        *lock(&self.commands) = None;
        // Dropping the handle closes the command channel; the worker drains
        // its inbox and exits, releasing the pipeline memory.
        self.worker.lock().await.take();
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

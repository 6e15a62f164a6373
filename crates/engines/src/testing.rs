//! Scripted runtime doubles and cache seeding shared by the engine tests.

use std::{
    ops::ControlFlow,
    path::Path,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
        mpsc,
    },
};

use crate::{
    cache::{self, CacheEntry},
    engine::{Backend, EngineConfig},
    models::ModelDef,
    runtime::{GenerationOutcome, ModelRuntime, RuntimeLoader, SamplingParams},
};

/// Runtime that replays a fixed script of text pieces.
pub(crate) struct ScriptedRuntime {
    pieces: Vec<String>,
    dropped: Option<Arc<AtomicBool>>,
}

impl ModelRuntime for ScriptedRuntime {
    fn generate(
        &mut self,
        _prompt: &str,
        _params: &SamplingParams,
        emit: &mut dyn FnMut(&str) -> ControlFlow<()>,
    ) -> anyhow::Result<GenerationOutcome> {
        for piece in &self.pieces {
            if let ControlFlow::Break(()) = emit(piece) {
                return Ok(GenerationOutcome::Stopped);
            }
        }
        Ok(GenerationOutcome::Finished)
    }
}

impl Drop for ScriptedRuntime {
    fn drop(&mut self) {
        if let Some(flag) = &self.dropped {
            flag.store(true, Ordering::SeqCst);
        }
    }
}

/// Loader returning scripted runtimes; optionally failing per backend.
pub(crate) struct ScriptedLoader {
    pieces: Vec<String>,
    fail_accelerated: bool,
    fail_cpu: bool,
    panic_on_load: bool,
    pub(crate) loads: AtomicUsize,
    /// Drop flag of the most recently loaded runtime.
    pub(crate) last_dropped: Mutex<Option<Arc<AtomicBool>>>,
}

impl ScriptedLoader {
    pub(crate) fn new(pieces: &[&str]) -> Self {
        Self {
            pieces: pieces.iter().map(|p| (*p).to_string()).collect(),
            fail_accelerated: false,
            fail_cpu: false,
            panic_on_load: false,
            loads: AtomicUsize::new(0),
            last_dropped: Mutex::new(None),
        }
    }

    pub(crate) fn failing_accelerated(pieces: &[&str]) -> Self {
        Self {
            fail_accelerated: true,
            ..Self::new(pieces)
        }
    }

    pub(crate) fn failing_all(pieces: &[&str]) -> Self {
        Self {
            fail_accelerated: true,
            fail_cpu: true,
            ..Self::new(pieces)
        }
    }

    pub(crate) fn panicking(pieces: &[&str]) -> Self {
        Self {
            panic_on_load: true,
            ..Self::new(pieces)
        }
    }

    pub(crate) fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub(crate) fn last_dropped(&self) -> Option<Arc<AtomicBool>> {
        crate::lock(&self.last_dropped).clone()
    }
}

impl RuntimeLoader for ScriptedLoader {
    fn load(
        &self,
        _artifact: &Path,
        _config: &EngineConfig,
        backend: Backend,
    ) -> anyhow::Result<Box<dyn ModelRuntime>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if self.panic_on_load {
            panic!("scripted loader panic");
        }
        match backend {
            Backend::Accelerated if self.fail_accelerated => anyhow::bail!("adapter lost"),
            Backend::Cpu if self.fail_cpu => anyhow::bail!("out of memory"),
            _ => {},
        }
        let flag = Arc::new(AtomicBool::new(false));
        *crate::lock(&self.last_dropped) = Some(Arc::clone(&flag));
        Ok(Box::new(ScriptedRuntime {
            pieces: self.pieces.clone(),
            dropped: Some(flag),
        }))
    }
}

/// Runtime that waits for an explicit permit before producing each piece,
/// letting tests interleave consumption and cancellation deterministically.
pub(crate) struct GatedRuntime {
    pieces: Vec<String>,
    gate: mpsc::Receiver<()>,
}

impl ModelRuntime for GatedRuntime {
    fn generate(
        &mut self,
        _prompt: &str,
        _params: &SamplingParams,
        emit: &mut dyn FnMut(&str) -> ControlFlow<()>,
    ) -> anyhow::Result<GenerationOutcome> {
        for piece in &self.pieces {
            if self.gate.recv().is_err() {
                return Ok(GenerationOutcome::Stopped);
            }
            if let ControlFlow::Break(()) = emit(piece) {
                return Ok(GenerationOutcome::Stopped);
            }
        }
        Ok(GenerationOutcome::Finished)
    }
}

/// Loader handing out a single [`GatedRuntime`]; `permit()` releases pieces.
pub(crate) struct GatedLoader {
    pieces: Vec<String>,
    gate_tx: mpsc::Sender<()>,
    gate_rx: Mutex<Option<mpsc::Receiver<()>>>,
}

impl GatedLoader {
    pub(crate) fn new(pieces: &[&str]) -> Self {
        let (gate_tx, gate_rx) = mpsc::channel();
        Self {
            pieces: pieces.iter().map(|p| (*p).to_string()).collect(),
            gate_tx,
            gate_rx: Mutex::new(Some(gate_rx)),
        }
    }

    /// Allow the runtime to produce one more piece.
    pub(crate) fn permit(&self) {
        let _ = self.gate_tx.send(());
    }
}

impl RuntimeLoader for GatedLoader {
    fn load(
        &self,
        _artifact: &Path,
        _config: &EngineConfig,
        _backend: Backend,
    ) -> anyhow::Result<Box<dyn ModelRuntime>> {
        let gate = crate::lock(&self.gate_rx)
            .take()
            .ok_or_else(|| anyhow::anyhow!("gated loader supports a single load"))?;
        Ok(Box::new(GatedRuntime {
            pieces: self.pieces.clone(),
            gate,
        }))
    }
}

/// Mark a model artifact as already downloaded in `cache_dir`.
pub(crate) fn seed_artifact(model: &ModelDef, backend: Backend, cache_dir: &Path) {
    let path = cache_dir.join(model.artifact(backend));
    std::fs::create_dir_all(cache_dir).expect("create cache dir");
    std::fs::write(&path, b"fake model weights").expect("write artifact");
    cache::record_entry(cache_dir, CacheEntry {
        model_id: model.id.to_string(),
        backend,
        filename: model.artifact(backend).to_string(),
        size_bytes: 18,
        sha256: "0".repeat(64),
    })
    .expect("record cache entry");
}

/// Engine config pointing at a test cache dir, with the default model.
pub(crate) fn test_config(cache_dir: &Path) -> EngineConfig {
    EngineConfig {
        cache_dir: cache_dir.to_path_buf(),
        ..EngineConfig::default()
    }
}

//! Dedicated worker thread hosting the CPU model pipeline.
//!
//! The engine and the worker communicate exclusively through the closed
//! [`Command`]/[`Event`] message pairs. The pipeline inside the thread is a
//! singleton: the first `Init` constructs it, later ones reuse it. Every
//! command handler runs under `catch_unwind` so a fault always surfaces as an
//! [`Event::Error`] instead of a silent death.

use std::{
    any::Any,
    ops::ControlFlow,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{Arc, mpsc},
    thread,
};

use {
    tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel},
    tokio_util::sync::CancellationToken,
    tracing::{debug, warn},
};

use crate::{
    cache,
    engine::{Backend, ChatMessage, EngineConfig},
    models,
    prompt::{self, TemplateHint},
    runtime::{ModelRuntime, RuntimeLoader, SamplingParams},
};

/// Engine → worker.
pub(crate) enum Command {
    Init { cancel: CancellationToken },
    Generate { messages: Vec<ChatMessage> },
    Interrupt,
}

/// Worker → engine.
pub(crate) enum Event {
    Progress { fraction: f32, text: String },
    Ready,
    /// Cumulative text so far; the engine diffs before forwarding.
    Update { text: String },
    Complete { text: String },
    Interrupted,
    /// Debugging echo; never required for correctness.
    InterruptAck,
    Error { message: String },
}

/// Live channel pair to a spawned worker thread. Dropping the handle closes
/// the command channel; the worker drains and exits.
pub(crate) struct WorkerHandle {
    pub(crate) commands: mpsc::Sender<Command>,
    pub(crate) events: UnboundedReceiver<Event>,
}

impl WorkerHandle {
    pub(crate) fn send(&self, command: Command) -> Result<(), mpsc::SendError<Command>> {
        self.commands.send(command)
    }
}

/// Spawn the worker thread for one engine instance.
pub(crate) fn spawn(config: EngineConfig, loader: Arc<dyn RuntimeLoader>) -> WorkerHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel();
    let (event_tx, event_rx) = unbounded_channel();

    let thread_events = event_tx.clone();
    let spawned = thread::Builder::new()
        .name("sotto-cpu-worker".into())
        .spawn(move || run(config, loader, cmd_rx, thread_events));
    if let Err(e) = spawned {
        let _ = event_tx.send(Event::Error {
            message: format!("failed to spawn worker thread: {e}"),
        });
    }

    WorkerHandle {
        commands: cmd_tx,
        events: event_rx,
    }
}

struct Pipeline {
    runtime: Box<dyn ModelRuntime>,
    template: TemplateHint,
}

fn run(
    config: EngineConfig,
    loader: Arc<dyn RuntimeLoader>,
    commands: mpsc::Receiver<Command>,
    events: UnboundedSender<Event>,
) {
    let mut pipeline: Option<Pipeline> = None;
    let params = SamplingParams::from_config(&config);

    while let Ok(command) = commands.recv() {
        match command {
            Command::Init { cancel } => {
                if pipeline.is_some() {
                    let _ = events.send(Event::Ready);
                    continue;
                }
                let result = catch_unwind(AssertUnwindSafe(|| {
                    init_pipeline(&config, loader.as_ref(), &events, &cancel)
                }));
                match result {
                    Ok(Ok(built)) => {
                        pipeline = Some(built);
                        let _ = events.send(Event::Ready);
                    },
                    Ok(Err(message)) => {
                        let _ = events.send(Event::Error { message });
                    },
                    Err(panic) => {
                        let _ = events.send(Event::Error {
                            message: panic_message(panic),
                        });
                    },
                }
            },
            Command::Generate { messages } => {
                let Some(active) = pipeline.as_mut() else {
                    let _ = events.send(Event::Error {
                        message: "pipeline not initialized".into(),
                    });
                    continue;
                };
                let result = catch_unwind(AssertUnwindSafe(|| {
                    run_generation(active, &messages, &params, &commands, &events);
                }));
                if let Err(panic) = result {
                    let _ = events.send(Event::Error {
                        message: panic_message(panic),
                    });
                }
            },
            Command::Interrupt => {
                // No generation in flight: nothing to stop.
                let _ = events.send(Event::InterruptAck);
            },
        }
    }

    debug!("cpu worker shutting down");
}

fn init_pipeline(
    config: &EngineConfig,
    loader: &dyn RuntimeLoader,
    events: &UnboundedSender<Event>,
    cancel: &CancellationToken,
) -> Result<Pipeline, String> {
    let model = models::find_model(&config.model_id)
        .ok_or_else(|| format!("unknown model '{}'", config.model_id))?;

    // The worker thread owns no async runtime; build a local one for the
    // download.
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| format!("failed to build worker runtime: {e}"))?;

    let artifact = rt
        .block_on(cache::ensure_artifact(
            model,
            Backend::Cpu,
            &config.cache_dir,
            &mut |progress| {
                let report = cache::download_report(progress);
                let _ = events.send(Event::Progress {
                    fraction: report.fraction,
                    text: report.text,
                });
            },
            cancel,
        ))
        .map_err(|e| e.to_string())?;

    let _ = events.send(Event::Progress {
        fraction: 0.9,
        text: "Loading model weights".into(),
    });

    let runtime = loader
        .load(&artifact, config, Backend::Cpu)
        .map_err(|e| e.to_string())?;

    if cancel.is_cancelled() {
        return Err("download cancelled".into());
    }

    Ok(Pipeline {
        runtime,
        template: model.template,
    })
}

fn run_generation(
    pipeline: &mut Pipeline,
    messages: &[ChatMessage],
    params: &SamplingParams,
    commands: &mpsc::Receiver<Command>,
    events: &UnboundedSender<Event>,
) {
    let rendered = prompt::format_messages(messages, pipeline.template);
    let mut cumulative = String::new();
    let mut interrupted = false;

    let outcome = pipeline.runtime.generate(&rendered, params, &mut |piece| {
        // Drain the inbox between pieces; an Interrupt here stops generation.
        while let Ok(command) = commands.try_recv() {
            if matches!(command, Command::Interrupt) {
                interrupted = true;
                let _ = events.send(Event::InterruptAck);
            } else {
                warn!("dropping command received mid-generation");
            }
        }
        if interrupted {
            return ControlFlow::Break(());
        }
        cumulative.push_str(piece);
        let _ = events.send(Event::Update {
            text: cumulative.clone(),
        });
        ControlFlow::Continue(())
    });

    if interrupted {
        let _ = events.send(Event::Interrupted);
        return;
    }
    match outcome {
        Ok(_) => {
            let _ = events.send(Event::Complete { text: cumulative });
        },
        Err(e) => {
            let _ = events.send(Event::Error {
                message: e.to_string(),
            });
        },
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("worker panicked: {message}")
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("worker panicked: {message}")
    } else {
        "worker panicked".into()
    }
}

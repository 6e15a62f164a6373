use std::{io::Write as _, path::PathBuf};

use {
    clap::{Parser, Subcommand},
    tokio_util::sync::CancellationToken,
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

use {
    sotto_config::SottoConfig,
    sotto_engines::{
        Backend, DetectionPrefs, EngineConfig, InitError,
        cache::{self, DownloadProgress},
        models::{self, ModelDef},
    },
};

#[derive(Parser)]
#[command(name = "sotto", about = "Sotto — on-device chat companion")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Force the CPU engine regardless of detected capabilities.
    #[arg(long, global = true, env = "SOTTO_FORCE_CPU")]
    cpu: bool,

    /// Custom model cache directory.
    #[arg(long, global = true, env = "SOTTO_CACHE_DIR")]
    cache_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start an interactive chat session (default when no subcommand given).
    Chat,
    /// List known models and their cache status.
    Models,
    /// Pre-download the configured model's artifact.
    Download {
        /// Backend to fetch for: "accelerated" or "cpu". Defaults to detection.
        #[arg(long)]
        backend: Option<String>,
    },
    /// Model cache management.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Show cached artifacts.
    Status,
    /// Delete all cached artifacts.
    Clear,
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    let registry = tracing_subscriber::registry().with(filter);

    if cli.json_logs {
        registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(false))
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true),
            )
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_telemetry(&cli);

    let mut config = sotto_config::discover_and_load();
    if cli.cpu {
        config.engine.force_cpu = true;
    }
    if let Some(dir) = &cli.cache_dir {
        config.engine.cache_dir = Some(dir.clone());
    }

    match cli.command.unwrap_or(Commands::Chat) {
        Commands::Chat => chat(&config).await,
        Commands::Models => {
            models_table(&config);
            Ok(())
        },
        Commands::Download { backend } => download(&config, backend.as_deref()).await,
        Commands::Cache { action } => match action {
            CacheAction::Status => {
                cache_status(&config);
                Ok(())
            },
            CacheAction::Clear => {
                let dir = EngineConfig::from_settings(&config).cache_dir;
                let removed = cache::clear_cache(&dir).await;
                println!("removed {removed} cached artifact(s)");
                Ok(())
            },
        },
    }
}

fn detection_prefs(config: &SottoConfig) -> DetectionPrefs {
    DetectionPrefs {
        force_cpu: config.engine.force_cpu,
        preferred: config.engine.backend.as_deref().and_then(Backend::parse),
    }
}

fn configured_model(config: &EngineConfig) -> anyhow::Result<&'static ModelDef> {
    models::find_model(&config.model_id)
        .ok_or_else(|| anyhow::anyhow!("unknown model '{}'; see `sotto models`", config.model_id))
}

fn print_download_progress(progress: DownloadProgress) {
    let mb = |bytes: u64| bytes / (1024 * 1024);
    match progress.total {
        Some(total) if total > 0 => eprint!(
            "\rdownloading {:>4}/{} MB ({:>3.0}%)",
            mb(progress.downloaded),
            mb(total),
            100.0 * progress.downloaded as f64 / total as f64
        ),
        _ => eprint!("\rdownloading {:>4} MB", mb(progress.downloaded)),
    }
    let _ = std::io::stderr().flush();
}

// ── Commands ────────────────────────────────────────────────────────────────

#[cfg(not(feature = "local-llm"))]
async fn chat(_config: &SottoConfig) -> anyhow::Result<()> {
    anyhow::bail!(
        "this build does not include the inference runtime; \
         rebuild with `cargo build --release --features local-llm`"
    );
}

#[cfg(feature = "local-llm")]
async fn chat(config: &SottoConfig) -> anyhow::Result<()> {
    use {
        sotto_chat::{ChatClient, StoredMessage},
        sotto_engines::{GenerateError, InferenceService, ProgressFn, TokenFn, llama},
        std::sync::{Arc, Mutex},
        tokio::io::AsyncBufReadExt,
    };

    let engine_config = EngineConfig::from_settings(config);
    let service = InferenceService::new(
        engine_config.clone(),
        detection_prefs(config),
        Arc::new(llama::LlamaRuntimeLoader),
    );
    let client = ChatClient::new(service, engine_config, config.chat.history_window);

    if !client.is_model_cached(None) {
        eprintln!("model not cached yet; the first start downloads several hundred MB (Ctrl-C cancels)");
    }

    let cancel_guard = client.clone();
    let ctrl_c_during_init = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel_guard.cancel_download();
        }
    });

    let on_progress: ProgressFn = Arc::new(|report| {
        eprint!("\r{:>3.0}% {}", report.fraction * 100.0, report.text);
        let _ = std::io::stderr().flush();
    });
    let init_result = client.initialize(on_progress).await;
    ctrl_c_during_init.abort();
    eprintln!();
    match init_result {
        Ok(()) => {},
        Err(InitError::Cancelled) => {
            eprintln!("download cancelled");
            return Ok(());
        },
        Err(e) => return Err(e.into()),
    }

    eprintln!("ready — empty line or /quit exits, Ctrl-C stops a reply");

    let mut history: Vec<StoredMessage> = Vec::new();
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();

    loop {
        print!("you › ");
        let _ = std::io::stdout().flush();
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim().to_string();
        if line.is_empty() || line == "/quit" || line == "/exit" {
            break;
        }
        if line == "/clear" {
            history.clear();
            eprintln!("(history cleared)");
            continue;
        }

        history.push(StoredMessage::user(line));
        print!("sotto › ");
        let _ = std::io::stdout().flush();

        let partial = Arc::new(Mutex::new(String::new()));
        let partial_sink = Arc::clone(&partial);
        let on_token: TokenFn = Arc::new(move |piece: &str| {
            print!("{piece}");
            let _ = std::io::stdout().flush();
            if let Ok(mut text) = partial_sink.lock() {
                text.push_str(piece);
            }
        });

        let turn_client = client.clone();
        let snapshot = history.clone();
        let mut turn =
            tokio::spawn(async move { turn_client.send_message(&snapshot, None, on_token).await });

        let result = tokio::select! {
            result = &mut turn => result,
            _ = tokio::signal::ctrl_c() => {
                client.stop_generation();
                turn.await
            },
        }?;

        match result {
            Ok(text) => {
                println!();
                history.push(StoredMessage::assistant(text));
            },
            Err(GenerateError::Aborted) => {
                println!(" (stopped)");
                let text = partial.lock().map(|t| t.clone()).unwrap_or_default();
                if !text.is_empty() {
                    history.push(StoredMessage::assistant(text));
                }
            },
            Err(e) => {
                println!();
                eprintln!("error: {e}");
            },
        }
    }

    client.unload().await;
    Ok(())
}

fn models_table(config: &SottoConfig) {
    let engine_config = EngineConfig::from_settings(config);
    println!(
        "  {:<34} {:<34} {:>7}  {}",
        "ID", "NAME", "MIN RAM", "CACHED"
    );
    for model in models::MODEL_REGISTRY {
        let accelerated = cache::is_model_cached(model, Backend::Accelerated, &engine_config.cache_dir);
        let cpu = cache::is_model_cached(model, Backend::Cpu, &engine_config.cache_dir);
        let cached = match (accelerated, cpu) {
            (true, true) => "accelerated, cpu",
            (true, false) => "accelerated",
            (false, true) => "cpu",
            (false, false) => "-",
        };
        let marker = if model.id == engine_config.model_id {
            "*"
        } else {
            " "
        };
        println!(
            "{} {:<34} {:<34} {:>6}G  {}",
            marker, model.id, model.display_name, model.min_ram_gb, cached
        );
    }
}

async fn download(config: &SottoConfig, backend: Option<&str>) -> anyhow::Result<()> {
    let engine_config = EngineConfig::from_settings(config);
    let model = configured_model(&engine_config)?;

    let backend = match backend {
        Some(raw) => Backend::parse(raw)
            .ok_or_else(|| anyhow::anyhow!("unknown backend '{raw}' (accelerated|cpu)"))?,
        None => sotto_engines::detect::detect_backend(detection_prefs(config)).await,
    };

    if cache::is_model_cached(model, backend, &engine_config.cache_dir) {
        println!("{} is already cached for the {backend} engine", model.id);
        return Ok(());
    }

    let cancel = CancellationToken::new();
    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c_cancel.cancel();
        }
    });

    let result = cache::ensure_artifact(
        model,
        backend,
        &engine_config.cache_dir,
        &mut print_download_progress,
        &cancel,
    )
    .await;
    eprintln!();

    match result {
        Ok(path) => {
            println!("downloaded to {}", path.display());
            Ok(())
        },
        Err(InitError::Cancelled) => {
            println!("download cancelled");
            Ok(())
        },
        Err(e) => Err(e.into()),
    }
}

fn cache_status(config: &SottoConfig) {
    let engine_config = EngineConfig::from_settings(config);
    let manifest = cache::load_manifest(&engine_config.cache_dir);

    println!("cache dir: {}", engine_config.cache_dir.display());
    if manifest.entries.is_empty() {
        println!("no cached artifacts");
        return;
    }
    for entry in &manifest.entries {
        println!(
            "{:<34} {:<12} {:>6} MB  {}",
            entry.model_id,
            entry.backend.as_str(),
            entry.size_bytes / (1024 * 1024),
            entry.filename
        );
    }
}

//! Config discovery, loading, env overrides, and standard directories.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::schema::SottoConfig;

const CONFIG_FILENAME: &str = "sotto.toml";

/// Load config from the given TOML file.
pub fn load_config(path: &Path) -> anyhow::Result<SottoConfig> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
    Ok(toml::from_str(&raw)?)
}

/// Discover and load config from standard locations, then apply env overrides.
///
/// Search order:
/// 1. `./sotto.toml` (project-local)
/// 2. `~/.config/sotto/sotto.toml` (user-global)
///
/// Returns `SottoConfig::default()` if no config file is found or a found one
/// fails to parse.
pub fn discover_and_load() -> SottoConfig {
    let mut config = if let Some(path) = find_config_file() {
        debug!(path = %path.display(), "loading config");
        match load_config(&path) {
            Ok(cfg) => cfg,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to load config, using defaults");
                SottoConfig::default()
            },
        }
    } else {
        debug!("no config file found, using defaults");
        SottoConfig::default()
    };
    apply_env_overrides(&mut config);
    config
}

/// Apply `SOTTO_*` environment overrides on top of a loaded config.
pub fn apply_env_overrides(config: &mut SottoConfig) {
    if let Ok(value) = std::env::var("SOTTO_FORCE_CPU")
        && matches!(value.trim(), "1" | "true" | "yes")
    {
        config.engine.force_cpu = true;
    }
    if let Ok(value) = std::env::var("SOTTO_MODEL")
        && !value.trim().is_empty()
    {
        config.model.id = value.trim().to_string();
    }
    if let Ok(value) = std::env::var("SOTTO_CACHE_DIR")
        && !value.trim().is_empty()
    {
        config.engine.cache_dir = Some(PathBuf::from(value));
    }
}

/// Find the first config file in standard locations.
fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from(CONFIG_FILENAME);
    if local.exists() {
        return Some(local);
    }

    if let Some(dir) = config_dir() {
        let global = dir.join(CONFIG_FILENAME);
        if global.exists() {
            return Some(global);
        }
    }

    None
}

/// Returns the user-global config directory (`~/.config/sotto/`).
pub fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "sotto").map(|d| d.config_dir().to_path_buf())
}

/// Returns the user-global data directory, used for the model cache.
///
/// Falls back to `./.sotto` when no home directory can be resolved.
pub fn data_dir() -> PathBuf {
    directories::ProjectDirs::from("", "", "sotto")
        .map(|d| d.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".sotto"))
}

/// Serialize `config` to TOML and write it to the user-global config path.
///
/// Creates parent directories if needed. Returns the path written to.
pub fn save_config(config: &SottoConfig) -> anyhow::Result<PathBuf> {
    let path = config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(CONFIG_FILENAME);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let toml_str =
        toml::to_string_pretty(config).map_err(|e| anyhow::anyhow!("serialize config: {e}"))?;
    std::fs::write(&path, toml_str)?;
    debug!(path = %path.display(), "saved config");
    Ok(path)
}

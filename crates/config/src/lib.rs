//! Configuration loading and schema for the sotto chat app.
//!
//! Config file: `sotto.toml`, searched in `./` then `~/.config/sotto/`.
//! Environment overrides: `SOTTO_FORCE_CPU`, `SOTTO_MODEL`, `SOTTO_CACHE_DIR`.

pub mod loader;
pub mod schema;

pub use {
    loader::{
        apply_env_overrides, config_dir, data_dir, discover_and_load, load_config, save_config,
    },
    schema::{ChatSettings, EngineSettings, ModelSettings, SottoConfig},
};

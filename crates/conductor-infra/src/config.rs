//! Engine configuration loader for Conductor.
//!
//! Reads `config.toml` from the data directory (`~/.conductor/` in
//! production) and deserializes it into [`EngineConfig`]. Falls back to
//! defaults when the file is missing, malformed, or fails validation.

use std::path::{Path, PathBuf};

use conductor_types::config::EngineConfig;

/// Name of the data-directory override variable.
pub const DATA_DIR_ENV: &str = "CONDUCTOR_DATA_DIR";

/// Load engine configuration from `{data_dir}/config.toml`.
///
/// - Missing file: [`EngineConfig::default()`].
/// - Unreadable, unparseable, or invalid file: logs a warning and returns
///   the default.
pub async fn load_engine_config(data_dir: &Path) -> EngineConfig {
    let config_path = data_dir.join("config.toml");

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config.toml found at {}, using defaults", config_path.display());
            return EngineConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            return EngineConfig::default();
        }
    };

    let config = match toml::from_str::<EngineConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!("Failed to parse {}: {err}, using defaults", config_path.display());
            return EngineConfig::default();
        }
    };

    match config.validate() {
        Ok(()) => config,
        Err(err) => {
            tracing::warn!("Invalid {}: {err}, using defaults", config_path.display());
            EngineConfig::default()
        }
    }
}

/// Resolve the data directory.
///
/// Priority:
/// 1. `CONDUCTOR_DATA_DIR` environment variable
/// 2. `~/.conductor`
/// 3. `.conductor` in the current directory
pub fn resolve_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
        return PathBuf::from(dir);
    }
    if let Some(home) = dirs::home_dir() {
        return home.join(".conductor");
    }
    PathBuf::from(".conductor")
}

/// Directory holding run state documents: `state_dir` from the config when
/// set (relative paths are taken from the data directory), else
/// `{data_dir}/state`.
pub fn resolve_state_dir(config: &EngineConfig, data_dir: &Path) -> PathBuf {
    match &config.state_dir {
        Some(dir) if dir.is_absolute() => dir.clone(),
        Some(dir) => data_dir.join(dir),
        None => data_dir.join("state"),
    }
}

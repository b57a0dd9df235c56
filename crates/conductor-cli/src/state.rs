//! Application state wiring the engine for CLI commands.

use std::path::PathBuf;

use conductor_infra::config::{load_engine_config, resolve_data_dir, resolve_state_dir};
use conductor_infra::engine::Engine;
use conductor_types::config::EngineConfig;

pub struct AppState {
    pub state_dir: PathBuf,
    pub config: EngineConfig,
    pub engine: Engine,
}

impl AppState {
    /// Load config from the data directory and build the engine.
    pub async fn init(data_dir: Option<PathBuf>) -> anyhow::Result<Self> {
        let data_dir = data_dir.unwrap_or_else(resolve_data_dir);
        tokio::fs::create_dir_all(&data_dir).await?;

        let config = load_engine_config(&data_dir).await;
        let state_dir = resolve_state_dir(&config, &data_dir);
        tokio::fs::create_dir_all(&state_dir).await?;

        let engine = Engine::build(config.clone(), &state_dir).await?;
        tracing::debug!(data_dir = %data_dir.display(), state_dir = %state_dir.display(), "engine ready");

        Ok(Self {
            state_dir,
            config,
            engine,
        })
    }
}

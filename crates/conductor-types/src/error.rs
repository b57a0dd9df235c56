use thiserror::Error;

/// Errors related to engine or plugin configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration value for '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("failed to parse configuration: {0}")]
    Parse(String),

    #[error("invalid sandbox policy: {0}")]
    Sandbox(String),
}

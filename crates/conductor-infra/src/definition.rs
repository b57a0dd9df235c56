//! Workflow definition files.
//!
//! Definitions are JSON or YAML. The format follows the file extension;
//! files with any other extension are sniffed by their first significant
//! character.

use std::path::Path;

use anyhow::{Context, Result, bail};
use conductor_types::workflow::WorkflowDefinition;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefinitionFormat {
    Json,
    Yaml,
}

impl DefinitionFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()?.to_ascii_lowercase().as_str() {
            "json" => Some(Self::Json),
            "yaml" | "yml" => Some(Self::Yaml),
            _ => None,
        }
    }

    /// Guess from content: a document opening with `{` is JSON.
    pub fn sniff(content: &str) -> Self {
        if content.trim_start().starts_with('{') {
            Self::Json
        } else {
            Self::Yaml
        }
    }
}

pub fn parse_definition(content: &str, format: DefinitionFormat) -> Result<WorkflowDefinition> {
    let definition = match format {
        DefinitionFormat::Json => {
            serde_json::from_str(content).context("invalid JSON workflow definition")?
        }
        DefinitionFormat::Yaml => {
            serde_yaml_ng::from_str(content).context("invalid YAML workflow definition")?
        }
    };
    Ok(definition)
}

/// Read and parse the definition at `path`.
pub async fn load_definition(path: &Path) -> Result<WorkflowDefinition> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    if content.trim().is_empty() {
        bail!("{} is empty", path.display());
    }
    let format = DefinitionFormat::from_path(path).unwrap_or_else(|| DefinitionFormat::sniff(&content));
    let definition = parse_definition(&content, format)
        .with_context(|| format!("failed to load workflow from {}", path.display()))?;
    tracing::debug!(
        path = %path.display(),
        workflow = definition.name.as_str(),
        steps = definition.steps.len(),
        "loaded workflow definition"
    );
    Ok(definition)
}

use std::path::Path;

use anyhow::{Context, Result};
use toolflow_core::FlowDefinition;

use crate::startup::StartupContext;

/// Parse `path` and check it against the configured retry defaults.
pub fn handle_validate_command(startup: &StartupContext, path: &Path) -> Result<FlowDefinition> {
    let resolved = startup.workspace.join(path);
    let flow = FlowDefinition::load(&resolved)
        .with_context(|| format!("Failed to load flow '{}'", path.display()))?;
    flow.validate(&startup.config.retry)
        .with_context(|| format!("Flow '{}' is invalid", path.display()))?;
    tracing::debug!(steps = flow.len(), path = %resolved.display(), "flow validated");
    Ok(flow)
}

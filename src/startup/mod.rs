use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use toolflow_core::config::{ConfigLayerSource, ConfigLoader};
use toolflow_core::ToolflowConfig;

/// Workspace and configuration resolved once per invocation.
#[derive(Debug, Clone)]
pub struct StartupContext {
    pub workspace: PathBuf,
    pub config: ToolflowConfig,
    pub layers: Vec<ConfigLayerSource>,
}

impl StartupContext {
    /// `config_path` replaces the user and workspace layers; otherwise the
    /// home directory and `TOOLFLOW_CONFIG_PATH` are consulted.
    pub fn load(workspace: &Path, config_path: Option<&Path>) -> Result<Self> {
        if !workspace.is_dir() {
            bail!("Workspace '{}' is not a directory", workspace.display());
        }
        let workspace = workspace
            .canonicalize()
            .with_context(|| format!("Failed to resolve workspace '{}'", workspace.display()))?;

        let loader = match config_path {
            Some(path) => ConfigLoader::new(&workspace).with_explicit(Some(path.to_path_buf())),
            None => ConfigLoader::from_env(&workspace),
        };
        let loaded = loader.load()?;

        Ok(Self {
            workspace,
            config: loaded.config,
            layers: loaded.layers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_fs::TempDir;
    use assert_fs::prelude::*;

    #[test]
    fn explicit_config_is_used() {
        let dir = TempDir::new().unwrap();
        let config = dir.child("custom.toml");
        config.write_str("[read_file]\nmax_bytes = 99\n").unwrap();

        let startup = StartupContext::load(dir.path(), Some(config.path())).unwrap();
        assert_eq!(startup.config.read_file.max_bytes, 99);
        assert_eq!(startup.layers.len(), 1);
    }

    #[test]
    fn missing_workspace_is_rejected() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("absent");
        assert!(StartupContext::load(&missing, None).is_err());
    }
}

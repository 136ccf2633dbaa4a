//! Layered TOML configuration.
//!
//! Built-in defaults are overlaid by `~/.toolflow/toolflow.toml` and then by
//! `<workspace>/toolflow.toml`. Setting `TOOLFLOW_CONFIG_PATH` replaces both
//! file layers with a single explicit file.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};
use toolflow_bash_runner::ShellKind;
use toolflow_bash_runner::policy::DEFAULT_DENY_PATTERNS;
use toolflow_bash_runner::retry::{
    DEFAULT_INITIAL_DELAY, DEFAULT_JITTER, DEFAULT_MAX_DELAY, DEFAULT_MULTIPLIER, MAX_MULTIPLIER,
};

pub const CONFIG_FILE_NAME: &str = "toolflow.toml";
pub const CONFIG_PATH_ENV: &str = "TOOLFLOW_CONFIG_PATH";
const HOME_CONFIG_DIR: &str = ".toolflow";

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct ToolflowConfig {
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub retry: RetryDefaults,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub read_file: ReadFileConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub debug: DebugConfig,
}

impl ToolflowConfig {
    pub fn validate(&self) -> Result<()> {
        self.execution.validate()?;
        self.retry.validate()?;
        self.policy.validate()?;
        self.read_file.validate()?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ExecutionConfig {
    /// Timeout applied to shell steps without `timeoutMs`. 0 disables it.
    #[serde(default = "ExecutionConfig::default_timeout_ms")]
    pub default_timeout_ms: u64,
    /// Force a shell dialect instead of detecting the host.
    #[serde(default)]
    pub shell: Option<ShellKind>,
    /// Per-stream capture limit for command output.
    #[serde(default = "ExecutionConfig::default_max_output_bytes")]
    pub max_output_bytes: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: Self::default_timeout_ms(),
            shell: None,
            max_output_bytes: Self::default_max_output_bytes(),
        }
    }
}

impl ExecutionConfig {
    const fn default_timeout_ms() -> u64 {
        120_000
    }

    const fn default_max_output_bytes() -> usize {
        256 * 1024
    }

    pub fn default_timeout(&self) -> Option<Duration> {
        (self.default_timeout_ms > 0).then(|| Duration::from_millis(self.default_timeout_ms))
    }

    pub fn shell(&self) -> ShellKind {
        self.shell.unwrap_or_else(ShellKind::host)
    }

    fn validate(&self) -> Result<()> {
        ensure!(
            self.max_output_bytes >= 1024,
            "execution.max_output_bytes must be at least 1024"
        );
        Ok(())
    }
}

/// Defaults for retry fields a flow's retry block leaves out.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RetryDefaults {
    #[serde(default = "RetryDefaults::default_delay_ms")]
    pub delay_ms: u64,
    #[serde(default = "RetryDefaults::default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "RetryDefaults::default_jitter")]
    pub jitter: f64,
    #[serde(default = "RetryDefaults::default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryDefaults {
    fn default() -> Self {
        Self {
            delay_ms: Self::default_delay_ms(),
            backoff_multiplier: Self::default_backoff_multiplier(),
            jitter: Self::default_jitter(),
            max_delay_ms: Self::default_max_delay_ms(),
        }
    }
}

impl RetryDefaults {
    fn default_delay_ms() -> u64 {
        u64::try_from(DEFAULT_INITIAL_DELAY.as_millis()).unwrap_or(1_000)
    }

    const fn default_backoff_multiplier() -> f64 {
        DEFAULT_MULTIPLIER
    }

    const fn default_jitter() -> f64 {
        DEFAULT_JITTER
    }

    fn default_max_delay_ms() -> u64 {
        u64::try_from(DEFAULT_MAX_DELAY.as_millis()).unwrap_or(30_000)
    }

    fn validate(&self) -> Result<()> {
        ensure!(
            (1.0..=MAX_MULTIPLIER).contains(&self.backoff_multiplier),
            "retry.backoff_multiplier must be between 1 and {MAX_MULTIPLIER}"
        );
        ensure!(
            (0.0..1.0).contains(&self.jitter),
            "retry.jitter must be at least 0 and below 1"
        );
        ensure!(
            self.delay_ms <= 60_000,
            "retry.delay_ms must not exceed 60000"
        );
        ensure!(self.max_delay_ms > 0, "retry.max_delay_ms must be positive");
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PolicyConfig {
    /// Regular expressions; a translated command matching any is denied.
    #[serde(default = "PolicyConfig::default_deny_patterns")]
    pub deny_patterns: Vec<String>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            deny_patterns: Self::default_deny_patterns(),
        }
    }
}

impl PolicyConfig {
    fn default_deny_patterns() -> Vec<String> {
        DEFAULT_DENY_PATTERNS.iter().map(|p| (*p).to_string()).collect()
    }

    fn validate(&self) -> Result<()> {
        for pattern in &self.deny_patterns {
            regex::Regex::new(pattern)
                .with_context(|| format!("policy.deny_patterns contains invalid regex `{pattern}`"))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ReadFileConfig {
    #[serde(default = "ReadFileConfig::default_max_bytes")]
    pub max_bytes: usize,
}

impl Default for ReadFileConfig {
    fn default() -> Self {
        Self {
            max_bytes: Self::default_max_bytes(),
        }
    }
}

impl ReadFileConfig {
    const fn default_max_bytes() -> usize {
        1024 * 1024
    }

    fn validate(&self) -> Result<()> {
        ensure!(self.max_bytes > 0, "read_file.max_bytes must be positive");
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    #[default]
    Mock,
    OpenAI,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub kind: ProviderKind,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    /// Environment variable holding the API key.
    #[serde(default = "ProviderConfig::default_api_key_env")]
    pub api_key_env: String,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: ProviderKind::default(),
            model: None,
            base_url: None,
            api_key_env: Self::default_api_key_env(),
        }
    }
}

impl ProviderConfig {
    fn default_api_key_env() -> String {
        "OPENAI_API_KEY".to_string()
    }

    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env)
            .ok()
            .filter(|key| !key.trim().is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DebugConfig {
    #[serde(default = "DebugConfig::default_trace_level")]
    pub trace_level: String,
    /// Extra `target=level` directives.
    #[serde(default)]
    pub trace_targets: Vec<String>,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            trace_level: Self::default_trace_level(),
            trace_targets: Vec::new(),
        }
    }
}

impl DebugConfig {
    fn default_trace_level() -> String {
        "warn".to_string()
    }

    /// `EnvFilter` directive string built from the configured level and targets.
    pub fn filter_directives(&self) -> String {
        std::iter::once(self.trace_level.clone())
            .chain(self.trace_targets.iter().cloned())
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Where a configuration layer came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigLayerSource {
    User(PathBuf),
    Workspace(PathBuf),
    Explicit(PathBuf),
}

impl ConfigLayerSource {
    pub fn path(&self) -> &Path {
        match self {
            Self::User(path) | Self::Workspace(path) | Self::Explicit(path) => path,
        }
    }
}

/// Resolves and merges configuration layers.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    workspace: PathBuf,
    home: Option<PathBuf>,
    explicit: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        Self {
            workspace: workspace.into(),
            home: None,
            explicit: None,
        }
    }

    /// Loader using the real home directory and `TOOLFLOW_CONFIG_PATH`.
    pub fn from_env(workspace: impl Into<PathBuf>) -> Self {
        let mut loader = Self::new(workspace);
        loader.home = dirs::home_dir();
        loader.explicit = std::env::var_os(CONFIG_PATH_ENV).map(PathBuf::from);
        loader
    }

    pub fn with_home(mut self, home: Option<PathBuf>) -> Self {
        self.home = home;
        self
    }

    pub fn with_explicit(mut self, path: Option<PathBuf>) -> Self {
        self.explicit = path;
        self
    }

    fn layer_paths(&self) -> Vec<ConfigLayerSource> {
        if let Some(explicit) = &self.explicit {
            return vec![ConfigLayerSource::Explicit(explicit.clone())];
        }
        let mut layers = Vec::new();
        if let Some(home) = &self.home {
            let path = home.join(HOME_CONFIG_DIR).join(CONFIG_FILE_NAME);
            if path.is_file() {
                layers.push(ConfigLayerSource::User(path));
            }
        }
        let path = self.workspace.join(CONFIG_FILE_NAME);
        if path.is_file() {
            layers.push(ConfigLayerSource::Workspace(path));
        }
        layers
    }

    pub fn load(&self) -> Result<LoadedConfig> {
        let mut merged = toml::Value::Table(toml::Table::new());
        let layers = self.layer_paths();
        for layer in &layers {
            let path = layer.path();
            let text = fs::read_to_string(path)
                .with_context(|| format!("failed to read config file {}", path.display()))?;
            let value: toml::Value = toml::from_str(&text)
                .with_context(|| format!("failed to parse config file {}", path.display()))?;
            tracing::debug!(path = %path.display(), "applying config layer");
            merge_toml_values(&mut merged, &value);
        }

        let config: ToolflowConfig = merged
            .try_into()
            .context("merged configuration does not match the expected schema")?;
        config.validate()?;
        Ok(LoadedConfig { config, layers })
    }
}

#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: ToolflowConfig,
    pub layers: Vec<ConfigLayerSource>,
}

/// Recursively merge `overlay` into `base`; tables merge key by key, any
/// other value replaces the base value.
pub fn merge_toml_values(base: &mut toml::Value, overlay: &toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base_table), toml::Value::Table(overlay_table)) => {
            for (key, value) in overlay_table {
                if let Some(base_value) = base_table.get_mut(key) {
                    merge_toml_values(base_value, value);
                } else {
                    base_table.insert(key.clone(), value.clone());
                }
            }
        }
        (base, overlay) => {
            *base = overlay.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_fs::TempDir;
    use assert_fs::prelude::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_are_valid() {
        let config = ToolflowConfig::default();
        config.validate().unwrap();
        assert_eq!(config.execution.default_timeout(), Some(Duration::from_secs(120)));
        assert_eq!(config.retry.backoff_multiplier, 2.0);
        assert_eq!(config.provider.kind, ProviderKind::Mock);
        assert!(!config.policy.deny_patterns.is_empty());
    }

    #[test]
    fn workspace_layer_overrides_user_layer() {
        let root = TempDir::new().unwrap();
        let home = root.child("home");
        home.child(".toolflow/toolflow.toml")
            .write_str("[retry]\njitter = 0.2\ndelay_ms = 500\n\n[provider]\nkind = \"openai\"\n")
            .unwrap();
        let workspace = root.child("ws");
        workspace
            .child("toolflow.toml")
            .write_str("[retry]\ndelay_ms = 250\n\n[read_file]\nmax_bytes = 4096\n")
            .unwrap();

        let loaded = ConfigLoader::new(workspace.path())
            .with_home(Some(home.path().to_path_buf()))
            .load()
            .unwrap();

        assert_eq!(loaded.layers.len(), 2);
        assert!(matches!(loaded.layers[0], ConfigLayerSource::User(_)));
        assert!(matches!(loaded.layers[1], ConfigLayerSource::Workspace(_)));
        assert_eq!(loaded.config.retry.jitter, 0.2);
        assert_eq!(loaded.config.retry.delay_ms, 250);
        assert_eq!(loaded.config.read_file.max_bytes, 4096);
        assert_eq!(loaded.config.provider.kind, ProviderKind::OpenAI);
        assert_eq!(loaded.config.execution, ExecutionConfig::default());
    }

    #[test]
    fn explicit_path_replaces_file_layers() {
        let root = TempDir::new().unwrap();
        root.child("toolflow.toml")
            .write_str("[read_file]\nmax_bytes = 1\n")
            .unwrap();
        let explicit = root.child("custom.toml");
        explicit.write_str("[execution]\ndefault_timeout_ms = 0\n").unwrap();

        let loaded = ConfigLoader::new(root.path())
            .with_explicit(Some(explicit.path().to_path_buf()))
            .load()
            .unwrap();
        assert_eq!(loaded.layers, vec![ConfigLayerSource::Explicit(explicit.path().to_path_buf())]);
        assert_eq!(loaded.config.execution.default_timeout(), None);
        assert_eq!(loaded.config.read_file.max_bytes, ReadFileConfig::default().max_bytes);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let root = TempDir::new().unwrap();
        root.child("toolflow.toml")
            .write_str("[retry]\njitter = 1.5\n")
            .unwrap();
        let err = ConfigLoader::new(root.path()).load().unwrap_err();
        assert!(err.to_string().contains("retry.jitter"));

        root.child("toolflow.toml")
            .write_str("[policy]\ndeny_patterns = [\"(unclosed\"]\n")
            .unwrap();
        assert!(ConfigLoader::new(root.path()).load().is_err());
    }

    #[test]
    fn merge_replaces_scalars_and_merges_tables() {
        let mut base: toml::Value = toml::from_str("[a]\nx = 1\ny = 2\n[b]\nz = 3\n").unwrap();
        let overlay: toml::Value = toml::from_str("[a]\ny = 20\nw = 4\n").unwrap();
        merge_toml_values(&mut base, &overlay);
        let expected: toml::Value =
            toml::from_str("[a]\nx = 1\ny = 20\nw = 4\n[b]\nz = 3\n").unwrap();
        assert_eq!(base, expected);
    }

    #[test]
    fn debug_directives_join_level_and_targets() {
        let debug = DebugConfig {
            trace_level: "info".into(),
            trace_targets: vec!["toolflow_core=debug".into()],
        };
        assert_eq!(debug.filter_directives(), "info,toolflow_core=debug");
    }
}

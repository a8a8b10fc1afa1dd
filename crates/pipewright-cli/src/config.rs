//! CLI configuration management.

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// CLI configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CliConfig {
    /// Used when neither the pipeline nor a flag bounds concurrency.
    #[serde(default = "default_max_parallel")]
    pub max_parallel: u32,
    /// Directory steps run in. Defaults to the current directory.
    #[serde(default)]
    pub workspace: Option<PathBuf>,
    /// Persist artifacts here. Unset keeps them in memory for the run.
    #[serde(default)]
    pub artifacts_dir: Option<PathBuf>,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_format: LogFormat,
}

fn default_max_parallel() -> u32 {
    4
}

fn default_retention_days() -> u32 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
            workspace: None,
            artifacts_dir: None,
            retention_days: default_retention_days(),
            log_level: default_log_level(),
            log_format: LogFormat::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl CliConfig {
    /// Load configuration from the platform config directory.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load configuration, falling back to defaults. The load error is
    /// returned so it can be reported once logging is up.
    pub fn load_or_default() -> (Self, Option<anyhow::Error>) {
        Self::or_default(Self::config_path().and_then(|path| Self::load_from(&path)))
    }

    fn or_default(loaded: Result<Self>) -> (Self, Option<anyhow::Error>) {
        match loaded {
            Ok(config) => (config, None),
            Err(e) => (Self::default(), Some(e)),
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&content).with_context(|| format!("parsing {}", path.display()))
    }

    /// Save configuration to the platform config directory.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_yaml::to_string(self)?)?;
        Ok(())
    }

    /// Get the configuration file path.
    pub fn config_path() -> Result<PathBuf> {
        let dirs = directories::ProjectDirs::from("dev", "pipewright", "pipewright")
            .ok_or_else(|| anyhow!("could not determine config directory"))?;
        Ok(dirs.config_dir().join("config.yaml"))
    }

    /// Set a configuration value.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "max_parallel" => {
                let n: u32 = value.parse().with_context(|| format!("invalid max_parallel: {value}"))?;
                if n == 0 {
                    bail!("max_parallel must be at least 1");
                }
                self.max_parallel = n;
            }
            "workspace" => self.workspace = optional_path(value),
            "artifacts_dir" => self.artifacts_dir = optional_path(value),
            "retention_days" => {
                self.retention_days = value
                    .parse()
                    .with_context(|| format!("invalid retention_days: {value}"))?;
            }
            "log_level" => self.log_level = value.to_string(),
            "log_format" => {
                self.log_format = match value {
                    "text" => LogFormat::Text,
                    "json" => LogFormat::Json,
                    _ => bail!("invalid log format: {value}"),
                };
            }
            _ => bail!("unknown config key: {key}"),
        }
        Ok(())
    }
}

/// Empty string clears the setting.
fn optional_path(value: &str) -> Option<PathBuf> {
    (!value.is_empty()).then(|| PathBuf::from(value))
}

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::services::analysis::CfgOptions;

/// Environment variable holding the address-space ceiling in bytes.
pub const MEM_LIMIT_ENV: &str = "DRILLER_MEM_LIMIT";
/// Environment variable holding the wall-clock budget in seconds.
pub const TIMEOUT_ENV: &str = "DRILLER_DICTIONARY_TIMEOUT";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config {path}: {reason}")]
    Parse { path: PathBuf, reason: String },
    #[error("Invalid value for {key}: {value:?}")]
    InvalidValue { key: String, value: String },
}

/// Process resource limits applied before analysis. `None` means unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Address-space ceiling in bytes.
    pub mem_limit: Option<u64>,
    /// Seconds until the process is interrupted.
    pub timeout_secs: Option<u32>,
}

impl ResourceLimits {
    /// Read limits from `DRILLER_MEM_LIMIT` / `DRILLER_DICTIONARY_TIMEOUT`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as `from_env`, with an injectable variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        Ok(Self {
            mem_limit: parse_var(MEM_LIMIT_ENV, lookup(MEM_LIMIT_ENV))?,
            timeout_secs: parse_var(TIMEOUT_ENV, lookup(TIMEOUT_ENV))?,
        })
    }

    /// Fields set in `other` win over fields set in `self`.
    pub fn overlay(self, other: ResourceLimits) -> Self {
        Self {
            mem_limit: other.mem_limit.or(self.mem_limit),
            timeout_secs: other.timeout_secs.or(self.timeout_secs),
        }
    }
}

fn parse_var<T: std::str::FromStr>(
    key: &str,
    raw: Option<String>,
) -> Result<Option<T>, ConfigError> {
    let Some(raw) = raw else { return Ok(None) };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    trimmed
        .parse()
        .map(Some)
        .map_err(|_| ConfigError::InvalidValue { key: key.to_string(), value: raw.clone() })
}

/// Settings file accepted by `--config` (JSON, or YAML for `.yaml`/`.yml`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DictConfig {
    #[serde(default)]
    pub mem_limit: Option<u64>,
    /// Seconds; named after the setting it replaces in campaign configs.
    #[serde(default)]
    pub dictionary_timeout: Option<u32>,
    #[serde(default)]
    pub backend: Option<String>,
    #[serde(default)]
    pub backend_path: Option<PathBuf>,
    #[serde(default)]
    pub arch: Option<String>,
    #[serde(default)]
    pub max_instructions: Option<usize>,
    #[serde(default)]
    pub keep_input_state: Option<bool>,
    #[serde(default)]
    pub advanced_backward_slicing: Option<bool>,
}

impl DictConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let body = fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        );
        let parsed = if is_yaml {
            serde_yaml::from_str(&body).map_err(|e| e.to_string())
        } else {
            serde_json::from_str(&body).map_err(|e| e.to_string())
        };
        parsed.map_err(|reason| ConfigError::Parse { path: path.to_path_buf(), reason })
    }

    pub fn limits(&self) -> ResourceLimits {
        ResourceLimits { mem_limit: self.mem_limit, timeout_secs: self.dictionary_timeout }
    }

    /// CFG options with config overrides applied to the defaults.
    pub fn cfg_options(&self) -> CfgOptions {
        let defaults = CfgOptions::default();
        CfgOptions {
            keep_input_state: self.keep_input_state.unwrap_or(defaults.keep_input_state),
            advanced_backward_slicing: self
                .advanced_backward_slicing
                .unwrap_or(defaults.advanced_backward_slicing),
            max_instructions: self.max_instructions.or(defaults.max_instructions),
        }
    }
}

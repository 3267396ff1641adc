//! Worker configuration
//!
//! Defaults, then an optional YAML file (schema `version: 1`), then
//! environment overrides, then `validate()`.

use crate::error::{OrchestratorError, Result};
use crate::stage::StageId;
use crate::stages::RetryPolicy;
use crate::worker::WorkerSettings;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const SUPPORTED_VERSION: u32 = 1;

pub const ENV_NORMALIZE_URL: &str = "NORMALIZATION_SERVICE_URL";
pub const ENV_EXTRACT_GRAPH_URL: &str = "PDG_GENERATOR_SERVICE_URL";
pub const ENV_BUILD_IMAGE_URL: &str = "IMAGE_GENERATOR_SERVICE_URL";
pub const ENV_CLASSIFY_URL: &str = "PREDICTION_SERVICE_URL";
pub const ENV_DATABASE: &str = "VULSCAN_DATABASE";
pub const ENV_WORK_DIR: &str = "VULSCAN_WORK_DIR";
pub const ENV_STAGE_TIMEOUT_MS: &str = "VULSCAN_STAGE_TIMEOUT_MS";

/// Base URLs of the four stage services
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageEndpoints {
    pub normalize: String,
    pub extract_graph: String,
    pub build_image: String,
    pub classify: String,
}

impl Default for StageEndpoints {
    fn default() -> Self {
        Self {
            normalize: "http://normalization:5001".to_string(),
            extract_graph: "http://pdg-generator:5002".to_string(),
            build_image: "http://image-generator:5003".to_string(),
            classify: "http://prediction:5004".to_string(),
        }
    }
}

impl StageEndpoints {
    pub fn base_url(&self, stage: StageId) -> &str {
        match stage {
            StageId::Normalize => &self.normalize,
            StageId::ExtractGraph => &self.extract_graph,
            StageId::BuildImage => &self.build_image,
            StageId::Classify => &self.classify,
        }
    }

    fn base_url_mut(&mut self, stage: StageId) -> &mut String {
        match stage {
            StageId::Normalize => &mut self.normalize,
            StageId::ExtractGraph => &mut self.extract_graph,
            StageId::BuildImage => &mut self.build_image,
            StageId::Classify => &mut self.classify,
        }
    }

    fn env_var(stage: StageId) -> &'static str {
        match stage {
            StageId::Normalize => ENV_NORMALIZE_URL,
            StageId::ExtractGraph => ENV_EXTRACT_GRAPH_URL,
            StageId::BuildImage => ENV_BUILD_IMAGE_URL,
            StageId::Classify => ENV_CLASSIFY_URL,
        }
    }
}

fn default_stage_timeout_ms() -> u64 {
    300_000
}

fn default_file_concurrency() -> usize {
    1
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("vulscan-work")
}

fn default_database_path() -> PathBuf {
    PathBuf::from("vulscan.db")
}

/// YAML schema v1
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkerConfig {
    /// Schema version (always 1 for v1)
    pub version: u32,

    #[serde(default)]
    pub stages: StageEndpoints,

    /// Per stage call
    #[serde(default = "default_stage_timeout_ms")]
    pub stage_timeout_ms: u64,

    #[serde(default)]
    pub retry: RetryPolicy,

    /// Files of one scan processed at once (1 = strictly sequential)
    #[serde(default = "default_file_concurrency")]
    pub file_concurrency: usize,

    /// 0 = unbounded
    #[serde(default)]
    pub max_concurrent_scans: usize,

    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,

    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            version: SUPPORTED_VERSION,
            stages: StageEndpoints::default(),
            stage_timeout_ms: default_stage_timeout_ms(),
            retry: RetryPolicy::default(),
            file_concurrency: default_file_concurrency(),
            max_concurrent_scans: 0,
            work_dir: default_work_dir(),
            database_path: default_database_path(),
        }
    }
}

impl WorkerConfig {
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: WorkerConfig = serde_yaml::from_str(content)?;

        if config.version != SUPPORTED_VERSION {
            return Err(OrchestratorError::config(format!(
                "Unsupported config version {} (supported: {})",
                config.version, SUPPORTED_VERSION
            )));
        }

        Ok(config)
    }

    pub fn from_yaml(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup`; empty values are ignored
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        for stage in StageId::CHAIN {
            if let Some(url) = get(StageEndpoints::env_var(stage)) {
                *self.stages.base_url_mut(stage) = url;
            }
        }

        if let Some(path) = get(ENV_DATABASE) {
            self.database_path = PathBuf::from(path);
        }

        if let Some(dir) = get(ENV_WORK_DIR) {
            self.work_dir = PathBuf::from(dir);
        }

        if let Some(raw) = get(ENV_STAGE_TIMEOUT_MS) {
            self.stage_timeout_ms = raw.trim().parse().map_err(|e| {
                OrchestratorError::config(format!("{}={}: {}", ENV_STAGE_TIMEOUT_MS, raw, e))
            })?;
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.stage_timeout_ms == 0 {
            return Err(OrchestratorError::config("stage_timeout_ms must be > 0"));
        }
        if self.file_concurrency == 0 {
            return Err(OrchestratorError::config("file_concurrency must be > 0"));
        }
        if self.retry.max_attempts == 0 {
            return Err(OrchestratorError::config("retry.max_attempts must be > 0"));
        }
        for stage in StageId::CHAIN {
            if self.stages.base_url(stage).trim().is_empty() {
                return Err(OrchestratorError::config(format!(
                    "Missing service URL for stage {}",
                    stage
                )));
            }
        }
        Ok(())
    }

    /// Defaults or `path`, then environment, then validation
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_yaml(path)?,
            None => Self::default(),
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn stage_timeout(&self) -> Duration {
        Duration::from_millis(self.stage_timeout_ms)
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            stage_timeout: self.stage_timeout(),
            retry: self.retry.clone(),
            file_concurrency: self.file_concurrency,
            work_dir: self.work_dir.clone(),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry.clone()
    }
}

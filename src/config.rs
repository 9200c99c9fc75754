use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::prompting::PromptFamily;

pub const DEFAULT_CONFIG_PATH: &str = "agents.json";
pub const DEFAULT_REPORT_PATH: &str = "analysis_report.txt";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("could not open config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid TOML config: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid JSON config: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct AgentSpec {
    pub name: String,
    pub role_system: String,
    pub role_user: String,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Local,
    Remote,
}

/// What happens to the rest of the agents when one fails.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Keep going; the failed agent gets an error placeholder.
    #[default]
    Isolate,
    /// Stop at the first failure.
    Abort,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RemoteDispatch {
    #[default]
    Sequential,
    Concurrent,
}

/// Local model parameters. Read-only once built.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelConfig {
    pub model_path: PathBuf,
    pub context_length: usize,
    pub threads: usize,
    /// Advisory only; prefill always submits the whole prompt.
    pub batch_size: usize,
    pub use_gpu: bool,
    pub gpu_layers: u32,
    pub tokenizer_path: Option<PathBuf>,
    pub tokenizer_repo: Option<String>,
    pub family: Option<PromptFamily>,
    pub chat_template: Option<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::new(),
            context_length: 2048,
            threads: 4,
            batch_size: 512,
            use_gpu: false,
            gpu_layers: 0,
            tokenizer_path: None,
            tokenizer_repo: None,
            family: None,
            chat_template: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct LocalSection {
    pub context_length: usize,
    pub threads: usize,
    pub batch_size: usize,
    pub use_gpu: bool,
    pub gpu_layers: u32,
    pub tokenizer: Option<PathBuf>,
    pub tokenizer_repo: Option<String>,
    pub family: Option<PromptFamily>,
    pub chat_template: Option<String>,
}

impl Default for LocalSection {
    fn default() -> Self {
        let model = ModelConfig::default();
        Self {
            context_length: model.context_length,
            threads: model.threads,
            batch_size: model.batch_size,
            use_gpu: model.use_gpu,
            gpu_layers: model.gpu_layers,
            tokenizer: None,
            tokenizer_repo: None,
            family: None,
            chat_template: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct RemoteConfig {
    pub base_url: String,
    pub timeout_secs: u64,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub temperature: f32,
    pub dispatch: RemoteDispatch,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            timeout_secs: 30,
            max_attempts: 3,
            base_delay_ms: 1000,
            temperature: 0.2,
            dispatch: RemoteDispatch::Sequential,
        }
    }
}

fn default_max_tokens() -> usize {
    1024
}

fn default_batch_size() -> usize {
    1
}

fn default_report_path() -> PathBuf {
    PathBuf::from(DEFAULT_REPORT_PATH)
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct AppConfig {
    /// GGUF path for the local backend, model name for the remote one.
    pub model: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    pub agents: Vec<AgentSpec>,
    #[serde(default)]
    pub backend: BackendKind,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    #[serde(default = "default_report_path")]
    pub report_path: PathBuf,
    #[serde(default)]
    pub local: LocalSection,
    #[serde(default)]
    pub remote: RemoteConfig,
}

impl AppConfig {
    /// Loads `path` as JSON when it ends in `.json`, TOML otherwise.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        let mut config = if is_json {
            Self::from_json(&raw)?
        } else {
            Self::from_toml(&raw)?
        };
        config.model = resolve_model_path(&config.model);
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.model.trim().is_empty() {
            return Err(ConfigError::Invalid("model must not be empty".to_string()));
        }
        if self.agents.is_empty() {
            return Err(ConfigError::Invalid("at least one agent is required".to_string()));
        }
        if let Some(agent) = self.agents.iter().find(|a| a.name.trim().is_empty()) {
            return Err(ConfigError::Invalid(format!(
                "agent with role '{}' has an empty name",
                agent.role_system
            )));
        }
        if self.max_tokens == 0 {
            return Err(ConfigError::Invalid("max_tokens must be > 0".to_string()));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid("batch_size must be > 0".to_string()));
        }
        if self.local.context_length == 0 {
            return Err(ConfigError::Invalid("local.context_length must be > 0".to_string()));
        }
        if self.local.threads == 0 {
            return Err(ConfigError::Invalid("local.threads must be > 0".to_string()));
        }
        if self.remote.max_attempts == 0 {
            return Err(ConfigError::Invalid("remote.max_attempts must be > 0".to_string()));
        }
        Ok(())
    }

    pub fn model_config(&self) -> ModelConfig {
        ModelConfig {
            model_path: PathBuf::from(&self.model),
            context_length: self.local.context_length,
            threads: self.local.threads,
            batch_size: self.local.batch_size,
            use_gpu: self.local.use_gpu,
            gpu_layers: self.local.gpu_layers,
            tokenizer_path: self.local.tokenizer.clone(),
            tokenizer_repo: self.local.tokenizer_repo.clone(),
            family: self.local.family,
            chat_template: self.local.chat_template.clone(),
        }
    }
}

/// Relative model paths that exist are made absolute; anything else (a
/// remote model name, a missing file) is passed through untouched.
fn resolve_model_path(model: &str) -> String {
    let path = Path::new(model);
    if path.is_absolute() || !path.exists() {
        return model.to_string();
    }
    fs::canonicalize(path)
        .map(|p| p.to_string_lossy().to_string())
        .unwrap_or_else(|_| model.to_string())
}

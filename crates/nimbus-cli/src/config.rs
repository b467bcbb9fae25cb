//! Configuration file support

use std::fs;
use std::path::PathBuf;

use nimbus_agent::{PromptTarget, SessionConfig, StackSpec};
use nimbus_ai::{DEFAULT_BASE_URL, DEFAULT_MODEL, DEFAULT_TEMPERATURE, ModelConfig};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MODEL_ENV_VAR: &str = "OPENAI_MODEL";
pub const TEMPERATURE_ENV_VAR: &str = "OPENAI_TEMPERATURE";
pub const BASE_URL_ENV_VAR: &str = "OPENAI_BASE_URL";
pub const API_KEY_ENV_VAR: &str = nimbus_ai::providers::openai::API_KEY_ENV_VAR;
pub const CONFIG_PATH_ENV_VAR: &str = "NIMBUS_CONFIG_PATH";

/// Errors while loading or resolving configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid value for {name}: {value:?}")]
    InvalidValue { name: String, value: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Configuration for nimbus
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Chat model id
    pub model: Option<String>,
    /// Sampling temperature
    pub temperature: Option<f32>,
    /// OpenAI-compatible API base URL
    pub base_url: Option<String>,
    /// Stack name
    pub stack: Option<String>,
    /// Pulumi project name
    pub project: Option<String>,
    /// Region resources are created in
    pub region: Option<String>,
    /// Deploy every generated program
    pub auto_deploy: Option<bool>,
    /// Pulumi project directory
    pub work_dir: Option<PathBuf>,
    /// API key (alternative to OPENAI_API_KEY)
    pub api_key: Option<String>,
}

/// Values given on the command line; they win over everything else
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub stack: Option<String>,
    pub project: Option<String>,
    pub region: Option<String>,
    pub no_deploy: bool,
    pub work_dir: Option<PathBuf>,
}

/// Fully resolved settings for one run
#[derive(Debug, Clone)]
pub struct Settings {
    pub session: SessionConfig,
    pub work_dir: PathBuf,
    pub api_key: Option<String>,
}

impl Config {
    /// Get the config directory
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("nimbus")
    }

    /// Get the config file path
    pub fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV_VAR) {
            return PathBuf::from(path);
        }
        Self::config_dir().join("config.toml")
    }

    /// Default Pulumi project directory for `project`
    pub fn default_work_dir(project: &str) -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("nimbus")
            .join(project)
    }

    /// Load config from file
    pub fn load() -> Self {
        let path = Self::config_path();
        if !path.exists() {
            return Self::default();
        }

        match fs::read_to_string(&path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => config,
                Err(e) => {
                    tracing::warn!("Failed to parse config file {}: {}", path.display(), e);
                    Self::default()
                }
            },
            Err(e) => {
                tracing::warn!("Failed to read config file {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    /// Save config to file
    pub fn save(&self) -> Result<(), ConfigError> {
        let path = Self::config_path();
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Create a default config file if it doesn't exist
    pub fn init() -> Result<PathBuf, ConfigError> {
        let path = Self::config_path();
        if path.exists() {
            return Ok(path);
        }

        let default_config = Config {
            model: Some(DEFAULT_MODEL.to_string()),
            temperature: Some(DEFAULT_TEMPERATURE),
            stack: Some("dev".to_string()),
            project: Some("nimbus".to_string()),
            region: Some("us-west-2".to_string()),
            auto_deploy: Some(true),
            ..Default::default()
        };

        default_config.save()?;
        Ok(path)
    }

    /// Merge command line, environment (read through `env`), this file and
    /// defaults, in that order of precedence.
    pub fn resolve(
        &self,
        overrides: &Overrides,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Settings, ConfigError> {
        let env_nonblank = |name: &str| env(name).filter(|v| !v.trim().is_empty());

        let model_id = overrides
            .model
            .clone()
            .or_else(|| env_nonblank(MODEL_ENV_VAR))
            .or_else(|| self.model.clone())
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());

        let temperature = match overrides.temperature {
            Some(t) => t,
            None => resolve_temperature(env(TEMPERATURE_ENV_VAR).as_deref())?
                .or(self.temperature)
                .unwrap_or(DEFAULT_TEMPERATURE),
        };

        let base_url = env_nonblank(BASE_URL_ENV_VAR)
            .or_else(|| self.base_url.clone())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());

        let defaults = StackSpec::default();
        let stack = StackSpec {
            stack_name: overrides
                .stack
                .clone()
                .or_else(|| self.stack.clone())
                .unwrap_or(defaults.stack_name),
            project_name: overrides
                .project
                .clone()
                .or_else(|| self.project.clone())
                .unwrap_or(defaults.project_name),
            ..defaults
        };

        let mut session = SessionConfig {
            model: ModelConfig::new(model_id)
                .with_temperature(temperature)
                .with_base_url(base_url),
            target: PromptTarget::default(),
            stack,
            auto_deploy: !overrides.no_deploy && self.auto_deploy.unwrap_or(true),
        };
        if let Some(region) = overrides.region.clone().or_else(|| self.region.clone()) {
            session = session.with_region(region);
        }

        let work_dir = overrides
            .work_dir
            .clone()
            .or_else(|| self.work_dir.clone())
            .unwrap_or_else(|| Self::default_work_dir(&session.stack.project_name));

        let api_key = env_nonblank(API_KEY_ENV_VAR).or_else(|| self.api_key.clone());

        Ok(Settings {
            session,
            work_dir,
            api_key,
        })
    }
}

/// Read the temperature setting: unset or blank means "use the default",
/// anything else must parse as a number.
pub fn resolve_temperature(raw: Option<&str>) -> Result<Option<f32>, ConfigError> {
    match raw.map(str::trim) {
        None | Some("") => Ok(None),
        Some(value) => value
            .parse::<f32>()
            .ok()
            .filter(|t| t.is_finite())
            .map(Some)
            .ok_or_else(|| ConfigError::InvalidValue {
                name: TEMPERATURE_ENV_VAR.to_string(),
                value: value.to_string(),
            }),
    }
}

/// Generate example config content
pub fn example_config() -> &'static str {
    r#"# nimbus configuration file
# Place at ~/.config/nimbus/config.toml (Linux), ~/Library/Application Support/nimbus/config.toml (Mac)
# or %APPDATA%\nimbus\config.toml (Windows). NIMBUS_CONFIG_PATH overrides the location.

# Chat model (OPENAI_MODEL overrides)
model = "gpt-4"

# Sampling temperature (OPENAI_TEMPERATURE overrides)
temperature = 0.0

# OpenAI-compatible endpoint (OPENAI_BASE_URL overrides)
# base_url = "https://api.openai.com/v1"

# Stack, project and region programs are deployed to
stack = "dev"
project = "nimbus"
region = "us-west-2"

# Deploy every generated program (--no-deploy turns this off)
auto_deploy = true

# Pulumi project directory (defaults to the platform data dir)
# work_dir = "/path/to/project"

# API key (optional - OPENAI_API_KEY is preferred)
# api_key = "sk-..."
"#
}

//! Configuration loader and validator for the tutoring workbench.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub app: App,
    pub tutor_api: TutorApi,
    pub generation: Generation,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct App {
    pub data_dir: String,
    pub poll_interval_ms: u64,
}

/// Tutoring-simulation API settings. The key may be left empty and supplied
/// via the `TUTOR_API_KEY` environment variable instead; catalog endpoints
/// work without it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TutorApi {
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
}

/// Text-generation service settings (OpenAI-style chat completions).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Generation {
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    pub model: String,
    pub max_output_tokens: u32,
    pub temperature: f64,
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.poll_interval_ms == 0 {
        return Err(ConfigError::Invalid("app.poll_interval_ms must be > 0"));
    }

    if cfg.tutor_api.base_url.trim().is_empty() {
        return Err(ConfigError::Invalid("tutor_api.base_url must be non-empty"));
    }
    // tutor_api.api_key may be empty; authenticated calls fail with a
    // key-missing error at call time.

    if cfg.generation.base_url.trim().is_empty() {
        return Err(ConfigError::Invalid(
            "generation.base_url must be non-empty",
        ));
    }
    if cfg.generation.model.trim().is_empty() {
        return Err(ConfigError::Invalid("generation.model must be non-empty"));
    }
    if cfg.generation.max_output_tokens == 0 {
        return Err(ConfigError::Invalid(
            "generation.max_output_tokens must be > 0",
        ));
    }
    if !(0.0..=2.0).contains(&cfg.generation.temperature) {
        return Err(ConfigError::Invalid(
            "generation.temperature must be within 0.0..=2.0",
        ));
    }

    Ok(())
}

/// Returns a canonical example configuration.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  poll_interval_ms: 500

tutor_api:
  base_url: "https://tutor-api.example.com"
  api_key: "YOUR_TUTOR_API_KEY"

generation:
  base_url: "https://api.openai.com"
  api_key: "YOUR_GENERATION_API_KEY"
  model: "gpt-4o-mini"
  max_output_tokens: 500
  temperature: 0.7
"#
}

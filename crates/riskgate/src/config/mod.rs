//! Filter configuration
//!
//! A `FilterConfig` is built exactly once at startup: defaults, then an
//! optional TOML file, then the env-style inputs the deployment injects.
//! After `validate` succeeds it is wrapped in an `Arc` and never mutated.

use serde::Deserialize;
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use crate::error::{GateError, Result};

pub const ENV_API_KEY: &str = "GUARDIAN_API_KEY";
pub const ENV_BASE_URL: &str = "GUARDIAN_URL";
pub const ENV_MODEL: &str = "GUARDIAN_MODEL";
pub const ENV_RISKY_TOKEN: &str = "GUARDIAN_RISKY_TOKEN";
pub const ENV_FAILURE_MODE: &str = "GUARDIAN_FAILURE_MODE";
pub const ENV_DISABLE_PROMPT_CHECK: &str = "DISABLE_PROMPT_RISK_CHECK";
pub const ENV_DISABLE_RESPONSE_CHECK: &str = "DISABLE_RESPONSE_RISK_CHECK";
pub const ENV_LISTEN_ADDR: &str = "RISKGATE_LISTEN_ADDR";

/// Top-level, process-wide configuration
#[derive(Debug, Clone, Deserialize, Default)]
pub struct FilterConfig {
    /// gRPC server settings
    #[serde(default)]
    pub server: ServerConfig,
    /// Risk classifier endpoint and decoding parameters
    #[serde(default)]
    pub classifier: ClassifierConfig,
    /// Which directions get checked and how failures are treated
    #[serde(default)]
    pub checks: CheckConfig,
}

/// gRPC server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address the ext_proc and health services listen on
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Seconds in-flight exchanges get to finish after a shutdown signal
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

fn default_listen_addr() -> String {
    "0.0.0.0:50051".to_string()
}

fn default_shutdown_grace_secs() -> u64 {
    1
}

/// OpenAI-compatible classifier endpoint configuration
#[derive(Clone, Deserialize)]
pub struct ClassifierConfig {
    /// Base URL of the model server, without the API path
    #[serde(default)]
    pub base_url: String,
    /// Bearer credential. Only ever read from the environment.
    #[serde(skip)]
    pub api_key: String,
    /// Path appended to `base_url` before `/chat/completions`
    #[serde(default = "default_api_path")]
    pub api_path: String,
    /// Model identifier sent with every request
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Classifier output that means "risky" (compared case-insensitively)
    #[serde(default = "default_risky_token")]
    pub risky_token: String,
}

impl ClassifierConfig {
    /// Full chat completions endpoint
    pub fn completions_url(&self) -> String {
        format!(
            "{}{}/chat/completions",
            self.base_url.trim_end_matches('/'),
            self.api_path.trim_end_matches('/')
        )
    }
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_key: String::new(),
            api_path: default_api_path(),
            model: default_model(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            risky_token: default_risky_token(),
        }
    }
}

impl fmt::Debug for ClassifierConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let api_key = if self.api_key.is_empty() {
            "<unset>"
        } else {
            "<redacted>"
        };
        f.debug_struct("ClassifierConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &api_key)
            .field("api_path", &self.api_path)
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("risky_token", &self.risky_token)
            .finish()
    }
}

fn default_api_path() -> String {
    "/openai/v1".to_string()
}

fn default_model() -> String {
    "granite-guardian".to_string()
}

fn default_temperature() -> f32 {
    0.01
}

fn default_max_tokens() -> u32 {
    50
}

fn default_risky_token() -> String {
    "Yes".to_string()
}

/// What to do with an exchange when the classifier call fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Treat the text as safe and let it through
    #[serde(alias = "fail-open")]
    Open,
    /// Treat the text as risky and block it
    #[default]
    #[serde(alias = "fail-closed")]
    Closed,
}

impl FailurePolicy {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "open" | "fail-open" => Some(Self::Open),
            "closed" | "fail-closed" => Some(Self::Closed),
            _ => None,
        }
    }
}

/// Per-direction bypass switches
#[derive(Debug, Clone, Deserialize, Default)]
pub struct CheckConfig {
    /// Skip classifying request prompts
    #[serde(default)]
    pub prompt_check_disabled: bool,
    /// Skip classifying LLM completions
    #[serde(default)]
    pub response_check_disabled: bool,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
}

/// Only the literal `yes` flips a bypass switch on
fn bypass_enabled(value: Option<String>) -> bool {
    value.as_deref() == Some("yes")
}

impl FilterConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| GateError::Config(format!("Failed to parse config: {e}")))
    }

    /// Load from `path`, or the first default location that exists, or defaults
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::read_file(path);
        }

        let default_paths = [
            dirs::home_dir().map(|h| h.join(".riskgate").join("config.toml")),
            dirs::config_dir().map(|c| c.join("riskgate").join("config.toml")),
            Some(PathBuf::from("riskgate.toml")),
        ];

        for candidate in default_paths.iter().flatten() {
            if candidate.exists() {
                return Self::read_file(candidate);
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn read_file(path: &Path) -> Result<Self> {
        tracing::info!("Loading config from: {}", path.display());
        let content = std::fs::read_to_string(path).map_err(|e| {
            GateError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_toml_str(&content)
    }

    /// Overlay env-style inputs. `lookup` is `std::env::var(..).ok()` in production.
    pub fn apply_env<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(key) = lookup(ENV_API_KEY) {
            self.classifier.api_key = key;
        }
        if let Some(url) = lookup(ENV_BASE_URL) {
            self.classifier.base_url = url;
        }
        if let Some(model) = lookup(ENV_MODEL).filter(|m| !m.is_empty()) {
            self.classifier.model = model;
        }
        if let Some(token) = lookup(ENV_RISKY_TOKEN).filter(|t| !t.is_empty()) {
            self.classifier.risky_token = token;
        }
        if let Some(addr) = lookup(ENV_LISTEN_ADDR).filter(|a| !a.is_empty()) {
            self.server.listen_addr = addr;
        }
        if let Some(mode) = lookup(ENV_FAILURE_MODE) {
            self.checks.failure_policy = FailurePolicy::parse(&mode).ok_or_else(|| {
                GateError::Config(format!(
                    "{ENV_FAILURE_MODE} must be 'open' or 'closed', got '{mode}'"
                ))
            })?;
        }

        // Env switches override the file when present.
        if let Some(value) = lookup(ENV_DISABLE_PROMPT_CHECK) {
            self.checks.prompt_check_disabled = bypass_enabled(Some(value));
        }
        if let Some(value) = lookup(ENV_DISABLE_RESPONSE_CHECK) {
            self.checks.response_check_disabled = bypass_enabled(Some(value));
        }

        Ok(self)
    }

    /// Startup validation. Nothing binds unless this passes.
    pub fn validate(&self) -> Result<()> {
        if self.classifier.api_key.is_empty() {
            return Err(GateError::Config(format!("{ENV_API_KEY} env var is not set")));
        }
        if self.classifier.base_url.is_empty() {
            return Err(GateError::Config(format!("{ENV_BASE_URL} env var is not set")));
        }
        url::Url::parse(&self.classifier.completions_url()).map_err(|e| {
            GateError::Config(format!(
                "Invalid classifier URL '{}': {e}",
                self.classifier.base_url
            ))
        })?;
        self.listen_addr()?;
        Ok(())
    }

    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.server
            .listen_addr
            .parse()
            .map_err(|e| GateError::Config(format!("Invalid listen address: {e}")))
    }
}

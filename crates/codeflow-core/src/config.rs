use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{CodeflowError, Result};
use crate::types::AssignmentMethod;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub notifier: NotifierConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub log: LogConfig,
}

/// Run engine behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Used for task nodes whose template names no assignment method.
    #[serde(default)]
    pub default_assignment: AssignmentMethod,
    /// Times a failed task node is requeued before the failure counts.
    /// Task templates may override it with `max_retries`.
    #[serde(default)]
    pub auto_retry: u32,
    /// Log entries kept per agent and per task.
    #[serde(default = "default_log_retention")]
    pub log_retention: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_assignment: AssignmentMethod::default(),
            auto_retry: 0,
            log_retention: default_log_retention(),
        }
    }
}

fn default_log_retention() -> usize { 1000 }

/// Outbound notification delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifierConfig {
    /// When false, events only reach the in-process bus.
    #[serde(default = "default_notifier_enabled")]
    pub enabled: bool,
    /// Capacity of the outbound queue and of the in-process bus.
    #[serde(default = "default_notifier_buffer")]
    pub buffer: usize,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            enabled: default_notifier_enabled(),
            buffer: default_notifier_buffer(),
            retry: RetryConfig::default(),
        }
    }
}

fn default_notifier_enabled() -> bool { true }
fn default_notifier_buffer() -> usize { 256 }

/// Bounded exponential backoff for channel delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

fn default_max_retries() -> u32 { 5 }
fn default_initial_backoff() -> u64 { 1000 }
fn default_max_backoff() -> u64 { 30000 }

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    /// SQLite database file. `~/` is expanded.
    #[serde(default)]
    pub path: Option<String>,
}

impl StoreConfig {
    /// Resolve the database path, falling back to `codeflow.db` in the
    /// working directory.
    pub fn resolved_path(&self) -> PathBuf {
        let raw = self.path.as_deref().unwrap_or("codeflow.db");
        if let Some(rest) = raw.strip_prefix("~/") {
            if let Some(home) = dirs_home() {
                return home.join(rest);
            }
        }
        PathBuf::from(raw)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// `tracing` filter directive used when `RUST_LOG` is unset.
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

fn default_log_filter() -> String { "codeflow=info,warn".to_string() }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| CodeflowError::ConfigNotFound(path.display().to_string()))?;

        let expanded = expand_env_vars(&content);

        toml::from_str(&expanded).map_err(|e| CodeflowError::Config(e.to_string()))
    }

    /// Load `path` if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        match Self::load(path) {
            Err(CodeflowError::ConfigNotFound(_)) if !path.exists() => Ok(Self::default()),
            other => other,
        }
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                // Unset variables stay verbatim.
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

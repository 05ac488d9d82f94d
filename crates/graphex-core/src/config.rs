use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::datatype::{CoercionMode, CoercionTable};
use crate::error::{GraphexError, Result};

/// File name looked up in the current directory before the home fallback.
pub const LOCAL_CONFIG_FILE: &str = "graphex.toml";

/// Top-level Graphex configuration. An empty file is valid.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub log: LogConfig,
    /// Credentials handed to nodes read-only through their context.
    #[serde(default)]
    pub secrets: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Upper bound on concurrently running nodes per run.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_node_timeout")]
    pub default_node_timeout_secs: u64,
    /// How long a timed-out node may unwind after its token is cancelled.
    #[serde(default = "default_cancel_grace")]
    pub cancel_grace_ms: u64,
    /// Per-run broadcast buffer. Slower subscribers get an overflow marker.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
    /// Log lines per run kept for replay to late subscribers.
    #[serde(default = "default_log_history")]
    pub log_history: usize,
    /// Finished runs kept in memory for late subscribers and `run.list`.
    #[serde(default = "default_retained_runs")]
    pub retained_runs: usize,
    #[serde(default)]
    pub coercion: CoercionMode,
    #[serde(default = "default_working_dir")]
    pub working_dir: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            default_node_timeout_secs: default_node_timeout(),
            cancel_grace_ms: default_cancel_grace(),
            event_buffer: default_event_buffer(),
            log_history: default_log_history(),
            retained_runs: default_retained_runs(),
            coercion: CoercionMode::default(),
            working_dir: default_working_dir(),
        }
    }
}

fn default_max_concurrency() -> usize { 4 }
fn default_node_timeout() -> u64 { 300 }
fn default_cancel_grace() -> u64 { 500 }
fn default_event_buffer() -> usize { 256 }
fn default_log_history() -> usize { 1000 }
fn default_retained_runs() -> usize { 64 }
fn default_working_dir() -> String { ".".to_string() }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:18790".to_string()
}

/// JSONL run logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// Directory for run logs. Default: ~/.graphex/logs
    #[serde(default)]
    pub log_dir: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_dir: None,
        }
    }
}

fn default_log_enabled() -> bool { true }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| GraphexError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        toml::from_str(&expanded).map_err(|e| GraphexError::Config(e.to_string()))
    }

    /// `./graphex.toml`, then `~/.graphex/config.toml`, then built-in defaults.
    pub fn load_default() -> Result<Self> {
        let local = PathBuf::from(LOCAL_CONFIG_FILE);
        if local.exists() {
            return Self::load(&local);
        }
        if let Some(home) = dirs_home() {
            let global = home.join(".graphex").join("config.toml");
            if global.exists() {
                return Self::load(&global);
            }
        }
        Ok(Self::default())
    }

    /// Resolve the engine working directory (expand ~).
    pub fn working_dir(&self) -> PathBuf {
        expand_home(&self.engine.working_dir)
    }

    /// Resolve the run log directory (expand ~).
    pub fn log_dir(&self) -> PathBuf {
        match &self.log.log_dir {
            Some(dir) => expand_home(dir),
            None => dirs_home()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".graphex")
                .join("logs"),
        }
    }

    pub fn coercion_table(&self) -> CoercionTable {
        CoercionTable::new(self.engine.coercion)
    }

    /// Reject values that would make the engine unusable.
    pub fn validate(&self) -> Result<()> {
        if self.engine.max_concurrency == 0 {
            return Err(GraphexError::Config(
                "engine.max_concurrency must be at least 1".into(),
            ));
        }
        if self.engine.event_buffer == 0 {
            return Err(GraphexError::Config(
                "engine.event_buffer must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs_home() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
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

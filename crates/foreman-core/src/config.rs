use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level configuration loaded from `~/.foreman/config.toml`.
///
/// Every section and field has a default, so a missing or partial file is
/// always usable.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub git: GitConfig,
}

impl Config {
    /// Load config from `~/.foreman/config.toml`, falling back to defaults
    /// when the file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            let cfg = Config::default();
            cfg.validate()?;
            Ok(cfg)
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let cfg: Config = toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Semantic validation for settings that are not fully expressible via
    /// type checks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dispatcher.max_concurrent == 0 {
            return Err(ConfigError::Validation(
                "dispatcher.max_concurrent must be at least 1".into(),
            ));
        }
        if self.dispatcher.task_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "dispatcher.task_timeout_secs must be at least 1".into(),
            ));
        }
        if self.queue.dir.trim().is_empty() {
            return Err(ConfigError::Validation("queue.dir must not be empty".into()));
        }
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        Self::data_dir().join("config.toml")
    }

    /// `~/.foreman`, holding the config file and the SQLite database.
    pub fn data_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".foreman")
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("validation: {0}")]
    Validation(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Override for the data directory; defaults to `~/.foreman`.
    #[serde(default)]
    pub data_dir: Option<String>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            log_level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Upper bound on simultaneously running tasks across all projects.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Wall-clock budget for a single task, queued handoffs included.
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,
}

impl DispatcherConfig {
    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            task_timeout_secs: default_task_timeout_secs(),
        }
    }
}

fn default_max_concurrent() -> usize {
    3
}
fn default_task_timeout_secs() -> u64 {
    300
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Execution mode: `direct`, `instruction_drop`, `bidirectional`, or
    /// `simulated`.
    #[serde(default = "default_agent_mode")]
    pub mode: String,
    /// Binary invoked in `direct` mode.
    #[serde(default = "default_agent_command")]
    pub command: String,
    #[serde(default = "default_simulated_delay_ms")]
    pub simulated_delay_ms: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            mode: default_agent_mode(),
            command: default_agent_command(),
            simulated_delay_ms: default_simulated_delay_ms(),
        }
    }
}

fn default_agent_mode() -> String {
    "simulated".into()
}
fn default_agent_command() -> String {
    "cursor-agent".into()
}
fn default_simulated_delay_ms() -> u64 {
    250
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Per-project handoff directory, relative to the project root.
    #[serde(default = "default_queue_dir")]
    pub dir: String,
    /// Filename prefix for progress records (`<prefix><task_id>.json`).
    #[serde(default = "default_record_prefix")]
    pub record_prefix: String,
    /// Quiet window applied per file before a change is delivered.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

impl QueueConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            dir: default_queue_dir(),
            record_prefix: default_record_prefix(),
            debounce_ms: default_debounce_ms(),
        }
    }
}

fn default_queue_dir() -> String {
    ".foreman-tasks".into()
}
fn default_record_prefix() -> String {
    "api_".into()
}
fn default_debounce_ms() -> u64 {
    1000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitConfig {
    /// Commit the project tree after each successful task.
    #[serde(default = "default_auto_snapshot")]
    pub auto_snapshot: bool,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            auto_snapshot: default_auto_snapshot(),
        }
    }
}

fn default_auto_snapshot() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = Config::default();
        cfg.validate().expect("defaults validate");
        assert_eq!(cfg.dispatcher.max_concurrent, 3);
        assert_eq!(cfg.dispatcher.task_timeout_secs, 300);
        assert_eq!(cfg.agent.mode, "simulated");
        assert_eq!(cfg.queue.dir, ".foreman-tasks");
        assert_eq!(cfg.queue.record_prefix, "api_");
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let cfg: Config = toml::from_str(
            r#"
            [dispatcher]
            max_concurrent = 5

            [agent]
            mode = "direct"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.dispatcher.max_concurrent, 5);
        assert_eq!(cfg.dispatcher.task_timeout_secs, 300);
        assert_eq!(cfg.agent.mode, "direct");
        assert_eq!(cfg.queue.debounce_ms, 1000);
    }

    #[test]
    fn zero_concurrency_rejected() {
        let cfg: Config = toml::from_str("[dispatcher]\nmax_concurrent = 0\n").unwrap();
        assert!(matches!(cfg.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn empty_queue_dir_rejected() {
        let cfg: Config = toml::from_str("[queue]\ndir = \"  \"\n").unwrap();
        assert!(matches!(cfg.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn load_from_missing_file_is_io_error() {
        let err = Config::load_from("/nonexistent/foreman.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}

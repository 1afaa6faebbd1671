//! Configuration for stream task sessions
//!
//! Loaded from TOML. Every section has defaults so an empty file is a valid
//! configuration; `validate` rejects values that would stall or disable the
//! worker pool and queues.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StreamTaskConfig {
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub task: TaskSection,
    #[serde(default)]
    pub filters: FilterPolicy,
}

/// Session section: worker pool and queue bounds
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionSection {
    /// Maximum number of tasks executing concurrently
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Per-stream bound on queued inbound entries, 0 for unbounded
    #[serde(default = "default_input_capacity")]
    pub input_capacity: usize,
    /// Per-stream bound on queued outbound entries, 0 for unbounded; writes
    /// block while full
    #[serde(default = "default_output_capacity")]
    pub output_capacity: usize,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            input_capacity: default_input_capacity(),
            output_capacity: default_output_capacity(),
        }
    }
}

impl SessionSection {
    pub fn input_bound(&self) -> Option<usize> {
        bound(self.input_capacity)
    }

    pub fn output_bound(&self) -> Option<usize> {
        bound(self.output_capacity)
    }
}

fn bound(capacity: usize) -> Option<usize> {
    (capacity > 0).then_some(capacity)
}

/// Task section: blocking behaviour of the queue adapters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskSection {
    /// Longest single wait inside a blocking read/write before the abort
    /// flag is checked again
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Overall deadline for one blocking read
    pub read_timeout_ms: Option<u64>,
    /// Overall deadline for one blocking write
    pub write_timeout_ms: Option<u64>,
}

impl Default for TaskSection {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            read_timeout_ms: None,
            write_timeout_ms: None,
        }
    }
}

impl TaskSection {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout_ms.map(Duration::from_millis)
    }

    pub fn write_timeout(&self) -> Option<Duration> {
        self.write_timeout_ms.map(Duration::from_millis)
    }
}

/// Connection filter policy applied to every synthetic request context
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FilterPolicy {
    /// Apply the restricted filter set
    #[serde(default = "default_restricted")]
    pub restricted: bool,
    /// Filters that belong to the real connection and must stay off the
    /// per-stream one
    #[serde(default = "default_connection_filters")]
    pub connection_filters: Vec<String>,
}

impl Default for FilterPolicy {
    fn default() -> Self {
        Self {
            restricted: default_restricted(),
            connection_filters: default_connection_filters(),
        }
    }
}

fn default_max_workers() -> usize {
    16
}

fn default_input_capacity() -> usize {
    64
}

fn default_output_capacity() -> usize {
    16
}

fn default_poll_interval_ms() -> u64 {
    50
}

fn default_restricted() -> bool {
    true
}

fn default_connection_filters() -> Vec<String> {
    vec!["ssl".to_string(), "reqtimeout".to_string(), "h2".to_string()]
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl StreamTaskConfig {
    /// Load configuration from a TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: StreamTaskConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session.max_workers == 0 {
            return Err(ConfigError::InvalidConfig(
                "session.max_workers must be at least 1".to_string(),
            ));
        }
        if self.task.poll_interval_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "task.poll_interval_ms must be at least 1".to_string(),
            ));
        }
        if let Some(name) = self
            .filters
            .connection_filters
            .iter()
            .find(|name| name.trim().is_empty())
        {
            return Err(ConfigError::InvalidConfig(format!(
                "filters.connection_filters contains an empty name: {name:?}"
            )));
        }
        Ok(())
    }

    /// Create a configuration with a short poll interval for tests
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[session]
max_workers = 4
input_capacity = 8
output_capacity = 4

[task]
poll_interval_ms = 5

[filters]
restricted = true
connection_filters = ["ssl", "reqtimeout"]
"#;
        Self::from_toml_str(toml_content).expect("Test config should parse")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_config() {
        let toml_content = r#"
[session]
max_workers = 8
input_capacity = 32
output_capacity = 2

[task]
poll_interval_ms = 20
read_timeout_ms = 1000
write_timeout_ms = 2000

[filters]
restricted = false
connection_filters = ["ssl"]
"#;

        let config = StreamTaskConfig::from_toml_str(toml_content).unwrap();
        assert_eq!(config.session.max_workers, 8);
        assert_eq!(config.session.input_bound(), Some(32));
        assert_eq!(config.session.output_bound(), Some(2));
        assert_eq!(config.task.poll_interval(), Duration::from_millis(20));
        assert_eq!(config.task.read_timeout(), Some(Duration::from_secs(1)));
        assert_eq!(config.task.write_timeout(), Some(Duration::from_secs(2)));
        assert!(!config.filters.restricted);
        assert_eq!(config.filters.connection_filters, vec!["ssl"]);
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = StreamTaskConfig::from_toml_str("").unwrap();
        assert_eq!(config, StreamTaskConfig::default());
        assert_eq!(config.session.max_workers, 16);
        assert_eq!(config.task.poll_interval_ms, 50);
        assert_eq!(config.task.read_timeout(), None);
        assert!(config.filters.restricted);
        assert!(config
            .filters
            .connection_filters
            .contains(&"ssl".to_string()));
    }

    #[test]
    fn test_zero_workers_rejected() {
        let result = StreamTaskConfig::from_toml_str("[session]\nmax_workers = 0\n");
        assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_zero_poll_interval_rejected() {
        let result = StreamTaskConfig::from_toml_str("[task]\npoll_interval_ms = 0\n");
        assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_zero_capacity_means_unbounded() {
        let config =
            StreamTaskConfig::from_toml_str("[session]\noutput_capacity = 0\n").unwrap();
        assert_eq!(config.session.output_bound(), None);
        assert_eq!(config.session.input_bound(), Some(64));

        // Unbounded survives a print and reload
        let rendered = toml::to_string_pretty(&config).unwrap();
        assert_eq!(StreamTaskConfig::from_toml_str(&rendered).unwrap(), config);
    }

    #[test]
    fn test_empty_filter_name_rejected() {
        let result =
            StreamTaskConfig::from_toml_str("[filters]\nconnection_filters = [\"ssl\", \" \"]\n");
        assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_malformed_toml() {
        let result = StreamTaskConfig::from_toml_str("[session\nmax_workers = 1");
        assert!(matches!(result, Err(ConfigError::TomlParse(_))));
    }

    #[test]
    fn test_test_config_is_valid() {
        let config = StreamTaskConfig::test_config();
        assert_eq!(config.task.poll_interval_ms, 5);
        assert!(config.validate().is_ok());
    }
}

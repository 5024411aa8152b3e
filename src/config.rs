//! Adoption core configuration.
//!
//! Loaded from a TOML file. Every field has a default so an empty file (or
//! `Config::default()`) yields a working single-thread configuration.

use serde::Deserialize;
use std::path::Path;

/// Core configuration loaded from a TOML file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Number of service threads.
    #[serde(default = "default_threads")]
    pub threads: usize,

    /// Capacity of each thread's fd table. The last entry is reserved for
    /// the thread's waker, so usable capacity is one less.
    #[serde(default = "default_fd_limit")]
    pub fd_limit_per_thread: usize,

    /// Maximum concurrent connections admitted per remote address.
    /// 0 disables the ceiling.
    #[serde(default)]
    pub max_connections_per_peer: usize,

    /// Number of header-parse contexts shared by all threads. Replayed
    /// bytes wait for a free context before they are serviced.
    #[serde(default = "default_parse_contexts")]
    pub parse_contexts: usize,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_threads() -> usize {
    1
}

fn default_fd_limit() -> usize {
    1024
}

fn default_parse_contexts() -> usize {
    8
}

impl Default for Config {
    fn default() -> Self {
        Self {
            threads: default_threads(),
            fd_limit_per_thread: default_fd_limit(),
            max_connections_per_peer: 0,
            parse_contexts: default_parse_contexts(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        if self.threads == 0 {
            return Err("threads must be at least 1".into());
        }
        if self.fd_limit_per_thread < 2 {
            return Err("fd_limit_per_thread must be at least 2".into());
        }
        Ok(())
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Log level filter: "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format
    #[serde(default)]
    pub format: LogFormat,

    /// Include the event's target (module path) in output
    #[serde(default = "default_true")]
    pub target: bool,

    /// Include thread names in output
    #[serde(default)]
    pub thread_names: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            target: default_true(),
            thread_names: false,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Compact single-line output
    #[default]
    Compact,
    /// Multi-line human-readable output
    Pretty,
    /// JSON structured output
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.threads, 1);
        assert_eq!(config.fd_limit_per_thread, 1024);
        assert_eq!(config.max_connections_per_peer, 0);
        assert_eq!(config.parse_contexts, 8);
        assert_eq!(config.logging.format, LogFormat::Compact);
    }

    #[test]
    fn empty_toml_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.threads, 1);
        assert_eq!(config.fd_limit_per_thread, 1024);
    }

    #[test]
    fn parse_full() {
        let config: Config = toml::from_str(
            r#"
            threads = 4
            fd_limit_per_thread = 256
            max_connections_per_peer = 10
            parse_contexts = 2

            [logging]
            level = "debug"
            format = "json"
            "#,
        )
        .unwrap();
        assert_eq!(config.threads, 4);
        assert_eq!(config.fd_limit_per_thread, 256);
        assert_eq!(config.max_connections_per_peer, 10);
        assert_eq!(config.parse_contexts, 2);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn unknown_field_rejected() {
        let result: Result<Config, _> = toml::from_str("not_a_field = 1");
        assert!(result.is_err());
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "threads = 2").unwrap();
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.threads, 2);
    }

    #[test]
    fn load_rejects_zero_threads() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "threads = 0").unwrap();
        assert!(Config::load(file.path()).is_err());
    }
}

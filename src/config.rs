//! Session and logging configuration.

use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Top level configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Multi handle and driver settings.
    #[serde(default)]
    pub session: SessionConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.session.validate()
    }
}

/// Settings applied to a session's multi handle and driver thread.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionConfig {
    /// Cookie file read by every request started on the session.
    #[serde(default)]
    pub cookie_file: Option<PathBuf>,

    /// Limit on simultaneously open connections. Unlimited when unset.
    #[serde(default)]
    pub max_total_connections: Option<usize>,

    /// Limit on simultaneously open connections to one host.
    #[serde(default)]
    pub max_host_connections: Option<usize>,

    /// Size of the idle connection cache.
    #[serde(default)]
    pub max_connects: Option<usize>,

    /// Multiplex transfers over HTTP/2 connections.
    #[serde(default = "SessionConfig::default_multiplex")]
    pub multiplex: bool,

    /// Name of the driver thread.
    #[serde(default = "SessionConfig::default_thread_name")]
    pub thread_name: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cookie_file: None,
            max_total_connections: None,
            max_host_connections: None,
            max_connects: None,
            multiplex: Self::default_multiplex(),
            thread_name: Self::default_thread_name(),
        }
    }
}

impl SessionConfig {
    fn default_multiplex() -> bool {
        true
    }

    fn default_thread_name() -> String {
        "crucible-curl".to_string()
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.thread_name.is_empty() {
            return Err(ConfigError::Invalid("session.thread_name must not be empty".into()));
        }
        if let (Some(total), Some(host)) = (self.max_total_connections, self.max_host_connections) {
            if total > 0 && host > total {
                return Err(ConfigError::Invalid(format!(
                    "session.max_host_connections ({host}) exceeds max_total_connections ({total})"
                )));
            }
        }
        Ok(())
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Log level, or any `EnvFilter` directive.
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,

    /// Log format: "pretty", "compact", or "json".
    #[serde(default)]
    pub format: LogFormat,

    /// Include timestamps in log lines.
    #[serde(default = "LoggingConfig::default_timestamps")]
    pub timestamps: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
            format: LogFormat::default(),
            timestamps: Self::default_timestamps(),
        }
    }
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_string()
    }

    fn default_timestamps() -> bool {
        true
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Print an annotated default configuration.
pub fn default_config() -> &'static str {
    r#"# crucible-curl configuration

[session]
# cookie_file = "cookies.txt"
# max_total_connections = 64
# max_host_connections = 8
# max_connects = 16
multiplex = true
thread_name = "crucible-curl"

[logging]
level = "info"
# pretty, compact, or json
format = "pretty"
timestamps = true
"#
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.session.multiplex);
        assert_eq!(config.session.thread_name, "crucible-curl");
        assert_eq!(config.session.cookie_file, None);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.format, LogFormat::Pretty);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_config_parses() {
        let config: Config = toml::from_str(default_config()).unwrap();
        assert!(config.validate().is_ok());
        assert!(config.logging.timestamps);
    }

    #[test]
    fn test_session_section() {
        let config: Config = toml::from_str(
            r#"
            [session]
            cookie_file = "/tmp/cookies.txt"
            max_total_connections = 10
            max_host_connections = 2
            multiplex = false

            [logging]
            format = "json"
            "#,
        )
        .unwrap();
        assert_eq!(
            config.session.cookie_file.as_deref(),
            Some(Path::new("/tmp/cookies.txt"))
        );
        assert_eq!(config.session.max_total_connections, Some(10));
        assert_eq!(config.session.max_host_connections, Some(2));
        assert!(!config.session.multiplex);
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_unknown_field_rejected() {
        let result: Result<Config, _> = toml::from_str("[session]\nthreads = 4\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_host_limit_above_total_rejected() {
        let config: Config = toml::from_str(
            "[session]\nmax_total_connections = 2\nmax_host_connections = 4\n",
        )
        .unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}

//! Configuration management for the ptyhub daemon.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/ptyhub/config.toml`.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use protocol::CreateSessionRequest;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::session::{
    SessionOptions, SpawnOptions, DEFAULT_CLIENT_CAPACITY, DEFAULT_LANG, DEFAULT_MAX_SESSIONS,
    DEFAULT_READ_BUFFER_SIZE, DEFAULT_TERM,
};

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("max_sessions must be between 1 and 1000, got {0}")]
    InvalidMaxSessions(usize),

    #[error("bind must be a socket address such as 127.0.0.1:3001, got {0}")]
    InvalidBindAddress(String),

    #[error("default_shell path does not exist: {0}")]
    InvalidShellPath(String),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),

    #[error("default window size must be non-zero, got {rows}x{cols}")]
    InvalidWindowSize { rows: u16, cols: u16 },

    #[error("read_buffer_size must be between 1024 and 1048576 bytes, got {0}")]
    InvalidReadBufferSize(usize),

    #[error("client_queue_capacity must be between 1 and 65536, got {0}")]
    InvalidQueueCapacity(usize),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Default HTTP listen address.
pub const DEFAULT_BIND: &str = "127.0.0.1:3001";

/// Default browser origin allowed to use the API.
pub const DEFAULT_ALLOWED_ORIGIN: &str = "http://localhost:3000";

/// Main configuration structure for the ptyhub daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General daemon configuration.
    pub daemon: DaemonConfig,

    /// HTTP server configuration.
    pub server: ServerConfig,

    /// Session defaults and limits.
    pub session: SessionConfig,
}

/// General daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Optional log file; rotated daily.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,

    /// Overrides the IPC socket location.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub socket_path: Option<PathBuf>,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the HTTP server listens on.
    pub bind: String,

    /// Browser origins allowed to call the API. Empty allows any origin.
    pub allowed_origins: Vec<String>,

    /// Accept requests that carry no `Origin` header, as non-browser clients
    /// send. Only consulted when `allowed_origins` is non-empty.
    pub allow_missing_origin: bool,
}

/// Session defaults and limits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Shell used when a request does not name one.
    pub default_shell: String,

    /// Initial rows when a request does not specify them.
    pub default_rows: u16,

    /// Initial columns when a request does not specify them.
    pub default_cols: u16,

    /// Maximum number of concurrent sessions.
    pub max_sessions: usize,

    /// `TERM` exported to shells.
    pub term: String,

    /// `LANG` and `LC_ALL` exported to shells.
    pub lang: String,

    /// Size of a single PTY read in bytes.
    pub read_buffer_size: usize,

    /// Output chunks queued per client before it is disconnected.
    pub client_queue_capacity: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_file: None,
            socket_path: None,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
            allowed_origins: vec![DEFAULT_ALLOWED_ORIGIN.to_string()],
            allow_missing_origin: true,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_shell: crate::session::detect_shell(None),
            default_rows: protocol::DEFAULT_ROWS,
            default_cols: protocol::DEFAULT_COLS,
            max_sessions: DEFAULT_MAX_SESSIONS,
            term: DEFAULT_TERM.to_string(),
            lang: DEFAULT_LANG.to_string(),
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            client_queue_capacity: DEFAULT_CLIENT_CAPACITY,
        }
    }
}

impl SessionConfig {
    /// Builds session options for a creation request, filling gaps from
    /// these defaults.
    pub fn session_options(&self, request: &CreateSessionRequest) -> SessionOptions {
        let shell = request
            .shell
            .clone()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| self.default_shell.clone());

        SessionOptions {
            spawn: SpawnOptions {
                shell: Some(shell),
                rows: request.rows.unwrap_or(self.default_rows),
                cols: request.cols.unwrap_or(self.default_cols),
                term: self.term.clone(),
                lang: self.lang.clone(),
                env: Vec::new(),
                cwd: None,
            },
            read_buffer_size: self.read_buffer_size,
            client_capacity: self.client_queue_capacity,
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ptyhub")
        .join("config.toml")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - PTYHUB_BIND: Override the HTTP listen address
    /// - PTYHUB_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - PTYHUB_SHELL: Override the default shell
    pub fn apply_env_overrides(&mut self) {
        if let Some(bind) = non_empty_env("PTYHUB_BIND") {
            tracing::info!(bind = %bind, "Overriding bind address from environment");
            self.server.bind = bind;
        }

        if let Some(level) = non_empty_env("PTYHUB_LOG_LEVEL") {
            tracing::info!(level = %level, "Overriding log_level from environment");
            self.daemon.log_level = level;
        }

        if let Some(shell) = non_empty_env("PTYHUB_SHELL") {
            tracing::info!(shell = %shell, "Overriding default_shell from environment");
            self.session.default_shell = shell;
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session.max_sessions < 1 || self.session.max_sessions > 1000 {
            return Err(ConfigError::InvalidMaxSessions(self.session.max_sessions));
        }

        if self.bind_addr().is_none() {
            return Err(ConfigError::InvalidBindAddress(self.server.bind.clone()));
        }

        let (rows, cols) = (self.session.default_rows, self.session.default_cols);
        if rows == 0 || cols == 0 {
            return Err(ConfigError::InvalidWindowSize { rows, cols });
        }

        if !(1024..=1024 * 1024).contains(&self.session.read_buffer_size) {
            return Err(ConfigError::InvalidReadBufferSize(
                self.session.read_buffer_size,
            ));
        }

        if !(1..=65536).contains(&self.session.client_queue_capacity) {
            return Err(ConfigError::InvalidQueueCapacity(
                self.session.client_queue_capacity,
            ));
        }

        // Absolute shells must exist; bare names are looked up on PATH.
        let shell_path = Path::new(&self.session.default_shell);
        let shell_found = if shell_path.is_absolute() {
            shell_path.exists()
        } else {
            which::which(&self.session.default_shell).is_ok()
        };
        if !shell_found {
            return Err(ConfigError::InvalidShellPath(
                self.session.default_shell.clone(),
            ));
        }

        let level = self.daemon.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.daemon.log_level.clone()));
        }

        Ok(())
    }

    /// Parses the configured bind address.
    pub fn bind_addr(&self) -> Option<SocketAddr> {
        self.server.bind.parse().ok()
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!(path = %path.display(), "Configuration saved");
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    /// A config that validates on any unix host.
    fn valid_config() -> Config {
        let mut config = Config::default();
        config.session.default_shell = "/bin/sh".to_string();
        config
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.daemon.log_level, "info");
        assert!(config.daemon.log_file.is_none());
        assert_eq!(config.server.bind, "127.0.0.1:3001");
        assert_eq!(config.server.allowed_origins, vec!["http://localhost:3000"]);
        assert!(config.server.allow_missing_origin);
        assert_eq!(config.session.max_sessions, 64);
        assert_eq!(config.session.default_rows, 24);
        assert_eq!(config.session.default_cols, 80);
        assert_eq!(config.session.term, "xterm-256color");
        assert_eq!(config.session.lang, "en_US.UTF-8");
        assert_eq!(config.session.read_buffer_size, 32 * 1024);
        assert_eq!(config.session.client_queue_capacity, 256);
        assert!(!config.session.default_shell.is_empty());
    }

    #[test]
    fn test_from_toml_empty() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_from_toml_partial() {
        let toml = r#"
[daemon]
log_level = "debug"

[session]
max_sessions = 5
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.daemon.log_level, "debug");
        assert_eq!(config.session.max_sessions, 5);
        assert_eq!(config.server.bind, "127.0.0.1:3001");
    }

    #[test]
    fn test_from_toml_full() {
        let toml = r#"
[daemon]
log_level = "trace"
log_file = "/var/log/ptyhub/daemon.log"
socket_path = "/run/ptyhub.sock"

[server]
bind = "0.0.0.0:8080"
allowed_origins = ["https://term.example.com"]
allow_missing_origin = false

[session]
default_shell = "/bin/zsh"
default_rows = 50
default_cols = 200
max_sessions = 20
term = "xterm"
lang = "C.UTF-8"
read_buffer_size = 8192
client_queue_capacity = 64
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.daemon.log_level, "trace");
        assert_eq!(
            config.daemon.log_file,
            Some(PathBuf::from("/var/log/ptyhub/daemon.log"))
        );
        assert_eq!(config.daemon.socket_path, Some(PathBuf::from("/run/ptyhub.sock")));
        assert_eq!(config.server.bind, "0.0.0.0:8080");
        assert_eq!(config.server.allowed_origins, vec!["https://term.example.com"]);
        assert!(!config.server.allow_missing_origin);
        assert_eq!(config.session.default_shell, "/bin/zsh");
        assert_eq!(config.session.default_rows, 50);
        assert_eq!(config.session.default_cols, 200);
        assert_eq!(config.session.max_sessions, 20);
        assert_eq!(config.session.term, "xterm");
        assert_eq!(config.session.lang, "C.UTF-8");
        assert_eq!(config.session.read_buffer_size, 8192);
        assert_eq!(config.session.client_queue_capacity, 64);
    }

    #[test]
    fn test_from_toml_invalid_syntax() {
        let result = Config::from_toml("[daemon\nlog_level = \"debug\"\n");
        let err = result.unwrap_err().to_string();
        assert!(err.contains("Invalid TOML"));
    }

    #[test]
    fn test_from_toml_wrong_type() {
        let result = Config::from_toml("[session]\nmax_sessions = \"many\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_roundtrip_custom() {
        let mut original = valid_config();
        original.daemon.log_level = "warn".to_string();
        original.daemon.log_file = Some(PathBuf::from("/tmp/ptyhub.log"));
        original.server.allowed_origins = Vec::new();
        original.session.max_sessions = 42;

        let toml = original.to_toml().unwrap();
        let loaded = Config::from_toml(&toml).unwrap();

        assert_eq!(original, loaded);
    }

    #[test]
    fn test_load_missing_file() {
        let config = Config::load("/nonexistent/path/config.toml").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("nested").join("config.toml");

        let mut original = valid_config();
        original.session.default_cols = 132;
        original.save(&config_path).unwrap();

        let loaded = Config::load(&config_path).unwrap();
        assert_eq!(original, loaded);
    }

    #[test]
    fn test_load_invalid_file() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        fs::write(&config_path, "invalid [ toml").unwrap();

        let err = Config::load(&config_path).unwrap_err().to_string();
        assert!(err.contains("Failed to parse config file"));
    }

    #[test]
    fn test_default_config_path() {
        let path = default_config_path();
        assert!(path.to_string_lossy().contains("ptyhub"));
        assert!(path.to_string_lossy().ends_with("config.toml"));
    }

    #[cfg(unix)]
    #[test]
    fn test_validate_accepts_defaults() {
        assert_eq!(valid_config().validate(), Ok(()));
    }

    #[test]
    fn test_validate_max_sessions() {
        let mut config = valid_config();
        config.session.max_sessions = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidMaxSessions(0)));

        config.session.max_sessions = 1001;
        assert_eq!(config.validate(), Err(ConfigError::InvalidMaxSessions(1001)));
    }

    #[test]
    fn test_validate_bind_address() {
        let mut config = valid_config();
        config.server.bind = "localhost".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidBindAddress("localhost".to_string()))
        );
    }

    #[test]
    fn test_validate_window_size() {
        let mut config = valid_config();
        config.session.default_rows = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidWindowSize { rows: 0, cols: 80 })
        );
    }

    #[test]
    fn test_validate_buffer_and_queue() {
        let mut config = valid_config();
        config.session.read_buffer_size = 16;
        assert_eq!(config.validate(), Err(ConfigError::InvalidReadBufferSize(16)));

        let mut config = valid_config();
        config.session.client_queue_capacity = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidQueueCapacity(0)));
    }

    #[test]
    fn test_validate_shell_path() {
        let mut config = valid_config();
        config.session.default_shell = "/nonexistent/shell".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidShellPath("/nonexistent/shell".to_string()))
        );

        config.session.default_shell = "definitely-not-a-shell-xyz".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidShellPath(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_validate_log_level() {
        let mut config = valid_config();
        config.daemon.log_level = "verbose".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidLogLevel("verbose".to_string()))
        );

        config.daemon.log_level = "DEBUG".to_string();
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn test_session_options_from_request() {
        let mut config = SessionConfig::default();
        config.default_shell = "/bin/sh".to_string();
        config.default_rows = 30;

        let options = config.session_options(&CreateSessionRequest::default());
        assert_eq!(options.spawn.shell.as_deref(), Some("/bin/sh"));
        assert_eq!((options.spawn.rows, options.spawn.cols), (30, 80));
        assert_eq!(options.client_capacity, 256);

        let request = CreateSessionRequest {
            shell: Some("/bin/bash".to_string()),
            rows: Some(40),
            cols: Some(120),
        };
        let options = config.session_options(&request);
        assert_eq!(options.spawn.shell.as_deref(), Some("/bin/bash"));
        assert_eq!((options.spawn.rows, options.spawn.cols), (40, 120));
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        std::env::set_var("PTYHUB_BIND", "127.0.0.1:4444");
        std::env::set_var("PTYHUB_LOG_LEVEL", "debug");
        std::env::set_var("PTYHUB_SHELL", "/bin/sh");

        let mut config = Config::default();
        config.apply_env_overrides();

        std::env::remove_var("PTYHUB_BIND");
        std::env::remove_var("PTYHUB_LOG_LEVEL");
        std::env::remove_var("PTYHUB_SHELL");

        assert_eq!(config.server.bind, "127.0.0.1:4444");
        assert_eq!(config.daemon.log_level, "debug");
        assert_eq!(config.session.default_shell, "/bin/sh");
    }

    #[test]
    #[serial]
    fn test_empty_env_ignored() {
        std::env::set_var("PTYHUB_BIND", "");

        let mut config = Config::default();
        config.apply_env_overrides();

        std::env::remove_var("PTYHUB_BIND");
        assert_eq!(config.server.bind, "127.0.0.1:3001");
    }
}

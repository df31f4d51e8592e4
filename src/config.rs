//! Configuration management for detached daemons.
//!
//! Settings are layered with figment, lowest precedence first:
//! built-in defaults, the TOML configuration file, then `DETACH_`-prefixed
//! environment variables (`__` separates nested keys, e.g.
//! `DETACH_LOGGING__LEVEL=debug`).
//!
//! This configures the controller itself. Application options are declared
//! at runtime and read by [`crate::options::Options`].

use figment::providers::{Env, Format, Serialized, Toml};
use figment::{Figment, Provider};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Prefix of environment variables overriding configuration values.
pub const CONFIG_ENV_PREFIX: &str = "DETACH_";

/// Log level configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Trace level logging (most verbose)
    Trace,
    /// Debug level logging
    Debug,
    /// Info level logging (default)
    #[default]
    Info,
    /// Warning level logging
    Warn,
    /// Error level logging
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Self::TRACE,
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Info => Self::INFO,
            LogLevel::Warn => Self::WARN,
            LogLevel::Error => Self::ERROR,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Logging level
    pub level: LogLevel,
    /// Emit JSON lines (needs the `json-logs` feature)
    pub json: bool,
    /// Append logs to this file instead of stderr. A detached worker's
    /// stderr is `/dev/null`, so background daemons usually want this.
    pub file: Option<PathBuf>,
}

/// Main daemon configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Daemon name, used in usage and version output
    pub name: String,
    /// One-line description shown in usage output
    pub description: String,
    /// Version string reported by `--version`
    pub version: String,
    /// Build time reported by `--version`
    pub build_time: String,
    /// Directory to change into before running; `None` keeps the current one
    pub working_dir: Option<PathBuf>,
    /// Single-instance lock file
    pub lock_file: PathBuf,
    /// Seconds the launcher waits for the worker to report readiness
    pub init_timeout_secs: u64,
    /// Optional TOML file with application option defaults
    pub options_file: Option<PathBuf>,
    /// Prefix of environment variables read as options; derived from the
    /// name when unset
    pub env_prefix: Option<String>,
    /// Treat `SIGHUP` as a reload request and keep running
    pub hangup_reloads: bool,
    /// Logging configuration
    pub logging: LogConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: String::from("proc-detach"),
            description: String::new(),
            version: crate::VERSION.to_string(),
            build_time: String::from("unknown"),
            working_dir: None,
            lock_file: std::env::temp_dir().join("proc-detach.lock"),
            init_timeout_secs: crate::MAX_INIT_TIMEOUT_SECS,
            options_file: None,
            env_prefix: None,
            hangup_reloads: false,
            logging: LogConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from the default file and the environment.
    ///
    /// # Errors
    ///
    /// Will return an error if a source contains invalid configuration data.
    pub fn load() -> Result<Self> {
        Self::load_from_file(crate::DEFAULT_CONFIG_FILE)
    }

    /// Load config from a file. A missing file is skipped.
    ///
    /// # Errors
    ///
    /// Will return an error if the file cannot be read or contains invalid configuration data.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if path.exists() {
            figment = figment.merge(Toml::file(path));
        }

        figment
            .merge(Env::prefixed(CONFIG_ENV_PREFIX).split("__"))
            .extract()
            .map_err(Error::from)
    }

    /// Load config using a configuration provider. The provider overrides
    /// both the defaults and the environment.
    ///
    /// # Errors
    ///
    /// Will return an error if the provider fails to load a valid configuration.
    pub fn load_with_provider<P: Provider>(provider: P) -> Result<Self> {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Env::prefixed(CONFIG_ENV_PREFIX).split("__"))
            .merge(provider)
            .extract()
            .map_err(Error::from)
    }

    /// Get the launcher's readiness timeout as a Duration.
    #[must_use]
    pub const fn init_timeout(&self) -> Duration {
        Duration::from_secs(self.init_timeout_secs)
    }

    /// Prefix of environment variables read as application options.
    #[must_use]
    pub fn option_env_prefix(&self) -> String {
        self.env_prefix.clone().unwrap_or_else(|| {
            let mut prefix: String = self
                .name
                .chars()
                .map(|c| {
                    if c.is_ascii_alphanumeric() {
                        c.to_ascii_uppercase()
                    } else {
                        '_'
                    }
                })
                .collect();
            prefix.push('_');
            prefix
        })
    }

    /// Check if JSON logging is enabled.
    #[must_use]
    pub const fn is_json_logging(&self) -> bool {
        self.logging.json
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Will return an error if any configuration values are invalid or missing required fields.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::config("Daemon name cannot be empty"));
        }

        if self.init_timeout_secs == 0 {
            return Err(Error::config("Init timeout must be greater than 0"));
        }

        if self.lock_file.as_os_str().is_empty() {
            return Err(Error::config("Lock file path cannot be empty"));
        }
        check_parent("Lock file", &self.lock_file)?;

        if let Some(ref log_file) = self.logging.file {
            check_parent("Log file", log_file)?;
        }

        Ok(())
    }

    /// Create a builder for this configuration.
    #[must_use]
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }
}

fn check_parent(what: &str, path: &Path) -> Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() && !parent.exists() => Err(Error::config(
            format!("{what} directory does not exist: {}", parent.display()),
        )),
        _ => Ok(()),
    }
}

/// Builder for creating configurations programmatically.
#[derive(Debug, Clone, Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new configuration builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the daemon name.
    #[must_use]
    pub fn name<S: Into<String>>(mut self, name: S) -> Self {
        self.config.name = name.into();
        self
    }

    /// Set the description.
    #[must_use]
    pub fn description<S: Into<String>>(mut self, description: S) -> Self {
        self.config.description = description.into();
        self
    }

    /// Set the reported version and build time.
    #[must_use]
    pub fn version<V: Into<String>, B: Into<String>>(mut self, version: V, build_time: B) -> Self {
        self.config.version = version.into();
        self.config.build_time = build_time.into();
        self
    }

    /// Set the working directory.
    #[must_use]
    pub fn working_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.config.working_dir = Some(dir.into());
        self
    }

    /// Set the lock file location.
    #[must_use]
    pub fn lock_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.config.lock_file = path.into();
        self
    }

    /// Set the launcher's readiness timeout.
    ///
    /// # Errors
    ///
    /// Will return an error if the timeout is shorter than one second.
    pub fn init_timeout(mut self, timeout: Duration) -> Result<Self> {
        if timeout.as_secs() == 0 {
            return Err(Error::config("Init timeout must be at least one second"));
        }
        self.config.init_timeout_secs = timeout.as_secs();
        Ok(self)
    }

    /// Set the options file.
    #[must_use]
    pub fn options_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.config.options_file = Some(path.into());
        self
    }

    /// Set the option environment prefix.
    #[must_use]
    pub fn env_prefix<S: Into<String>>(mut self, prefix: S) -> Self {
        self.config.env_prefix = Some(prefix.into());
        self
    }

    /// Keep running on `SIGHUP` and ask the application to reload.
    #[must_use]
    pub const fn hangup_reloads(mut self, enabled: bool) -> Self {
        self.config.hangup_reloads = enabled;
        self
    }

    /// Set the log level.
    #[must_use]
    pub const fn log_level(mut self, level: LogLevel) -> Self {
        self.config.logging.level = level;
        self
    }

    /// Enable JSON logging.
    #[must_use]
    pub const fn json_logging(mut self, enabled: bool) -> Self {
        self.config.logging.json = enabled;
        self
    }

    /// Append logs to a file.
    #[must_use]
    pub fn log_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.config.logging.file = Some(path.into());
        self
    }

    /// Build the configuration.
    ///
    /// # Errors
    ///
    /// Will return an error if validation fails.
    pub fn build(self) -> Result<Config> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.name, "proc-detach");
        assert_eq!(config.logging.level, LogLevel::Info);
        assert!(!config.logging.json);
        assert_eq!(config.init_timeout(), Duration::from_secs(10));
        assert!(!config.hangup_reloads);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let dir = tempdir().unwrap();
        let config = Config::builder()
            .name("test-daemon")
            .log_level(LogLevel::Debug)
            .json_logging(true)
            .lock_file(dir.path().join("test.lock"))
            .init_timeout(Duration::from_secs(3))
            .unwrap()
            .hangup_reloads(true)
            .build()
            .unwrap();

        assert_eq!(config.name, "test-daemon");
        assert_eq!(config.logging.level, LogLevel::Debug);
        assert!(config.is_json_logging());
        assert_eq!(config.init_timeout_secs, 3);
        assert!(config.hangup_reloads);
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        config.init_timeout_secs = 0;
        assert!(config.validate().is_err());

        config.init_timeout_secs = 5;
        config.name = String::new();
        assert!(config.validate().is_err());

        config.name = "ok".into();
        config.lock_file = PathBuf::from("/nonexistent-dir-for-detach/x.lock");
        assert!(config.validate().is_err());

        config.lock_file = PathBuf::from("relative.lock");
        assert!(config.validate().is_ok());

        assert!(Config::builder()
            .init_timeout(Duration::from_millis(500))
            .is_err());
    }

    #[test]
    fn test_option_env_prefix() {
        let mut config = Config::default();
        config.name = "my-daemon.v2".into();
        assert_eq!(config.option_env_prefix(), "MY_DAEMON_V2_");

        config.env_prefix = Some("APP_".into());
        assert_eq!(config.option_env_prefix(), "APP_");
    }

    #[test]
    fn test_provider_overrides_defaults() {
        let config = Config::load_with_provider(Toml::string(
            "name = \"from-provider\"\ninit_timeout_secs = 4\n[logging]\nlevel = \"warn\"\n",
        ))
        .unwrap();

        assert_eq!(config.name, "from-provider");
        assert_eq!(config.init_timeout_secs, 4);
        assert_eq!(config.logging.level, LogLevel::Warn);
        assert!(config.working_dir.is_none());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("detach.toml");
        std::fs::write(&path, "name = \"filed\"\nhangup_reloads = true\n").unwrap();

        let config = Config::load_from_file(&path).unwrap();
        assert_eq!(config.name, "filed");
        assert!(config.hangup_reloads);

        let missing = Config::load_from_file(dir.path().join("absent.toml")).unwrap();
        assert_eq!(missing.init_timeout_secs, crate::MAX_INIT_TIMEOUT_SECS);
    }

    #[test]
    fn test_invalid_file_is_config_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("detach.toml");
        std::fs::write(&path, "init_timeout_secs = \"soon\"\n").unwrap();

        let err = Config::load_from_file(&path).unwrap_err();
        assert!(err.is_config_error());
    }

    #[test]
    fn test_log_level_conversion() {
        assert_eq!(tracing::Level::from(LogLevel::Info), tracing::Level::INFO);
        assert_eq!(tracing::Level::from(LogLevel::Error), tracing::Level::ERROR);
    }
}

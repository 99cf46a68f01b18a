//! Engine configuration.
//!
//! Knobs for the embedded engine that the host does not pass through the C
//! API: runtime sizing, socket rebind policy, watchdog behaviour and logging.
//! Loaded from TOML with `WGKIT_*` environment overrides on top.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Environment variable naming an explicit config file.
pub const CONFIG_PATH_ENV: &str = "WGKIT_CONFIG";

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Error reading configuration file
    #[error("Failed to read config file: {0}")]
    IoError(#[from] io::Error),

    /// Error parsing TOML configuration
    #[error("Failed to parse TOML config: {0}")]
    TomlError(#[from] toml::de::Error),

    /// Error serializing configuration to TOML
    #[error("Failed to serialize config to TOML: {0}")]
    TomlSerError(#[from] toml::ser::Error),

    /// Invalid configuration value
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration file not found
    #[error("Configuration file not found at {0}")]
    FileNotFound(PathBuf),
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}

/// Logging settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Also print to stdout (default: false; the host logger is the main sink)
    #[serde(default)]
    pub log_to_stdout: bool,

    /// Also write a daily rolling file (default: false)
    #[serde(default)]
    pub log_to_file: bool,

    /// Directory for rolling log files (default: "./logs")
    #[serde(default = "default_log_dir")]
    pub log_dir: String,

    /// JSON formatted stdout/file output (default: false)
    #[serde(default)]
    pub json_format: bool,

    /// Lines buffered for the host logger before dropping (default: 1024)
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_log_dir() -> String {
    "./logs".to_string()
}

fn default_queue_capacity() -> usize {
    1024
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            log_to_stdout: false,
            log_to_file: false,
            log_dir: default_log_dir(),
            json_format: false,
            queue_capacity: default_queue_capacity(),
        }
    }
}

/// Async runtime settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RuntimeConfig {
    /// Worker threads of the engine runtime (default: 2)
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
}

fn default_worker_threads() -> usize {
    2
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            worker_threads: default_worker_threads(),
        }
    }
}

/// Handle registry settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RegistryConfig {
    /// Maximum number of live handles (default: i32::MAX)
    #[serde(default = "default_max_handles")]
    pub max_handles: i32,
}

fn default_max_handles() -> i32 {
    i32::MAX
}

impl Default for RegistryConfig {
    fn default() -> Self {
        RegistryConfig {
            max_handles: default_max_handles(),
        }
    }
}

/// Socket rebind policy used by bump.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BindConfig {
    /// Attempts before giving up (default: 10)
    #[serde(default = "default_bump_retries")]
    pub bump_retries: u32,

    /// Delay between attempts in milliseconds (default: 500)
    #[serde(default = "default_bump_retry_delay_ms")]
    pub bump_retry_delay_ms: u64,
}

fn default_bump_retries() -> u32 {
    10
}

fn default_bump_retry_delay_ms() -> u64 {
    500
}

impl Default for BindConfig {
    fn default() -> Self {
        BindConfig {
            bump_retries: default_bump_retries(),
            bump_retry_delay_ms: default_bump_retry_delay_ms(),
        }
    }
}

impl BindConfig {
    pub fn bump_retry_delay(&self) -> Duration {
        Duration::from_millis(self.bump_retry_delay_ms)
    }
}

/// Proxy attachment settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProxyConfig {
    /// Upper bound on the proxy handshake in milliseconds (default: 10000)
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

impl Default for ProxyConfig {
    fn default() -> Self {
        ProxyConfig {
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl ProxyConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// What the watchdog does after repeated probe failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryPolicy {
    /// Rebind the session sockets (default)
    #[default]
    Rebump,
    /// Only log
    Observe,
}

/// Health-check watchdog settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WatchdogConfig {
    /// Probe period in milliseconds (default: 5000)
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    /// Per-probe timeout in milliseconds (default: 2000)
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    /// Port used when the probe address has none (default: 443)
    #[serde(default = "default_probe_port")]
    pub probe_port: u16,

    /// Consecutive failures before recovery (default: 3)
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default)]
    pub recovery: RecoveryPolicy,
}

fn default_interval_ms() -> u64 {
    5_000
}

fn default_probe_timeout_ms() -> u64 {
    2_000
}

fn default_probe_port() -> u16 {
    443
}

fn default_failure_threshold() -> u32 {
    3
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        WatchdogConfig {
            interval_ms: default_interval_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
            probe_port: default_probe_port(),
            failure_threshold: default_failure_threshold(),
            recovery: RecoveryPolicy::default(),
        }
    }
}

impl WatchdogConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

/// Diagnostics settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DiagnosticsConfig {
    /// Log a dump of live sessions on SIGUSR2 (default: true)
    #[serde(default = "default_true")]
    pub dump_on_sigusr2: bool,
}

fn default_true() -> bool {
    true
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        DiagnosticsConfig {
            dump_on_sigusr2: default_true(),
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Log level (default: "info")
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub runtime: RuntimeConfig,

    #[serde(default)]
    pub registry: RegistryConfig,

    #[serde(default)]
    pub bind: BindConfig,

    #[serde(default)]
    pub proxy: ProxyConfig,

    #[serde(default)]
    pub watchdog: WatchdogConfig,

    #[serde(default)]
    pub diagnostics: DiagnosticsConfig,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            log_level: default_log_level(),
            logging: LoggingConfig::default(),
            runtime: RuntimeConfig::default(),
            registry: RegistryConfig::default(),
            bind: BindConfig::default(),
            proxy: ProxyConfig::default(),
            watchdog: WatchdogConfig::default(),
            diagnostics: DiagnosticsConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path)?;
        let mut config: EngineConfig = toml::from_str(&content)?;
        config.validate()?;

        // Environment takes precedence over the file
        Self::apply_env_overrides(&mut config);
        config.validate()?;

        Ok(config)
    }

    /// Load from `$WGKIT_CONFIG`, else the default path if it exists, else
    /// built-in defaults (with environment overrides).
    pub fn load_default() -> Result<Self, ConfigError> {
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            if !path.is_empty() {
                return Self::load(path);
            }
        }

        let path = Self::default_path();
        if path.exists() {
            return Self::load(path);
        }

        let mut config = EngineConfig::default();
        Self::apply_env_overrides(&mut config);
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !matches!(
            self.log_level.as_str(),
            "trace" | "debug" | "info" | "warn" | "error"
        ) {
            return Err(invalid(
                "log_level",
                "must be one of trace, debug, info, warn, error",
            ));
        }
        if self.logging.queue_capacity == 0 {
            return Err(invalid("logging.queue_capacity", "must be greater than 0"));
        }
        if self.logging.log_to_file && self.logging.log_dir.trim().is_empty() {
            return Err(invalid(
                "logging.log_dir",
                "log directory cannot be empty when log_to_file=true",
            ));
        }
        if self.runtime.worker_threads == 0 {
            return Err(invalid("runtime.worker_threads", "must be greater than 0"));
        }
        if self.registry.max_handles <= 0 {
            return Err(invalid("registry.max_handles", "must be greater than 0"));
        }
        if self.bind.bump_retries == 0 {
            return Err(invalid("bind.bump_retries", "must be greater than 0"));
        }
        if self.proxy.connect_timeout_ms == 0 {
            return Err(invalid("proxy.connect_timeout_ms", "must be greater than 0"));
        }
        if self.watchdog.interval_ms == 0 {
            return Err(invalid("watchdog.interval_ms", "must be greater than 0"));
        }
        if self.watchdog.probe_timeout_ms == 0 {
            return Err(invalid("watchdog.probe_timeout_ms", "must be greater than 0"));
        }
        if self.watchdog.probe_port == 0 {
            return Err(invalid("watchdog.probe_port", "must be greater than 0"));
        }
        if self.watchdog.failure_threshold == 0 {
            return Err(invalid("watchdog.failure_threshold", "must be greater than 0"));
        }
        Ok(())
    }

    /// Apply environment variable overrides (prefix: WGKIT_)
    /// Example keys:
    /// - WGKIT_LOG_LEVEL, WGKIT_LOG_TO_STDOUT, WGKIT_LOG_TO_FILE, WGKIT_LOG_DIR, WGKIT_LOG_JSON
    /// - WGKIT_RUNTIME_WORKER_THREADS, WGKIT_REGISTRY_MAX_HANDLES
    /// - WGKIT_BIND_BUMP_RETRIES, WGKIT_BIND_BUMP_RETRY_DELAY_MS, WGKIT_PROXY_CONNECT_TIMEOUT_MS
    /// - WGKIT_WATCHDOG_INTERVAL_MS, WGKIT_WATCHDOG_PROBE_TIMEOUT_MS, WGKIT_WATCHDOG_PROBE_PORT,
    ///   WGKIT_WATCHDOG_FAILURE_THRESHOLD, WGKIT_WATCHDOG_RECOVERY
    /// - WGKIT_DIAGNOSTICS_DUMP_ON_SIGUSR2
    fn apply_env_overrides(cfg: &mut EngineConfig) {
        use std::env;

        fn parse_bool(s: &str) -> Option<bool> {
            match s.to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "y" => Some(true),
                "false" | "0" | "no" | "n" => Some(false),
                _ => None,
            }
        }
        fn set_parsed<T: std::str::FromStr>(name: &str, slot: &mut T) {
            if let Ok(v) = env::var(name) {
                if let Ok(n) = v.trim().parse() {
                    *slot = n;
                }
            }
        }
        fn set_bool(name: &str, slot: &mut bool) {
            if let Ok(v) = env::var(name) {
                if let Some(b) = parse_bool(&v) {
                    *slot = b;
                }
            }
        }

        // Logging
        if let Ok(v) = env::var("WGKIT_LOG_LEVEL") {
            cfg.log_level = v.to_ascii_lowercase();
        }
        set_bool("WGKIT_LOG_TO_STDOUT", &mut cfg.logging.log_to_stdout);
        set_bool("WGKIT_LOG_TO_FILE", &mut cfg.logging.log_to_file);
        if let Ok(v) = env::var("WGKIT_LOG_DIR") {
            if !v.is_empty() {
                cfg.logging.log_dir = v;
            }
        }
        set_bool("WGKIT_LOG_JSON", &mut cfg.logging.json_format);
        set_parsed("WGKIT_LOG_QUEUE_CAPACITY", &mut cfg.logging.queue_capacity);

        // Runtime and registry
        set_parsed("WGKIT_RUNTIME_WORKER_THREADS", &mut cfg.runtime.worker_threads);
        set_parsed("WGKIT_REGISTRY_MAX_HANDLES", &mut cfg.registry.max_handles);

        // Bind and proxy
        set_parsed("WGKIT_BIND_BUMP_RETRIES", &mut cfg.bind.bump_retries);
        set_parsed("WGKIT_BIND_BUMP_RETRY_DELAY_MS", &mut cfg.bind.bump_retry_delay_ms);
        set_parsed("WGKIT_PROXY_CONNECT_TIMEOUT_MS", &mut cfg.proxy.connect_timeout_ms);

        // Watchdog
        set_parsed("WGKIT_WATCHDOG_INTERVAL_MS", &mut cfg.watchdog.interval_ms);
        set_parsed("WGKIT_WATCHDOG_PROBE_TIMEOUT_MS", &mut cfg.watchdog.probe_timeout_ms);
        set_parsed("WGKIT_WATCHDOG_PROBE_PORT", &mut cfg.watchdog.probe_port);
        set_parsed("WGKIT_WATCHDOG_FAILURE_THRESHOLD", &mut cfg.watchdog.failure_threshold);
        if let Ok(v) = env::var("WGKIT_WATCHDOG_RECOVERY") {
            match v.to_ascii_lowercase().as_str() {
                "rebump" => cfg.watchdog.recovery = RecoveryPolicy::Rebump,
                "observe" => cfg.watchdog.recovery = RecoveryPolicy::Observe,
                _ => {}
            }
        }

        // Diagnostics
        set_bool(
            "WGKIT_DIAGNOSTICS_DUMP_ON_SIGUSR2",
            &mut cfg.diagnostics.dump_on_sigusr2,
        );
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("wgkit").join("engine.toml")
        } else {
            PathBuf::from("engine.toml")
        }
    }
}

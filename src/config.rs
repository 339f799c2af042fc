//! Configuration loading and constants.
//!
//! Loads server configuration from a TOML file with per-environment overrides
//! and resolves it into the scalar values the lifecycle core consumes
//! (`ServerConfig`). Also defines defaults for addresses, paths, logging, and
//! the remote stop protocol.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::format::{Item, StrftimeItems};
use const_format::formatcp;
use serde::Deserialize;

// =============================================================================
// Server Defaults
// =============================================================================

/// Default bind host
pub const DEFAULT_HOST: &str = "0.0.0.0";

/// Default bind port
pub const DEFAULT_PORT: u16 = 9000;

/// Default bind address
pub const DEFAULT_ADDR: &str = formatcp!("{}:{}", DEFAULT_HOST, DEFAULT_PORT);

/// Default environment name
pub const DEFAULT_ENV: &str = "dev";

/// Extension appended to the executable path for the default PID file
pub const PID_FILE_EXTENSION: &str = "pid";

/// Extension appended to the executable path for the default config file
pub const CONFIG_FILE_EXTENSION: &str = "toml";

/// Name used when the executable path cannot be determined
pub const FALLBACK_APP_NAME: &str = "vigil";

/// hyper refuses read buffers smaller than this
pub const MIN_HEADER_BUFFER_BYTES: usize = 8192;

// =============================================================================
// Remote Stop Protocol
// =============================================================================

/// Interval between liveness polls after signalling a remote server
pub const REMOTE_STOP_POLL_INTERVAL_MS: u64 = 100;

/// Number of polls before a remote stop is reported as timed out (5 seconds)
pub const REMOTE_STOP_POLL_ATTEMPTS: u32 = 50;

// =============================================================================
// Logging
// =============================================================================

/// Default log filter when RUST_LOG is not set
pub const DEFAULT_LOG_FILTER: &str = "vigil=info";

/// Default log format (text or json)
pub const DEFAULT_LOG_FORMAT: &str = "text";

/// Default access log line, Apache combined format
pub const DEFAULT_ACCESS_LOG_FORMAT: &str =
    "$RemoteAddr - $RemoteUser $Time \"$Request\" $Status $BodyBytes \"$HttpReferer\" \"$HttpUserAgent\"";

/// Default timestamp format for `$Time` (chrono strftime syntax)
pub const DEFAULT_ACCESS_LOG_TIME_FORMAT: &str = "[%d/%b/%Y:%H:%M:%S %z]";

/// Path of the running executable as given on the command line.
fn app_path() -> PathBuf {
    std::env::args_os()
        .next()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(FALLBACK_APP_NAME))
}

fn with_extension_appended(path: PathBuf, ext: &str) -> PathBuf {
    let mut raw = path.into_os_string();
    raw.push(".");
    raw.push(ext);
    PathBuf::from(raw)
}

/// Default PID file: the executable path with `.pid` appended.
pub fn default_pid_file() -> PathBuf {
    with_extension_appended(app_path(), PID_FILE_EXTENSION)
}

/// Default config file: the executable path with `.toml` appended.
pub fn default_config_file() -> PathBuf {
    with_extension_appended(app_path(), CONFIG_FILE_EXTENSION)
}

/// Parse a duration such as `500ms`, `1s`, `5m` or `2h`. A bare number is seconds.
pub fn parse_duration(s: &str) -> Result<Duration, ConfigError> {
    let s = s.trim().to_lowercase();
    let invalid = || ConfigError::Validation(format!("Invalid duration: {:?}", s));

    let (num_str, unit_ms) = if let Some(n) = s.strip_suffix("ms") {
        (n, 1)
    } else if let Some(n) = s.strip_suffix('h') {
        (n, 60 * 60 * 1000)
    } else if let Some(n) = s.strip_suffix('m') {
        (n, 60 * 1000)
    } else if let Some(n) = s.strip_suffix('s') {
        (n, 1000)
    } else {
        (s.as_str(), 1000)
    };

    let num: u64 = num_str.trim().parse().map_err(|_| invalid())?;
    num.checked_mul(unit_ms)
        .map(Duration::from_millis)
        .ok_or_else(invalid)
}

/// Resolved settings for one server instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Address to bind, e.g. `127.0.0.1:9000`
    pub addr: String,
    /// PID file claimed while serving
    pub pid_file: PathBuf,
    /// TLS certificate chain (PEM). TLS is enabled only with `key_file` too.
    pub cert_file: Option<PathBuf>,
    /// TLS private key (PEM)
    pub key_file: Option<PathBuf>,
    /// Maximum time to read request headers
    pub read_timeout: Option<Duration>,
    /// Maximum time for the handler to produce a response
    pub write_timeout: Option<Duration>,
    /// Read buffer size limit, which bounds request header size
    pub max_header_bytes: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: DEFAULT_ADDR.to_string(),
            pid_file: default_pid_file(),
            cert_file: None,
            key_file: None,
            read_timeout: None,
            write_timeout: None,
            max_header_bytes: None,
        }
    }
}

impl ServerConfig {
    /// Config for `addr` with a specific PID file and no other settings.
    pub fn new(addr: impl Into<String>, pid_file: impl Into<PathBuf>) -> Self {
        Self {
            addr: addr.into(),
            pid_file: pid_file.into(),
            ..Default::default()
        }
    }

    /// Certificate and key paths when both are configured.
    pub fn tls_paths(&self) -> Option<(&Path, &Path)> {
        match (&self.cert_file, &self.key_file) {
            (Some(cert), Some(key)) => Some((cert.as_path(), key.as_path())),
            _ => None,
        }
    }
}

/// One `[server]` or `[env.<name>]` table. Every key is optional so that
/// environment tables only need to name what they override.
#[derive(Debug, Clone, Default, Deserialize)]
struct ServerSection {
    addr: Option<String>,
    pid_file: Option<PathBuf>,
    cert_file: Option<PathBuf>,
    key_file: Option<PathBuf>,
    read_timeout: Option<String>,
    write_timeout: Option<String>,
    max_header_bytes: Option<usize>,
}

impl ServerSection {
    /// Fill unset keys from `base`.
    fn or(self, base: &ServerSection) -> ServerSection {
        ServerSection {
            addr: self.addr.or_else(|| base.addr.clone()),
            pid_file: self.pid_file.or_else(|| base.pid_file.clone()),
            cert_file: self.cert_file.or_else(|| base.cert_file.clone()),
            key_file: self.key_file.or_else(|| base.key_file.clone()),
            read_timeout: self.read_timeout.or_else(|| base.read_timeout.clone()),
            write_timeout: self.write_timeout.or_else(|| base.write_timeout.clone()),
            max_header_bytes: self.max_header_bytes.or(base.max_header_bytes),
        }
    }

    fn resolve(self) -> Result<ServerConfig, ConfigError> {
        let defaults = ServerConfig::default();

        let max_header_bytes = match self.max_header_bytes {
            Some(n) if n < MIN_HEADER_BUFFER_BYTES => {
                return Err(ConfigError::Validation(format!(
                    "max_header_bytes must be at least {}, got {}",
                    MIN_HEADER_BUFFER_BYTES, n
                )))
            }
            other => other,
        };

        Ok(ServerConfig {
            addr: self.addr.unwrap_or(defaults.addr),
            pid_file: self.pid_file.unwrap_or(defaults.pid_file),
            cert_file: self.cert_file,
            key_file: self.key_file,
            read_timeout: self.read_timeout.as_deref().map(parse_duration).transpose()?,
            write_timeout: self.write_timeout.as_deref().map(parse_duration).transpose()?,
            max_header_bytes,
        })
    }
}

/// Raw shape of the configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    server: ServerSection,
    #[serde(default)]
    env: HashMap<String, ServerSection>,
    #[serde(default)]
    app: toml::Table,
    #[serde(default)]
    env_app: HashMap<String, toml::Table>,
    #[serde(default)]
    logging: LoggingConfig,
    #[serde(default)]
    access_log: AccessLogConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "text" (human-readable, default) or "json" (structured)
    #[serde(default = "LoggingConfig::default_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: DEFAULT_LOG_FORMAT.to_string(),
        }
    }
}

impl LoggingConfig {
    fn default_format() -> String {
        DEFAULT_LOG_FORMAT.to_string()
    }

    pub fn is_json(&self) -> bool {
        self.format.eq_ignore_ascii_case("json")
    }
}

/// Access log line layout
#[derive(Debug, Clone, Deserialize)]
pub struct AccessLogConfig {
    #[serde(default = "AccessLogConfig::default_format")]
    pub format: String,
    #[serde(default = "AccessLogConfig::default_time_format")]
    pub time_format: String,
}

impl Default for AccessLogConfig {
    fn default() -> Self {
        Self {
            format: Self::default_format(),
            time_format: Self::default_time_format(),
        }
    }
}

impl AccessLogConfig {
    fn default_format() -> String {
        DEFAULT_ACCESS_LOG_FORMAT.to_string()
    }

    fn default_time_format() -> String {
        DEFAULT_ACCESS_LOG_TIME_FORMAT.to_string()
    }

    /// Reject strftime formats chrono cannot render.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if StrftimeItems::new(&self.time_format).any(|item| matches!(item, Item::Error)) {
            return Err(ConfigError::Validation(format!(
                "[access_log] time_format {:?} is not a valid strftime format",
                self.time_format
            )));
        }
        Ok(())
    }
}

/// Fully resolved configuration for one environment.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Environment the values were resolved for
    pub env: String,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub access_log: AccessLogConfig,
    /// `[app]` merged with `[env_app.<env>]`
    app: toml::Table,
}

impl AppConfig {
    /// Built-in defaults for `env`, used when no config file is present.
    pub fn defaults(env: &str) -> Self {
        Self {
            env: env.to_string(),
            server: ServerConfig::default(),
            logging: LoggingConfig::default(),
            access_log: AccessLogConfig::default(),
            app: toml::Table::new(),
        }
    }

    pub fn load<P: AsRef<Path>>(path: P, env: &str) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents, env)
    }

    pub fn parse(contents: &str, env: &str) -> Result<Self, ConfigError> {
        let mut file: ConfigFile = toml::from_str(contents)?;

        let server = file
            .env
            .remove(env)
            .unwrap_or_default()
            .or(&file.server)
            .resolve()?;

        file.access_log.validate()?;

        let mut app = file.app;
        if let Some(overrides) = file.env_app.remove(env) {
            app.extend(overrides);
        }

        Ok(Self {
            env: env.to_string(),
            server,
            logging: file.logging,
            access_log: file.access_log,
            app,
        })
    }

    /// Look up an `[app]` value as a string.
    pub fn string(&self, key: &str) -> Result<&str, ConfigError> {
        self.value(key)?
            .as_str()
            .ok_or_else(|| Self::wrong_type(key, "string"))
    }

    /// Look up an `[app]` value as an integer.
    pub fn int(&self, key: &str) -> Result<i64, ConfigError> {
        self.value(key)?
            .as_integer()
            .ok_or_else(|| Self::wrong_type(key, "integer"))
    }

    /// Look up an `[app]` value as a boolean.
    pub fn bool(&self, key: &str) -> Result<bool, ConfigError> {
        self.value(key)?
            .as_bool()
            .ok_or_else(|| Self::wrong_type(key, "boolean"))
    }

    fn value(&self, key: &str) -> Result<&toml::Value, ConfigError> {
        self.app
            .get(key)
            .ok_or_else(|| ConfigError::MissingKey(key.to_string()))
    }

    fn wrong_type(key: &str, expected: &str) -> ConfigError {
        ConfigError::Validation(format!("[app] {} is not a {}", key, expected))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Missing config key: {0}")]
    MissingKey(String),
    #[error("Configuration error: {0}")]
    Validation(String),
}

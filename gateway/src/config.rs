//! Gateway configuration.
//!
//! Values come from three layers: an optional TOML file, environment
//! variables, and positional command-line arguments, each overriding the
//! previous one. The environment variables match the deployment surface
//! of the gateway (`CANDIDATES`, `LISTEN_HOST`, `NUM_THREADS`, ...).

use serde::Deserialize;
use std::fmt;
use std::path::Path;

/// Worker thread count bounds.
pub const MIN_WORKERS: usize = 1;
pub const MAX_WORKERS: usize = 64;

/// Main configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Client listener.
    #[serde(default)]
    pub listen: ListenConfig,

    /// Comma-separated `host:port` candidate backends.
    #[serde(default)]
    pub candidates: Option<String>,

    /// Worker thread configuration.
    #[serde(default)]
    pub workers: WorkersConfig,

    /// Health probe configuration.
    #[serde(default)]
    pub probe: ProbeConfig,

    /// Client/backend socket options.
    #[serde(default)]
    pub tcp: TcpConfig,

    /// Metrics endpoint.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Client listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ListenConfig {
    #[serde(default = "ListenConfig::default_host")]
    pub host: String,
    #[serde(default = "ListenConfig::default_port")]
    pub port: u16,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            host: Self::default_host(),
            port: Self::default_port(),
        }
    }
}

impl ListenConfig {
    fn default_host() -> String {
        "localhost".to_string()
    }

    fn default_port() -> u16 {
        5432
    }
}

/// Worker thread configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkersConfig {
    /// Number of forwarder threads, clamped to [1, 64].
    #[serde(default = "WorkersConfig::default_threads")]
    pub threads: usize,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            threads: Self::default_threads(),
        }
    }
}

impl WorkersConfig {
    fn default_threads() -> usize {
        1
    }
}

/// Health probe configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ProbeConfig {
    /// Database used for probe sessions.
    #[serde(default = "ProbeConfig::default_dbname")]
    pub dbname: String,

    /// Probe channel connect timeout in milliseconds.
    #[serde(default = "ProbeConfig::default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Server-side statement timeout applied to probe queries.
    #[serde(default = "ProbeConfig::default_query_timeout_ms")]
    pub query_timeout_ms: u64,

    /// Seconds between probe cycles.
    #[serde(default = "ProbeConfig::default_check_every_secs")]
    pub check_every_secs: u64,

    /// Probe credentials (folded into the connection string).
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            dbname: Self::default_dbname(),
            connect_timeout_ms: Self::default_connect_timeout_ms(),
            query_timeout_ms: Self::default_query_timeout_ms(),
            check_every_secs: Self::default_check_every_secs(),
            user: None,
            password: None,
        }
    }
}

impl ProbeConfig {
    fn default_dbname() -> String {
        "postgres".to_string()
    }

    fn default_connect_timeout_ms() -> u64 {
        800
    }

    fn default_query_timeout_ms() -> u64 {
        500
    }

    fn default_check_every_secs() -> u64 {
        2
    }

    /// Build the libpq-style connection string for one candidate.
    ///
    /// `connect_timeout` is whole seconds, rounded up so a sub-second
    /// configuration still bounds the connect.
    pub fn conninfo(&self, host: &str, port: u16) -> String {
        let timeout_secs = self.connect_timeout_ms.div_ceil(1000).max(1);
        let mut s = format!(
            "host={} port={} connect_timeout={} dbname={} application_name=pg-gateway",
            host, port, timeout_secs, self.dbname
        );
        if let Some(user) = &self.user {
            s.push_str(&format!(" user={}", user));
        }
        if let Some(password) = &self.password {
            s.push_str(&format!(" password={}", password));
        }
        s
    }
}

/// Socket options applied to client and backend connections.
#[derive(Debug, Clone, Deserialize)]
pub struct TcpConfig {
    /// Enable keepalive (idle 60s, interval 10s, 3 probes).
    #[serde(default = "TcpConfig::default_keepalive")]
    pub keepalive: bool,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            keepalive: Self::default_keepalive(),
        }
    }
}

impl TcpConfig {
    fn default_keepalive() -> bool {
        true
    }
}

/// Metrics endpoint configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "MetricsConfig::default_host")]
    pub host: String,
    #[serde(default = "MetricsConfig::default_port")]
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            host: Self::default_host(),
            port: Self::default_port(),
        }
    }
}

impl MetricsConfig {
    fn default_host() -> String {
        "::".to_string()
    }

    fn default_port() -> u16 {
        9090
    }
}

/// Logging configuration.
///
/// The gateway runs named threads (`worker-N`, `health`, `metrics`);
/// `thread_names` tags every event with its origin so a forwarding
/// problem can be pinned to one worker loop.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Level filter applied when `RUST_LOG` is not set.
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,

    /// Output format.
    #[serde(default)]
    pub format: LogFormat,

    /// Tag events with the originating thread name.
    #[serde(default = "LoggingConfig::default_thread_names")]
    pub thread_names: bool,
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable, one event per line with ANSI colors.
    #[default]
    Pretty,
    /// Newline-delimited JSON for log shippers.
    Json,
    /// Terse single-line output.
    Compact,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
            format: LogFormat::default(),
            thread_names: Self::default_thread_names(),
        }
    }
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_string()
    }

    fn default_thread_names() -> bool {
        true
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        let config: Config = toml::from_str(&content).map_err(ConfigError::Parse)?;
        Ok(config)
    }

    /// Overlay environment variables on top of the current values.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(host) = std::env::var("LISTEN_HOST") {
            self.listen.host = host;
        }
        if let Ok(port) = std::env::var("LISTEN_PORT") {
            self.listen.port = parse_env("LISTEN_PORT", &port)?;
        }
        if let Ok(candidates) = std::env::var("CANDIDATES") {
            self.candidates = Some(candidates);
        }
        if let Ok(threads) = std::env::var("NUM_THREADS") {
            self.workers.threads = parse_env("NUM_THREADS", &threads)?;
        }
        if let Ok(dbname) = std::env::var("PGDATABASE") {
            self.probe.dbname = dbname;
        }
        if let Ok(ms) = std::env::var("CONNECT_TIMEOUT_MS") {
            self.probe.connect_timeout_ms = parse_env("CONNECT_TIMEOUT_MS", &ms)?;
        }
        if let Ok(ms) = std::env::var("QUERY_TIMEOUT_MS") {
            self.probe.query_timeout_ms = parse_env("QUERY_TIMEOUT_MS", &ms)?;
        }
        if let Ok(secs) = std::env::var("CHECK_EVERY") {
            self.probe.check_every_secs = parse_env("CHECK_EVERY", &secs)?;
        }
        if let Ok(user) = std::env::var("PGUSER") {
            self.probe.user = Some(user);
        }
        if let Ok(password) = std::env::var("PGPASSWORD") {
            self.probe.password = Some(password);
        }
        if let Ok(ka) = std::env::var("TCP_KEEPALIVE") {
            self.tcp.keepalive = ka != "0";
        }
        if let Ok(host) = std::env::var("METRICS_HOST") {
            self.metrics.host = host;
        }
        if let Ok(port) = std::env::var("METRICS_PORT") {
            self.metrics.port = parse_env("METRICS_PORT", &port)?;
        }

        self.workers.threads = self.workers.threads.clamp(MIN_WORKERS, MAX_WORKERS);
        Ok(())
    }

    /// Overlay positional command-line arguments (listen address, port).
    pub fn apply_args(
        &mut self,
        addr: Option<&str>,
        port: Option<&str>,
    ) -> Result<(), ConfigError> {
        if let Some(addr) = addr {
            self.listen.host = addr.to_string();
        }
        if let Some(port) = port {
            self.listen.port = parse_env("listen_port", port)?;
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::Invalid {
        name: name.to_string(),
        value: value.to_string(),
    })
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    Invalid { name: String, value: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Invalid { name, value } => {
                write!(f, "invalid value '{}' for {}", value, name)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

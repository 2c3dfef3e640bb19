//! Server configuration.
//!
//! Configuration is resolved once at startup, in this order:
//! - TOML configuration file (`--config`, or the first default path that exists)
//! - Environment variable overrides
//! - Validation and path normalization
//!
//! The result is immutable and handed to every component explicitly.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Default locations searched for a configuration file.
const CONFIG_PATHS: [&str; 3] = [
    "chord-relay.toml",
    "/etc/chord-relay/chord-relay.toml",
    "~/.config/chord-relay/chord-relay.toml",
];

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to when listening on a TCP port.
    #[serde(default = "default_host")]
    pub host: String,

    /// TCP port or Unix socket path to listen on.
    #[serde(default)]
    pub listen_on: ListenTarget,

    /// Parse bus payloads as JSON (`true`) or relay them as raw strings.
    #[serde(default = "default_true")]
    pub json_messages: bool,

    /// Prefix for every HTTP route.
    #[serde(default)]
    pub base_path: String,

    /// Mount path of the WebSocket endpoint, below `base_path`.
    #[serde(default = "default_socket_io_path")]
    pub socket_io_path: String,

    /// How long shutdown waits for sessions to flush, in milliseconds.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_ms: u64,

    /// Message bus configuration.
    #[serde(default)]
    pub bus: BusConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Heartbeat configuration.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Discovery descriptor.
    #[serde(default)]
    pub service: ServiceConfig,
}

/// Where the server listens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawListenTarget", into = "String")]
pub enum ListenTarget {
    /// A TCP port on `host`.
    Port(u16),
    /// A Unix domain socket path.
    Socket(PathBuf),
}

/// `listen_on` may be written as a TOML integer or string.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawListenTarget {
    Number(u64),
    Text(String),
}

/// Message bus configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusConfig {
    /// Redis connection URL, `host:port`, or Unix socket path.
    #[serde(default = "default_bus_url")]
    pub url: String,

    /// Channel pattern to subscribe to.
    #[serde(default = "default_pattern")]
    pub pattern: String,

    /// Time allowed to open a bus connection, in milliseconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// First reconnect delay after losing the bus, in milliseconds.
    #[serde(default = "default_reconnect_initial")]
    pub reconnect_initial_ms: u64,

    /// Upper bound for the reconnect delay, in milliseconds.
    #[serde(default = "default_reconnect_max")]
    pub reconnect_max_ms: u64,
}

/// Resource limits configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of concurrent sessions.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Outbound frames queued per session before deliveries start failing.
    #[serde(default = "default_session_buffer")]
    pub session_buffer: usize,

    /// Maximum inbound WebSocket message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Interval between server pings, in milliseconds.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_ms: u64,
}

/// Metrics configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable the Prometheus exporter.
    #[serde(default)]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

/// Fields of the `service-info` descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_service_id")]
    pub id: String,

    #[serde(default = "default_service_name")]
    pub name: String,

    /// Service type; derived from `id` and `version` when unset.
    #[serde(default, rename = "type")]
    pub kind: Option<String>,

    #[serde(default = "default_service_description")]
    pub description: String,

    #[serde(default = "default_organization_name")]
    pub organization_name: String,

    #[serde(default = "default_organization_url")]
    pub organization_url: String,

    #[serde(default = "default_contact_url")]
    pub contact_url: String,

    #[serde(default = "default_version")]
    pub version: String,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_true() -> bool {
    true
}

fn default_socket_io_path() -> String {
    "/socket.io".to_string()
}

fn default_shutdown_grace() -> u64 {
    5_000
}

fn default_bus_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_pattern() -> String {
    "chord.*".to_string()
}

fn default_connect_timeout() -> u64 {
    5_000
}

fn default_reconnect_initial() -> u64 {
    500
}

fn default_reconnect_max() -> u64 {
    30_000
}

fn default_max_connections() -> usize {
    10_000
}

fn default_session_buffer() -> usize {
    256
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_heartbeat_interval() -> u64 {
    25_000
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_service_id() -> String {
    "ca.c3g.chord:event-relay".to_string()
}

fn default_service_name() -> String {
    "CHORD Event Relay".to_string()
}

fn default_service_description() -> String {
    "Event relay for a CHORD application.".to_string()
}

fn default_organization_name() -> String {
    "C3G".to_string()
}

fn default_organization_url() -> String {
    "http://www.computationalgenomics.ca".to_string()
}

fn default_contact_url() -> String {
    "mailto:info@computationalgenomics.ca".to_string()
}

fn default_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            listen_on: ListenTarget::default(),
            json_messages: true,
            base_path: String::new(),
            socket_io_path: default_socket_io_path(),
            shutdown_grace_ms: default_shutdown_grace(),
            bus: BusConfig::default(),
            limits: LimitsConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            metrics: MetricsConfig::default(),
            service: ServiceConfig::default(),
        }
    }
}

impl Default for ListenTarget {
    fn default() -> Self {
        Self::Port(8080)
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            url: default_bus_url(),
            pattern: default_pattern(),
            connect_timeout_ms: default_connect_timeout(),
            reconnect_initial_ms: default_reconnect_initial(),
            reconnect_max_ms: default_reconnect_max(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            session_buffer: default_session_buffer(),
            max_message_size: default_max_message_size(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            id: default_service_id(),
            name: default_service_name(),
            kind: None,
            description: default_service_description(),
            organization_name: default_organization_name(),
            organization_url: default_organization_url(),
            contact_url: default_contact_url(),
            version: default_version(),
        }
    }
}

impl FromStr for ListenTarget {
    type Err = String;

    /// A value made only of digits is a port; anything else is a socket path.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err("listen target cannot be empty".to_string());
        }
        if s.bytes().all(|b| b.is_ascii_digit()) {
            return s
                .parse::<u16>()
                .map(Self::Port)
                .map_err(|_| format!("port out of range: {s}"));
        }
        Ok(Self::Socket(PathBuf::from(s)))
    }
}

impl TryFrom<RawListenTarget> for ListenTarget {
    type Error = String;

    fn try_from(raw: RawListenTarget) -> Result<Self, Self::Error> {
        match raw {
            RawListenTarget::Number(n) => u16::try_from(n)
                .map(Self::Port)
                .map_err(|_| format!("port out of range: {n}")),
            RawListenTarget::Text(s) => s.parse(),
        }
    }
}

impl From<ListenTarget> for String {
    fn from(target: ListenTarget) -> Self {
        target.to_string()
    }
}

impl fmt::Display for ListenTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Port(port) => write!(f, "{port}"),
            Self::Socket(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Reject path segments the router would read as captures or wildcards.
fn check_route_path(key: &str, path: &str) -> Result<()> {
    if path.contains(['{', '}', '*']) {
        bail!("{key} cannot contain '{{', '}}' or '*', got {path:?}");
    }
    if path.split('/').any(|segment| segment.starts_with(':')) {
        bail!("{key} segments cannot start with ':', got {path:?}");
    }
    Ok(())
}

/// Parse a boolean environment value.
fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        other => bail!("{key} must be a boolean, got {other:?}"),
    }
}

impl Config {
    /// Resolve the full configuration: file, then environment, then validation.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file cannot be read or parsed, or if any
    /// value is invalid.
    pub fn resolve<F>(path: Option<&Path>, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::load()?,
        };
        config.apply_env(lookup)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from the first default path that exists, or defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        for path in &CONFIG_PATHS {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Apply environment overrides.
    ///
    /// `SERVICE_SOCKET` takes precedence over `LISTEN_ON`.
    ///
    /// # Errors
    ///
    /// Returns an error if an override has an invalid value.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(value) = get("JSON_MESSAGES") {
            self.json_messages = parse_bool("JSON_MESSAGES", &value)?;
        }
        if let Some(value) = get("REDIS_CONNECTION") {
            self.bus.url = value;
        }
        if let Some(value) = get("REDIS_SUBSCRIBE_PATTERN") {
            self.bus.pattern = value;
        }
        if let Some(value) = lookup("SERVICE_URL_BASE_PATH") {
            self.base_path = value;
        }
        if let Some(value) = get("SOCKET_IO_PATH") {
            self.socket_io_path = value;
        }
        if let Some((key, value)) = get("SERVICE_SOCKET")
            .map(|v| ("SERVICE_SOCKET", v))
            .or_else(|| get("LISTEN_ON").map(|v| ("LISTEN_ON", v)))
        {
            self.listen_on = value
                .parse()
                .map_err(|e| anyhow::anyhow!("{key}: {e}"))?;
        }
        if let Some(value) = get("RELAY_HOST") {
            self.host = value;
        }
        if let Some(value) = get("RELAY_METRICS_PORT") {
            self.metrics.port = value
                .trim()
                .parse()
                .with_context(|| format!("RELAY_METRICS_PORT: invalid port {value:?}"))?;
            self.metrics.enabled = true;
        }

        Ok(())
    }

    /// Check values and normalize route paths.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first invalid value.
    pub fn validate(&mut self) -> Result<()> {
        let base = self.base_path.trim().trim_end_matches('/');
        self.base_path = if base.is_empty() || base.starts_with('/') {
            base.to_string()
        } else {
            format!("/{base}")
        };

        let socket_io = self.socket_io_path.trim();
        if !socket_io.starts_with('/') {
            bail!("socket_io_path must start with '/', got {socket_io:?}");
        }
        let socket_io = socket_io.trim_end_matches('/');
        if socket_io.is_empty() {
            bail!("socket_io_path cannot be the root path");
        }
        self.socket_io_path = socket_io.to_string();

        check_route_path("base_path", &self.base_path)?;
        check_route_path("socket_io_path", &self.socket_io_path)?;
        if self.socket_path() == self.service_info_path() {
            bail!(
                "socket_io_path {:?} collides with the service-info route",
                self.socket_io_path
            );
        }

        if self.bus.pattern.trim().is_empty() {
            bail!("bus.pattern cannot be empty");
        }
        if self.limits.session_buffer == 0 {
            bail!("limits.session_buffer must be at least 1");
        }
        if self.heartbeat.interval_ms == 0 {
            bail!("heartbeat.interval_ms must be greater than 0");
        }
        if self.bus.reconnect_initial_ms == 0
            || self.bus.reconnect_max_ms < self.bus.reconnect_initial_ms
        {
            bail!("bus.reconnect_initial_ms must be > 0 and <= bus.reconnect_max_ms");
        }

        Ok(())
    }

    /// Route of the discovery endpoint.
    #[must_use]
    pub fn service_info_path(&self) -> String {
        format!("{}/service-info", self.base_path)
    }

    /// Route of the WebSocket endpoint.
    #[must_use]
    pub fn socket_path(&self) -> String {
        format!("{}{}", self.base_path, self.socket_io_path)
    }

    #[must_use]
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

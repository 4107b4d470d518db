//! Configuration types for emptyendpoints-dns.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::error::ProxyError;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// DNS listener and upstream configuration.
    pub dns: DnsConfig,

    /// Empty-endpoint detection configuration.
    #[serde(default)]
    pub detection: DetectionConfig,

    /// Telemetry configuration.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Prefix of environment overrides, e.g. `EMPTYENDPOINTS_DNS__DNS__LISTEN_ADDR`.
pub const ENV_PREFIX: &str = "EMPTYENDPOINTS_DNS";

/// Environment source layered over the configuration file.
///
/// `EMPTYENDPOINTS_DNS__DETECTION__NAMESPACES` takes a comma separated list.
pub fn environment() -> config::Environment {
    config::Environment::with_prefix(ENV_PREFIX)
        .separator("__")
        .list_separator(",")
        .with_list_parse_key("detection.namespaces")
        .try_parsing(true)
}

impl Config {
    /// Load `path` with environment overrides applied on top.
    pub fn load(path: &Path) -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(environment())
            .build()?
            .try_deserialize()
    }

    /// Reject settings the proxy cannot run with.
    pub fn validate(&self) -> Result<(), ProxyError> {
        if self.dns.listen_addr == self.dns.upstream_addr {
            return Err(ProxyError::Config(format!(
                "upstream_addr {} is the proxy's own listen address",
                self.dns.upstream_addr
            )));
        }

        let detection = &self.detection;
        for (field, value) in [
            ("metric_namespace", &detection.metric_namespace),
            ("metric_subsystem", &detection.metric_subsystem),
        ] {
            if !is_metric_name(value) {
                return Err(ProxyError::Config(format!(
                    "{field} {value:?} is not a valid metric name component"
                )));
            }
        }

        if detection.mode == DetectionMode::Lookup && detection.lookup_timeout_ms == 0 {
            return Err(ProxyError::Config(
                "lookup_timeout_ms must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }
}

/// `[a-zA-Z_][a-zA-Z0-9_]*`
fn is_metric_name(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// DNS proxy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsConfig {
    /// Address for the proxy to listen on (UDP and TCP).
    pub listen_addr: SocketAddr,

    /// Resolver every query is relayed to, normally the cluster DNS service.
    pub upstream_addr: SocketAddr,

    /// Upstream query timeout in milliseconds.
    #[serde(default = "default_upstream_timeout_ms")]
    pub upstream_timeout_ms: u64,

    /// Idle timeout for TCP client connections in seconds.
    #[serde(default = "default_tcp_timeout_secs")]
    pub tcp_timeout_secs: u64,
}

impl DnsConfig {
    /// Upstream query timeout.
    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_millis(self.upstream_timeout_ms)
    }

    /// TCP connection idle timeout.
    pub fn tcp_timeout(&self) -> Duration {
        Duration::from_secs(self.tcp_timeout_secs)
    }
}

/// How emptiness of a service is decided.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionMode {
    /// Watch the upstream answer for NXDOMAIN.
    #[default]
    Observe,
    /// Ask the Kubernetes endpoint cache before forwarding.
    Lookup,
}

/// Empty-endpoint detection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    /// Detection strategy.
    #[serde(default)]
    pub mode: DetectionMode,

    /// Namespaces to watch. Empty watches all namespaces.
    #[serde(default)]
    pub namespaces: Vec<String>,

    /// Endpoint cache lookup timeout in milliseconds (lookup mode only).
    #[serde(default = "default_lookup_timeout_ms")]
    pub lookup_timeout_ms: u64,

    /// First part of the exported counter name.
    #[serde(default = "default_metric_namespace")]
    pub metric_namespace: String,

    /// Second part of the exported counter name.
    #[serde(default = "default_metric_subsystem")]
    pub metric_subsystem: String,
}

impl DetectionConfig {
    /// Endpoint cache lookup timeout.
    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_millis(self.lookup_timeout_ms)
    }
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            mode: DetectionMode::default(),
            namespaces: Vec::new(),
            lookup_timeout_ms: default_lookup_timeout_ms(),
            metric_namespace: default_metric_namespace(),
            metric_subsystem: default_metric_subsystem(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human readable lines.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

/// Telemetry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level filter (e.g., "info", "debug", "emptyendpoints_dns=debug,warn").
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log output format.
    #[serde(default)]
    pub log_format: LogFormat,

    /// Prometheus metrics exporter address.
    #[serde(default)]
    pub prometheus_addr: Option<SocketAddr>,

    /// OpenTelemetry configuration.
    #[serde(default)]
    pub opentelemetry: Option<OpenTelemetryConfig>,
}

/// OpenTelemetry exporter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenTelemetryConfig {
    /// OTLP endpoint (e.g., "http://localhost:4317").
    pub endpoint: String,

    /// Service name for traces.
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::default(),
            prometheus_addr: None,
            opentelemetry: None,
        }
    }
}

fn default_upstream_timeout_ms() -> u64 {
    2000
}

fn default_tcp_timeout_secs() -> u64 {
    30
}

fn default_lookup_timeout_ms() -> u64 {
    250
}

fn default_metric_namespace() -> String {
    "coredns".to_string()
}

fn default_metric_subsystem() -> String {
    "emptyendpoints".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_service_name() -> String {
    "emptyendpoints-dns".to_string()
}

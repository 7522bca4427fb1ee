//! Configuration for the GPU diagnostics service.
//!
//! Loaded from a YAML file with per-field `serde` defaults, then overridden
//! by CLI flags and environment variables (CLI/env precedence is handled in
//! `main.rs`; this module only owns the shape and the file/string parsing).

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// `Operator` is reserved for future mutating tools; the service is
/// read-only in both modes today.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceMode {
    #[default]
    ReadOnly,
    Operator,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NvmlMode {
    #[default]
    Mock,
    Real,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RoutingMode {
    #[default]
    Http,
    Exec,
}

/// HTTP transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Listener port; 0 means stdio only.
    #[serde(default)]
    pub port: u16,

    /// Bind address.
    #[serde(default = "default_addr")]
    pub addr: String,

    /// Timeout for outbound per-agent HTTP calls. MUST exceed worst-case
    /// agent processing time.
    #[serde(with = "humantime_serde", default = "default_agent_timeout")]
    pub agent_timeout: Duration,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            port: 0,
            addr: default_addr(),
            agent_timeout: default_agent_timeout(),
        }
    }
}

/// Gateway fan-out configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Whether gateway mode (proxied tools, cluster client) is enabled.
    #[serde(default)]
    pub enabled: bool,

    /// How the gateway reaches per-node agents.
    #[serde(default)]
    pub routing_mode: RoutingMode,

    /// Namespace agent pods live in.
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// `app.kubernetes.io/name` label value agents are discovered by.
    #[serde(default = "default_agent_label_name")]
    pub agent_label_name: String,

    /// Port the agent's HTTP transport listens on, used to derive the
    /// per-node endpoint URL under `http` routing.
    #[serde(default = "default_agent_port")]
    pub agent_port: u16,

    /// Maximum concurrently outstanding per-node calls during fan-out.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Consecutive per-node failures before the circuit breaker opens.
    #[serde(default = "default_breaker_threshold")]
    pub circuit_breaker_threshold: u32,

    /// Circuit breaker cool-down before a HalfOpen probe is admitted.
    #[serde(with = "humantime_serde", default = "default_breaker_cooldown")]
    pub circuit_breaker_cooldown: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            routing_mode: RoutingMode::default(),
            namespace: default_namespace(),
            agent_label_name: default_agent_label_name(),
            agent_port: default_agent_port(),
            max_concurrency: default_max_concurrency(),
            circuit_breaker_threshold: default_breaker_threshold(),
            circuit_breaker_cooldown: default_breaker_cooldown(),
        }
    }
}

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Operating mode.
    #[serde(default)]
    pub mode: ServiceMode,

    /// Hardware abstraction backend.
    #[serde(default)]
    pub nvml_mode: NvmlMode,

    /// Node name (from the Kubernetes downward API).
    #[serde(default)]
    pub node_name: Option<String>,

    /// HTTP transport configuration.
    #[serde(default)]
    pub http: HttpConfig,

    /// Gateway fan-out configuration.
    #[serde(default)]
    pub gateway: GatewayConfig,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).context("Failed to parse YAML configuration")
    }

    pub fn validate(&self) -> Result<()> {
        if self.gateway.enabled && self.gateway.namespace.is_empty() {
            anyhow::bail!("gateway.namespace must be set when gateway mode is enabled");
        }
        if self.gateway.max_concurrency == 0 {
            anyhow::bail!("gateway.max_concurrency must be > 0");
        }
        if self.gateway.circuit_breaker_threshold == 0 {
            anyhow::bail!("gateway.circuit_breaker_threshold must be > 0");
        }
        if self.http.port != 0 && self.http.addr.is_empty() {
            anyhow::bail!("http.addr must be set when http.port is non-zero");
        }
        Ok(())
    }

    /// Override node_name from environment if not set.
    pub fn with_node_name_from_env(mut self) -> Self {
        if self.node_name.is_none() {
            self.node_name = std::env::var("NODE_NAME").ok();
        }
        self
    }
}

fn default_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_agent_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_namespace() -> String {
    "gpu-diagnostics".to_string()
}

fn default_agent_label_name() -> String {
    "gpudiag".to_string()
}

fn default_agent_port() -> u16 {
    8080
}

fn default_max_concurrency() -> usize {
    10
}

fn default_breaker_threshold() -> u32 {
    5
}

fn default_breaker_cooldown() -> Duration {
    Duration::from_secs(30)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.http.port, 0);
        assert_eq!(config.gateway.max_concurrency, 10);
    }

    #[test]
    fn parses_yaml_overrides() {
        let yaml = r#"
mode: read-only
nvml_mode: real

http:
  port: 8080
  addr: 0.0.0.0

gateway:
  enabled: true
  routing_mode: exec
  namespace: gpu-diagnostics
  max_concurrency: 20
  circuit_breaker_threshold: 3
  circuit_breaker_cooldown: 15s
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.nvml_mode, NvmlMode::Real);
        assert!(config.gateway.enabled);
        assert_eq!(config.gateway.routing_mode, RoutingMode::Exec);
        assert_eq!(config.gateway.max_concurrency, 20);
        assert_eq!(config.gateway.circuit_breaker_cooldown, Duration::from_secs(15));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_empty_namespace_when_gateway_enabled() {
        let mut config = Config::default();
        config.gateway.enabled = true;
        config.gateway.namespace = String::new();
        assert!(config.validate().is_err());
    }
}

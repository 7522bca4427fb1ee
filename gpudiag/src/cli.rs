//! CLI argument parsing for the GPU diagnostics service.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

/// GPU diagnostics MCP service
#[derive(Debug, Parser)]
#[command(name = "gpudiag")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/gpudiag/config.yaml")]
    pub config: PathBuf,

    /// Node name (overrides config and NODE_NAME env)
    #[arg(long, env = "NODE_NAME")]
    pub node_name: Option<String>,

    /// Operating mode: read-only today, operator reserved for future
    /// mutating tools
    #[arg(long, value_enum, env = "GPUDIAG_MODE")]
    pub mode: Option<ServiceMode>,

    /// Hardware abstraction backend
    #[arg(long, value_enum, env = "GPUDIAG_NVML_MODE")]
    pub nvml_mode: Option<NvmlMode>,

    /// HTTP listener port; 0 means stdio only
    #[arg(long, env = "GPUDIAG_PORT")]
    pub port: Option<u16>,

    /// HTTP bind address
    #[arg(long, env = "GPUDIAG_ADDR")]
    pub addr: Option<String>,

    /// Run in stdio mode explicitly, regardless of port
    #[arg(long)]
    pub stdio: bool,

    /// Read exactly one handshake and one tool call from stdio, then exit
    #[arg(long)]
    pub once: bool,

    /// Enable gateway mode (register proxied tools, require a cluster client)
    #[arg(long, env = "GPUDIAG_GATEWAY")]
    pub gateway: bool,

    /// How the gateway reaches per-node agents
    #[arg(long, value_enum, env = "GPUDIAG_ROUTING_MODE")]
    pub routing_mode: Option<RoutingModeArg>,

    /// Namespace agent pods live in
    #[arg(long, env = "GPUDIAG_NAMESPACE")]
    pub namespace: Option<String>,

    /// Maximum concurrently outstanding per-node calls during fan-out
    #[arg(long, env = "GPUDIAG_MAX_CONCURRENCY")]
    pub max_concurrency: Option<usize>,

    /// Consecutive per-node failures before the circuit breaker opens
    #[arg(long, env = "GPUDIAG_CIRCUIT_BREAKER_THRESHOLD")]
    pub circuit_breaker_threshold: Option<u32>,

    /// Circuit breaker cool-down before a HalfOpen probe is admitted
    #[arg(long, env = "GPUDIAG_CIRCUIT_BREAKER_COOLDOWN")]
    pub circuit_breaker_cooldown: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "GPUDIAG_LOG_LEVEL")]
    pub log_level: String,

    /// Output logs in JSON format
    #[arg(long, default_value = "false", env = "GPUDIAG_LOG_JSON")]
    pub log_json: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ServiceMode {
    ReadOnly,
    Operator,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum NvmlMode {
    Mock,
    Real,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RoutingModeArg {
    Http,
    Exec,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_stdio_friendly() {
        let cli = Cli::try_parse_from(["gpudiag"]).unwrap();
        assert_eq!(cli.config.to_str().unwrap(), "/etc/gpudiag/config.yaml");
        assert_eq!(cli.log_level, "info");
        assert!(!cli.gateway);
        assert!(!cli.once);
    }

    #[test]
    fn gateway_flags_parse() {
        let cli = Cli::try_parse_from([
            "gpudiag",
            "--gateway",
            "--routing-mode",
            "exec",
            "--namespace",
            "gpu-diagnostics",
            "--max-concurrency",
            "20",
        ])
        .unwrap();
        assert!(cli.gateway);
        assert_eq!(cli.routing_mode, Some(RoutingModeArg::Exec));
        assert_eq!(cli.namespace.as_deref(), Some("gpu-diagnostics"));
        assert_eq!(cli.max_concurrency, Some(20));
    }

    #[test]
    fn once_mode_parses() {
        let cli = Cli::try_parse_from(["gpudiag", "--once"]).unwrap();
        assert!(cli.once);
    }
}

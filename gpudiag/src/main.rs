//! GPU diagnostics MCP service.
//!
//! An on-demand diagnostic service for NVIDIA GPU fleets: hardware
//! inventory with telemetry, health scoring, kernel-log XID analysis, node
//! description, and pod-to-GPU allocation correlation, exposed over
//! JSON-RPC on HTTP and/or stdio. In agent mode every operation runs
//! locally against the hardware abstraction; in gateway mode the same
//! operations fan out to every per-node agent and the results are
//! aggregated.

mod cli;
mod config;
mod registry;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cli::Cli;
use config::{Config, NvmlMode, RoutingMode as ConfigRoutingMode};
use gpudiag_cluster::K8sClient;
use gpudiag_core::device::{create_device_interface, BackendMode};
use gpudiag_core::tools::ClusterContext;
use gpudiag_core::DeviceInterface as _;
use gpudiag_dispatch::transport_client::RoutingMode as DispatchRoutingMode;
use gpudiag_dispatch::{Router, TransportClient};
use gpudiag_transport::jsonrpc::ToolDispatch;
use gpudiag_transport::{build_router, serve, SessionStore};
use registry::{AgentRegistry, ClusterReadiness, GatewayRegistry, UnavailableCluster};

/// Logs always go to stderr: required unconditionally under the stdio
/// transport and harmless under HTTP-only operation.
fn init_logging(log_level: &str, json_format: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    if json_format {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn apply_cli_overrides(mut config: Config, cli: &Cli) -> Config {
    if let Some(node_name) = &cli.node_name {
        config.node_name = Some(node_name.clone());
    }
    if let Some(mode) = cli.mode {
        config.mode = match mode {
            cli::ServiceMode::ReadOnly => config::ServiceMode::ReadOnly,
            cli::ServiceMode::Operator => config::ServiceMode::Operator,
        };
    }
    if let Some(nvml_mode) = cli.nvml_mode {
        config.nvml_mode = match nvml_mode {
            cli::NvmlMode::Mock => NvmlMode::Mock,
            cli::NvmlMode::Real => NvmlMode::Real,
        };
    }
    if let Some(port) = cli.port {
        config.http.port = port;
    }
    if let Some(addr) = &cli.addr {
        config.http.addr = addr.clone();
    }
    if cli.gateway {
        config.gateway.enabled = true;
    }
    if let Some(routing_mode) = cli.routing_mode {
        config.gateway.routing_mode = match routing_mode {
            cli::RoutingModeArg::Http => ConfigRoutingMode::Http,
            cli::RoutingModeArg::Exec => ConfigRoutingMode::Exec,
        };
    }
    if let Some(namespace) = &cli.namespace {
        config.gateway.namespace = namespace.clone();
    }
    if let Some(max_concurrency) = cli.max_concurrency {
        config.gateway.max_concurrency = max_concurrency;
    }
    if let Some(threshold) = cli.circuit_breaker_threshold {
        config.gateway.circuit_breaker_threshold = threshold;
    }
    if let Some(cooldown) = &cli.circuit_breaker_cooldown {
        match humantime::parse_duration(cooldown) {
            Ok(d) => config.gateway.circuit_breaker_cooldown = d,
            Err(e) => warn!(error = %e, value = %cooldown, "ignoring unparseable --circuit-breaker-cooldown"),
        }
    }
    config
}

fn backend_mode(mode: NvmlMode) -> BackendMode {
    match mode {
        NvmlMode::Mock => BackendMode::Mock,
        NvmlMode::Real => BackendMode::Real,
    }
}

fn dispatch_routing_mode(mode: ConfigRoutingMode) -> DispatchRoutingMode {
    match mode {
        ConfigRoutingMode::Http => DispatchRoutingMode::Http,
        ConfigRoutingMode::Exec => DispatchRoutingMode::Exec,
    }
}

/// Build the cluster client every process wants: agents use it to describe
/// their own node and list pods scheduled on it; the gateway uses it to
/// discover agent pods. Falls back to a stub that always reports
/// `Unavailable` when no cluster credentials can be found, so the process
/// still starts (e.g. local development with `--nvml-mode mock`).
async fn build_cluster_context(config: &Config) -> Arc<dyn ClusterContext> {
    match K8sClient::new(
        config.gateway.namespace.clone(),
        config.gateway.agent_label_name.clone(),
    )
    .await
    {
        Ok(client) => Arc::new(client),
        Err(e) => {
            warn!(error = %e, "no Kubernetes client available, cluster-facing tools will report unavailable");
            Arc::new(UnavailableCluster)
        }
    }
}

async fn run_agent(config: Config, shutdown: CancellationToken) -> Result<()> {
    let devices = create_device_interface(backend_mode(config.nvml_mode))
        .context("failed to construct hardware abstraction")?;
    devices
        .init(&shutdown)
        .await
        .context("failed to initialize hardware abstraction")?;

    let count = devices.device_count(&shutdown).await.unwrap_or(0);
    info!(device_count = count, nvml_mode = ?config.nvml_mode, "hardware abstraction ready");

    let cluster = build_cluster_context(&config).await;
    let registry = Arc::new(AgentRegistry::new(devices, cluster));
    let dispatch: Arc<dyn ToolDispatch> = registry.clone();
    let readiness: Arc<dyn gpudiag_transport::http::ReadinessCheck> = registry;

    serve_transports_with_readiness(config, dispatch, readiness, shutdown).await
}

async fn run_gateway(config: Config, shutdown: CancellationToken) -> Result<()> {
    let cluster = Arc::new(
        K8sClient::new(
            config.gateway.namespace.clone(),
            config.gateway.agent_label_name.clone(),
        )
        .await
        .context("gateway mode requires a reachable Kubernetes API server")?,
    );

    let transport_client = Arc::new(TransportClient::new(
        config.gateway.agent_port,
        config.http.agent_timeout,
    ));

    let router = Arc::new(Router::new(
        cluster.clone(),
        transport_client,
        dispatch_routing_mode(config.gateway.routing_mode),
        config.gateway.max_concurrency,
        config.gateway.circuit_breaker_threshold,
        config.gateway.circuit_breaker_cooldown,
    ));

    info!(
        namespace = %config.gateway.namespace,
        routing_mode = ?config.gateway.routing_mode,
        max_concurrency = config.gateway.max_concurrency,
        "gateway dispatch ready"
    );

    let dispatch: Arc<dyn ToolDispatch> = Arc::new(GatewayRegistry::new(router));
    let readiness: Arc<dyn gpudiag_transport::http::ReadinessCheck> = Arc::new(ClusterReadiness { cluster });

    serve_transports_with_readiness(config, dispatch, readiness, shutdown).await
}

async fn serve_transports_with_readiness(
    config: Config,
    dispatch: Arc<dyn ToolDispatch>,
    readiness: Arc<dyn gpudiag_transport::http::ReadinessCheck>,
    shutdown: CancellationToken,
) -> Result<()> {
    let run_http = config.http.port != 0;

    let http_task = if run_http {
        let sessions = Arc::new(SessionStore::new());
        let router = build_router(dispatch.clone(), sessions, readiness);
        let addr: SocketAddr = format!("{}:{}", config.http.addr, config.http.port)
            .parse()
            .context("invalid http.addr/http.port")?;
        let shutdown = shutdown.clone();
        Some(tokio::spawn(async move {
            tokio::select! {
                result = serve(router, addr) => result,
                _ = shutdown.cancelled() => Ok(()),
            }
        }))
    } else {
        None
    };

    if !run_http {
        gpudiag_transport::stdio::run_stdio(dispatch, shutdown, false).await?;
    } else if let Some(task) = http_task {
        task.await.context("HTTP transport task panicked")??;
    }

    Ok(())
}

async fn run_once(config: Config) -> Result<()> {
    let token = CancellationToken::new();
    let dispatch: Arc<dyn ToolDispatch> = if config.gateway.enabled {
        let cluster = Arc::new(
            K8sClient::new(
                config.gateway.namespace.clone(),
                config.gateway.agent_label_name.clone(),
            )
            .await
            .context("gateway mode requires a reachable Kubernetes API server")?,
        );
        let transport_client = Arc::new(TransportClient::new(
            config.gateway.agent_port,
            config.http.agent_timeout,
        ));
        let router = Arc::new(Router::new(
            cluster,
            transport_client,
            dispatch_routing_mode(config.gateway.routing_mode),
            config.gateway.max_concurrency,
            config.gateway.circuit_breaker_threshold,
            config.gateway.circuit_breaker_cooldown,
        ));
        Arc::new(GatewayRegistry::new(router))
    } else {
        let devices = create_device_interface(backend_mode(config.nvml_mode))
            .context("failed to construct hardware abstraction")?;
        devices.init(&token).await.context("failed to initialize hardware abstraction")?;
        let cluster = build_cluster_context(&config).await;
        Arc::new(AgentRegistry::new(devices, cluster))
    };

    gpudiag_transport::stdio::run_stdio(dispatch, token, true).await
}

fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let shutdown = token.clone();

    tokio::spawn(async move {
        let ctrl_c = async {
            signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
        };

        #[cfg(unix)]
        let terminate = async {
            signal::unix::signal(signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => info!("received Ctrl+C, initiating shutdown"),
            _ = terminate => info!("received SIGTERM, initiating shutdown"),
        }

        shutdown.cancel();
    });

    token
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse_args();
    init_logging(&cli.log_level, cli.log_json);

    info!(version = env!("CARGO_PKG_VERSION"), "gpudiag starting");

    let mut config = if cli.config.exists() {
        Config::from_file(&cli.config)
            .with_context(|| format!("failed to load config from {:?}", cli.config))?
    } else {
        warn!(path = ?cli.config, "config file not found, using defaults");
        Config::default()
    };

    config = apply_cli_overrides(config, &cli);
    config = config.with_node_name_from_env();
    config.validate().context("invalid configuration")?;

    if cli.once {
        info!("running single handshake + tool call (--once mode)");
        return run_once(config).await;
    }

    let stdio_requested = cli.stdio || config.http.port == 0;
    if stdio_requested {
        config.http.port = 0;
    }

    let shutdown = install_shutdown_handler();

    if config.gateway.enabled {
        info!(mode = ?config.mode, "starting in gateway mode");
        run_gateway(config, shutdown).await
    } else {
        info!(mode = ?config.mode, "starting in agent mode");
        run_agent(config, shutdown).await
    }
}

//! Storage Control Sync
//!
//! Runs either the controller, which holds the authoritative cluster model,
//! or a satellite, which mirrors the part of it that concerns its node.
//!
//! ```text
//!   storage-control-sync controller --config controller.yaml
//!   storage-control-sync satellite  --node-name node-a --controller-addr 10.0.0.1:3370
//! ```

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use storage_control_sync::{
    Controller, ControllerConfig, LoggingReconciler, ProcessLifecycle, Satellite,
    SatelliteConfig, StaticProbe, SyncMetrics,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Controller/satellite state synchronization for clustered storage
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    role: Role,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON", global = true)]
    log_json: bool,
}

#[derive(Subcommand, Debug)]
enum Role {
    /// Serve satellites from the authoritative model
    Controller(ControllerArgs),
    /// Mirror the controller's model for one node
    Satellite(SatelliteArgs),
}

#[derive(Args, Debug)]
struct ControllerArgs {
    /// YAML configuration file
    #[arg(long, env = "CONFIG")]
    config: Option<PathBuf>,

    /// Satellite connection bind address
    #[arg(long, env = "LISTEN_ADDR")]
    listen_addr: Option<String>,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR")]
    health_addr: Option<String>,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR")]
    metrics_addr: Option<String>,
}

#[derive(Args, Debug)]
struct SatelliteArgs {
    /// YAML configuration file
    #[arg(long, env = "CONFIG")]
    config: Option<PathBuf>,

    /// Node name to authenticate as
    #[arg(long, env = "NODE_NAME")]
    node_name: Option<String>,

    /// Controller address to dial
    #[arg(long, env = "CONTROLLER_ADDR")]
    controller_addr: Option<String>,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR")]
    health_addr: Option<String>,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level, cli.log_json)?;

    info!("Starting {} {}", storage_control_sync::NAME, storage_control_sync::VERSION);
    match cli.role {
        Role::Controller(args) => run_controller(args).await,
        Role::Satellite(args) => run_satellite(args).await,
    }
}

async fn run_controller(args: ControllerArgs) -> anyhow::Result<()> {
    let mut config = match &args.config {
        Some(path) => ControllerConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => ControllerConfig::default(),
    };
    if let Some(addr) = args.listen_addr {
        config.listen_addr = addr;
    }
    if let Some(addr) = args.health_addr {
        config.health_addr = addr;
    }
    if let Some(addr) = args.metrics_addr {
        config.metrics_addr = addr;
    }

    info!("  Listen: {}", config.listen_addr);
    info!("  Full sync awaits response: {}", config.full_sync_awaits_response);
    let health_addr: SocketAddr = config.health_addr.parse().context("health address")?;
    let metrics_addr: SocketAddr = config.metrics_addr.parse().context("metrics address")?;

    let controller = Controller::new(config)?;
    spawn_health_server(health_addr, controller.clone());
    spawn_metrics_server(metrics_addr, controller.metrics().clone());

    let signalled = controller.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signalled.shutdown();
        }
    });

    controller.run().await?;
    info!("Controller shutdown complete");
    Ok(())
}

async fn run_satellite(args: SatelliteArgs) -> anyhow::Result<()> {
    let mut config = match &args.config {
        Some(path) => SatelliteConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => SatelliteConfig::default(),
    };
    if let Some(name) = args.node_name {
        config.node_name = name;
    }
    if let Some(addr) = args.controller_addr {
        config.controller_addr = addr;
    }
    if let Some(addr) = args.health_addr {
        config.health_addr = addr;
    }

    info!("  Node: {}", config.node_name);
    info!("  Controller: {}", config.controller_addr);
    let health_addr: SocketAddr = config.health_addr.parse().context("health address")?;

    let lifecycle = Arc::new(ProcessLifecycle::new());
    let probe = Arc::new(StaticProbe::from_config(&config));
    let satellite = Satellite::new(config, Arc::new(LoggingReconciler), probe, lifecycle.clone())?;
    spawn_health_server(health_addr, satellite.clone());

    let signalled = satellite.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signalled.shutdown();
        }
    });

    satellite.run().await?;
    if let Some(reason) = lifecycle.shutdown_reason() {
        bail!("satellite stopped: {}", reason);
    }
    info!("Satellite shutdown complete");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(log_level: &str, json: bool) -> anyhow::Result<()> {
    let level = match log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("hyper=warn".parse()?)
        .add_directive("tokio_util=warn".parse()?);

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
    Ok(())
}

// =============================================================================
// Health Server
// =============================================================================

/// What the health endpoints report on
trait HealthSource: Send + Sync + 'static {
    fn ready(&self) -> bool;
    fn status_json(&self) -> serde_json::Result<String>;
    /// Metrics served next to the health endpoints
    fn metrics(&self) -> Option<&SyncMetrics> {
        None
    }
}

impl HealthSource for Controller {
    fn ready(&self) -> bool {
        true
    }

    fn status_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(&self.status())
    }
}

impl HealthSource for Satellite {
    fn ready(&self) -> bool {
        self.monitor().is_online()
    }

    fn status_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(&self.state())
    }

    fn metrics(&self) -> Option<&SyncMetrics> {
        Some(Satellite::metrics(self))
    }
}

fn text(status: hyper::StatusCode, body: impl Into<hyper::Body>) -> hyper::Response<hyper::Body> {
    let mut response = hyper::Response::new(body.into());
    *response.status_mut() = status;
    response
}

fn metrics_response(metrics: &SyncMetrics) -> hyper::Response<hyper::Body> {
    use hyper::header::{HeaderValue, CONTENT_TYPE};
    use hyper::StatusCode;

    match metrics.encode() {
        Ok((content_type, buffer)) => {
            let mut response = text(StatusCode::OK, buffer);
            if let Ok(value) = HeaderValue::from_str(&content_type) {
                response.headers_mut().insert(CONTENT_TYPE, value);
            }
            response
        }
        Err(e) => text(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

fn spawn_health_server<H: HealthSource>(addr: SocketAddr, source: Arc<H>) {
    tokio::spawn(async move {
        if let Err(e) = run_health_server(addr, source).await {
            error!("Health server error: {}", e);
        }
    });
}

async fn run_health_server<H: HealthSource>(addr: SocketAddr, source: Arc<H>) -> anyhow::Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let source = source.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let source = source.clone();
                async move {
                    let response = match req.uri().path() {
                        "/healthz" | "/livez" => text(StatusCode::OK, "ok"),
                        "/readyz" if source.ready() => text(StatusCode::OK, "ok"),
                        "/readyz" => text(StatusCode::SERVICE_UNAVAILABLE, "not ready"),
                        "/status" => match source.status_json() {
                            Ok(body) => text(StatusCode::OK, body),
                            Err(e) => text(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
                        },
                        "/metrics" => match source.metrics() {
                            Some(metrics) => metrics_response(metrics),
                            None => text(StatusCode::NOT_FOUND, "not found"),
                        },
                        _ => text(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    info!("Health server listening on {}", addr);
    Server::try_bind(&addr)?.serve(make_svc).await?;
    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

fn spawn_metrics_server(addr: SocketAddr, metrics: SyncMetrics) {
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(addr, metrics).await {
            error!("Metrics server error: {}", e);
        }
    });
}

async fn run_metrics_server(addr: SocketAddr, metrics: SyncMetrics) -> anyhow::Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let metrics = metrics.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let metrics = metrics.clone();
                async move {
                    let response = match req.uri().path() {
                        "/metrics" => metrics_response(&metrics),
                        path => {
                            warn!("Metrics server: unknown path {}", path);
                            text(StatusCode::NOT_FOUND, "not found")
                        }
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    info!("Metrics server listening on {}", addr);
    Server::try_bind(&addr)?.serve(make_svc).await?;
    Ok(())
}

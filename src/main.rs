//! Local Volume Reaper
//!
//! Watches for deleted Kubernetes nodes and removes the PersistentVolumeClaims,
//! PersistentVolumes and Pods that a local-disk provisioner anchored to them.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use local_volume_reaper::{
    connect, ClaimResolution, Controller, ControllerConfig, Error, KubeClusterClient,
    ReaperMetrics, ResourceWatcher, Result,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Local Volume Reaper - cleans up claims, volumes and pods of deleted nodes
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML config file; flags below override its values
    #[arg(long, env = "REAPER_CONFIG")]
    config: Option<PathBuf>,

    /// Kubeconfig path (defaults to in-cluster config, then ~/.kube/config)
    #[arg(long, env = "KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// Provisioner identity whose volumes are cleaned up
    #[arg(long, env = "REAPER_PROVISIONER")]
    provisioner: Option<String>,

    /// How claims of a deleted node are found (index, volume-scan)
    #[arg(long, env = "REAPER_CLAIM_RESOLUTION")]
    claim_resolution: Option<ClaimResolution>,

    /// Upper bound on claims cleaned up at once
    #[arg(long, env = "REAPER_MAX_CONCURRENT_DELETES")]
    max_concurrent_deletes: Option<usize>,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args);

    let config = load_config(&args)?;
    config.validate()?;

    info!("Starting Local Volume Reaper");
    info!("  Version: {}", local_volume_reaper::VERSION);
    info!("  Provisioner: {}", config.ownership.expected_provisioner);
    info!("  Claim resolution: {}", config.claim_resolution);
    info!("  Max concurrent deletes: {}", config.max_concurrent_deletes);

    let health_addr = parse_addr(&args.health_addr, "health")?;
    let metrics_addr = parse_addr(&args.metrics_addr, "metrics")?;

    let client = connect(args.kubeconfig.as_deref()).await?;
    info!("Connected to Kubernetes API server");

    let metrics = ReaperMetrics::new()?;
    let cluster = Arc::new(KubeClusterClient::new(client.clone(), &config));
    let controller = Controller::new(config, cluster, metrics.clone())?;

    let shutdown = CancellationToken::new();
    tokio::spawn(watch_signals(shutdown.clone()));

    // Start health server
    let ready = controller.ready_flag();
    let health_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(health_addr, ready, health_shutdown).await {
            error!("Health server error: {}", e);
        }
    });

    // Start metrics server
    let metrics_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(metrics_addr, metrics, metrics_shutdown).await {
            error!("Metrics server error: {}", e);
        }
    });

    let watcher = Arc::new(ResourceWatcher::new(client));
    let result = controller.run(watcher, shutdown.clone()).await;
    shutdown.cancel();

    match &result {
        Ok(()) => info!("Reaper shutdown complete"),
        Err(e) => error!("Reaper stopped: {}", e),
    }
    result
}

// =============================================================================
// Configuration
// =============================================================================

fn load_config(args: &Args) -> Result<ControllerConfig> {
    let mut config = match &args.config {
        Some(path) => {
            info!("Loading config from {}", path.display());
            ControllerConfig::from_file(path)?
        }
        None => ControllerConfig::default(),
    };

    if let Some(provisioner) = &args.provisioner {
        config.ownership.expected_provisioner = provisioner.clone();
    }
    if let Some(resolution) = args.claim_resolution {
        config.claim_resolution = resolution;
    }
    if let Some(limit) = args.max_concurrent_deletes {
        config.max_concurrent_deletes = limit;
    }
    Ok(config)
}

fn parse_addr(addr: &str, server: &str) -> Result<SocketAddr> {
    addr.parse()
        .map_err(|e| Error::Configuration(format!("Invalid {} server address: {}", server, e)))
}

// =============================================================================
// Signals
// =============================================================================

async fn watch_signals(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
                    _ = terminate.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                error!("Cannot install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received interrupt");
    }

    shutdown.cancel();
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "kube=info", "tower=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    if args.log_json {
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
}

// =============================================================================
// Health Server
// =============================================================================

fn with_status(status: hyper::StatusCode, body: &'static str) -> hyper::Response<hyper::Body> {
    let mut response = hyper::Response::new(hyper::Body::from(body));
    *response.status_mut() = status;
    response
}

async fn run_health_server(
    addr: SocketAddr,
    ready: Arc<AtomicBool>,
    shutdown: CancellationToken,
) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let ready = ready.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let ready = ready.load(Ordering::SeqCst);
                async move {
                    let response = match req.uri().path() {
                        "/healthz" | "/livez" => with_status(StatusCode::OK, "ok"),
                        "/readyz" if ready => with_status(StatusCode::OK, "ok"),
                        "/readyz" => with_status(StatusCode::SERVICE_UNAVAILABLE, "not ready"),
                        _ => with_status(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    info!("Health server listening on {}", addr);
    Server::try_bind(&addr)
        .map_err(|e| Error::Internal(format!("Health server bind error: {}", e)))?
        .serve(make_svc)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| Error::Internal(format!("Health server error: {}", e)))?;

    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(
    addr: SocketAddr,
    metrics: ReaperMetrics,
    shutdown: CancellationToken,
) -> Result<()> {
    use hyper::header::CONTENT_TYPE;
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let metrics = metrics.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let metrics = metrics.clone();
                async move {
                    let response = match req.uri().path() {
                        "/metrics" => match metrics.encode() {
                            Ok(buffer) => {
                                let mut response = Response::new(Body::from(buffer));
                                if let Ok(value) = metrics.content_type().parse() {
                                    response.headers_mut().insert(CONTENT_TYPE, value);
                                }
                                response
                            }
                            Err(e) => {
                                error!("Failed to encode metrics: {}", e);
                                with_status(StatusCode::INTERNAL_SERVER_ERROR, "encode error")
                            }
                        },
                        _ => with_status(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    info!("Metrics server listening on {}", addr);
    Server::try_bind(&addr)
        .map_err(|e| Error::Internal(format!("Metrics server bind error: {}", e)))?
        .serve(make_svc)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?;

    Ok(())
}

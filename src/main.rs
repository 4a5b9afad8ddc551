//! Unified Replication Operator
//!
//! Runs the replication controllers, the REST API, and the health and
//! metrics servers. `crdgen` prints the CRD manifests and exits.

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use unified_replication_operator::controller::{run_controllers, ControllerContext};
use unified_replication_operator::{
    crd, ApiServer, ApiServerConfig, Backend, Error, InMemoryResourceStore, KubeResourceStore,
    OperatorConfig, Orchestrator, ResourceStoreRef, Result,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Unified Replication Operator - one replication API over Ceph, Trident and PowerStore
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Operator configuration file (YAML)
    #[arg(long, env = "CONFIG_FILE")]
    config: Option<String>,

    /// Namespace to watch (all namespaces when unset)
    #[arg(long, env = "WATCH_NAMESPACE")]
    namespace: Option<String>,

    /// Cluster identifier, part of the discovery cache key
    #[arg(long, env = "CLUSTER_ID", default_value = "in-cluster")]
    cluster_id: String,

    /// REST API bind address
    #[arg(long, env = "API_ADDR", default_value = "0.0.0.0:8090")]
    api_addr: String,

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

    /// Run in standalone mode (no Kubernetes, in-memory store)
    #[arg(long, env = "STANDALONE")]
    standalone: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the CustomResourceDefinitions as YAML
    Crdgen,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if let Some(Command::Crdgen) = args.command {
        print!("{}", crd::render_crds()?);
        return Ok(());
    }

    init_logging(&args);

    let mut config = match &args.config {
        Some(path) => OperatorConfig::load(path)?,
        None => OperatorConfig::default(),
    };
    if args.namespace.is_some() {
        config.controller.namespace = args.namespace.clone();
    }

    info!("Starting Unified Replication Operator");
    info!("  Version: {}", unified_replication_operator::VERSION);
    info!("  REST API: {}", args.api_addr);
    info!("  Replication classes: {}", config.classes.len());
    info!("  Standalone mode: {}", args.standalone);

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
        }
        signal.cancel();
    });

    let client = if args.standalone {
        None
    } else {
        Some(kube::Client::try_default().await?)
    };
    let store: ResourceStoreRef = match &client {
        Some(client) => Arc::new(KubeResourceStore::new(client.clone(), args.cluster_id.clone())),
        None => Arc::new(InMemoryResourceStore::with_backends(&Backend::PREFERENCE_ORDER)),
    };

    let orchestrator = Arc::new(Orchestrator::from_config(&config, store)?);
    info!("Orchestrator initialized");

    // Start health server
    let health_addr = parse_addr(&args.health_addr, "health server")?;
    tokio::spawn(async move {
        if let Err(e) = run_health_server(health_addr).await {
            error!("Health server error: {}", e);
        }
    });

    // Start metrics server
    let metrics_addr = parse_addr(&args.metrics_addr, "metrics server")?;
    let metrics_source = orchestrator.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(metrics_addr, metrics_source).await {
            error!("Metrics server error: {}", e);
        }
    });

    // Start controllers
    if let Some(client) = client {
        let ctx = ControllerContext::new(
            client,
            orchestrator.clone(),
            config.controller.resync_interval(),
            shutdown.clone(),
        );
        let namespace = config.controller.namespace.clone();
        tokio::spawn(async move {
            if let Err(e) = run_controllers(ctx, namespace).await {
                error!("Controller error: {}", e);
            }
        });
    }

    let api_config = ApiServerConfig {
        rest_addr: parse_addr(&args.api_addr, "REST API")?,
    };
    let api_server = ApiServer::new(api_config, orchestrator, shutdown.clone());

    info!("Starting REST API server");
    api_server.run().await?;

    info!("Operator shutdown complete");
    Ok(())
}

fn parse_addr(addr: &str, what: &str) -> Result<SocketAddr> {
    addr.parse()
        .map_err(|e| Error::Configuration(format!("Invalid {} address {}: {}", what, addr, e)))
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

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "{},hyper=warn,kube=info,tower=warn,tower_http=info,axum=info",
            level
        ))
    });

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

fn text_response(status: hyper::StatusCode, body: impl Into<hyper::Body>) -> hyper::Response<hyper::Body> {
    let mut response = hyper::Response::new(body.into());
    *response.status_mut() = status;
    response
}

async fn run_health_server(addr: SocketAddr) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, std::convert::Infallible>(service_fn(|req: Request<Body>| async move {
            let response = match req.uri().path() {
                "/healthz" | "/livez" | "/readyz" => text_response(StatusCode::OK, "ok"),
                _ => text_response(StatusCode::NOT_FOUND, "not found"),
            };
            Ok::<_, std::convert::Infallible>(response)
        }))
    });

    info!("Health server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Health server error: {}", e)))?;

    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: SocketAddr, orchestrator: Arc<Orchestrator>) -> Result<()> {
    use hyper::header::{HeaderValue, CONTENT_TYPE};
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let orchestrator = orchestrator.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let orchestrator = orchestrator.clone();
                async move {
                    let response = match req.uri().path() {
                        "/metrics" => match orchestrator.render_metrics() {
                            Ok(text) => {
                                let mut response = text_response(StatusCode::OK, text);
                                response.headers_mut().insert(
                                    CONTENT_TYPE,
                                    HeaderValue::from_static("text/plain; version=0.0.4"),
                                );
                                response
                            }
                            Err(e) => text_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
                        },
                        _ => text_response(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    info!("Metrics server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?;

    Ok(())
}

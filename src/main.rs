//! Disk Attach Operator
//!
//! Runs the attach/detach reconciler and the migration progress tracker
//! against the cluster the process is configured for.
//!
//! ```text
//!   startup:  parse args ─▶ logging ─▶ kube client ─▶ recovery (retried) ─▶ ready
//!   running:  AttachmentRequest watch ─▶ queue ─▶ N reconcile workers
//!             PersistentVolume watch  ─▶ migration tracker
//!   shutdown: ctrl-c ─▶ cancel token ─▶ queue drained ─▶ exit
//! ```

use clap::Parser;
use kube::CustomResourceExt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use disk_attach_operator::controller::events;
use disk_attach_operator::domain::ports::ClusterClientRef;
use disk_attach_operator::{
    AttachDetachReconciler, AttachmentRequest, ControllerMetrics, Error, KubeClusterClient,
    MigrationProgressTracker, ReconcilerConfig, RestAttachmentProvisioner,
    RestProvisionerConfig, Result, TrackerConfig, WorkQueue,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Disk Attach Operator - attach/detach reconciler and migration tracker
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// CSI driver name whose attachments and volumes are managed
    #[arg(long, env = "DRIVER_NAME", default_value = "disk.csi.azure.com")]
    driver_name: String,

    /// Namespace AttachmentRequests live in
    #[arg(long, env = "NAMESPACE", default_value = "azure-disk-csi")]
    namespace: String,

    /// Number of reconcile workers
    #[arg(long, env = "WORKERS", default_value = "4")]
    workers: usize,

    /// Deadline for a single reconcile, in seconds
    #[arg(long, env = "RECONCILE_TIMEOUT_SECS", default_value = "120")]
    reconcile_timeout_secs: u64,

    /// Base URL of the attachment service
    #[arg(long, env = "PROVISIONER_ENDPOINT", default_value = "http://localhost:8090")]
    provisioner_endpoint: String,

    /// Timeout for a single attachment service request, in seconds
    #[arg(long, env = "PROVISIONER_TIMEOUT_SECS", default_value = "60")]
    provisioner_timeout_secs: u64,

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

    /// Skip rebuilding AttachmentRequests from VolumeAttachments at startup
    #[arg(long, env = "SKIP_RECOVERY")]
    skip_recovery: bool,

    /// Print the AttachmentRequest CRD as YAML and exit
    #[arg(long)]
    print_crd: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_crd {
        print!("{}", serde_yaml::to_string(&AttachmentRequest::crd())?);
        return Ok(());
    }

    init_logging(&args)?;

    info!("Starting Disk Attach Operator");
    info!("  Version: {}", disk_attach_operator::VERSION);
    info!("  Driver: {}", args.driver_name);
    info!("  Namespace: {}", args.namespace);
    info!("  Workers: {}", args.workers);
    info!("  Provisioner: {}", args.provisioner_endpoint);

    let metrics = Arc::new(
        ControllerMetrics::new()
            .map_err(|e| Error::Internal(format!("Failed to create metrics: {}", e)))?,
    );
    metrics
        .register(prometheus::default_registry())
        .map_err(|e| Error::Internal(format!("Failed to register metrics: {}", e)))?;

    let shutdown = CancellationToken::new();
    let ready = Arc::new(AtomicBool::new(false));

    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received"),
            Err(e) => error!("Failed to listen for shutdown signal: {}", e),
        }
        signal_shutdown.cancel();
    });

    // Start health server
    let health_addr = args.health_addr.clone();
    let health_ready = ready.clone();
    let health_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr, health_ready, health_shutdown).await {
            error!("Health server error: {}", e);
        }
    });

    // Start metrics server
    let metrics_addr = args.metrics_addr.clone();
    let metrics_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr, metrics_shutdown).await {
            error!("Metrics server error: {}", e);
        }
    });

    let client = kube::Client::try_default().await?;
    let cluster = Arc::new(KubeClusterClient::new(client, args.namespace.clone()));
    let provisioner = Arc::new(RestAttachmentProvisioner::new(RestProvisionerConfig {
        endpoint: args.provisioner_endpoint.clone(),
        request_timeout: Duration::from_secs(args.provisioner_timeout_secs),
    })?);

    let reconciler = Arc::new(AttachDetachReconciler::new(
        ReconcilerConfig {
            driver_name: args.driver_name.clone(),
            namespace: args.namespace.clone(),
            reconcile_timeout: Duration::from_secs(args.reconcile_timeout_secs),
            ..Default::default()
        },
        cluster.clone(),
        provisioner,
        metrics.clone(),
    ));

    let tracker = Arc::new(MigrationProgressTracker::new(
        TrackerConfig {
            driver_name: args.driver_name.clone(),
        },
        Some(cluster.clone() as ClusterClientRef),
        metrics,
    ));

    if args.skip_recovery {
        warn!("Recovery skipped");
    } else {
        match reconciler.recover_until_complete(&shutdown).await {
            Some(report) => info!(
                created = report.created,
                skipped = report.skipped,
                name_collisions = report.name_collisions,
                "Recovery complete"
            ),
            None => {
                info!("Shutdown during recovery");
                return Ok(());
            }
        }
    }

    let queue = WorkQueue::new();
    let tasks = vec![
        tokio::spawn(events::watch_attachment_requests(
            cluster.attachment_requests(),
            queue.clone(),
            shutdown.clone(),
        )),
        tokio::spawn(events::watch_persistent_volumes(
            cluster.persistent_volumes(),
            tracker,
            shutdown.clone(),
        )),
        tokio::spawn(reconciler.run(queue, args.workers, shutdown.clone())),
    ];

    ready.store(true, Ordering::SeqCst);
    info!("Operator ready");

    shutdown.cancelled().await;
    ready.store(false, Ordering::SeqCst);

    for result in futures::future::join_all(tasks).await {
        if let Err(e) = result {
            error!("Task failed during shutdown: {}", e);
        }
    }

    info!("Operator shutdown complete");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) -> Result<()> {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "kube=info", "reqwest=warn"] {
        filter = filter.add_directive(directive.parse().map_err(|e| {
            Error::Configuration(format!("Invalid log directive {}: {}", directive, e))
        })?);
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
    Ok(())
}

// =============================================================================
// Health Server
// =============================================================================

fn text_response(status: hyper::StatusCode, body: &'static str) -> hyper::Response<hyper::Body> {
    let mut response = hyper::Response::new(hyper::Body::from(body));
    *response.status_mut() = status;
    response
}

async fn run_health_server(
    addr: &str,
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
                        "/healthz" | "/livez" => text_response(StatusCode::OK, "ok"),
                        "/readyz" if ready => text_response(StatusCode::OK, "ok"),
                        "/readyz" => text_response(StatusCode::SERVICE_UNAVAILABLE, "not ready"),
                        _ => text_response(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    let addr: SocketAddr = addr.parse().map_err(|e| {
        Error::Configuration(format!("Invalid health server address: {}", e))
    })?;

    info!("Health server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| Error::Internal(format!("Health server error: {}", e)))?;

    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: &str, shutdown: CancellationToken) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};
    use prometheus::{Encoder, TextEncoder};

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, std::convert::Infallible>(service_fn(|req: Request<Body>| async move {
            let response = match req.uri().path() {
                "/metrics" => {
                    let encoder = TextEncoder::new();
                    let metric_families = prometheus::gather();
                    let mut buffer = Vec::new();
                    match encoder.encode(&metric_families, &mut buffer) {
                        Ok(()) => {
                            let mut response = Response::new(Body::from(buffer));
                            if let Ok(value) = encoder.format_type().parse() {
                                response.headers_mut().insert("Content-Type", value);
                            }
                            response
                        }
                        Err(_) => text_response(StatusCode::INTERNAL_SERVER_ERROR, "encode failed"),
                    }
                }
                _ => text_response(StatusCode::NOT_FOUND, "not found"),
            };
            Ok::<_, std::convert::Infallible>(response)
        }))
    });

    let addr: SocketAddr = addr.parse().map_err(|e| {
        Error::Configuration(format!("Invalid metrics server address: {}", e))
    })?;

    info!("Metrics server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?;

    Ok(())
}

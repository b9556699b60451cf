//! SMcli Provisioner
//!
//! Kubernetes dynamic provisioner for iSCSI SAN arrays driven through the
//! SMcli management client.
//!
//! The binary wires the SAN client, the iSCSI provisioner, the claim
//! controller and the defrag scheduler together, serves health and metrics
//! endpoints, and shuts everything down on SIGINT or SIGTERM.

use clap::Parser;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use smcli_provisioner::{
    ClaimController, ControllerConfig, DefragScheduler, Error, IscsiProvisioner, ProcessExecutor,
    ProvisionerConfig, ProvisionerMetrics, Result, SanBackendRef, SmcliClient,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// SMcli Provisioner - dynamic iSCSI volumes on SMcli-managed SAN arrays
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(flatten)]
    provisioner: ProvisionerConfig,

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

    let config = &args.provisioner;
    config.validate()?;

    let connection = config.san_connection();
    info!("Starting SMcli Provisioner");
    info!("  Version: {}", smcli_provisioner::VERSION);
    info!("  Identifier: {}", config.identifier);
    info!("  Provisioner: {}", config.provisioner_name);
    info!("  SAN: {:?}", connection);

    let metrics = Arc::new(ProvisionerMetrics::new()?);
    let cancel = CancellationToken::new();
    let ready = Arc::new(AtomicBool::new(false));

    // SAN client and provisioner
    let executor = Arc::new(ProcessExecutor::new(config.command_timeout(), cancel.clone()));
    let client = SmcliClient::new(connection, executor)
        .with_rollback_policy(config.rollback_policy())
        .with_metrics(metrics.clone());
    let backend: SanBackendRef = Arc::new(client);

    let provisioner = Arc::new(
        IscsiProvisioner::new(
            backend.clone(),
            config.identifier.clone(),
            config.provisioner_name.clone(),
        )
        .with_metrics(metrics.clone()),
    );

    // Start health server
    let health_addr = args.health_addr.clone();
    let health_ready = ready.clone();
    let health_cancel = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr, health_ready, health_cancel).await {
            error!("Health server error: {}", e);
        }
    });

    // Start metrics server
    let metrics_addr = args.metrics_addr.clone();
    let server_metrics = metrics.clone();
    let metrics_cancel = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr, server_metrics, metrics_cancel).await {
            error!("Metrics server error: {}", e);
        }
    });

    // Start defrag scheduler
    let defrag = match config.defrag_interval() {
        Some(interval) => {
            let scheduler = DefragScheduler::new(backend.clone(), interval, cancel.clone())
                .with_metrics(metrics.clone());
            Some(tokio::spawn(async move { scheduler.run().await }))
        }
        None => {
            info!("Defrag scheduler disabled");
            None
        }
    };

    // Stop on SIGINT / SIGTERM
    tokio::spawn(shutdown_on_signal(cancel.clone()));

    let kube_client = kube::Client::try_default().await?;
    let controller = ClaimController::new(
        kube_client,
        provisioner,
        ControllerConfig::default(),
        cancel.clone(),
    );

    ready.store(true, Ordering::SeqCst);
    let result = controller.run().await;

    // The controller only returns on shutdown or error; stop the rest too
    cancel.cancel();
    if let Some(handle) = defrag {
        match handle.await {
            Ok(runs) => info!("Defrag scheduler finished after {} runs", runs),
            Err(e) => error!("Defrag scheduler task failed: {}", e),
        }
    }

    info!("Provisioner shutdown complete");
    result
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
// Shutdown
// =============================================================================

async fn shutdown_on_signal(cancel: CancellationToken) {
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
                error!("Cannot listen for SIGTERM: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received SIGINT");
    }

    cancel.cancel();
}

// =============================================================================
// Health Server
// =============================================================================

fn respond(status: hyper::StatusCode, body: impl Into<hyper::Body>) -> hyper::Response<hyper::Body> {
    let mut response = hyper::Response::new(body.into());
    *response.status_mut() = status;
    response
}

async fn run_health_server(
    addr: &str,
    ready: Arc<AtomicBool>,
    cancel: CancellationToken,
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
                        "/healthz" | "/livez" => respond(StatusCode::OK, "ok"),
                        "/readyz" if ready => respond(StatusCode::OK, "ok"),
                        "/readyz" => respond(StatusCode::SERVICE_UNAVAILABLE, "not ready"),
                        _ => respond(StatusCode::NOT_FOUND, "not found"),
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
    Server::try_bind(&addr)
        .map_err(|e| Error::Internal(format!("Health server error: {}", e)))?
        .serve(make_svc)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|e| Error::Internal(format!("Health server error: {}", e)))?;

    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(
    addr: &str,
    metrics: Arc<ProvisionerMetrics>,
    cancel: CancellationToken,
) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{header, Body, Request, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let metrics = metrics.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let metrics = metrics.clone();
                async move {
                    let response = match req.uri().path() {
                        "/metrics" => match metrics.encode() {
                            Ok((content_type, buffer)) => {
                                let mut response = respond(StatusCode::OK, buffer);
                                if let Ok(value) = header::HeaderValue::from_str(&content_type) {
                                    response.headers_mut().insert(header::CONTENT_TYPE, value);
                                }
                                response
                            }
                            Err(e) => respond(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
                        },
                        _ => respond(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    let addr: SocketAddr = addr.parse().map_err(|e| {
        Error::Configuration(format!("Invalid metrics server address: {}", e))
    })?;

    info!("Metrics server listening on {}", addr);
    Server::try_bind(&addr)
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?
        .serve(make_svc)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?;

    Ok(())
}

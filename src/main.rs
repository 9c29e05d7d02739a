//! stripenet node
//!
//! Runs the striped client core against in-memory storage targets, with one
//! import per target, and serves health and Prometheus endpoints.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         stripenet node                           │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │  │ StripeDevice │───▶│ Extent Locks │───▶│   Targets    │       │
//! │  └──────────────┘    └──────────────┘    └──────────────┘       │
//! │  ┌──────────────┐    ┌──────────────┐                           │
//! │  │   Imports    │───▶│  Loopback    │   /healthz   /metrics     │
//! │  └──────────────┘    └──────────────┘                           │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use stripenet::adapters::{LocalLockService, LoopbackTransport, MemorySubIoFactory, MemoryTargets};
use stripenet::domain::RpcTransport;
use stripenet::{metrics, ExtentLockAdapter, Import, ImportState, StripeDevice, StripenetConfig};

// =============================================================================
// CLI Arguments
// =============================================================================

/// stripenet - striped storage client core
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (YAML); defaults apply when omitted
    #[arg(long, env = "STRIPENET_CONFIG")]
    config: Option<PathBuf>,

    /// Number of in-memory storage targets
    #[arg(long, env = "STRIPENET_TARGETS", default_value = "4")]
    targets: u32,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Log output format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum LogFormat {
    Text,
    Json,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args)?;
    metrics::init();

    let config = match &args.config {
        Some(path) => StripenetConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => StripenetConfig::default(),
    };
    if config.layout.stripe_count > args.targets {
        anyhow::bail!(
            "layout.stripe_count {} exceeds the {} available targets",
            config.layout.stripe_count,
            args.targets
        );
    }

    info!("Starting stripenet");
    info!("  Targets: {}", args.targets);
    info!("  Stripe size: {}", config.layout.stripe_size);
    info!("  Stripe count: {}", config.layout.stripe_count);
    info!("  Wire format: {:?}", config.msg_format());
    info!("  Recovery policy: {:?}", config.recovery.policy);

    // Storage targets and the coordinator in front of them
    let targets = Arc::new(MemoryTargets::new(args.targets));
    let locks = Arc::new(ExtentLockAdapter::new(
        Arc::new(LocalLockService::new(targets.clone())),
        config.locking.disabled,
    ));
    let factory = Arc::new(MemorySubIoFactory::new(targets.clone(), locks.clone()));
    let device = StripeDevice::new(factory, config.layout.reserve_slots)?;
    info!(reserve_slots = device.reserve_slots(), "stripe device ready");

    // One import per target
    let import_config = config.import()?;
    let imports: Vec<Arc<Import>> = (0..args.targets)
        .map(|index| {
            let transport: Arc<dyn RpcTransport> = Arc::new(LoopbackTransport::new());
            Import::new(format!("target-{:04}", index), transport, import_config.clone())
        })
        .collect();
    for import in &imports {
        if let Err(e) = import.connect().await {
            error!(import = %import.target(), error = %e, "initial connect failed");
        }
    }

    let ready = Arc::new(AtomicBool::new(
        imports.iter().all(|i| i.state() == ImportState::Full),
    ));
    let shutdown = CancellationToken::new();

    // Track readiness as imports change state
    for import in &imports {
        let mut states = import.subscribe();
        let imports = imports.clone();
        let ready = ready.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    changed = states.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let all_full = imports.iter().all(|i| i.state() == ImportState::Full);
                        ready.store(all_full, Ordering::Release);
                    }
                }
            }
        });
    }

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

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Shutdown requested");
    shutdown.cancel();

    for import in &imports {
        import.close();
    }

    info!("stripenet shutdown complete");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) -> anyhow::Result<()> {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("hyper=warn".parse()?);

    if args.log_format == LogFormat::Json {
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

fn text_response(
    status: hyper::StatusCode,
    body: &'static str,
) -> hyper::Response<http_body_util::Full<hyper::body::Bytes>> {
    let mut response = hyper::Response::new(http_body_util::Full::new(
        hyper::body::Bytes::from_static(body.as_bytes()),
    ));
    *response.status_mut() = status;
    response
}

async fn run_health_server(
    addr: &str,
    ready: Arc<AtomicBool>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::StatusCode;
    use hyper_util::rt::TokioIo;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    let addr: SocketAddr = addr.parse().context("invalid health server address")?;
    let listener = TcpListener::bind(addr)
        .await
        .context("failed to bind health server")?;

    info!("Health server listening on {}", addr);

    loop {
        let (stream, _) = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            accepted = listener.accept() => accepted.context("health server accept error")?,
        };
        let io = TokioIo::new(stream);
        let ready = ready.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req: hyper::Request<hyper::body::Incoming>| {
                let ready = ready.load(Ordering::Acquire);
                async move {
                    let response = match req.uri().path() {
                        "/healthz" | "/livez" => text_response(StatusCode::OK, "ok"),
                        "/readyz" if ready => text_response(StatusCode::OK, "ok"),
                        "/readyz" => {
                            text_response(StatusCode::SERVICE_UNAVAILABLE, "recovering")
                        }
                        _ => text_response(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            });
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                tracing::error!("Health server connection error: {}", e);
            }
        });
    }
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: &str, shutdown: CancellationToken) -> anyhow::Result<()> {
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use prometheus::{Encoder, TextEncoder};
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    async fn metrics_handler(
        req: Request<hyper::body::Incoming>,
    ) -> std::result::Result<Response<Full<Bytes>>, std::convert::Infallible> {
        if req.uri().path() != "/metrics" {
            return Ok(text_response(StatusCode::NOT_FOUND, "not found"));
        }

        let encoder = TextEncoder::new();
        let metric_families = prometheus::gather();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            tracing::error!("Failed to encode metrics: {}", e);
            return Ok(text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to encode metrics",
            ));
        }

        let mut response = Response::new(Full::new(Bytes::from(buffer)));
        if let Ok(value) = hyper::header::HeaderValue::from_str(encoder.format_type()) {
            response
                .headers_mut()
                .insert(hyper::header::CONTENT_TYPE, value);
        }
        Ok(response)
    }

    let addr: SocketAddr = addr.parse().context("invalid metrics server address")?;
    let listener = TcpListener::bind(addr)
        .await
        .context("failed to bind metrics server")?;

    info!("Metrics server listening on {}", addr);

    loop {
        let (stream, _) = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            accepted = listener.accept() => accepted.context("metrics server accept error")?,
        };
        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(metrics_handler))
                .await
            {
                tracing::error!("Metrics server connection error: {}", e);
            }
        });
    }
}

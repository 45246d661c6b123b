//! lancache - LAN-local caching mirror for a Registry v2 model registry

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

mod config;
mod net;
mod tls;

use config::{Config, HTTPS_PORT};
use lancache_api::{AppState, MetricsHandle, create_router};
use lancache_core::MirrorService;
use lancache_dns::{DnsConfig, DnsServer};
use lancache_proxy::{UpstreamClient, UpstreamClientConfig};
use lancache_store::Store;

/// How long non-intercepted DNS queries may wait on the upstream resolver
const DNS_FORWARD_TIMEOUT: Duration = Duration::from_secs(5);

/// How long in-flight request workers get to finish after a shutdown signal
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// lancache - pull model artifacts once, serve them at LAN speed
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config/lancache.toml")]
    config: String,

    /// Bind address for both listeners
    #[arg(long, env = "LANCACHE_BIND")]
    bind: Option<String>,

    /// HTTP port (443 enables the self-signed TLS shim)
    #[arg(long, env = "LANCACHE_HTTP_PORT")]
    http_port: Option<u16>,

    /// DNS port
    #[arg(long, env = "LANCACHE_DNS_PORT")]
    dns_port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = Config::load(&args.config)?;
    if let Some(bind) = args.bind {
        config.server.bind_address = bind;
    }
    if let Some(port) = args.http_port {
        config.server.http_port = port;
    }
    if let Some(port) = args.dns_port {
        config.server.dns_port = port;
    }

    init_logging(&config.logging.level);

    info!("Starting lancache v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Mirroring {} (upstream {})",
        config.upstream.registry,
        config.upstream_url()
    );

    // Initialize the store; a cache directory we cannot create is fatal
    let store = Arc::new(
        Store::open(&config.cache.dir)
            .await
            .with_context(|| format!("Failed to create cache directory {}", config.cache.dir))?,
    );

    // Initialize the upstream client
    let upstream = Arc::new(UpstreamClient::new(UpstreamClientConfig {
        url: config.upstream_url(),
        control_timeout: Duration::from_secs(config.upstream.timeout_secs),
        read_timeout: Duration::from_secs(config.upstream.timeout_secs),
    })?);

    // Wire the mirror service and router
    let service = Arc::new(MirrorService::new(
        store,
        upstream,
        config.upstream.registry.clone(),
    ));
    let state = AppState::new(service);

    let metrics_handle = init_metrics();
    let app = create_router(state, metrics_handle.map(Arc::new))
        .layer(TraceLayer::new_for_http());

    // One shutdown signal drives every listener
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let mut tasks: JoinSet<Result<()>> = JoinSet::new();

    if config.server.http_enabled {
        let addr: SocketAddr = format!("{}:{}", config.server.bind_address, config.server.http_port)
            .parse()
            .context("Invalid HTTP bind address")?;

        if config.server.http_port == HTTPS_PORT {
            // Pick one crypto backend for the process before building
            // the TLS config.
            let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
            let cert = tls::self_signed_certificate(
                &config.upstream.registry,
                &net::local_ipv4_addresses(),
            )?;
            let app = app.clone();
            let shutdown = shutdown_rx.clone();
            tasks.spawn(async move { tls::serve_https(addr, app, cert, shutdown).await });
        } else {
            let listener = tokio::net::TcpListener::bind(addr)
                .await
                .with_context(|| format!("Failed to bind HTTP listener on {}", addr))?;
            info!("HTTP listening on {}", addr);
            let app = app.clone();
            let shutdown = shutdown_rx.clone();
            tasks.spawn(async move {
                axum::serve(listener, app)
                    .with_graceful_shutdown(wait_for_shutdown(shutdown))
                    .await
                    .context("HTTP server failed")
            });
        }
    }

    if config.server.dns_enabled {
        let bind: SocketAddr = format!("{}:{}", config.server.bind_address, config.server.dns_port)
            .parse()
            .context("Invalid DNS bind address")?;
        let upstream_dns: SocketAddr = config
            .upstream
            .dns
            .parse()
            .with_context(|| format!("Invalid upstream resolver {}", config.upstream.dns))?;
        let redirect_ip = config
            .dns
            .redirect_ip
            .or_else(net::default_redirect_ip)
            .context("No non-loopback IPv4 address found; set dns.redirect_ip")?;

        let dns = DnsServer::bind(DnsConfig {
            bind,
            upstream: upstream_dns,
            intercept_host: config.upstream.registry.clone(),
            redirect_ip,
            forward_timeout: DNS_FORWARD_TIMEOUT,
        })
        .await
        .with_context(|| format!("Failed to bind DNS listener on {}", bind))?;

        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move {
            dns.run(wait_for_shutdown(shutdown))
                .await
                .context("DNS server failed")
        });
    }

    if tasks.is_empty() {
        anyhow::bail!("Both listeners are disabled; nothing to do");
    }

    tokio::select! {
        _ = wait_for_shutdown(shutdown_rx.clone()) => {
            info!(
                "Shutdown signal received, draining for up to {}s",
                SHUTDOWN_GRACE.as_secs()
            );
            let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
                while let Some(result) = tasks.join_next().await {
                    if let Err(e) = result.context("Listener task panicked").and_then(|r| r) {
                        warn!("Listener exited with error during shutdown: {:#}", e);
                    }
                }
            })
            .await;
            if drained.is_err() {
                warn!("Grace period expired, aborting in-flight workers");
                tasks.abort_all();
            }
        }
        result = tasks.join_next() => {
            // A listener died before any shutdown was requested
            if let Some(result) = result {
                result.context("Listener task panicked")??;
            }
            anyhow::bail!("Listener exited unexpectedly");
        }
    }

    info!("Shutdown complete");
    Ok(())
}

/// Initialize logging
fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();
}

/// Initialize Prometheus metrics
fn init_metrics() -> Option<MetricsHandle> {
    use metrics_exporter_prometheus::PrometheusBuilder;

    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            info!("Prometheus metrics enabled at /metrics");

            metrics::describe_counter!(
                "lancache_cache_hits_total",
                "Total number of cache hits"
            );
            metrics::describe_counter!(
                "lancache_cache_misses_total",
                "Total number of cache misses"
            );
            metrics::describe_counter!(
                "lancache_health_checks_total",
                "Total number of health checks"
            );

            Some(handle)
        }
        Err(e) => {
            warn!("Failed to initialize Prometheus metrics: {}", e);
            None
        }
    }
}

/// Resolve once the shutdown flag flips
async fn wait_for_shutdown(mut shutdown: watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Wait for SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install CTRL+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("Shutdown signal received");
}

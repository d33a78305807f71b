use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use mcptunnel_shared::bus::{MemoryBus, MessageBus, WsBus, WsBusConfig};
use mcptunnel_shared::protocol::Topics;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod allowlist;
mod app;
mod config;
mod executor;
mod health;
mod hub;
mod metrics;
mod rate_limiter;
mod worker;

use allowlist::AllowList;
use app::AppState;
use config::RelayConfig;
use executor::{ReqwestTransport, RequestExecutor};
use hub::BusHub;
use metrics::Metrics;
use rate_limiter::RateLimiter;
use worker::Worker;

#[derive(Parser)]
#[command(name = "mcptunnel-relay")]
#[command(version)]
#[command(about = "Executes tunneled HTTP requests on behalf of a tenant", long_about = None)]
struct Cli {
    /// Config file (defaults to ./relay.yml when present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Tenant whose requests this relay serves
    #[arg(long, env = "TENANT_ID")]
    tenant_id: Option<String>,

    /// Join an external bus hub instead of hosting one
    #[arg(long, env = "BUS_URL")]
    bus_url: Option<String>,

    /// Bus credential
    #[arg(long, env = "BUS_KEY", hide_env_values = true)]
    bus_key: Option<String>,

    /// Topic namespace
    #[arg(long, env = "BUS_NAMESPACE")]
    namespace: Option<String>,

    /// Comma-separated destination host patterns (empty = allow all)
    #[arg(long, env = "ALLOWED_HOSTS", value_delimiter = ',')]
    allowed_hosts: Option<Vec<String>>,

    /// Wildcard patterns only admit real subdomains (`*.a.com` refuses `a.com`)
    #[arg(long, env = "STRICT_WILDCARDS")]
    strict_wildcards: bool,

    /// Maximum decoded request body in bytes
    #[arg(long, env = "MAX_REQUEST_SIZE")]
    max_request_size: Option<usize>,

    /// Requests allowed per tenant per window
    #[arg(long, env = "RATE_LIMIT_PER_TENANT")]
    rate_limit: Option<usize>,

    /// Rate limit window in milliseconds
    #[arg(long, env = "RATE_LIMIT_WINDOW_MS")]
    rate_limit_window_ms: Option<u64>,

    /// Port for health, readiness, metrics and the bus hub
    #[arg(short, long, env = "PORT")]
    port: Option<u16>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn into_config(self) -> Result<RelayConfig> {
        let path = self.config.clone().or_else(RelayConfig::find_config);
        let mut config = match path {
            Some(path) => RelayConfig::load(&path)?,
            None => RelayConfig::default(),
        };

        if let Some(tenant_id) = self.tenant_id {
            config.tenant_id = tenant_id;
        }
        if self.bus_url.is_some() {
            config.bus.url = self.bus_url;
        }
        if self.bus_key.is_some() {
            config.bus.key = self.bus_key;
        }
        if let Some(namespace) = self.namespace {
            config.bus.namespace = namespace;
        }
        if let Some(hosts) = self.allowed_hosts {
            config.allowed_hosts = hosts
                .into_iter()
                .map(|h| h.trim().to_string())
                .filter(|h| !h.is_empty())
                .collect();
        }
        if self.strict_wildcards {
            config.strict_wildcards = true;
        }
        if let Some(size) = self.max_request_size {
            config.max_request_size = size;
        }
        if let Some(limit) = self.rate_limit {
            config.rate_limit.requests = limit;
        }
        if let Some(window) = self.rate_limit_window_ms {
            config.rate_limit.window_ms = window;
        }
        if let Some(port) = self.port {
            config.port = port;
        }

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "mcptunnel_relay=debug,mcptunnel_shared=debug"
    } else {
        "mcptunnel_relay=info,mcptunnel_shared=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let config = cli.into_config()?;
    let topics = Topics::new(&config.bus.namespace, &config.tenant_id);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let metrics = Metrics::new();

    // Either host the bus here or join someone else's hub.
    let (bus, hub): (Arc<dyn MessageBus>, Option<BusHub>) = match &config.bus.url {
        None => {
            let bus: Arc<dyn MessageBus> = Arc::new(MemoryBus::new());
            let hub = BusHub::new(
                bus.clone(),
                config.bus.namespace.clone(),
                config.bus.key.clone(),
                shutdown_rx.clone(),
            );
            (bus, Some(hub))
        }
        Some(url) => {
            let ws = WsBus::new(
                WsBusConfig::new(url.clone())
                    .with_api_key(config.bus.key.clone())
                    .with_connect_timeout(Duration::from_millis(config.bus.connect_timeout_ms)),
            );
            (Arc::new(ws), None)
        }
    };

    if hub.is_some() && config.bus.key.is_none() {
        warn!("Hosting the bus without a key; any client can connect to /bus");
    }

    // Serve health first so /ready reports 503 until the bus is up.
    let state = AppState::new(bus.clone(), metrics.clone(), hub);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    let mut server_shutdown = shutdown_rx.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, app::build_router(state))
            .with_graceful_shutdown(async move {
                let _ = server_shutdown.changed().await;
            })
            .await
    });
    info!("MCP Tunnel relay on {}", addr);

    bus.connect().await.context("Failed to connect to message bus")?;
    info!(
        tenant_id = %config.tenant_id,
        bus = config.bus.url.as_deref().unwrap_or("embedded"),
        "Connected to message bus"
    );

    let limiter = Arc::new(RateLimiter::new(
        config.rate_limit.requests,
        Duration::from_millis(config.rate_limit.window_ms),
    ));
    info!(
        limit = limiter.limit(),
        window_ms = limiter.window().as_millis() as u64,
        "Per-tenant rate limit"
    );
    let allow_list =
        AllowList::from_strings(&config.allowed_hosts).with_strict_wildcards(config.strict_wildcards);
    if allow_list.is_empty() {
        info!("No host allow-list configured; all destinations permitted");
    } else {
        info!(
            hosts = ?config.allowed_hosts,
            strict_wildcards = config.strict_wildcards,
            "Host allow-list active"
        );
    }
    let executor = RequestExecutor::new(
        Arc::new(ReqwestTransport::new()),
        allow_list,
        config.max_request_size,
        metrics.clone(),
    );
    let worker = Arc::new(Worker::new(
        bus.clone(),
        topics,
        executor,
        limiter.clone(),
        metrics,
    ));

    let sweep_every = limiter.window();
    let sweeper = worker::spawn_sweeper(limiter, sweep_every, shutdown_rx.clone());
    let worker_task = tokio::spawn(worker.run(shutdown_rx));

    shutdown_signal().await;
    info!("Shutting down");

    let _ = shutdown_tx.send(true);
    if let Err(e) = bus.close().await {
        warn!("Error closing message bus: {}", e);
    }

    match worker_task.await {
        Ok(Err(e)) => error!("Worker failed: {}", e),
        Err(e) => error!("Worker task panicked: {}", e),
        Ok(Ok(())) => {}
    }
    let _ = sweeper.await;
    match server.await {
        Ok(Err(e)) => error!("HTTP server error: {}", e),
        Err(e) => error!("HTTP server task panicked: {}", e),
        Ok(Ok(())) => {}
    }

    info!("Relay stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

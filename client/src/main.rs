use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mcptunnel_shared::protocol::DEFAULT_MAX_REQUEST_SIZE;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod config;
mod proxy;
mod tunnel;

use config::ClientConfig;
use tunnel::{CallIntent, TunnelClient};

#[derive(Parser)]
#[command(name = "mcptunnel")]
#[command(version)]
#[command(about = "Perform HTTP calls through a remote relay over the message bus", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Bus hub URL
    #[arg(long, env = "BUS_URL", default_value = config::DEFAULT_BUS_URL)]
    bus_url: String,

    /// Bus credential
    #[arg(long, env = "BUS_KEY", hide_env_values = true)]
    bus_key: Option<String>,

    /// Tenant whose relay performs the calls
    #[arg(short, long, env = "TENANT_ID")]
    tenant_id: String,

    /// Topic namespace
    #[arg(long, env = "BUS_NAMESPACE", default_value = mcptunnel_shared::protocol::DEFAULT_NAMESPACE)]
    namespace: String,

    /// Per-call timeout in milliseconds
    #[arg(long, env = "TUNNEL_TIMEOUT_MS", default_value_t = mcptunnel_shared::protocol::DEFAULT_TIMEOUT_MS)]
    timeout_ms: u64,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Perform one call and print the response
    Fetch {
        url: String,

        /// HTTP method
        #[arg(short = 'X', long, default_value = "GET")]
        method: String,

        /// Request header, `Name: value` (repeatable)
        #[arg(short = 'H', long = "header")]
        headers: Vec<String>,

        /// Request body
        #[arg(short = 'd', long)]
        data: Option<String>,

        /// Print status line and headers before the body
        #[arg(short, long)]
        include: bool,

        /// Timeout for this call in milliseconds (overrides --timeout-ms)
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Run a local HTTP forward proxy that sends every request through the tunnel
    Proxy {
        /// Local port to listen on
        #[arg(short, long, default_value = "8888")]
        port: u16,

        /// Address to bind
        #[arg(long, default_value = "127.0.0.1")]
        bind: std::net::IpAddr,
    },
}

impl Cli {
    fn client_config(&self) -> Result<ClientConfig> {
        let config = ClientConfig {
            bus_url: self.bus_url.clone(),
            bus_key: self.bus_key.clone(),
            namespace: self.namespace.clone(),
            tenant_id: self.tenant_id.clone(),
            timeout: Duration::from_millis(self.timeout_ms),
            ..ClientConfig::default()
        };
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "mcptunnel=debug,mcptunnel_shared=debug"
    } else {
        "mcptunnel=info,mcptunnel_shared=warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = cli.client_config()?;
    let client = Arc::new(TunnelClient::new(
        Arc::new(config.bus()),
        &config.namespace,
        config.tenant_id.clone(),
        config.timeout,
    ));
    client
        .connect()
        .await
        .with_context(|| format!("Failed to connect to bus hub at {}", config.bus_url))?;

    let result = match cli.command {
        Commands::Fetch {
            url,
            method,
            headers,
            data,
            include,
            timeout,
        } => match build_intent(url, method, headers, data, timeout) {
            Ok(intent) => run_fetch(&client, intent, include).await,
            Err(e) => Err(e),
        },
        Commands::Proxy { port, bind } => {
            let addr = SocketAddr::new(bind, port);
            proxy::serve(client.clone(), addr, DEFAULT_MAX_REQUEST_SIZE, async {
                let _ = tokio::signal::ctrl_c().await;
                info!("Shutting down...");
            })
            .await
        }
    };

    client.close().await?;
    result
}

fn build_intent(
    url: String,
    method: String,
    headers: Vec<String>,
    data: Option<String>,
    timeout_ms: Option<u64>,
) -> Result<CallIntent> {
    let mut intent = CallIntent::new(method, url);
    for raw in headers {
        let (name, value) = parse_header(&raw)?;
        intent = intent.header(name, value);
    }
    if let Some(data) = data {
        intent = intent.body(data.into_bytes());
    }
    if let Some(ms) = timeout_ms {
        intent = intent.timeout(Duration::from_millis(ms));
    }
    Ok(intent)
}

async fn run_fetch(client: &TunnelClient, intent: CallIntent, include: bool) -> Result<()> {
    let response = client.fetch(intent).await?;

    let mut stdout = std::io::stdout().lock();
    if include {
        writeln!(
            stdout,
            "HTTP {} {}",
            response.status,
            response.status_text.as_deref().unwrap_or_default()
        )?;
        for (name, value) in &response.headers {
            writeln!(stdout, "{}: {}", name, value)?;
        }
        writeln!(stdout)?;
    }
    stdout.write_all(&response.body)?;
    stdout.flush()?;
    Ok(())
}

/// Split a `Name: value` header argument.
fn parse_header(raw: &str) -> Result<(String, String)> {
    let (name, value) = raw
        .split_once(':')
        .with_context(|| format!("Invalid header '{}', expected 'Name: value'", raw))?;
    let name = name.trim();
    if name.is_empty() {
        anyhow::bail!("Invalid header '{}': empty name", raw);
    }
    Ok((name.to_string(), value.trim().to_string()))
}

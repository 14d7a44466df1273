//! burrow: expose localhost to the internet.
//!
//! `burrow serve` runs the public gateway; `burrow start` exposes a local
//! port through a gateway.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use burrow_agent::{Agent, AgentConfig};
use burrow_gateway::{Gateway, GatewayConfig, MemoryBlobStore};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// burrow: expose localhost to the internet
#[derive(Parser, Debug)]
#[command(name = "burrow", version, about = "expose localhost to the internet")]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the public gateway server
    Serve {
        /// Port to listen on
        #[arg(short, long, default_value_t = 8080)]
        port: u16,

        /// Bind address
        #[arg(long, default_value = "0.0.0.0")]
        bind: IpAddr,

        /// Public routing domain (host-based dispatch stays off without it)
        #[arg(long, default_value = "")]
        domain: String,

        /// Per-subdomain requests per minute (0 = default 60)
        #[arg(long, default_value_t = 0)]
        requests_per_min: usize,

        /// Per-subdomain concurrent connections (0 = default 5)
        #[arg(long, default_value_t = 0)]
        max_conns: usize,
    },

    /// Expose a local port through a gateway
    Start {
        /// Local port to expose
        #[arg(short, long, default_value_t = 3000)]
        port: u16,

        /// Positional form of the local port
        #[arg(value_name = "PORT")]
        port_arg: Option<u16>,

        /// Gateway address (host:port)
        #[arg(short, long, default_value = "localhost:8080")]
        server: String,

        /// Requested subdomain (best effort)
        #[arg(long)]
        subdomain: Option<String>,

        /// Exit instead of reconnecting when the tunnel drops
        #[arg(long)]
        no_reconnect: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutting down");
                cancel.cancel();
            }
        });
    }

    let result = match cli.command {
        Command::Serve {
            port,
            bind,
            domain,
            requests_per_min,
            max_conns,
        } => run_gateway(port, bind, domain, requests_per_min, max_conns, cancel).await,
        Command::Start {
            port,
            port_arg,
            server,
            subdomain,
            no_reconnect,
        } => {
            let port = port_arg.unwrap_or(port);
            run_agent(port, server, subdomain, !no_reconnect, cancel).await
        }
    };

    if let Err(e) = result {
        error!(error = %e, "exited with error");
        std::process::exit(1);
    }
}

async fn run_gateway(
    port: u16,
    bind: IpAddr,
    domain: String,
    requests_per_min: usize,
    max_conns: usize,
    cancel: CancellationToken,
) -> burrow_core::TunnelResult<()> {
    let config = GatewayConfig {
        addr: SocketAddr::new(bind, port),
        domain,
        version: VERSION.to_string(),
        requests_per_min,
        max_conns,
    };

    let gateway =
        Gateway::bind_with_blobs(config, Some(Arc::new(MemoryBlobStore::new()))).await?;
    if !gateway.domain().is_empty() {
        info!("public URL: http://*.{}", gateway.domain());
    }
    gateway.run(cancel).await
}

async fn run_agent(
    port: u16,
    server: String,
    subdomain: Option<String>,
    reconnect: bool,
    cancel: CancellationToken,
) -> burrow_core::TunnelResult<()> {
    let agent = Agent::new(AgentConfig {
        gateway_addr: server,
        local_port: port,
        subdomain,
        reconnect,
    })?;

    agent.on_connected(move |public_url| {
        info!(public_url = %public_url, local_port = port, "forwarding");
    });
    agent.on_disconnect(|| {
        info!("disconnected");
    });

    agent.connect(cancel.clone()).await?;
    agent.wait(&cancel).await;
    Ok(())
}

//! dialchain client
//!
//! Runs local HTTP and SOCKS5 proxies that dial every target through the
//! configured transport chain:
//! - builds the chain from the `[proxy]` section
//! - optionally tries proxyless (packet-manipulated direct) dials first
//! - relays each client connection until either side finishes

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use dialchain::{
    config::{generate_example_config, Config, LoggingConfig},
    obfuscation::PacketDialer,
    policy::{AttemptHistory, FallbackDialer, ProxylessDialer},
    proxy::{HttpProxyServer, Socks5Server},
    transport::TcpDialer,
    Registry, SharedDialer,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// dialchain client - local proxy over a composable transport chain
#[derive(Parser, Debug)]
#[command(name = "dialchain-client")]
#[command(about = "Local HTTP/SOCKS5 proxy over a composable transport chain")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Write an example configuration to the config path and exit
    #[arg(long)]
    generate_config: bool,

    /// Local HTTP proxy address (overrides config)
    #[arg(long)]
    http: Option<String>,

    /// Local SOCKS5 proxy address (overrides config)
    #[arg(long)]
    socks5: Option<String>,

    /// Log level or filter (overrides config)
    #[arg(short = 'v', long)]
    log_level: Option<String>,
}

fn init_logging(logging: &LoggingConfig, override_level: Option<&str>) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(override_level.unwrap_or(&logging.level)));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if logging.format == "compact" {
        builder.compact().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.generate_config {
        generate_example_config()
            .save(&args.config)
            .context("Failed to write example configuration")?;
        println!("Example configuration written to {}", args.config);
        return Ok(());
    }

    let config = Config::load(&args.config).context("Failed to load configuration")?;
    init_logging(&config.logging, args.log_level.as_deref());

    info!("dialchain client v{}", dialchain::VERSION);

    let registry = Registry::with_defaults()
        .with_transport(config.client.transport())
        .with_multiplex(config.multiplex.to_mux_config()?);
    let chain = registry
        .build_chain(&config.proxy)
        .context("Failed to build dialer chain")?;
    info!("Proxy: {} via {}", chain.server(), chain.stages().join(" -> "));

    let dialer: SharedDialer = match &config.proxyless {
        Some(proxyless) => {
            let packet = PacketDialer::parse(
                TcpDialer::new(config.client.transport()),
                &proxyless.techniques,
            )
            .context("Invalid [proxyless] techniques")?;
            let history = Arc::new(AttemptHistory::new(config.policy.staleness()));
            info!(
                "Proxyless: {} (retry failed destinations after {}h)",
                proxyless.techniques, config.policy.staleness_hours
            );
            let direct = Arc::new(ProxylessDialer::new(packet, history));
            Arc::new(FallbackDialer::new(direct, Arc::new(chain)))
        }
        None => Arc::new(chain),
    };

    let http_addr = args.http.or(config.client.http_listen.clone());
    let socks5_addr = args.socks5.or(config.client.socks5_listen.clone());
    if http_addr.is_none() && socks5_addr.is_none() {
        return Err(anyhow!("No listener configured: set client.http_listen or client.socks5_listen"));
    }

    let cancel = CancellationToken::new();
    let credentials = config.client.credentials();

    if let Some(addr) = &http_addr {
        let mut server = HttpProxyServer::bind(addr, dialer.clone())
            .await
            .with_context(|| format!("Failed to bind HTTP proxy on {}", addr))?
            .with_cancel(cancel.clone());
        if let Some((user, pass)) = credentials.clone() {
            server = server.with_auth(user, pass);
        }
        if let Some(token) = &config.client.auth_token {
            server = server.with_auth_token(config.client.auth_header.clone(), token.clone());
        }
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("HTTP proxy error: {}", e);
            }
        });
    }

    if let Some(addr) = &socks5_addr {
        let mut server = Socks5Server::bind(addr, dialer.clone())
            .await
            .with_context(|| format!("Failed to bind SOCKS5 proxy on {}", addr))?
            .with_cancel(cancel.clone());
        if let Some((user, pass)) = credentials {
            server = server.with_auth(user, pass);
        }
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("SOCKS5 proxy error: {}", e);
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    cancel.cancel();

    Ok(())
}

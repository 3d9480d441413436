//! dialchain development server
//!
//! Serves the far end of a chain for testing:
//! - accepts shadowsocks or algeneva on the configured port
//! - runs a multiplexer session over each accepted connection
//! - dials each logical stream's destination and relays it
//!
//! Streams may name any destination, so the server is meant for local use.
//! It listens on loopback unless `--listen` says otherwise.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use dialchain::{
    algeneva::AlgenevaAcceptor,
    config::{Config, LoggingConfig},
    multiplex::{MuxConfig, Session},
    proxy::relay,
    shadowsocks::{ShadowsocksAcceptor, ShadowsocksConfig},
    transport::{StreamDialer, TcpConn, TcpDialer},
    BoxConn,
};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// dialchain server - development endpoint for client chains
#[derive(Parser, Debug)]
#[command(name = "dialchain-server")]
#[command(about = "Development endpoint serving shadowsocks or algeneva plus the multiplexer")]
#[command(version)]
struct Args {
    /// Configuration file path (the [proxy] section selects the protocol)
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Listen address (default: 127.0.0.1 on the configured proxy port)
    #[arg(short, long)]
    listen: Option<String>,

    /// Maximum concurrent physical connections
    #[arg(long, default_value_t = 1000)]
    max_connections: usize,

    /// Log level or filter (overrides config)
    #[arg(short = 'v', long)]
    log_level: Option<String>,
}

/// Server-side protocol handshake
#[derive(Clone)]
enum Acceptor {
    Shadowsocks(ShadowsocksAcceptor),
    Algeneva(AlgenevaAcceptor),
}

impl Acceptor {
    async fn accept(&self, conn: TcpConn) -> Result<BoxConn> {
        match self {
            Acceptor::Shadowsocks(acceptor) => {
                let (conn, target) = acceptor.accept(conn).await?;
                debug!("shadowsocks header names {}", target);
                Ok(Box::new(conn))
            }
            Acceptor::Algeneva(acceptor) => {
                let (conn, request) = acceptor.accept(conn).await?;
                debug!("algeneva request for {:?}", request.target());
                Ok(Box::new(conn))
            }
        }
    }
}

struct ServerState {
    acceptor: Acceptor,
    mux: MuxConfig,
    upstream: TcpDialer,
    conn_semaphore: Arc<Semaphore>,
    cancel: CancellationToken,
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

    let config = Config::load(&args.config).context("Failed to load configuration")?;
    init_logging(&config.logging, args.log_level.as_deref());

    let acceptor = match config.proxy.protocol.as_str() {
        "shadowsocks" => {
            let ss = ShadowsocksConfig::from_params(&config.proxy.params)
                .context("Invalid shadowsocks parameters")?;
            Acceptor::Shadowsocks(ShadowsocksAcceptor::new(&ss))
        }
        "algeneva" => Acceptor::Algeneva(AlgenevaAcceptor::new()),
        other => return Err(anyhow!("Server does not support protocol {}", other)),
    };

    let listen = args
        .listen
        .unwrap_or_else(|| default_listen(config.proxy.port));
    let listener = TcpListener::bind(&listen)
        .await
        .with_context(|| format!("Failed to bind {}", listen))?;
    let local_addr = listener.local_addr()?;
    if !local_addr.ip().is_loopback() {
        warn!(
            "Listening on {}: any client reaching it can relay to any destination",
            local_addr
        );
    }

    info!("dialchain server v{}", dialchain::VERSION);
    info!("Serving {} on {}", config.proxy.protocol, listen);

    let state = Arc::new(ServerState {
        acceptor,
        mux: config.multiplex.to_mux_config()?,
        upstream: TcpDialer::new(config.client.transport()),
        conn_semaphore: Arc::new(Semaphore::new(args.max_connections)),
        cancel: CancellationToken::new(),
    });

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                let permit = match state.conn_semaphore.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        warn!("Connection limit reached, dropping {}", peer);
                        continue;
                    }
                };
                let state = state.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, state).await {
                        debug!("Connection from {} ended: {}", peer, e);
                    }
                    drop(permit);
                });
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                state.cancel.cancel();
                return Ok(());
            }
        }
    }
}

async fn handle_connection(stream: TcpStream, state: Arc<ServerState>) -> Result<()> {
    let conn = TcpConn::new(stream)?;
    let conn = state.acceptor.accept(conn).await?;

    let (session, mut incoming) = Session::server(conn, state.mux.clone());

    loop {
        let stream = tokio::select! {
            stream = incoming.accept() => match stream {
                Some(stream) => stream,
                None => break,
            },
            _ = state.cancel.cancelled() => break,
        };

        let state = state.clone();
        tokio::spawn(async move {
            let destination = stream.destination().to_string();
            match state.upstream.dial_stream(&destination).await {
                Ok(remote) => {
                    let outcome = relay(stream, remote, state.cancel.clone()).await;
                    debug!("{}: {:?}", destination, outcome);
                }
                Err(e) => {
                    error!("Failed to dial {}: {}", destination, e);
                }
            }
        });
    }

    session.close();
    Ok(())
}

/// Loopback on the configured port
fn default_listen(port: u16) -> String {
    format!("127.0.0.1:{}", port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_listen_is_loopback() {
        let addr: std::net::SocketAddr = default_listen(8388).parse().unwrap();
        assert!(addr.ip().is_loopback());
        assert_eq!(addr.port(), 8388);
    }

    #[test]
    fn test_listen_flag_overrides_default() {
        let args = Args::try_parse_from(["dialchain-server", "--listen", "0.0.0.0:9000"]).unwrap();
        assert_eq!(args.listen.as_deref(), Some("0.0.0.0:9000"));

        let args = Args::try_parse_from(["dialchain-server"]).unwrap();
        assert!(args.listen.is_none());
    }
}

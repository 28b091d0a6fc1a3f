//! vnet demo node
//!
//! Starts a node backed by the in-process simulated subsystems, listens on
//! port 80 of the overlay and answers every connection with a greeting. The
//! loopback local API and SOCKS5 proxy are opened and their address logged.

use anyhow::Result;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use vnet_node::sim::SimSubsystems;
use vnet_node::{Server, ServerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    // RUST_LOG wins; VNET_LOG_LEVEL is the short form.
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_from_env("VNET_LOG_LEVEL"))
        .unwrap_or_else(|_| "info".into());
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting vnet demo node");

    let config = ServerConfig::from_env()?;
    info!(?config, "Configuration loaded");

    let server = Server::new(config, SimSubsystems::default());
    let status = server.up().await?;
    info!(
        hostname = %status.self_node.hostname,
        addrs = ?status.addrs,
        "Node is up"
    );

    let loopback = server.loopback().await?;
    info!(addr = %loopback.addr, proxy_user = %loopback.proxy_user, "Loopback surface ready");

    let listener = server.listen("tcp", ":80").await?;
    let accept_loop = tokio::spawn(async move {
        loop {
            let mut conn = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    debug!(error = %e, "Accept loop stopped");
                    return;
                }
            };
            tokio::spawn(async move {
                if let Err(e) = conn.write_all(b"hello from vnet\n").await {
                    debug!(error = %e, "Greeting failed");
                }
            });
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    if let Err(e) = server.close().await {
        error!(error = %e, "Close failed");
    }
    let _ = accept_loop.await;

    info!("vnet demo node stopped");
    Ok(())
}

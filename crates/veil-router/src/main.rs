use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use veil_router::{serve, spawn_sweeper, RouterConfig, RouterContext};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,veil_router=debug")),
        )
        .init();

    info!("Starting Veil router v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = RouterConfig::from_env();
    info!(
        name = %config.name,
        listen = %config.listen_addr,
        message = config.message_router,
        transfer = config.transfer_router,
        chunk_size = config.chunk_size,
        chunk_buffer = config.chunk_buffer,
        max_transfers = config.max_transfers,
        max_threads = config.max_threads,
        verified = config.verified.len(),
        "Loaded configuration"
    );
    if !config.message_router && !config.transfer_router {
        anyhow::bail!("router serves neither message nor transfer sessions");
    }

    // -----------------------------------------------------------------------
    // 3. Initialize shared state and background cleanup
    // -----------------------------------------------------------------------
    let listen_addr = config.listen_addr;
    let ctx = RouterContext::new(config);
    let sweeper = spawn_sweeper(ctx.clone());

    // -----------------------------------------------------------------------
    // 4. Accept connections until Ctrl+C
    // -----------------------------------------------------------------------
    let listener = TcpListener::bind(listen_addr).await?;

    tokio::select! {
        result = serve(listener, ctx.clone()) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Router stopped");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    sweeper.abort();
    info!(
        clients = ctx.directory.client_count().await,
        transfers = ctx.transfers.active().await,
        "Router stopped"
    );
    Ok(())
}

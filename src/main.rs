use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sqlfe_server::query::memory::{MemoryExecutor, StaticPrivilegeManager};
use sqlfe_server::{Config, MysqlServer};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sqlfe_server=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting sqlfe-server");

    // Load configuration
    let config = Config::load()?;
    info!(
        host = %config.host,
        port = config.port,
        socket = ?config.socket,
        max_connections = config.max_connections,
        users = config.users.len(),
        tables = config.tables.len(),
        "Configuration loaded"
    );

    let executor = Arc::new(MemoryExecutor::new(&config));
    let privileges = Arc::new(StaticPrivilegeManager::new(&config.users));
    let grace = Duration::from_secs(config.graceful_shutdown_timeout_secs);
    let port = config.port;

    let server = Arc::new(MysqlServer::new(config, executor, privileges)?);

    let serving = server.clone();
    let mut server_handle = tokio::spawn(async move { serving.run().await });

    info!("Connect with: mysql -h 127.0.0.1 -P {} -u root", port);

    tokio::select! {
        joined = &mut server_handle => {
            match joined {
                Ok(Ok(())) => info!("MySQL server stopped"),
                Ok(Err(e)) => error!("MySQL server error: {}", e),
                Err(e) => error!("MySQL server task failed: {}", e),
            }
            return Ok(());
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    server.graceful_shutdown(grace).await;
    let _ = server_handle.await;
    info!("Shutting down sqlfe-server");
    Ok(())
}

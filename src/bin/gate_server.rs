use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chatfabric::config::{ConfigOverrides, FabricConfig};
use chatfabric::db::{DbPool, UserMapper};
use chatfabric::gateway::{build_router, GatewayState};
use chatfabric::kv::RedisKvStore;
use chatfabric::logging;
use chatfabric::rpc::TokenStubPool;
use clap::Parser;
use tracing::info;

/// The stateless HTTP gateway: registration, login, verification, and
/// password reset.
#[derive(Parser)]
#[command(name = "gate-server", about = "Chatfabric HTTP gateway", version)]
struct Args {
    /// Path to config.toml
    #[arg(long, env = "CHATFABRIC_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, env = "CHATFABRIC_GATEWAY_PORT")]
    port: Option<u16>,

    #[arg(long, env = "CHATFABRIC_DATABASE_URL")]
    database_url: Option<String>,

    #[arg(long, env = "CHATFABRIC_REDIS_URL")]
    redis_url: Option<String>,

    #[arg(long, env = "CHATFABRIC_STATUS_ENDPOINT")]
    status_endpoint: Option<String>,

    #[arg(long, env = "CHATFABRIC_LOG")]
    log: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let cfg = FabricConfig::load(
        args.config.as_deref(),
        ConfigOverrides {
            gateway_port: args.port,
            database_url: args.database_url,
            redis_url: args.redis_url,
            status_endpoint: args.status_endpoint,
            log: args.log,
            ..Default::default()
        },
    );
    logging::init(&cfg.log);

    let db = DbPool::connect(
        &cfg.database_url,
        cfg.db_max_connections,
        Duration::from_secs(cfg.db_connection_lifetime_secs),
        Duration::from_secs(cfg.db_connection_idle_secs),
    )
    .await
    .context("failed to connect to database")?;
    db.migrate().await.context("failed to run migrations")?;
    db.spawn_monitor(Duration::from_secs(cfg.db_monitor_interval_secs));

    let kv = Arc::new(
        RedisKvStore::connect(&cfg.redis_url)
            .await
            .context("failed to connect to redis")?,
    );

    let token_stubs = Arc::new(
        TokenStubPool::connect(&cfg.status_endpoint, 4)
            .await
            .context("failed to dial status service")?,
    );

    let state = Arc::new(GatewayState {
        users: UserMapper::new(db),
        kv,
        token_stubs,
    });

    let router = build_router(state);
    let addr: SocketAddr = format!("0.0.0.0:{}", cfg.gateway_port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "gateway listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("gateway shut down cleanly");
    Ok(())
}

/// Resolves on SIGTERM or Ctrl-C (SIGINT on Unix), so the caller can drain
/// in-flight requests before exiting.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
    }
}

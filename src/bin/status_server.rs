use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chatfabric::config::{ConfigOverrides, FabricConfig};
use chatfabric::kv::RedisKvStore;
use chatfabric::logging;
use chatfabric::rpc::proto::authentication_service_server::AuthenticationServiceServer;
use chatfabric::token::{cleanup, AuthenticationServiceImpl, ChatServerRegistry, TokenService};
use clap::Parser;
use tonic::transport::Server;
use tracing::info;

/// The stateful Status/Token service: JWT issuance, validation, and
/// chat-server selection, exposed over gRPC.
#[derive(Parser)]
#[command(name = "status-server", about = "Chatfabric status/token service", version)]
struct Args {
    #[arg(long, env = "CHATFABRIC_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, env = "CHATFABRIC_STATUS_RPC_PORT")]
    port: Option<u16>,

    #[arg(long, env = "CHATFABRIC_REDIS_URL")]
    redis_url: Option<String>,

    #[arg(long, env = "CHATFABRIC_JWT_SECRET")]
    jwt_secret: Option<String>,

    #[arg(long, env = "CHATFABRIC_LOG")]
    log: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let cfg = FabricConfig::load(
        args.config.as_deref(),
        ConfigOverrides {
            status_rpc_port: args.port,
            redis_url: args.redis_url,
            jwt_secret: args.jwt_secret,
            log: args.log,
            ..Default::default()
        },
    );
    logging::init(&cfg.log);

    let kv = Arc::new(
        RedisKvStore::connect(&cfg.redis_url)
            .await
            .context("failed to connect to redis")?,
    );
    let registry = ChatServerRegistry::new();
    let token_service = Arc::new(TokenService::new(
        &cfg.jwt_secret,
        kv.clone(),
        registry.clone(),
        cfg.token_ttl_secs,
    ));

    cleanup::spawn(kv, Duration::from_secs(cfg.token_cleanup_interval_secs));

    let service = AuthenticationServiceImpl::new(token_service, registry);
    let addr: SocketAddr = format!("0.0.0.0:{}", cfg.status_rpc_port).parse()?;
    info!(%addr, "status/token service listening");

    Server::builder()
        .add_service(AuthenticationServiceServer::new(service))
        .serve_with_shutdown(addr, shutdown_signal())
        .await?;

    info!("status/token service shut down cleanly");
    Ok(())
}

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

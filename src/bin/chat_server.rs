use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chatfabric::chat::ChatServer;
use chatfabric::config::{ConfigOverrides, FabricConfig};
use chatfabric::logging;
use chatfabric::rpc::TokenStubPool;
use chatfabric::worker_pool::WorkerPool;
use clap::Parser;
use tracing::info;
use uuid::Uuid;

/// One node in the chat-server pool: accepts TCP sessions, authenticates
/// them against the status service, and routes chat frames.
#[derive(Parser)]
#[command(name = "chat-server", about = "Chatfabric chat server", version)]
struct Args {
    #[arg(long, env = "CHATFABRIC_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, env = "CHATFABRIC_CHAT_HOST")]
    chat_host: Option<String>,

    #[arg(long, env = "CHATFABRIC_CHAT_PORT")]
    chat_port: Option<u16>,

    /// Deployment zone this node reports itself as belonging to. Purely
    /// informational for the core — master/slave or zone-aware routing is
    /// a deployment concern, not a protocol one.
    #[arg(long, env = "CHATFABRIC_CHAT_ZONE")]
    chat_zone: Option<String>,

    #[arg(long, env = "CHATFABRIC_STATUS_ENDPOINT")]
    status_endpoint: Option<String>,

    /// Stable identifier this node reports itself as in the status
    /// registry. Defaults to a random id if not set.
    #[arg(long, env = "CHATFABRIC_SERVER_ID")]
    server_id: Option<String>,

    #[arg(long, env = "CHATFABRIC_LOG")]
    log: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let server_id = args.server_id.clone().unwrap_or_else(|| Uuid::new_v4().to_string());

    let cfg = FabricConfig::load(
        args.config.as_deref(),
        ConfigOverrides {
            chat_host: args.chat_host,
            chat_port: args.chat_port,
            chat_zone: args.chat_zone,
            status_endpoint: args.status_endpoint,
            log: args.log,
            ..Default::default()
        },
    );
    logging::init(&cfg.log);

    let token_stubs = Arc::new(
        TokenStubPool::connect(&cfg.status_endpoint, 4)
            .await
            .context("failed to dial status service")?,
    );

    let worker_pool = WorkerPool::new(cfg.worker_threads, cfg.worker_channel_capacity);

    let bind_addr = format!("{}:{}", cfg.chat_host, cfg.chat_port);
    let server = ChatServer::new(
        server_id.clone(),
        cfg.chat_zone.clone(),
        bind_addr,
        cfg.max_connections,
        worker_pool.clone(),
        token_stubs.clone(),
    );

    let heartbeat = {
        let server = server.clone();
        let host = cfg.chat_host.clone();
        let port = cfg.chat_port;
        tokio::spawn(async move {
            server.heartbeat_loop(host, port, std::time::Duration::from_secs(30)).await;
        })
    };

    let accept_loop = {
        let server = server.clone();
        tokio::spawn(async move { server.start().await })
    };

    shutdown_signal().await;
    info!(id = %server_id, "shutting down chat server");
    server.stop().await;
    heartbeat.abort();

    if let Err(e) = accept_loop.await.context("accept loop task panicked")? {
        tracing::error!(err = %e, "chat server accept loop exited with error");
    }

    worker_pool.wait_for_completion(10_000).await;
    worker_pool.stop();

    info!("chat server shut down cleanly");
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

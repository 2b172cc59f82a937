//! Layered configuration: CLI/env > TOML file > built-in default.
//!
//! Mirrors the precedence and struct shape used throughout this fabric's
//! three processes — each binary loads a [`FabricConfig`] once at startup
//! and threads it through as `Arc<FabricConfig>`.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{error, warn};

const DEFAULT_GATEWAY_PORT: u16 = 8080;
const DEFAULT_STATUS_RPC_PORT: u16 = 9090;
const DEFAULT_CHAT_PORT: u16 = 7070;
const DEFAULT_MAX_CONNECTIONS: usize = 10_000;
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 16;
const DEFAULT_DB_CONNECTION_LIFETIME_SECS: u64 = 30 * 60;
const DEFAULT_DB_CONNECTION_IDLE_SECS: u64 = 5 * 60;
const DEFAULT_DB_MONITOR_INTERVAL_SECS: u64 = 5 * 60;
const DEFAULT_WORKER_CHANNEL_CAPACITY: usize = 1024;
const DEFAULT_TOKEN_TTL_SECS: i64 = 24 * 60 * 60;
const DEFAULT_VERIFY_CODE_TTL_SECS: u64 = 5 * 60;
const DEFAULT_TOKEN_CLEANUP_INTERVAL_SECS: u64 = 60 * 60;

/// `{config_dir}/config.toml` — every field is an optional override.
#[derive(Deserialize, Default)]
struct TomlConfig {
    gateway_port: Option<u16>,
    status_rpc_port: Option<u16>,
    chat_port: Option<u16>,
    chat_host: Option<String>,
    chat_zone: Option<String>,
    max_connections: Option<usize>,
    worker_threads: Option<usize>,
    worker_channel_capacity: Option<usize>,
    database_url: Option<String>,
    db_max_connections: Option<u32>,
    db_connection_lifetime_secs: Option<u64>,
    db_connection_idle_secs: Option<u64>,
    db_monitor_interval_secs: Option<u64>,
    redis_url: Option<String>,
    status_endpoint: Option<String>,
    jwt_secret: Option<String>,
    token_ttl_secs: Option<i64>,
    verify_code_ttl_secs: Option<u64>,
    token_cleanup_interval_secs: Option<u64>,
    log: Option<String>,
}

fn load_toml(path: &Path) -> Option<TomlConfig> {
    let contents = std::fs::read_to_string(path).ok()?;
    match toml::from_str::<TomlConfig>(&contents) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            error!(path = %path.display(), err = %e, "failed to parse config.toml — using defaults");
            None
        }
    }
}

/// Shared configuration surface for all three processes. Fields not used by
/// a given binary (e.g. `chat_port` for the gateway) are harmless to carry —
/// it keeps one config file and one loader for the whole fabric.
#[derive(Debug, Clone)]
pub struct FabricConfig {
    pub gateway_port: u16,
    pub status_rpc_port: u16,
    pub chat_host: String,
    pub chat_port: u16,
    pub chat_zone: String,
    pub max_connections: usize,
    pub worker_threads: usize,
    pub worker_channel_capacity: usize,
    pub database_url: String,
    pub db_max_connections: u32,
    pub db_connection_lifetime_secs: u64,
    pub db_connection_idle_secs: u64,
    pub db_monitor_interval_secs: u64,
    pub redis_url: String,
    pub status_endpoint: String,
    pub jwt_secret: String,
    pub token_ttl_secs: i64,
    pub verify_code_ttl_secs: u64,
    pub token_cleanup_interval_secs: u64,
    pub log: String,
}

/// CLI/env overlay — every field is `Some` only when the caller explicitly
/// passed it (via `clap`'s `env` attribute or a flag).
#[derive(Default)]
pub struct ConfigOverrides {
    pub gateway_port: Option<u16>,
    pub status_rpc_port: Option<u16>,
    pub chat_host: Option<String>,
    pub chat_port: Option<u16>,
    pub chat_zone: Option<String>,
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub status_endpoint: Option<String>,
    pub jwt_secret: Option<String>,
    pub log: Option<String>,
}

impl FabricConfig {
    /// Build config from CLI/env overrides + an optional `config.toml`.
    pub fn load(config_path: Option<&Path>, overrides: ConfigOverrides) -> Self {
        let default_path = PathBuf::from("config.toml");
        let path = config_path.unwrap_or(&default_path);
        let toml = if path.exists() {
            load_toml(path).unwrap_or_default()
        } else {
            TomlConfig::default()
        };

        let jwt_secret = overrides
            .jwt_secret
            .or(toml.jwt_secret)
            .unwrap_or_else(|| {
                warn!("no jwt_secret configured — using an insecure development default");
                "dev-insecure-secret-change-me".to_string()
            });

        Self {
            gateway_port: overrides
                .gateway_port
                .or(toml.gateway_port)
                .unwrap_or(DEFAULT_GATEWAY_PORT),
            status_rpc_port: overrides
                .status_rpc_port
                .or(toml.status_rpc_port)
                .unwrap_or(DEFAULT_STATUS_RPC_PORT),
            chat_host: overrides
                .chat_host
                .or(toml.chat_host)
                .unwrap_or_else(|| "0.0.0.0".to_string()),
            chat_port: overrides.chat_port.or(toml.chat_port).unwrap_or(DEFAULT_CHAT_PORT),
            chat_zone: overrides
                .chat_zone
                .or(toml.chat_zone)
                .unwrap_or_else(|| "default".to_string()),
            max_connections: toml.max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS),
            worker_threads: toml
                .worker_threads
                .unwrap_or_else(|| (std::thread::available_parallelism().map(|n| n.get()).unwrap_or(2) / 2).max(1)),
            worker_channel_capacity: toml
                .worker_channel_capacity
                .unwrap_or(DEFAULT_WORKER_CHANNEL_CAPACITY),
            database_url: overrides
                .database_url
                .or(toml.database_url)
                .unwrap_or_else(|| "mysql://root@127.0.0.1/chatfabric".to_string()),
            db_max_connections: toml.db_max_connections.unwrap_or(DEFAULT_DB_MAX_CONNECTIONS),
            db_connection_lifetime_secs: toml
                .db_connection_lifetime_secs
                .unwrap_or(DEFAULT_DB_CONNECTION_LIFETIME_SECS),
            db_connection_idle_secs: toml
                .db_connection_idle_secs
                .unwrap_or(DEFAULT_DB_CONNECTION_IDLE_SECS),
            db_monitor_interval_secs: toml
                .db_monitor_interval_secs
                .unwrap_or(DEFAULT_DB_MONITOR_INTERVAL_SECS),
            redis_url: overrides
                .redis_url
                .or(toml.redis_url)
                .unwrap_or_else(|| "redis://127.0.0.1/".to_string()),
            status_endpoint: overrides
                .status_endpoint
                .or(toml.status_endpoint)
                .unwrap_or_else(|| "http://127.0.0.1:9090".to_string()),
            jwt_secret,
            token_ttl_secs: toml.token_ttl_secs.unwrap_or(DEFAULT_TOKEN_TTL_SECS),
            verify_code_ttl_secs: toml.verify_code_ttl_secs.unwrap_or(DEFAULT_VERIFY_CODE_TTL_SECS),
            token_cleanup_interval_secs: toml
                .token_cleanup_interval_secs
                .unwrap_or(DEFAULT_TOKEN_CLEANUP_INTERVAL_SECS),
            log: overrides.log.or(toml.log).unwrap_or_else(|| "info".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_no_overrides_or_file() {
        let cfg = FabricConfig::load(Some(Path::new("/nonexistent/config.toml")), ConfigOverrides::default());
        assert_eq!(cfg.gateway_port, DEFAULT_GATEWAY_PORT);
        assert_eq!(cfg.chat_port, DEFAULT_CHAT_PORT);
        assert_eq!(cfg.max_connections, DEFAULT_MAX_CONNECTIONS);
    }

    #[test]
    fn overrides_win_over_defaults() {
        let overrides = ConfigOverrides {
            gateway_port: Some(1234),
            ..Default::default()
        };
        let cfg = FabricConfig::load(Some(Path::new("/nonexistent/config.toml")), overrides);
        assert_eq!(cfg.gateway_port, 1234);
    }
}

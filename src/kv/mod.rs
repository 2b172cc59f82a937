//! A thin key/value facade used for verification codes and token records,
//! backed by Redis in production and an in-memory map in tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::errors::KvError;

pub const VERIFY_CODE_TTL: Duration = Duration::from_secs(5 * 60);
pub const TOKEN_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), KvError>;
    async fn del(&self, key: &str) -> Result<(), KvError>;
    async fn exists(&self, key: &str) -> Result<bool, KvError>;
    async fn ttl(&self, key: &str) -> Result<Option<Duration>, KvError>;
    async fn scan(&self, pattern: &str) -> Result<Vec<String>, KvError>;
}

/// Generate (or reuse, idempotently, for the duration of its TTL) a 6-char
/// verification code for `email` and store it with a 5-minute TTL.
pub async fn generate_and_store_code(kv: &dyn KvStore, email: &str) -> Result<String, KvError> {
    let key = format!("verification_code:{email}");
    if let Some(existing) = kv.get(&key).await? {
        return Ok(existing);
    }
    let code = random_code();
    kv.set(&key, &code, VERIFY_CODE_TTL).await?;
    Ok(code)
}

/// Atomic check-and-delete: a matching code is consumed on success so it
/// cannot be replayed.
pub async fn verify_code(kv: &dyn KvStore, email: &str, code: &str) -> Result<(), KvError> {
    let key = format!("verification_code:{email}");
    let stored = kv.get(&key).await?.ok_or(KvError::ValueExpired)?;
    if stored != code {
        return Err(KvError::ValueMismatch);
    }
    kv.del(&key).await
}

fn random_code() -> String {
    Uuid::new_v4().simple().to_string()[..6].to_uppercase()
}

/// Redis-backed implementation over a shared `ConnectionManager` (handles
/// reconnection transparently; safe to clone/share across tasks).
pub struct RedisKvStore {
    conn: ConnectionManager,
}

impl RedisKvStore {
    pub async fn connect(redis_url: &str) -> Result<Self, KvError> {
        let client = redis::Client::open(redis_url).map_err(|e| KvError::ConnectionFailed(e.to_string()))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| KvError::ConnectionFailed(e.to_string()))?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl KvStore for RedisKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let mut conn = self.conn.clone();
        conn.get(key)
            .await
            .map_err(|e| KvError::OperationFailed(e.to_string()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), KvError> {
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(key, value, ttl.as_secs().max(1))
            .await
            .map_err(|e| KvError::OperationFailed(e.to_string()))
    }

    async fn del(&self, key: &str) -> Result<(), KvError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key)
            .await
            .map_err(|e| KvError::OperationFailed(e.to_string()))
    }

    async fn exists(&self, key: &str) -> Result<bool, KvError> {
        let mut conn = self.conn.clone();
        conn.exists(key).await.map_err(|e| KvError::OperationFailed(e.to_string()))
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, KvError> {
        let mut conn = self.conn.clone();
        let secs: i64 = conn.ttl(key).await.map_err(|e| KvError::OperationFailed(e.to_string()))?;
        Ok(if secs >= 0 { Some(Duration::from_secs(secs as u64)) } else { None })
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>, KvError> {
        let mut conn = self.conn.clone();
        conn.keys(pattern).await.map_err(|e| KvError::OperationFailed(e.to_string()))
    }
}

struct MemoryEntry {
    value: String,
    expires_at: Option<Instant>,
}

/// In-memory backend for tests that don't want a live Redis.
#[derive(Clone)]
pub struct MemoryKvStore {
    entries: Arc<Mutex<HashMap<String, MemoryEntry>>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl Default for MemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get(key) {
            if let Some(expires_at) = entry.expires_at {
                if expires_at <= Instant::now() {
                    entries.remove(key);
                    return Ok(None);
                }
            }
            return Ok(Some(entry.value.clone()));
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), KvError> {
        let mut entries = self.entries.lock().await;
        entries.insert(
            key.to_string(),
            MemoryEntry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), KvError> {
        self.entries.lock().await.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, KvError> {
        Ok(self.get(key).await?.is_some())
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, KvError> {
        let entries = self.entries.lock().await;
        Ok(entries
            .get(key)
            .and_then(|e| e.expires_at)
            .map(|exp| exp.saturating_duration_since(Instant::now())))
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>, KvError> {
        let prefix = pattern.trim_end_matches('*');
        let entries = self.entries.lock().await;
        Ok(entries.keys().filter(|k| k.starts_with(prefix)).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn generate_and_store_code_is_idempotent() {
        let kv = MemoryKvStore::new();
        let first = generate_and_store_code(&kv, "a@example.com").await.unwrap();
        let second = generate_and_store_code(&kv, "a@example.com").await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn verify_code_consumes_on_success() {
        let kv = MemoryKvStore::new();
        let code = generate_and_store_code(&kv, "a@example.com").await.unwrap();
        verify_code(&kv, "a@example.com", &code).await.unwrap();
        assert!(matches!(
            verify_code(&kv, "a@example.com", &code).await,
            Err(KvError::ValueExpired)
        ));
    }

    #[tokio::test]
    async fn verify_code_rejects_mismatch() {
        let kv = MemoryKvStore::new();
        let _code = generate_and_store_code(&kv, "a@example.com").await.unwrap();
        assert!(matches!(
            verify_code(&kv, "a@example.com", "WRONGC").await,
            Err(KvError::ValueMismatch)
        ));
    }
}

//! In-memory registry of live chat-server descriptors and the load-aware
//! selection algorithm.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug)]
pub struct ChatServerDescriptor {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub zone: String,
    pub max_connections: u32,
    pub current_load: AtomicU32,
    pub active: AtomicBool,
}

impl ChatServerDescriptor {
    pub fn load_ratio(&self) -> f64 {
        let load = self.current_load.load(Ordering::Acquire) as f64;
        let max = self.max_connections.max(1) as f64;
        load / max
    }
}

/// Single-process table of chat-server descriptors. No cluster-wide
/// consensus: this registry's view is authoritative only for the Status
/// process that owns it.
pub struct ChatServerRegistry {
    servers: RwLock<HashMap<String, Arc<ChatServerDescriptor>>>,
}

impl ChatServerRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            servers: RwLock::new(HashMap::new()),
        })
    }

    pub async fn upsert(
        &self,
        id: String,
        host: String,
        port: u16,
        zone: String,
        max_connections: u32,
        current_load: u32,
    ) {
        let mut servers = self.servers.write().await;
        match servers.get(&id) {
            Some(existing) => {
                existing.current_load.store(current_load, Ordering::Release);
                existing.active.store(true, Ordering::Release);
            }
            None => {
                servers.insert(
                    id.clone(),
                    Arc::new(ChatServerDescriptor {
                        id,
                        host,
                        port,
                        zone,
                        max_connections,
                        current_load: AtomicU32::new(current_load),
                        active: AtomicBool::new(true),
                    }),
                );
            }
        }
    }

    pub async fn mark_inactive(&self, id: &str) {
        if let Some(server) = self.servers.read().await.get(id) {
            server.active.store(false, Ordering::Release);
        }
    }

    pub async fn decrement_load(&self, id: &str) {
        if let Some(server) = self.servers.read().await.get(id) {
            let _ = server
                .current_load
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)));
        }
    }

    /// Discards servers at or over capacity, picks the lowest load ratio
    /// among the rest, tie-breaks by lexicographic id, and bumps the
    /// winner's `current_load` by one before returning it.
    pub async fn select_best(&self) -> Option<Arc<ChatServerDescriptor>> {
        let servers = self.servers.read().await;
        let best = servers
            .values()
            .filter(|s| s.active.load(Ordering::Acquire) && s.load_ratio() < 1.0)
            .min_by(|a, b| {
                a.load_ratio()
                    .partial_cmp(&b.load_ratio())
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.id.cmp(&b.id))
            })
            .cloned();

        if let Some(server) = &best {
            server.current_load.fetch_add(1, Ordering::AcqRel);
            debug!(id = %server.id, load = server.current_load.load(Ordering::Acquire), "selected chat server");
        }
        best
    }
}

impl Default for ChatServerRegistry {
    fn default() -> Self {
        Self {
            servers: RwLock::new(HashMap::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn select_best_picks_lowest_load_ratio() {
        let registry = ChatServerRegistry::new();
        registry.upsert("b".into(), "host".into(), 1, "zone-1".into(), 100, 50).await;
        registry.upsert("a".into(), "host".into(), 2, "zone-1".into(), 100, 10).await;

        let best = registry.select_best().await.unwrap();
        assert_eq!(best.id, "a");
    }

    #[tokio::test]
    async fn select_best_discards_full_servers() {
        let registry = ChatServerRegistry::new();
        registry.upsert("full".into(), "host".into(), 1, "zone-1".into(), 10, 10).await;
        assert!(registry.select_best().await.is_none());
    }

    #[tokio::test]
    async fn select_best_ties_break_lexicographically() {
        let registry = ChatServerRegistry::new();
        registry.upsert("zeta".into(), "host".into(), 1, "zone-1".into(), 100, 10).await;
        registry.upsert("alpha".into(), "host".into(), 2, "zone-1".into(), 100, 10).await;

        let best = registry.select_best().await.unwrap();
        assert_eq!(best.id, "alpha");
    }
}

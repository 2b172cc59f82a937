//! Periodic safety-net sweep of `token:*` entries. Not a correctness
//! dependency — TTL expiry already reclaims these keys; this only guards
//! against stray keys that were set without one.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::kv::KvStore;

pub fn spawn(kv: Arc<dyn KvStore>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            match kv.scan("token:*").await {
                Ok(keys) => {
                    let mut swept = 0;
                    for key in keys {
                        if matches!(kv.ttl(&key).await, Ok(None)) {
                            if kv.del(&key).await.is_ok() {
                                swept += 1;
                            }
                        }
                    }
                    if swept > 0 {
                        debug!(swept, "token cleanup swept entries with no ttl");
                    }
                }
                Err(e) => warn!(err = %e, "token cleanup scan failed"),
            }
        }
    });
}

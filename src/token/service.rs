//! Issues and validates JWT bearer tokens scoped to `(user_uuid,
//! device_id)`, and picks a chat server for newly-authenticated sessions.

use std::sync::Arc;

use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use uuid::Uuid;

use crate::kv::KvStore;
use crate::token::claims::Claims;
use crate::token::registry::{ChatServerDescriptor, ChatServerRegistry};

pub struct TokenService {
    kv: Arc<dyn KvStore>,
    registry: Arc<ChatServerRegistry>,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    ttl_secs: i64,
}

pub struct IssuedToken {
    pub token: String,
    pub expires_at: i64,
    pub chat_server: Arc<ChatServerDescriptor>,
}

impl TokenService {
    pub fn new(secret: &str, kv: Arc<dyn KvStore>, registry: Arc<ChatServerRegistry>, ttl_secs: i64) -> Self {
        Self {
            kv,
            registry,
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            ttl_secs,
        }
    }

    /// Signs a fresh claim set, records it in the KV store as the
    /// authority for "is this token still active", and selects a chat
    /// server for the caller to connect to. Returns `None` if no chat
    /// server currently has spare capacity.
    pub async fn generate_token(&self, user_uuid: Uuid, device_id: &str) -> anyhow::Result<Option<IssuedToken>> {
        let Some(chat_server) = self.registry.select_best().await else {
            return Ok(None);
        };

        let claims = Claims::new(user_uuid, device_id.to_string(), self.ttl_secs);
        let token = encode(&Header::default(), &claims, &self.encoding_key)?;

        self.kv
            .set(
                &format!("token:{token}"),
                &user_uuid.to_string(),
                std::time::Duration::from_secs(self.ttl_secs.max(0) as u64),
            )
            .await?;

        Ok(Some(IssuedToken {
            token,
            expires_at: claims.exp,
            chat_server,
        }))
    }

    /// Verifies signature and expiry, then checks the KV record exists and
    /// agrees with both the claimed `user_uuid` and `device_id`. Returns
    /// `None` on any mismatch — never distinguishes the reason to the
    /// caller, matching the single tagged-failure contract other RPCs use.
    pub async fn validate_token(&self, token: &str, device_id: &str) -> anyhow::Result<Option<Uuid>> {
        let validation = Validation::default();
        let decoded = match decode::<Claims>(token, &self.decoding_key, &validation) {
            Ok(d) => d.claims,
            Err(_) => return Ok(None),
        };

        if decoded.dev != device_id {
            return Ok(None);
        }

        let stored = self.kv.get(&format!("token:{token}")).await?;
        match stored {
            Some(stored_uuid) if stored_uuid == decoded.sub.to_string() => Ok(Some(decoded.sub)),
            _ => Ok(None),
        }
    }

    pub async fn revoke_token(&self, token: &str) -> anyhow::Result<()> {
        self.kv.del(&format!("token:{token}")).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKvStore;

    async fn service_with_one_server() -> TokenService {
        let registry = ChatServerRegistry::new();
        registry.upsert("chat-1".into(), "127.0.0.1".into(), 7070, "zone-1".into(), 100, 0).await;
        TokenService::new("test-secret", Arc::new(MemoryKvStore::new()), registry, 3600)
    }

    #[tokio::test]
    async fn generate_then_validate_round_trips() {
        let service = service_with_one_server().await;
        let user = Uuid::new_v4();
        let issued = service.generate_token(user, "device-1").await.unwrap().unwrap();

        let validated = service.validate_token(&issued.token, "device-1").await.unwrap();
        assert_eq!(validated, Some(user));
    }

    #[tokio::test]
    async fn validate_rejects_wrong_device() {
        let service = service_with_one_server().await;
        let user = Uuid::new_v4();
        let issued = service.generate_token(user, "device-1").await.unwrap().unwrap();

        let validated = service.validate_token(&issued.token, "device-2").await.unwrap();
        assert_eq!(validated, None);
    }

    #[tokio::test]
    async fn validate_rejects_revoked_token() {
        let service = service_with_one_server().await;
        let user = Uuid::new_v4();
        let issued = service.generate_token(user, "device-1").await.unwrap().unwrap();

        service.revoke_token(&issued.token).await.unwrap();
        let validated = service.validate_token(&issued.token, "device-1").await.unwrap();
        assert_eq!(validated, None);
    }

    #[tokio::test]
    async fn generate_token_returns_none_when_no_capacity() {
        let registry = ChatServerRegistry::new();
        registry.upsert("chat-1".into(), "127.0.0.1".into(), 7070, "zone-1".into(), 1, 1).await;
        let service = TokenService::new("test-secret", Arc::new(MemoryKvStore::new()), registry, 3600);

        let issued = service.generate_token(Uuid::new_v4(), "device-1").await.unwrap();
        assert!(issued.is_none());
    }
}

//! RPC clients to the Status/Token service, and the generic stub pool
//! they're built on.

pub mod stub_pool;

pub use stub_pool::StubPool;

pub mod proto {
    tonic::include_proto!("chatfabric.token");
}

use proto::authentication_service_client::AuthenticationServiceClient;
use proto::{
    GenerateTokenRequest, GenerateTokenResponse, ReportHeartbeatRequest, ReportSessionClosedRequest,
    ValidateTokenRequest,
};
use uuid::Uuid;

use crate::errors::RpcError;

/// Domain-level wrapper over a [`StubPool`] dialed to the Status/Token
/// service, exposing the calls the chat server and gateway actually need
/// instead of the raw generated client.
pub struct TokenStubPool {
    pool: StubPool,
}

impl TokenStubPool {
    pub async fn connect(endpoint: &str, count: usize) -> Result<Self, crate::errors::PoolError> {
        Ok(Self {
            pool: StubPool::connect(endpoint, count).await?,
        })
    }

    fn client(&self) -> AuthenticationServiceClient<tonic::transport::Channel> {
        AuthenticationServiceClient::new(self.pool.checkout())
    }

    pub async fn generate_token(
        &self,
        user_uuid: Uuid,
        device_id: &str,
    ) -> Result<GenerateTokenResponse, RpcError> {
        let req = GenerateTokenRequest {
            user_uuid: user_uuid.to_string(),
            device_id: device_id.to_string(),
        };
        let resp = self.client().generate_token(req).await?;
        Ok(resp.into_inner())
    }

    /// Returns `Some(user_uuid)` on success, `None` if the token was
    /// rejected (bad signature, expired, kv mismatch, device mismatch).
    pub async fn validate_token(&self, token: &str, device_id: &str) -> Result<Option<Uuid>, RpcError> {
        let req = ValidateTokenRequest {
            token: token.to_string(),
            device_id: device_id.to_string(),
        };
        let resp = self.client().validate_token(req).await?.into_inner();
        if !resp.success {
            return Ok(None);
        }
        match Uuid::parse_str(&resp.user_uuid) {
            Ok(uuid) => Ok(Some(uuid)),
            Err(_) => Ok(None),
        }
    }

    pub async fn report_session_closed(&self, server_id: &str, user_uuid: Uuid) -> Result<(), RpcError> {
        let req = ReportSessionClosedRequest {
            server_id: server_id.to_string(),
            user_uuid: user_uuid.to_string(),
        };
        self.client().report_session_closed(req).await?;
        Ok(())
    }

    pub async fn report_heartbeat(
        &self,
        server_id: &str,
        host: &str,
        port: u16,
        zone: &str,
        current_load: u32,
        max_connections: u32,
    ) -> Result<(), RpcError> {
        let req = ReportHeartbeatRequest {
            server_id: server_id.to_string(),
            host: host.to_string(),
            port: port as u32,
            current_load,
            max_connections,
            zone: zone.to_string(),
        };
        self.client().report_heartbeat(req).await?;
        Ok(())
    }
}

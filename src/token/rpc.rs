//! tonic service implementation backing the Status/Token RPC surface.

use std::sync::Arc;

use tonic::{Request, Response, Status};
use tracing::error;
use uuid::Uuid;

use crate::rpc::proto::authentication_service_server::AuthenticationService;
use crate::rpc::proto::{
    AuthenticateLoginRequest, AuthenticateLoginResponse, ChatServerInfo, GenerateTokenRequest,
    GenerateTokenResponse, ReportHeartbeatRequest, ReportHeartbeatResponse, ReportSessionClosedRequest,
    ReportSessionClosedResponse, ValidateTokenRequest, ValidateTokenResponse,
};
use crate::token::registry::ChatServerRegistry;
use crate::token::service::TokenService;

pub struct AuthenticationServiceImpl {
    token_service: Arc<TokenService>,
    registry: Arc<ChatServerRegistry>,
}

impl AuthenticationServiceImpl {
    pub fn new(token_service: Arc<TokenService>, registry: Arc<ChatServerRegistry>) -> Self {
        Self {
            token_service,
            registry,
        }
    }
}

#[tonic::async_trait]
impl AuthenticationService for AuthenticationServiceImpl {
    async fn generate_token(
        &self,
        request: Request<GenerateTokenRequest>,
    ) -> Result<Response<GenerateTokenResponse>, Status> {
        let req = request.into_inner();
        let user_uuid = Uuid::parse_str(&req.user_uuid).map_err(|_| Status::invalid_argument("bad user_uuid"))?;

        match self.token_service.generate_token(user_uuid, &req.device_id).await {
            Ok(Some(issued)) => Ok(Response::new(GenerateTokenResponse {
                success: true,
                token: issued.token,
                expires_at: issued.expires_at,
                chat_server: Some(ChatServerInfo {
                    id: issued.chat_server.id.clone(),
                    host: issued.chat_server.host.clone(),
                    port: issued.chat_server.port as u32,
                    zone: issued.chat_server.zone.clone(),
                }),
                error: String::new(),
            })),
            Ok(None) => Ok(Response::new(GenerateTokenResponse {
                success: false,
                token: String::new(),
                expires_at: 0,
                chat_server: None,
                error: "no chat server has spare capacity".to_string(),
            })),
            Err(e) => {
                error!(err = %e, "generate_token failed");
                Err(Status::internal(e.to_string()))
            }
        }
    }

    async fn validate_token(
        &self,
        request: Request<ValidateTokenRequest>,
    ) -> Result<Response<ValidateTokenResponse>, Status> {
        let req = request.into_inner();
        match self.token_service.validate_token(&req.token, &req.device_id).await {
            Ok(Some(user_uuid)) => Ok(Response::new(ValidateTokenResponse {
                success: true,
                user_uuid: user_uuid.to_string(),
                error: String::new(),
            })),
            Ok(None) => Ok(Response::new(ValidateTokenResponse {
                success: false,
                user_uuid: String::new(),
                error: "token invalid, expired, or revoked".to_string(),
            })),
            Err(e) => {
                error!(err = %e, "validate_token failed");
                Err(Status::internal(e.to_string()))
            }
        }
    }

    /// Kept for wire compatibility. The gateway is the single authority
    /// for password verification; this RPC is intentionally unimplemented.
    async fn authenticate_login(
        &self,
        _request: Request<AuthenticateLoginRequest>,
    ) -> Result<Response<AuthenticateLoginResponse>, Status> {
        Err(Status::unimplemented(
            "password verification is performed by the gateway, not the status service",
        ))
    }

    async fn report_session_closed(
        &self,
        request: Request<ReportSessionClosedRequest>,
    ) -> Result<Response<ReportSessionClosedResponse>, Status> {
        let req = request.into_inner();
        self.registry.decrement_load(&req.server_id).await;
        Ok(Response::new(ReportSessionClosedResponse { acknowledged: true }))
    }

    async fn report_heartbeat(
        &self,
        request: Request<ReportHeartbeatRequest>,
    ) -> Result<Response<ReportHeartbeatResponse>, Status> {
        let req = request.into_inner();
        let port = u16::try_from(req.port).map_err(|_| Status::invalid_argument("port out of range"))?;
        self.registry
            .upsert(req.server_id, req.host, port, req.zone, req.max_connections, req.current_load)
            .await;
        Ok(Response::new(ReportHeartbeatResponse { acknowledged: true }))
    }
}

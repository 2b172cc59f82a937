//! Stateless HTTP front door: verification codes, registration, login,
//! and password reset. Orchestrates `KvStore`, `db::UserMapper`, and the
//! Status service over the RPC stub pool; never persists any state of its
//! own.

pub mod handlers;

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::db::UserMapper;
use crate::kv::KvStore;
use crate::rpc::TokenStubPool;

pub struct GatewayState {
    pub users: UserMapper,
    pub kv: Arc<dyn KvStore>,
    pub token_stubs: Arc<TokenStubPool>,
}

#[derive(Debug)]
pub enum GatewayError {
    BadRequest(&'static str),
    Unauthorized(&'static str),
    Forbidden(&'static str),
    Conflict(&'static str),
    ServiceUnavailable(&'static str),
    Internal(String),
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            GatewayError::BadRequest(m) => (StatusCode::BAD_REQUEST, *m),
            GatewayError::Unauthorized(m) => (StatusCode::UNAUTHORIZED, *m),
            GatewayError::Forbidden(m) => (StatusCode::FORBIDDEN, *m),
            GatewayError::Conflict(m) => (StatusCode::CONFLICT, *m),
            GatewayError::ServiceUnavailable(m) => (StatusCode::SERVICE_UNAVAILABLE, *m),
            GatewayError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal error"),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

pub type GatewayResult = Result<Json<Value>, GatewayError>;

pub fn build_router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/get_verify_code", post(handlers::get_verify_code))
        .route("/register_user", post(handlers::register_user))
        .route("/login_user", post(handlers::login_user))
        .route("/authenticate_reset_pwd", post(handlers::authenticate_reset_pwd))
        .route("/reset_password", post(handlers::reset_password))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

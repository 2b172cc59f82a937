use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use tracing::{error, warn};

use crate::errors::KvError;
use crate::gateway::{GatewayError, GatewayResult, GatewayState};
use crate::kv;

/// Every Gateway request body is wrapped in this envelope (§6): a
/// `request_service_type` tag the client sets to say what it thinks it's
/// asking for, and the actual payload nested under `data`. The literal
/// end-to-end scenarios spell the tag `service_type` instead of
/// `request_service_type` — accept either name rather than pick a fight
/// between the table and the prose.
#[derive(Deserialize)]
pub struct Envelope<T> {
    #[serde(alias = "service_type", default)]
    #[allow(dead_code)]
    request_service_type: Option<String>,
    data: T,
}

#[derive(Deserialize)]
pub struct GetVerifyCodeData {
    email: String,
    #[serde(default)]
    #[allow(dead_code)]
    verify_type: Option<String>,
}

pub async fn get_verify_code(
    State(state): State<Arc<GatewayState>>,
    Json(req): Json<Envelope<GetVerifyCodeData>>,
) -> GatewayResult {
    let data = req.data;
    if data.email.is_empty() {
        return Err(GatewayError::BadRequest("missing email"));
    }
    let code = kv::generate_and_store_code(state.kv.as_ref(), &data.email)
        .await
        .map_err(map_kv_error)?;
    Ok(Json(json!({ "response_status_code": 200, "data": { "verify_code": code } })))
}

#[derive(Deserialize)]
pub struct RegisterUserData {
    username: String,
    email: String,
    hashed_password: String,
    verify_code: String,
}

pub async fn register_user(
    State(state): State<Arc<GatewayState>>,
    Json(req): Json<Envelope<RegisterUserData>>,
) -> GatewayResult {
    let data = req.data;
    if data.username.is_empty() || data.email.is_empty() || data.hashed_password.is_empty() {
        return Err(GatewayError::BadRequest("missing required fields"));
    }
    if data.username.len() > 30 || data.email.len() > 320 {
        return Err(GatewayError::BadRequest("field too long"));
    }

    kv::verify_code(state.kv.as_ref(), &data.email, &data.verify_code)
        .await
        .map_err(map_kv_error)?;

    if state
        .users
        .find_by_username(&data.username)
        .await
        .map_err(internal)?
        .is_some()
        || state.users.find_by_email(&data.email).await.map_err(internal)?.is_some()
    {
        return Err(GatewayError::Conflict("username or email already registered"));
    }

    let digest = bcrypt::hash(&data.hashed_password, bcrypt::DEFAULT_COST).map_err(|e| internal(e))?;

    state
        .users
        .create(&data.username, &data.email, &digest)
        .await
        .map_err(|e| match e {
            crate::errors::PersistenceError::DataAlreadyExist => GatewayError::Conflict("username or email already registered"),
            other => internal(other),
        })?;

    Ok(Json(json!({ "response_status_code": 200 })))
}

#[derive(Deserialize)]
pub struct LoginUserData {
    username: String,
    hashed_password: String,
    client_device_id: String,
}

pub async fn login_user(
    State(state): State<Arc<GatewayState>>,
    Json(req): Json<Envelope<LoginUserData>>,
) -> GatewayResult {
    let data = req.data;
    if data.username.is_empty() || data.hashed_password.is_empty() || data.client_device_id.is_empty() {
        return Err(GatewayError::BadRequest("missing required fields"));
    }

    let user = state
        .users
        .find_by_username(&data.username)
        .await
        .map_err(internal)?
        .ok_or(GatewayError::Unauthorized("invalid username or password"))?;

    let matches = bcrypt::verify(&data.hashed_password, &user.password_digest).map_err(|e| internal(e))?;
    if !matches {
        return Err(GatewayError::Unauthorized("invalid username or password"));
    }

    let user_uuid = uuid::Uuid::parse_str(&user.uuid).map_err(internal)?;
    let resp = state
        .token_stubs
        .generate_token(user_uuid, &data.client_device_id)
        .await
        .map_err(|e| {
            error!(err = %e, "status service unavailable during login");
            GatewayError::ServiceUnavailable("authentication service unavailable")
        })?;

    if !resp.success {
        return Err(GatewayError::ServiceUnavailable("no chat server has spare capacity"));
    }
    let chat_server = resp.chat_server.ok_or(GatewayError::Internal("missing chat server info".into()))?;

    Ok(Json(json!({
        "response_status_code": 200,
        "data": {
            "user_uuid": user.uuid,
            "token": resp.token,
            "expires_at": resp.expires_at,
            "chat_server_host": chat_server.host,
            "chat_server_port": chat_server.port,
            "chat_server_id": chat_server.id,
            "chat_server_zone": chat_server.zone,
        }
    })))
}

#[derive(Deserialize)]
pub struct AuthenticateResetPwdData {
    email: String,
    verify_code: String,
}

pub async fn authenticate_reset_pwd(
    State(state): State<Arc<GatewayState>>,
    Json(req): Json<Envelope<AuthenticateResetPwdData>>,
) -> GatewayResult {
    let data = req.data;
    kv::verify_code(state.kv.as_ref(), &data.email, &data.verify_code)
        .await
        .map_err(map_kv_error)?;
    Ok(Json(json!({ "response_status_code": 200 })))
}

#[derive(Deserialize)]
pub struct ResetPasswordData {
    email: String,
    hashed_password: String,
}

pub async fn reset_password(
    State(state): State<Arc<GatewayState>>,
    Json(req): Json<Envelope<ResetPasswordData>>,
) -> GatewayResult {
    let data = req.data;
    if data.hashed_password.is_empty() {
        return Err(GatewayError::BadRequest("missing hashed_password"));
    }
    let user = state
        .users
        .find_by_email(&data.email)
        .await
        .map_err(internal)?
        .ok_or(GatewayError::Conflict("no account for this email"))?;

    let digest = bcrypt::hash(&data.hashed_password, bcrypt::DEFAULT_COST).map_err(|e| internal(e))?;
    let user_uuid = uuid::Uuid::parse_str(&user.uuid).map_err(internal)?;
    state.users.update_password(user_uuid, &digest).await.map_err(internal)?;

    Ok(Json(json!({ "response_status_code": 200 })))
}

fn map_kv_error(e: KvError) -> GatewayError {
    match e {
        KvError::KeyNotFound | KvError::ValueExpired => GatewayError::Forbidden("verification code expired"),
        KvError::ValueMismatch => GatewayError::Unauthorized("verification code does not match"),
        KvError::OperationFailed(m) | KvError::ConnectionFailed(m) => {
            warn!(err = %m, "kv store operation failed");
            GatewayError::ServiceUnavailable("verification service unavailable")
        }
    }
}

fn internal<E: std::fmt::Display>(e: E) -> GatewayError {
    GatewayError::Internal(e.to_string())
}

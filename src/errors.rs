//! Typed error kinds for every subsystem boundary.
//!
//! Leaf errors are `thiserror` enums; callers that only need to propagate
//! (handlers, `main.rs`) work in terms of `anyhow::Error`, which every
//! variant here converts into via `#[from]` at the call site.

use thiserror::Error;

/// Errors raised while parsing or validating the chat wire protocol.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid message header")]
    InvalidHeader,
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u16),
    #[error("body length {0} exceeds maximum of {1} bytes")]
    BodyTooLarge(u32, u32),
    #[error("unknown frame type {0}")]
    UnknownFrameType(u16),
    #[error("malformed JSON body: {0}")]
    BadJson(#[from] serde_json::Error),
    #[error("missing required field: {0}")]
    MissingField(&'static str),
}

/// Errors raised while authenticating a session or an RPC caller.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing credentials")]
    MissingCredentials,
    #[error("token signature or expiry invalid")]
    InvalidToken,
    #[error("token record not found or mismatched")]
    KvMismatch,
    #[error("device id does not match the token's claim")]
    DeviceMismatch,
    #[error("rpc call to status service failed: {0}")]
    Rpc(#[from] RpcError),
}

/// Errors that terminate a session's lifecycle.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("authentication was not completed within the timeout")]
    AuthTimeout,
    #[error("no heartbeat was received within the timeout")]
    HeartbeatTimeout,
    #[error("peer reset the connection")]
    PeerReset,
    #[error("write error: {0}")]
    Write(#[source] std::io::Error),
    #[error("write queue is full — message dropped")]
    WriteQueueFull,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Errors raised by the MySQL-backed persistence layer.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("duplicate entry")]
    DataAlreadyExist,
    #[error("row not found")]
    NotFound,
    #[error("connection broken: {0}")]
    ConnectionBroken(String),
    #[error("transaction aborted: {0}")]
    TransactionAborted(String),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Errors raised by the KvStore facade.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KvError {
    #[error("key not found")]
    KeyNotFound,
    #[error("value expired")]
    ValueExpired,
    #[error("value mismatch")]
    ValueMismatch,
    #[error("operation failed: {0}")]
    OperationFailed(String),
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
}

/// Errors raised by RPC stub calls (Status service, etc.).
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("service unavailable")]
    Unavailable,
    #[error("deadline exceeded")]
    DeadlineExceeded,
    #[error("internal error: {0}")]
    Internal(String),
}

/// Errors raised by connection pools (DbPool, RpcStubPool, WorkerPool).
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("timed out waiting for a free connection")]
    WaitTimeout,
    #[error("pool is shutting down")]
    Shutdown,
    #[error("failed to create a new connection: {0}")]
    CreateConnectionFailed(String),
}

impl From<tonic::Status> for RpcError {
    fn from(status: tonic::Status) -> Self {
        use tonic::Code;
        match status.code() {
            Code::Unavailable => RpcError::Unavailable,
            Code::DeadlineExceeded => RpcError::DeadlineExceeded,
            _ => RpcError::Internal(status.message().to_string()),
        }
    }
}

//! The Status/Token service: JWT issuance and validation, chat-server
//! registry + selection, a background cleanup sweep, and the RPC front
//! end that exposes all of it.

pub mod claims;
pub mod cleanup;
pub mod registry;
pub mod rpc;
pub mod service;

pub use registry::{ChatServerDescriptor, ChatServerRegistry};
pub use rpc::AuthenticationServiceImpl;
pub use service::TokenService;

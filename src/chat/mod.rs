//! The chat server: framed wire protocol, per-connection session FSM, and
//! the TCP acceptor + session registry.

pub mod protocol;
pub mod server;
pub mod session;

pub use server::ChatServer;
pub use session::{Session, SessionState};

//! MySQL-backed persistence: connection pool, query-condition tree, and
//! the typed entity mapper built on top of them.

pub mod condition;
pub mod mapper;
pub mod pool;
pub mod user;

pub use condition::Condition;
pub use mapper::Mapper;
pub use pool::DbPool;
pub use user::{User, UserMapper};

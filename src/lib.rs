// Library exports for sqlfe-server
// The binary and the integration tests both build on these modules.

pub mod cache;
pub mod config;
pub mod error;
pub mod expression;
pub mod mysql;
pub mod query;

// Re-export commonly used types
pub use config::Config;
pub use error::{FrontendError, Result};
pub use mysql::MysqlServer;
pub use query::{PrivilegeManager, QueryExecutor, Session};

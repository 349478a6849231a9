//! Database layer for dedup

mod account_repository;
mod connection;
mod connection_repository;
mod group_repository;
mod migrations;
mod run_repository;

pub use account_repository::{AccountRepository, LibSqlAccountRepository};
pub use connection::Database;
pub use connection_repository::{ConnectionRepository, LibSqlConnectionRepository};
pub use group_repository::{GroupRepository, LibSqlGroupRepository, NewAuditEntry};
pub use run_repository::{LibSqlRunRepository, RunRepository};

//! Persistence layer: messages, processing tasks, migrations.

pub mod libsql_store;
pub mod migrations;
pub mod traits;

pub use libsql_store::LibSqlStore;
pub use traits::{TaskCounts, TaskStore};

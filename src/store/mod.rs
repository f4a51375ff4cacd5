//! Persistence layer: libSQL-backed storage for the TimeCamp mirror, the
//! threshold ledger and notification routing.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::Database;

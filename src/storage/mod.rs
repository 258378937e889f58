//! SQLite storage layer.
//!
//! - [`schema`] - table/index/FTS definitions, applied idempotently
//! - [`sqlite`] - the [`SqliteStorage`] backend with all CRUD and search ops

pub mod schema;
pub mod sqlite;

pub use sqlite::{NewObservation, SqliteStorage, StoreStats};

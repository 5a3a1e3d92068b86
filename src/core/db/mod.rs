/// Database Module
///
/// This module provides the core database functionality for tenantdb,
/// organized into focused submodules.
///
/// ## Architecture
///
/// - **Driver** (`driver.rs`): the blocking seam to one physical link
/// - **SQLite** (`sqlite.rs`): the bundled `rusqlite` driver
/// - **Connection Management** (`connection.rs`): connect, liveness, bounded reconnect
/// - **Query Results** (`query.rs`): values, rows and result shapes
/// - **Schema Metadata** (`schema.rs`): cached per-table charset and column lengths
pub mod connection;
pub mod driver;
pub mod query;
pub mod schema;
pub mod sqlite;

pub use connection::*;
pub use driver::*;
pub use query::*;
pub use schema::*;
pub use sqlite::SqliteDriver;

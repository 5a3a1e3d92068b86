// Core infrastructure modules
pub mod core;

// Feature-specific modules
pub mod config;
pub mod database;
pub mod placeholder;
pub mod prefix;
pub mod reporter;
pub mod sanitize;
pub mod sql;
pub mod storage;

#[cfg(test)]
pub mod test_utils;

#[cfg(test)]
mod integration_tests;

pub use crate::config::{load_config, DbConfig};
pub use crate::core::db::{Driver, Output, QueryResult, QueryStatus, SchemaCharsetCache, SqliteDriver, Value};
pub use crate::core::{DbError, ErrorKind, PrepareError, Result};
pub use crate::database::Database;
pub use crate::placeholder::{Arg, Format, PlaceholderCompiler, Prepared};
pub use crate::prefix::{TablePrefixResolver, TableScope};

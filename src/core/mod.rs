/// Core Module for tenantdb
///
/// This module contains the fundamental components shared by the rest of the
/// crate: the error taxonomy and the database layer (driver seam, connection
/// management, result types and schema metadata).

pub mod db;
pub mod error;

// Re-export commonly used types for convenience
pub use error::{DbError, ErrorKind, PrepareError, Result};

/// tenantdb Error Module
///
/// This module defines the error taxonomy shared by every layer of the crate.
/// Connection-level transient errors are retried internally; everything else
/// reaches the caller as a typed `Err`.
use thiserror::Error;

/// Errors produced while compiling a placeholder template.
///
/// These never reach the driver: a template that fails to compile is
/// reported to the caller and nothing is executed.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PrepareError {
    /// Too few arguments for the placeholders and no numbered placeholder
    /// covers the gap.
    #[error(
        "The query does not contain the correct number of placeholders ({placeholders}) for the number of arguments passed ({arguments})"
    )]
    ArgumentCountMismatch { placeholders: usize, arguments: usize },

    /// A single list argument was passed to a template with exactly one
    /// placeholder, but the list did not hold exactly one value.
    #[error("The query only expected one placeholder, but a list of {0} arguments was sent")]
    AmbiguousArity(usize),

    /// The same positional argument was used as an identifier and as a value.
    #[error(
        "Arguments cannot be prepared as both an Identifier and Value. Found the following conflicts: {}",
        conflicts.join(", ")
    )]
    DualRoleConflict { conflicts: Vec<String> },

    /// The template contains no `%` at all.
    #[error("The query argument must have a placeholder")]
    MissingPlaceholder,
}

/// Comprehensive error type for database access.
#[derive(Error, Debug)]
pub enum DbError {
    /// The link to the server dropped and could not be re-established
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// Credentials were refused; never retried
    #[error("Authentication failure: {0}")]
    AuthenticationFailure(String),

    /// A placeholder template could not be compiled
    #[error("Prepare error: {0}")]
    Prepare(#[from] PrepareError),

    /// Column or table charset metadata could not be resolved
    #[error("Charset resolution error for table {table}: {message}")]
    CharsetResolution { table: String, message: String },

    /// The server rejected a statement
    #[error("Query error: {message} [query: {query}]")]
    QueryExecution { message: String, query: String },

    /// Values (or a whole query) would be altered by text sanitizing
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// Table prefix contains characters outside `[A-Za-z0-9_]`
    #[error("Invalid database prefix: {0}")]
    InvalidPrefix(String),

    /// No usable connection
    #[error("Database not ready: {0}")]
    NotReady(String),

    /// Configuration loading and validation errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A setup failure recorded by the error reporter in non-fatal mode.
    /// `cause` is the kind of the failure that triggered it.
    #[error("{message} ({code})")]
    Bailed {
        code: String,
        message: String,
        cause: ErrorKind,
    },

    /// File system and I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Errors from the local query-log store
    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),
}

/// Coarse classification of a `DbError`, kept on error records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ConnectionLost,
    AuthenticationFailure,
    Prepare,
    CharsetResolution,
    QueryExecution,
    InvalidData,
    InvalidPrefix,
    NotReady,
    Config,
    Setup,
    Io,
}

impl DbError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DbError::ConnectionLost(_) => ErrorKind::ConnectionLost,
            DbError::AuthenticationFailure(_) => ErrorKind::AuthenticationFailure,
            DbError::Prepare(_) => ErrorKind::Prepare,
            DbError::CharsetResolution { .. } => ErrorKind::CharsetResolution,
            DbError::QueryExecution { .. } => ErrorKind::QueryExecution,
            DbError::InvalidData(_) => ErrorKind::InvalidData,
            DbError::InvalidPrefix(_) => ErrorKind::InvalidPrefix,
            DbError::NotReady(_) => ErrorKind::NotReady,
            DbError::Config(_) => ErrorKind::Config,
            DbError::Bailed { .. } => ErrorKind::Setup,
            DbError::Io(_) | DbError::Storage(_) => ErrorKind::Io,
        }
    }

    /// The kind behind the error; for `Bailed` the failure that was bailed on.
    pub fn cause(&self) -> ErrorKind {
        match self {
            DbError::Bailed { cause, .. } => *cause,
            other => other.kind(),
        }
    }

    /// Whether the error is worth a reconnect attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, DbError::ConnectionLost(_))
    }
}

/// Type alias for Result to use DbError as the error type.
pub type Result<T> = std::result::Result<T, DbError>;

/// Error Reporter
///
/// Central sink for failures. Per-query errors are logged and kept as the
/// last error; setup failures go through [`ErrorReporter::bail`], which
/// terminates the process in fatal mode and records a structured error
/// otherwise.

use crate::core::db::DriverError;
use crate::core::{DbError, ErrorKind};
use std::fmt;
use std::panic::Location;
use std::sync::Arc;
use tracing::error;

/// Called by `bail` in fatal mode. The default logs and exits with status 1.
pub type Terminator = Arc<dyn Fn(&ErrorRecord) + Send + Sync>;

/// One reported failure.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub message: String,
    /// Statement that failed, if any
    pub query: Option<String>,
    /// `file:line` of the public call that led here
    pub caller: String,
    /// Setup failure code such as `db_connect_fail`
    pub code: Option<String>,
}

impl ErrorRecord {
    pub fn new(kind: ErrorKind, message: impl Into<String>, query: Option<String>, caller: &Location<'_>) -> Self {
        ErrorRecord {
            kind,
            message: message.into(),
            query,
            caller: format!("{}:{}", caller.file(), caller.line()),
            code: None,
        }
    }

    /// Builds a record from an error, pulling the query text out of
    /// execution errors.
    pub fn from_error(err: &DbError, caller: &Location<'_>) -> Self {
        let query = match err {
            DbError::QueryExecution { query, .. } => Some(query.clone()),
            _ => None,
        };
        let message = match err {
            DbError::QueryExecution { message, .. } => message.clone(),
            other => other.to_string(),
        };
        ErrorRecord::new(err.kind(), message, query, caller)
    }
}

impl fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Database error {}", self.message)?;
        if let Some(query) = &self.query {
            write!(f, " for query {}", query)?;
        }
        write!(f, " made by {}", self.caller)
    }
}

fn default_terminator() -> Terminator {
    Arc::new(|record: &ErrorRecord| {
        error!(code = ?record.code, "{}", record);
        eprintln!("{}", record);
        std::process::exit(1);
    })
}

/// Fatal vs. recoverable error signaling.
#[derive(Clone)]
pub struct ErrorReporter {
    show_errors: bool,
    suppress_errors: bool,
    last_error: Option<ErrorRecord>,
    errors: Vec<ErrorRecord>,
    terminator: Terminator,
}

impl fmt::Debug for ErrorReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorReporter")
            .field("show_errors", &self.show_errors)
            .field("suppress_errors", &self.suppress_errors)
            .field("last_error", &self.last_error)
            .field("errors", &self.errors.len())
            .finish()
    }
}

impl Default for ErrorReporter {
    fn default() -> Self {
        ErrorReporter::new(false, false)
    }
}

impl ErrorReporter {
    /// `fatal` makes `bail` terminate; `suppress` silences `print_error`.
    pub fn new(fatal: bool, suppress: bool) -> Self {
        ErrorReporter {
            show_errors: fatal,
            suppress_errors: suppress,
            last_error: None,
            errors: Vec::new(),
            terminator: default_terminator(),
        }
    }

    pub fn with_terminator(mut self, terminator: Terminator) -> Self {
        self.terminator = terminator;
        self
    }

    pub fn set_terminator(&mut self, terminator: Terminator) {
        self.terminator = terminator;
    }

    /// Enables fatal mode. Returns the previous setting.
    pub fn show_errors(&mut self, show: bool) -> bool {
        std::mem::replace(&mut self.show_errors, show)
    }

    pub fn hide_errors(&mut self) -> bool {
        self.show_errors(false)
    }

    pub fn is_fatal(&self) -> bool {
        self.show_errors
    }

    /// Silences `print_error`. Returns the previous setting.
    pub fn suppress_errors(&mut self, suppress: bool) -> bool {
        std::mem::replace(&mut self.suppress_errors, suppress)
    }

    pub fn last_error(&self) -> Option<&ErrorRecord> {
        self.last_error.as_ref()
    }

    /// Every error printed since construction (suppressed ones included).
    pub fn errors(&self) -> &[ErrorRecord] {
        &self.errors
    }

    pub fn clear_last_error(&mut self) {
        self.last_error = None;
    }

    /// Records a per-query failure and logs it unless suppressed.
    pub fn print_error(&mut self, record: ErrorRecord) {
        self.errors.push(record.clone());
        if !self.suppress_errors {
            error!(kind = ?record.kind, "{}", record);
        }
        self.last_error = Some(record);
    }

    /// Setup failure. In fatal mode the terminator runs; otherwise the
    /// failure is recorded and returned as `DbError::Bailed`.
    #[track_caller]
    pub fn bail(
        &mut self,
        message: &str,
        code: &str,
        cause: ErrorKind,
        driver_error: Option<&DriverError>,
    ) -> DbError {
        let message = match driver_error {
            Some(err) => format!("{}: {}", err, message),
            None => message.to_string(),
        };
        let mut record = ErrorRecord::new(ErrorKind::Setup, message.clone(), None, Location::caller());
        record.code = Some(code.to_string());

        if self.show_errors {
            (self.terminator)(&record);
        }
        self.last_error = Some(record);
        DbError::Bailed {
            code: code.to_string(),
            message,
            cause,
        }
    }
}

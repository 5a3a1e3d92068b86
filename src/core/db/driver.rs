/// Driver Module
///
/// The blocking seam between the connection manager and one physical link.
/// Everything the core needs from a server goes through `Driver`; the
/// defaults speak MySQL and engines without those statements override them.

use super::query::Value;
use crate::sql::{quote_qualified_identifier, EscapeStyle};
use thiserror::Error;

/// MySQL client error: server has gone away
pub const CR_SERVER_GONE_ERROR: u32 = 2006;
/// MySQL client error: lost connection during query
pub const CR_SERVER_LOST: u32 = 2013;

/// How a driver failure should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverErrorKind {
    /// The link dropped; a reconnect may help
    ConnectionLost,
    /// Credentials were refused; a reconnect will not help
    Authentication,
    /// The server rejected the statement
    Server,
}

impl DriverErrorKind {
    /// Classifies a MySQL error number.
    pub fn from_mysql_code(code: u32) -> Self {
        match code {
            2002 | 2003 | 2006 | 2013 | 2055 => DriverErrorKind::ConnectionLost,
            1044 | 1045 | 1698 => DriverErrorKind::Authentication,
            _ => DriverErrorKind::Server,
        }
    }
}

/// An error reported by a driver.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{message}")]
pub struct DriverError {
    pub kind: DriverErrorKind,
    pub code: Option<u32>,
    pub message: String,
}

impl DriverError {
    pub fn new(kind: DriverErrorKind, code: Option<u32>, message: impl Into<String>) -> Self {
        DriverError {
            kind,
            code,
            message: message.into(),
        }
    }

    /// Builds an error from a MySQL error number and message.
    pub fn mysql(code: u32, message: impl Into<String>) -> Self {
        Self::new(DriverErrorKind::from_mysql_code(code), Some(code), message)
    }

    pub fn gone_away() -> Self {
        Self::mysql(CR_SERVER_GONE_ERROR, "MySQL server has gone away")
    }

    pub fn server(message: impl Into<String>) -> Self {
        Self::new(DriverErrorKind::Server, None, message)
    }

    pub fn is_connection_lost(&self) -> bool {
        self.kind == DriverErrorKind::ConnectionLost
    }
}

pub type DriverResult<T> = std::result::Result<T, DriverError>;

/// SQL family spoken by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    MySql,
    Sqlite,
}

impl Dialect {
    /// Whether `SET NAMES` and `@@SESSION.sql_mode` exist.
    pub fn has_session_settings(self) -> bool {
        matches!(self, Dialect::MySql)
    }
}

/// Everything needed to open the link.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectParams {
    pub host: String,
    pub port: Option<u16>,
    pub socket: Option<String>,
    pub user: String,
    pub password: String,
    pub database: String,
}

/// Raw outcome of one statement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Execution {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    pub rows_affected: u64,
    pub insert_id: u64,
}

/// One column as reported by schema introspection.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDescriptor {
    pub field: String,
    pub column_type: String,
    pub collation: Option<String>,
}

/// A blocking link to one database server.
pub trait Driver: Send {
    fn connect(&mut self, params: &ConnectParams) -> DriverResult<()>;

    fn close(&mut self);

    fn is_open(&self) -> bool;

    /// Lightweight liveness probe.
    fn ping(&mut self) -> bool;

    fn execute(&mut self, sql: &str) -> DriverResult<Execution>;

    fn select_db(&mut self, name: &str) -> DriverResult<()>;

    /// Server version string, e.g. `8.0.36` or `5.5.5-10.11.6-MariaDB`.
    fn server_info(&self) -> Option<String>;

    fn dialect(&self) -> Dialect {
        Dialect::MySql
    }

    fn escape_style(&self) -> EscapeStyle {
        EscapeStyle::Backslash
    }

    /// Native client-charset switch. Returns `false` when unsupported.
    fn set_charset(&mut self, _charset: &str) -> DriverResult<bool> {
        Ok(false)
    }

    /// Charset the client library negotiated, if known.
    fn client_charset(&self) -> Option<String> {
        None
    }

    /// Columns of `table` with declared type and collation.
    fn describe_table(&mut self, table: &str) -> DriverResult<Vec<ColumnDescriptor>> {
        let execution = self.execute(&format!("SHOW FULL COLUMNS FROM {}", quote_qualified_identifier(table)))?;
        let position = |name: &str| {
            execution
                .columns
                .iter()
                .position(|c| c.eq_ignore_ascii_case(name))
        };
        let (Some(field), Some(column_type)) = (position("Field"), position("Type")) else {
            return Err(DriverError::server("SHOW FULL COLUMNS returned no Field/Type columns"));
        };
        let collation = position("Collation");

        let text = |row: &[Value], i: usize| -> Option<String> {
            row.get(i).filter(|v| !v.is_null()).map(|v| v.to_string())
        };
        Ok(execution
            .rows
            .iter()
            .map(|row| ColumnDescriptor {
                field: text(row, field).unwrap_or_default(),
                column_type: text(row, column_type).unwrap_or_default(),
                collation: collation.and_then(|i| text(row, i)).filter(|c| !c.is_empty()),
            })
            .collect())
    }
}

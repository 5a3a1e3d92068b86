/// SQLite Driver
///
/// A `Driver` over the bundled SQLite engine. The database "name" is a file
/// path or `:memory:`; host and credentials are ignored. SQLite has no
/// session charset or SQL mode, and table introspection goes through
/// `pragma_table_info`, which reports no collations.

use super::driver::{ColumnDescriptor, ConnectParams, Dialect, Driver, DriverError, DriverErrorKind, DriverResult, Execution};
use super::query::Value;
use crate::sql::EscapeStyle;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, ErrorCode};
use tracing::debug;

/// Driver for a local SQLite database.
#[derive(Debug, Default)]
pub struct SqliteDriver {
    conn: Option<Connection>,
    path: Option<String>,
}

impl SqliteDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Path of the open database, `:memory:` for in-memory ones.
    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    fn open(&mut self, path: &str) -> DriverResult<()> {
        let conn = if path.is_empty() || path == ":memory:" {
            Connection::open_in_memory()
        } else {
            Connection::open(path)
        }
        .map_err(map_error)?;
        debug!(path, "Opened SQLite database");
        self.conn = Some(conn);
        self.path = Some(if path.is_empty() { ":memory:" } else { path }.to_string());
        Ok(())
    }

    fn conn(&self) -> DriverResult<&Connection> {
        self.conn
            .as_ref()
            .ok_or_else(|| DriverError::new(DriverErrorKind::ConnectionLost, None, "database is closed"))
    }
}

/// Maps engine errors onto driver error kinds.
fn map_error(err: rusqlite::Error) -> DriverError {
    let code = match &err {
        rusqlite::Error::SqliteFailure(failure, _) => Some(failure.code),
        _ => None,
    };
    let kind = match code {
        Some(ErrorCode::CannotOpen) | Some(ErrorCode::SystemIoFailure) => DriverErrorKind::ConnectionLost,
        Some(ErrorCode::PermissionDenied) | Some(ErrorCode::AuthorizationForStatementDenied) => {
            DriverErrorKind::Authentication
        }
        _ => DriverErrorKind::Server,
    };
    DriverError::new(kind, None, err.to_string())
}

fn to_value(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Int(i),
        ValueRef::Real(f) => Value::Float(f),
        ValueRef::Text(t) => match std::str::from_utf8(t) {
            Ok(s) => Value::Text(s.to_string()),
            Err(_) => Value::Bytes(t.to_vec()),
        },
        ValueRef::Blob(b) => Value::Bytes(b.to_vec()),
    }
}

impl Driver for SqliteDriver {
    fn connect(&mut self, params: &ConnectParams) -> DriverResult<()> {
        self.open(&params.database)
    }

    fn close(&mut self) {
        self.conn = None;
    }

    fn is_open(&self) -> bool {
        self.conn.is_some()
    }

    fn ping(&mut self) -> bool {
        self.conn()
            .and_then(|c| c.query_row("SELECT 1", [], |r| r.get::<_, i64>(0)).map_err(map_error))
            .is_ok()
    }

    fn execute(&mut self, sql: &str) -> DriverResult<Execution> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql).map_err(map_error)?;

        if stmt.column_count() == 0 {
            let rows_affected = stmt.execute([]).map_err(map_error)?;
            return Ok(Execution {
                columns: Vec::new(),
                rows: Vec::new(),
                rows_affected: rows_affected as u64,
                insert_id: u64::try_from(conn.last_insert_rowid()).unwrap_or(0),
            });
        }

        let columns: Vec<String> = stmt.column_names().into_iter().map(str::to_string).collect();
        let width = columns.len();
        let mut rows = Vec::new();
        let mut cursor = stmt.query([]).map_err(map_error)?;
        while let Some(row) = cursor.next().map_err(map_error)? {
            let mut values = Vec::with_capacity(width);
            for i in 0..width {
                values.push(to_value(row.get_ref(i).map_err(map_error)?));
            }
            rows.push(values);
        }

        Ok(Execution {
            columns,
            rows,
            rows_affected: 0,
            insert_id: 0,
        })
    }

    fn select_db(&mut self, name: &str) -> DriverResult<()> {
        if self.path.as_deref() == Some(name) && self.conn.is_some() {
            return Ok(());
        }
        self.open(name)
    }

    fn server_info(&self) -> Option<String> {
        Some(rusqlite::version().to_string())
    }

    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn escape_style(&self) -> EscapeStyle {
        EscapeStyle::Standard
    }

    fn client_charset(&self) -> Option<String> {
        Some("utf8mb4".to_string())
    }

    fn describe_table(&mut self, table: &str) -> DriverResult<Vec<ColumnDescriptor>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT name, type FROM pragma_table_info(?1)")
            .map_err(map_error)?;
        let columns = stmt
            .query_map([table], |row| {
                Ok(ColumnDescriptor {
                    field: row.get(0)?,
                    column_type: row.get(1)?,
                    collation: None,
                })
            })
            .map_err(map_error)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(map_error)?;
        Ok(columns)
    }
}

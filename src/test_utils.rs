/// # Test Utilities Module
///
/// Scriptable driver, recording sleeper and terminator, and fixtures for
/// exercising `Database` without a live server.
///
/// This module provides:
/// - `MockDriver`: a MySQL-flavoured driver whose answers are scripted
/// - `RecordingSleeper`: counts reconnect delays instead of sleeping
/// - `recording_terminator`: captures fatal bails instead of exiting
/// - SQLite fixtures with a WordPress-like schema

use crate::config::DbConfig;
use crate::core::db::{
    ColumnDescriptor, ConnectParams, Driver, DriverError, DriverResult, Execution, Sleeper, Value,
};
use crate::core::Result;
use crate::database::Database;
use crate::reporter::{ErrorRecord, Terminator};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, Once, PoisonError};
use std::time::Duration;

/// Everything the mock driver knows and has seen.
#[derive(Debug)]
pub struct MockState {
    pub open: bool,
    /// Outcomes for successive `connect` calls; empty means success
    pub connect_results: VecDeque<DriverResult<()>>,
    /// Outcomes for successive `select_db` calls on an open link
    pub select_results: VecDeque<DriverResult<()>>,
    /// Outcomes for successive data statements; empty means an empty success
    pub responses: VecDeque<DriverResult<Execution>>,
    /// Every statement passed to `execute`
    pub executed: Vec<String>,
    /// Column definitions served to `SHOW FULL COLUMNS`
    pub tables: HashMap<String, Vec<ColumnDescriptor>>,
    pub server_info: String,
    pub sql_mode: String,
    pub connects: usize,
    pub selected: Vec<String>,
}

impl Default for MockState {
    fn default() -> Self {
        MockState {
            open: false,
            connect_results: VecDeque::new(),
            select_results: VecDeque::new(),
            responses: VecDeque::new(),
            executed: Vec::new(),
            tables: HashMap::new(),
            server_info: "8.0.36".to_string(),
            sql_mode: "ONLY_FULL_GROUP_BY,STRICT_TRANS_TABLES,NO_ENGINE_SUBSTITUTION".to_string(),
            connects: 0,
            selected: Vec::new(),
        }
    }
}

/// Shared handle to a mock driver's state, kept by the test.
#[derive(Debug, Clone, Default)]
pub struct MockHandle(Arc<Mutex<MockState>>);

impl MockHandle {
    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a table for introspection. Columns are
    /// `(field, type, collation)`.
    pub fn with_table(&self, name: &str, columns: &[(&str, &str, Option<&str>)]) -> &Self {
        let columns = columns
            .iter()
            .map(|(field, column_type, collation)| ColumnDescriptor {
                field: field.to_string(),
                column_type: column_type.to_string(),
                collation: collation.map(str::to_string),
            })
            .collect();
        self.state().tables.insert(name.to_ascii_lowercase(), columns);
        self
    }

    /// Queues the outcome of the next data statement.
    pub fn respond(&self, result: DriverResult<Execution>) -> &Self {
        self.state().responses.push_back(result);
        self
    }

    /// Queues a single-row result.
    pub fn respond_row(&self, columns: &[&str], row: Vec<Value>) -> &Self {
        self.respond(Ok(Execution {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows: vec![row],
            ..Execution::default()
        }))
    }

    /// Queues outcomes for the next `connect` calls.
    pub fn script_connects(&self, results: Vec<DriverResult<()>>) -> &Self {
        self.state().connect_results.extend(results);
        self
    }

    /// Queues outcomes for the next `select_db` calls.
    pub fn script_selects(&self, results: Vec<DriverResult<()>>) -> &Self {
        self.state().select_results.extend(results);
        self
    }

    /// Simulates the server dropping the link.
    pub fn drop_link(&self) {
        self.state().open = false;
    }

    pub fn executed(&self) -> Vec<String> {
        self.state().executed.clone()
    }

    /// Statements other than session setup and introspection.
    pub fn data_statements(&self) -> Vec<String> {
        self.executed()
            .into_iter()
            .filter(|sql| !is_session_statement(sql) && !sql.starts_with("SHOW FULL COLUMNS"))
            .collect()
    }

    pub fn last_statement(&self) -> Option<String> {
        self.data_statements().pop()
    }

    pub fn describe_count(&self, table: &str) -> usize {
        let needle = format!("SHOW FULL COLUMNS FROM `{}`", table);
        self.executed().iter().filter(|sql| **sql == needle).count()
    }
}

fn is_session_statement(sql: &str) -> bool {
    sql.starts_with("SET ") || sql.contains("@@SESSION.sql_mode")
}

/// A MySQL-flavoured driver backed by `MockState`.
#[derive(Debug, Clone, Default)]
pub struct MockDriver {
    handle: MockHandle,
}

impl MockDriver {
    pub fn new() -> (Self, MockHandle) {
        let handle = MockHandle::default();
        (MockDriver { handle: handle.clone() }, handle)
    }
}

impl Driver for MockDriver {
    fn connect(&mut self, _params: &ConnectParams) -> DriverResult<()> {
        let mut state = self.handle.state();
        state.connects += 1;
        let result = state.connect_results.pop_front().unwrap_or(Ok(()));
        state.open = result.is_ok();
        result
    }

    fn close(&mut self) {
        self.handle.state().open = false;
    }

    fn is_open(&self) -> bool {
        self.handle.state().open
    }

    fn ping(&mut self) -> bool {
        self.handle.state().open
    }

    fn execute(&mut self, sql: &str) -> DriverResult<Execution> {
        let mut state = self.handle.state();
        state.executed.push(sql.to_string());
        if !state.open {
            return Err(DriverError::gone_away());
        }

        if sql.contains("@@SESSION.sql_mode") {
            return Ok(Execution {
                columns: vec!["@@SESSION.sql_mode".to_string()],
                rows: vec![vec![Value::Text(state.sql_mode.clone())]],
                ..Execution::default()
            });
        }
        if sql.starts_with("SET ") {
            return Ok(Execution::default());
        }
        if let Some(table) = sql.strip_prefix("SHOW FULL COLUMNS FROM ") {
            let table = table.trim_matches('`').to_ascii_lowercase();
            return match state.tables.get(&table) {
                Some(columns) => Ok(Execution {
                    columns: vec!["Field".to_string(), "Type".to_string(), "Collation".to_string()],
                    rows: columns
                        .iter()
                        .map(|c| {
                            vec![
                                Value::Text(c.field.clone()),
                                Value::Text(c.column_type.clone()),
                                c.collation.clone().map(Value::Text).unwrap_or(Value::Null),
                            ]
                        })
                        .collect(),
                    ..Execution::default()
                }),
                None => Err(DriverError::mysql(1146, format!("Table '{}' doesn't exist", table))),
            };
        }

        state.responses.pop_front().unwrap_or_else(|| Ok(Execution::default()))
    }

    fn select_db(&mut self, name: &str) -> DriverResult<()> {
        let mut state = self.handle.state();
        if !state.open {
            return Err(DriverError::gone_away());
        }
        state.select_results.pop_front().unwrap_or(Ok(()))?;
        state.selected.push(name.to_string());
        Ok(())
    }

    fn server_info(&self) -> Option<String> {
        Some(self.handle.state().server_info.clone())
    }
}

/// Records reconnect delays.
#[derive(Debug, Clone, Default)]
pub struct RecordingSleeper(Arc<Mutex<Vec<Duration>>>);

impl RecordingSleeper {
    pub fn sleeps(&self) -> Vec<Duration> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).push(duration);
    }
}

/// A terminator that records instead of exiting.
pub fn recording_terminator() -> (Terminator, Arc<Mutex<Vec<ErrorRecord>>>) {
    let records = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&records);
    let terminator: Terminator = Arc::new(move |record: &ErrorRecord| {
        sink.lock().unwrap_or_else(PoisonError::into_inner).push(record.clone());
    });
    (terminator, records)
}

/// Routes `tracing` output through the test harness, once per process.
pub fn init_test_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .try_init();
    });
}

/// Config pointing at a mock server with fast retries.
pub fn mock_config() -> DbConfig {
    DbConfig {
        host: "db.internal:3306".to_string(),
        user: "wp".to_string(),
        password: "secret".to_string(),
        name: "wordpress".to_string(),
        reconnect_delay_ms: 10,
        ..DbConfig::default()
    }
}

/// A connected `Database` over a `MockDriver`, with `wp_posts` registered.
pub fn mock_database(config: DbConfig) -> Result<(Database, MockHandle, RecordingSleeper)> {
    init_test_logging();
    let (driver, handle) = MockDriver::new();
    handle.with_table(
        "wp_posts",
        &[
            ("ID", "bigint(20) unsigned", None),
            ("post_title", "text", Some("utf8mb4_unicode_ci")),
            ("post_name", "varchar(10)", Some("utf8mb4_unicode_ci")),
            ("post_parent", "bigint(20) unsigned", None),
        ],
    );
    let sleeper = RecordingSleeper::default();
    let mut db = Database::new(config, Box::new(driver))?.with_sleeper(Box::new(sleeper.clone()));
    db.connect()?;
    Ok((db, handle, sleeper))
}

/// An in-memory SQLite `Database` with a small WordPress-like schema.
pub fn sqlite_database(config: DbConfig) -> Result<Database> {
    init_test_logging();
    let mut db = Database::sqlite(DbConfig {
        name: ":memory:".to_string(),
        ..config
    })?;
    for ddl in [
        "CREATE TABLE wp_posts (
            ID INTEGER PRIMARY KEY AUTOINCREMENT,
            post_title TEXT NOT NULL DEFAULT '',
            post_name VARCHAR(200) NOT NULL DEFAULT '',
            post_parent INTEGER,
            menu_order INTEGER NOT NULL DEFAULT 0
        )",
        "CREATE TABLE wp_options (
            option_id INTEGER PRIMARY KEY AUTOINCREMENT,
            option_name VARCHAR(191) NOT NULL UNIQUE,
            option_value TEXT NOT NULL
        )",
        "CREATE TABLE wp_files (id INTEGER PRIMARY KEY, body BLOB)",
    ] {
        db.query(ddl)?;
    }
    Ok(db)
}

/// Asserts that a result is a specific `DbError` variant.
#[macro_export]
macro_rules! assert_db_error {
    ($result:expr, $variant:ident, $context:expr) => {
        match $result {
            Err($crate::core::DbError::$variant { .. }) => {}
            Ok(_) => panic!("Expected {} error but got Ok in {}", stringify!($variant), $context),
            Err(other) => panic!("Expected {} but got {:?} in {}", stringify!($variant), other, $context),
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::DbError;

    #[test]
    fn test_mock_serves_registered_tables() {
        let (mut driver, handle) = MockDriver::new();
        handle.with_table("t", &[("name", "varchar(20)", Some("latin1_swedish_ci"))]);
        driver.connect(&ConnectParams::default()).unwrap();

        let columns = driver.describe_table("t").unwrap();
        assert_eq!(columns.len(), 1);
        assert_eq!(columns[0].collation.as_deref(), Some("latin1_swedish_ci"));
        assert!(driver.describe_table("missing").is_err());
        assert_eq!(handle.describe_count("t"), 1);
    }

    #[test]
    fn test_mock_scripted_connects_and_drops() {
        let (mut driver, handle) = MockDriver::new();
        handle.script_connects(vec![Err(DriverError::mysql(2002, "Can't connect"))]);
        assert!(driver.connect(&ConnectParams::default()).is_err());
        assert!(driver.connect(&ConnectParams::default()).is_ok());
        assert_eq!(handle.state().connects, 2);

        handle.drop_link();
        assert!(!driver.ping());
        assert!(driver.execute("SELECT 1").unwrap_err().is_connection_lost());
    }

    #[test]
    fn test_sqlite_fixture() {
        let mut db = sqlite_database(DbConfig::default()).unwrap();
        assert_eq!(db.get_var("SELECT COUNT(*) FROM wp_posts", 0, 0).unwrap(), Some(Value::Int(0)));
    }

    #[test]
    fn test_error_assertion_macro() {
        let result: Result<()> = Err(DbError::InvalidData("bad".to_string()));
        assert_db_error!(result, InvalidData, "macro test");
    }
}

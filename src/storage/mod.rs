//! Query log: the in-memory record of executed statements and its SQLite persistence
use chrono::{DateTime, Utc};
use rusqlite::{Connection, Result as SqlResult, Row};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, error};

const QUERY_LOG_TABLE_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS query_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    query TEXT NOT NULL,
    started_at TEXT NOT NULL,
    elapsed_us INTEGER NOT NULL,
    caller TEXT NOT NULL,
    success BOOLEAN NOT NULL,
    row_count INTEGER
)"#;

const SELECT_COLUMNS: &str = "SELECT id, query, started_at, elapsed_us, caller, success, row_count FROM query_log";

/// One executed statement.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryLogEntry {
    /// Row id once persisted, 0 before
    pub id: i64,
    pub query: String,
    pub started_at: DateTime<Utc>,
    pub elapsed: Duration,
    /// `file:line` of the public call that issued the statement
    pub caller: String,
    pub success: bool,
    pub row_count: Option<u64>,
}

impl QueryLogEntry {
    pub fn new(
        query: impl Into<String>,
        started_at: DateTime<Utc>,
        elapsed: Duration,
        caller: impl Into<String>,
        success: bool,
        row_count: Option<u64>,
    ) -> Self {
        Self {
            id: 0,
            query: query.into(),
            started_at,
            elapsed,
            caller: caller.into(),
            success,
            row_count,
        }
    }

    fn from_row(row: &Row<'_>) -> SqlResult<Self> {
        let started_at: String = row.get(2)?;
        let started_at = DateTime::parse_from_rfc3339(&started_at)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e)))?;
        let elapsed_us: i64 = row.get(3)?;
        let row_count: Option<i64> = row.get(6)?;
        Ok(Self {
            id: row.get(0)?,
            query: row.get(1)?,
            started_at,
            elapsed: Duration::from_micros(u64::try_from(elapsed_us).unwrap_or(0)),
            caller: row.get(4)?,
            success: row.get(5)?,
            row_count: row_count.and_then(|n| u64::try_from(n).ok()),
        })
    }
}

/// Statements recorded while `save_queries` is on.
#[derive(Debug, Clone, Default)]
pub struct QueryLog {
    entries: Vec<QueryLogEntry>,
}

impl QueryLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, entry: QueryLogEntry) {
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[QueryLogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total time spent executing logged statements.
    pub fn total_elapsed(&self) -> Duration {
        self.entries.iter().map(|e| e.elapsed).sum()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Writes every entry to `store`. Returns the number written.
    pub fn persist(&self, store: &QueryLogStore) -> SqlResult<usize> {
        for entry in &self.entries {
            store.append(entry)?;
        }
        Ok(self.entries.len())
    }
}

/// SQLite-backed query log.
pub struct QueryLogStore {
    conn: Connection,
}

impl QueryLogStore {
    /// Opens (or creates) the log at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> SqlResult<Self> {
        debug!("Opening query log at {:?}", path.as_ref());
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.init()?;
        Ok(store)
    }

    pub fn open_in_memory() -> SqlResult<Self> {
        let store = Self {
            conn: Connection::open_in_memory()?,
        };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> SqlResult<()> {
        self.conn.execute(QUERY_LOG_TABLE_SQL, [])?;
        Ok(())
    }

    /// Appends one entry and returns its row id.
    pub fn append(&self, entry: &QueryLogEntry) -> SqlResult<i64> {
        let result = self.conn.execute(
            "INSERT INTO query_log (query, started_at, elapsed_us, caller, success, row_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            (
                &entry.query,
                entry.started_at.to_rfc3339(),
                i64::try_from(entry.elapsed.as_micros()).unwrap_or(i64::MAX),
                &entry.caller,
                entry.success,
                entry.row_count.and_then(|n| i64::try_from(n).ok()),
            ),
        );

        match result {
            Ok(_) => {
                let id = self.conn.last_insert_rowid();
                debug!("Appended query log entry {}", id);
                Ok(id)
            }
            Err(e) => {
                error!("Failed to append query log entry: {}", e);
                Err(e)
            }
        }
    }

    /// The most recent `count` entries, newest first.
    pub fn recent(&self, count: usize) -> SqlResult<Vec<QueryLogEntry>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{} ORDER BY id DESC LIMIT ?1", SELECT_COLUMNS))?;
        let entries = stmt.query_map([count as i64], |row| QueryLogEntry::from_row(row))?;
        entries.collect()
    }

    /// Entries whose query text contains `term`, newest first.
    pub fn search(&self, term: &str) -> SqlResult<Vec<QueryLogEntry>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{} WHERE instr(query, ?1) > 0 ORDER BY id DESC", SELECT_COLUMNS))?;
        let entries = stmt.query_map([term], |row| QueryLogEntry::from_row(row))?;
        entries.collect()
    }
}

/// Database Façade
///
/// One `Database` owns one logical connection and the scratch state of the
/// last statement (query text, result, error, insert id, counters). Calls
/// take `&mut self`; share an instance across threads only behind a lock,
/// or give each worker its own instance. The schema charset cache may be
/// shared between instances.

use crate::config::DbConfig;
use crate::core::db::{
    Capability, ColumnLength, ConnectionManager, ConnectionSettings, ConnectionState, Driver, Output, QueryResult,
    QueryStatus, Results, RowShape, SchemaCharsetCache, Sleeper, SqliteDriver, TableMeta, Value,
};
use crate::core::{DbError, Result};
use crate::placeholder::{remove_placeholder_escape, Arg, Format, PlaceholderCompiler, Prepared};
use crate::prefix::{TablePrefixResolver, TableScope};
use crate::reporter::{ErrorRecord, ErrorReporter, Terminator};
use crate::sanitize::{FieldValue, TextSanitizer};
use crate::sql::{
    check_ascii, esc_like, get_table_from_query, is_insert_statement, is_non_reading_statement,
    is_schema_statement, is_write_statement, quote_qualified_identifier,
};
use crate::storage::{QueryLog, QueryLogEntry, QueryLogStore};
use chrono::Utc;
use std::panic::Location;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Collations whose comparisons are safe without stripping the query first.
const SAFE_COLLATIONS: &[&str] = &[
    "utf8_bin",
    "utf8_general_ci",
    "utf8mb3_bin",
    "utf8mb3_general_ci",
    "utf8mb4_bin",
    "utf8mb4_general_ci",
];

/// A column name / value pair for CRUD calls.
pub type Field<'a> = (&'a str, Arg);

/// SQL access layer over one connection.
#[derive(Debug)]
pub struct Database {
    config: DbConfig,
    conn: ConnectionManager,
    compiler: PlaceholderCompiler,
    prefixes: TablePrefixResolver,
    schema: Arc<SchemaCharsetCache>,
    reporter: ErrorReporter,
    last_query: Option<String>,
    last_result: QueryResult,
    insert_id: u64,
    rows_affected: u64,
    num_rows: usize,
    num_queries: u64,
    check_current_query: bool,
    save_queries: bool,
    query_log: QueryLog,
}

impl Database {
    /// Builds an unconnected instance over `driver`.
    pub fn new(config: DbConfig, driver: Box<dyn Driver>) -> Result<Self> {
        config.validate()?;
        let compiler = PlaceholderCompiler::new()
            .allow_unsafe_unquoted(config.allow_unsafe_unquoted_parameters)
            .with_escape_style(driver.escape_style());
        let prefixes = TablePrefixResolver::new(&config.table_prefix, config.multisite, config.tables.clone())?
            .with_custom_user_tables(config.custom_user_table.clone(), config.custom_user_meta_table.clone());
        let conn = ConnectionManager::new(driver, ConnectionSettings::from(&config));

        Ok(Database {
            compiler,
            prefixes,
            conn,
            schema: SchemaCharsetCache::shared(),
            reporter: ErrorReporter::new(config.fatal_errors, config.suppress_errors),
            last_query: None,
            last_result: QueryResult::default(),
            insert_id: 0,
            rows_affected: 0,
            num_rows: 0,
            num_queries: 0,
            check_current_query: true,
            save_queries: config.save_queries,
            query_log: QueryLog::new(),
            config,
        })
    }

    /// Builds and connects.
    pub fn open(config: DbConfig, driver: Box<dyn Driver>) -> Result<Self> {
        let mut db = Self::new(config, driver)?;
        db.connect()?;
        Ok(db)
    }

    /// Opens the SQLite database named by `config.name`.
    pub fn sqlite(config: DbConfig) -> Result<Self> {
        Self::open(config, Box::new(SqliteDriver::new()))
    }

    pub fn with_sleeper(mut self, sleeper: Box<dyn Sleeper>) -> Self {
        self.conn.set_sleeper(sleeper);
        self
    }

    pub fn with_terminator(mut self, terminator: Terminator) -> Self {
        self.reporter.set_terminator(terminator);
        self
    }

    /// Shares a schema cache with other instances.
    pub fn with_schema_cache(mut self, cache: Arc<SchemaCharsetCache>) -> Self {
        self.schema = cache;
        self
    }

    /// Opens the connection; setup failures go through `bail`.
    pub fn connect(&mut self) -> Result<()> {
        self.conn.connect(&mut self.reporter, true)?;
        self.compiler.set_escape_style(self.conn.escape_style());
        Ok(())
    }

    /// Probes the link, reconnecting with bounded retries.
    pub fn check_connection(&mut self, allow_bail: bool) -> Result<()> {
        self.conn.check_connection(&mut self.reporter, allow_bail)
    }

    pub fn close(&mut self) {
        self.conn.close();
    }

    pub fn select(&mut self, database: &str) -> Result<()> {
        self.conn.select(database, &mut self.reporter, true)
    }

    pub fn set_charset(&mut self, charset: &str, collate: Option<&str>) {
        self.conn.set_charset(charset, collate);
    }

    pub fn set_sql_mode(&mut self, modes: &[String]) {
        self.conn.set_sql_mode(modes);
    }

    // Accessors

    pub fn config(&self) -> &DbConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        self.conn.state()
    }

    pub fn is_ready(&self) -> bool {
        self.conn.is_ready()
    }

    pub fn charset(&self) -> Option<&str> {
        self.conn.charset()
    }

    pub fn collate(&self) -> Option<&str> {
        self.conn.collate()
    }

    pub fn compiler(&self) -> &PlaceholderCompiler {
        &self.compiler
    }

    pub fn last_query(&self) -> Option<&str> {
        self.last_query.as_deref()
    }

    pub fn last_result(&self) -> &QueryResult {
        &self.last_result
    }

    pub fn last_error(&self) -> Option<&ErrorRecord> {
        self.reporter.last_error()
    }

    pub fn reporter(&self) -> &ErrorReporter {
        &self.reporter
    }

    pub fn insert_id(&self) -> u64 {
        self.insert_id
    }

    pub fn rows_affected(&self) -> u64 {
        self.rows_affected
    }

    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    pub fn num_queries(&self) -> u64 {
        self.num_queries
    }

    pub fn query_log(&self) -> &QueryLog {
        &self.query_log
    }

    /// Writes the query log to `store`.
    pub fn persist_query_log(&self, store: &QueryLogStore) -> Result<usize> {
        Ok(self.query_log.persist(store)?)
    }

    pub fn show_errors(&mut self, show: bool) -> bool {
        self.reporter.show_errors(show)
    }

    pub fn suppress_errors(&mut self, suppress: bool) -> bool {
        self.reporter.suppress_errors(suppress)
    }

    pub fn db_server_info(&self) -> Option<String> {
        self.conn.server_info()
    }

    pub fn db_version(&self) -> String {
        self.conn.db_version()
    }

    pub fn has_cap(&self, cap: Capability) -> bool {
        self.conn.has_cap(cap)
    }

    // Tenants

    pub fn prefixes(&self) -> &TablePrefixResolver {
        &self.prefixes
    }

    pub fn set_prefix(&mut self, prefix: &str) -> Result<String> {
        self.prefixes.set_prefix(prefix)
    }

    pub fn set_blog_id(&mut self, blog_id: u64, network_id: Option<u64>) -> u64 {
        self.prefixes.set_blog_id(blog_id, network_id)
    }

    pub fn get_blog_prefix(&self, blog_id: Option<u64>) -> String {
        self.prefixes.blog_prefix(blog_id)
    }

    pub fn tables(&self, scope: TableScope, with_prefix: bool, blog_id: Option<u64>) -> Vec<(String, String)> {
        self.prefixes.tables(scope, with_prefix, blog_id)
    }

    /// Resolved name of a bare table for the current tenant.
    pub fn table(&self, bare: &str) -> Option<&str> {
        self.prefixes.table(bare)
    }

    // Escaping

    /// Compiles a template against arguments.
    pub fn prepare(&self, template: &str, args: &[Arg]) -> Result<Prepared> {
        Ok(self.compiler.compile(template, args)?)
    }

    /// Escapes a string literal body for embedding in a template.
    pub fn escape(&self, text: &str) -> String {
        self.compiler.escape(text)
    }

    pub fn esc_like(&self, text: &str) -> String {
        esc_like(text)
    }

    pub fn quote_identifier(&self, name: &str) -> String {
        quote_qualified_identifier(name)
    }

    // Schema metadata

    /// Shared handle to the schema cache.
    pub fn schema_cache(&self) -> Arc<SchemaCharsetCache> {
        Arc::clone(&self.schema)
    }

    fn table_meta(&mut self, table: &str) -> Result<Arc<TableMeta>> {
        let conn = &mut self.conn;
        self.schema.get_or_load(table, || {
            conn.describe_table(table).map_err(|e| DbError::CharsetResolution {
                table: table.to_string(),
                message: e.message,
            })
        })
    }

    /// Table charset; `None` when the table declares no text charset.
    pub fn get_table_charset(&mut self, table: &str) -> Result<Option<String>> {
        Ok(self.table_meta(table)?.charset().map(str::to_string))
    }

    pub fn get_col_charset(&mut self, table: &str, column: &str) -> Result<Option<String>> {
        Ok(self.table_meta(table)?.col_charset(column))
    }

    pub fn get_col_length(&mut self, table: &str, column: &str) -> Result<Option<ColumnLength>> {
        Ok(self.table_meta(table)?.col_length(column))
    }

    fn connection_charset(&self) -> String {
        self.conn
            .charset()
            .map(str::to_string)
            .or_else(|| self.conn.client_charset())
            .unwrap_or_else(|| "utf8mb4".to_string())
    }

    /// Runs the sanitizer, sending any server-side conversions over the
    /// connection as one statement.
    pub fn strip_invalid_text(&mut self, fields: Vec<FieldValue>) -> Result<Vec<FieldValue>> {
        let sanitizer = TextSanitizer::new(self.connection_charset());
        // Conversion values are always quoted, whatever the legacy setting.
        let compiler = self.compiler.clone().allow_unsafe_unquoted(false);
        let conn = &mut self.conn;
        sanitizer.strip_invalid_text(fields, |conversion| {
            let sql = compiler.compile(&conversion.template, &conversion.args)?.into_sql();
            let execution = conn.execute(&sql).map_err(|e| DbError::QueryExecution {
                message: e.message,
                query: sql.clone(),
            })?;
            Ok(execution.rows.into_iter().next())
        })
    }

    /// Returns the query as it would be stored: stripped against its
    /// table's charset, or the connection charset when no table is found.
    pub fn strip_invalid_text_from_query(&mut self, sql: &str) -> Result<String> {
        let trimmed = sql.trim_start_matches(['\r', '\n', '\t', ' ', '(']);
        if is_non_reading_statement(trimmed) {
            return Ok(sql.to_string());
        }

        let charset = match get_table_from_query(sql) {
            Some(table) => {
                let meta = self.table_meta(&table)?;
                if meta.is_binary() {
                    return Ok(sql.to_string());
                }
                meta.charset().map(str::to_string)
            }
            None => self.conn.charset().map(str::to_string),
        };

        let mut field = FieldValue::new("query", sql);
        field.charset = charset;
        field.ascii = Some(false);
        let mut stripped = self.strip_invalid_text(vec![field])?;
        Ok(match stripped.pop().map(|f| f.value) {
            Some(Arg::Str(text)) => text,
            Some(other) => other.as_text().unwrap_or_default().to_string(),
            None => String::new(),
        })
    }

    /// Whether a read can skip the pre-execution strip.
    pub fn check_safe_collation(&mut self, sql: &str) -> bool {
        let trimmed = sql.trim_start_matches(['\r', '\n', '\t', ' ', '(']);
        if is_non_reading_statement(trimmed) || check_ascii(sql) {
            return true;
        }
        let Some(table) = get_table_from_query(sql) else {
            return false;
        };
        let Ok(meta) = self.table_meta(&table) else {
            return false;
        };
        if matches!(meta.charset(), None | Some("latin1")) {
            return true;
        }
        let safe = meta.collations().all(|c| SAFE_COLLATIONS.contains(&c));
        safe
    }

    /// Clears the scratch state of the previous statement.
    pub fn flush(&mut self) {
        self.last_result = QueryResult::default();
        self.last_query = None;
        self.rows_affected = 0;
        self.num_rows = 0;
        self.reporter.clear_last_error();
    }

    // Execution

    /// Executes one statement.
    ///
    /// Returns `Schema` for DDL, the affected row count for writes and the
    /// number of rows read otherwise; rows are kept as the last result. A
    /// lost connection is re-established once before the statement is
    /// retried.
    #[track_caller]
    pub fn query(&mut self, sql: &str) -> Result<QueryStatus> {
        let caller = Location::caller();
        self.run_query(sql, caller)
    }

    fn run_query(&mut self, sql: &str, caller: &'static Location<'static>) -> Result<QueryStatus> {
        if !self.conn.is_ready() {
            self.check_current_query = true;
            return Err(DbError::NotReady(format!("connection is {:?}", self.conn.state())));
        }

        let sql = remove_placeholder_escape(sql);
        if sql.trim().is_empty() {
            self.check_current_query = true;
            self.insert_id = 0;
            return Err(DbError::InvalidData("empty query".to_string()));
        }

        self.flush();

        if self.check_current_query && !check_ascii(&sql) {
            let unchanged = matches!(self.strip_invalid_text_from_query(&sql), Ok(ref s) if *s == sql);
            if !unchanged {
                self.check_current_query = true;
                self.insert_id = 0;
                self.last_query = Some(sql.clone());
                let err = DbError::InvalidData(
                    "Could not perform query because it contains invalid data.".to_string(),
                );
                let mut record = ErrorRecord::from_error(&err, caller);
                record.query = Some(sql);
                self.reporter.print_error(record);
                return Err(err);
            }
        }
        self.check_current_query = true;
        self.last_query = Some(sql.clone());

        let started_at = Utc::now();
        let timer = Instant::now();
        self.num_queries += 1;
        let mut outcome = self.conn.execute(&sql);

        if matches!(&outcome, Err(e) if e.is_connection_lost()) {
            if let Err(err) = self.conn.check_connection(&mut self.reporter, true) {
                self.insert_id = 0;
                self.log_query(&sql, started_at, timer, caller, false, None);
                return Err(err);
            }
            self.num_queries += 1;
            outcome = self.conn.execute(&sql);
        }

        let execution = match outcome {
            Ok(execution) => execution,
            Err(driver_err) => {
                if is_insert_statement(&sql) {
                    self.insert_id = 0;
                }
                self.log_query(&sql, started_at, timer, caller, false, None);
                let err = DbError::QueryExecution {
                    message: driver_err.message,
                    query: sql,
                };
                self.reporter.print_error(ErrorRecord::from_error(&err, caller));
                return Err(err);
            }
        };

        let status = if is_schema_statement(&sql) {
            QueryStatus::Schema
        } else if is_write_statement(&sql) {
            self.rows_affected = execution.rows_affected;
            if is_insert_statement(&sql) {
                self.insert_id = execution.insert_id;
            }
            QueryStatus::Affected(self.rows_affected)
        } else {
            let mut result = QueryResult::new(execution.columns, execution.rows);
            result.rows_affected = execution.rows_affected;
            result.insert_id = execution.insert_id;
            self.num_rows = result.row_count();
            self.last_result = result;
            QueryStatus::Rows(self.num_rows)
        };

        let count = match status {
            QueryStatus::Schema => None,
            QueryStatus::Affected(n) => Some(n),
            QueryStatus::Rows(n) => Some(n as u64),
        };
        self.log_query(&sql, started_at, timer, caller, true, count);
        debug!(status = ?status, "Query executed");
        Ok(status)
    }

    fn log_query(
        &mut self,
        sql: &str,
        started_at: chrono::DateTime<Utc>,
        timer: Instant,
        caller: &Location<'_>,
        success: bool,
        row_count: Option<u64>,
    ) {
        if !self.save_queries {
            return;
        }
        self.query_log.record(QueryLogEntry::new(
            sql,
            started_at,
            timer.elapsed(),
            format!("{}:{}", caller.file(), caller.line()),
            success,
            row_count,
        ));
    }

    fn read(&mut self, sql: &str, caller: &'static Location<'static>) -> Result<()> {
        if self.check_current_query && self.check_safe_collation(sql) {
            self.check_current_query = false;
        }
        self.run_query(sql, caller).map(|_| ())
    }

    /// One value from the result: column `x` of row `y`. Empty text reads
    /// as `None`.
    #[track_caller]
    pub fn get_var(&mut self, sql: &str, x: usize, y: usize) -> Result<Option<Value>> {
        self.read(sql, Location::caller())?;
        Ok(self.last_result.var(x, y))
    }

    /// Row `y` of the result in the requested shape.
    #[track_caller]
    pub fn get_row(&mut self, sql: &str, output: Output, y: usize) -> Result<Option<RowShape>> {
        self.read(sql, Location::caller())?;
        Ok(self.last_result.row(output, y))
    }

    /// Column `x` of every row.
    #[track_caller]
    pub fn get_col(&mut self, sql: &str, x: usize) -> Result<Vec<Value>> {
        self.read(sql, Location::caller())?;
        Ok(self.last_result.column(x))
    }

    /// The whole result in the requested shape.
    #[track_caller]
    pub fn get_results(&mut self, sql: &str, output: Output) -> Result<Results> {
        self.read(sql, Location::caller())?;
        Ok(self.last_result.shape(output))
    }

    // CRUD

    /// `INSERT INTO table (...) VALUES (...)`. Returns rows affected.
    #[track_caller]
    pub fn insert(&mut self, table: &str, data: &[Field<'_>], formats: &[Format]) -> Result<u64> {
        self.insert_replace(table, data, formats, "INSERT", Location::caller())
    }

    /// `REPLACE INTO table (...) VALUES (...)`. Returns rows affected.
    #[track_caller]
    pub fn replace(&mut self, table: &str, data: &[Field<'_>], formats: &[Format]) -> Result<u64> {
        self.insert_replace(table, data, formats, "REPLACE", Location::caller())
    }

    fn insert_replace(
        &mut self,
        table: &str,
        data: &[Field<'_>],
        formats: &[Format],
        verb: &str,
        caller: &'static Location<'static>,
    ) -> Result<u64> {
        self.insert_id = 0;
        let fields = self.process_fields(table, data, formats, caller)?;

        let mut columns = Vec::with_capacity(fields.len());
        let mut placeholders = Vec::with_capacity(fields.len());
        let mut values = Vec::new();
        for field in fields {
            columns.push(template_identifier(&field.name));
            if field.value.is_null() {
                placeholders.push("NULL");
                continue;
            }
            placeholders.push(field.format.placeholder());
            values.push(field.value);
        }

        let template = format!(
            "{} INTO {} ({}) VALUES ({})",
            verb,
            template_identifier(table),
            columns.join(", "),
            placeholders.join(", ")
        );
        self.execute_crud(&template, values, caller)
    }

    /// `UPDATE table SET ... WHERE ...`. `NULL` conditions become `IS NULL`.
    #[track_caller]
    pub fn update(
        &mut self,
        table: &str,
        data: &[Field<'_>],
        where_: &[Field<'_>],
        formats: &[Format],
        where_formats: &[Format],
    ) -> Result<u64> {
        let caller = Location::caller();
        let fields = self.process_fields(table, data, formats, caller)?;
        let conditions = self.process_fields(table, where_, where_formats, caller)?;
        if fields.is_empty() || conditions.is_empty() {
            return Err(DbError::InvalidData("update needs columns to set and to match".to_string()));
        }

        let mut values = Vec::new();
        let mut set = Vec::with_capacity(fields.len());
        for field in fields {
            let column = template_identifier(&field.name);
            if field.value.is_null() {
                set.push(format!("{} = NULL", column));
                continue;
            }
            set.push(format!("{} = {}", column, field.format.placeholder()));
            values.push(field.value);
        }
        let where_clause = Self::where_clause(conditions, &mut values);

        let template = format!(
            "UPDATE {} SET {} WHERE {}",
            template_identifier(table),
            set.join(", "),
            where_clause
        );
        self.execute_crud(&template, values, caller)
    }

    /// `DELETE FROM table WHERE ...`.
    #[track_caller]
    pub fn delete(&mut self, table: &str, where_: &[Field<'_>], where_formats: &[Format]) -> Result<u64> {
        let caller = Location::caller();
        let conditions = self.process_fields(table, where_, where_formats, caller)?;
        if conditions.is_empty() {
            return Err(DbError::InvalidData("delete needs columns to match".to_string()));
        }

        let mut values = Vec::new();
        let where_clause = Self::where_clause(conditions, &mut values);
        let template = format!(
            "DELETE FROM {} WHERE {}",
            template_identifier(table),
            where_clause
        );
        self.execute_crud(&template, values, caller)
    }

    fn where_clause(conditions: Vec<FieldValue>, values: &mut Vec<Arg>) -> String {
        conditions
            .into_iter()
            .map(|field| {
                let column = template_identifier(&field.name);
                if field.value.is_null() {
                    format!("{} IS NULL", column)
                } else {
                    let clause = format!("{} = {}", column, field.format.placeholder());
                    values.push(field.value);
                    clause
                }
            })
            .collect::<Vec<_>>()
            .join(" AND ")
    }

    /// Compiles a CRUD template without legacy unquoting and runs it
    /// without the raw-query strip (values are already checked per column).
    fn execute_crud(&mut self, template: &str, values: Vec<Arg>, caller: &'static Location<'static>) -> Result<u64> {
        let sql = if values.is_empty() {
            template.replace("%%", "%")
        } else {
            let strict = self.compiler.clone().allow_unsafe_unquoted(false);
            strict.compile(template, &values)?.into_sql()
        };
        self.check_current_query = false;
        match self.run_query(&sql, caller)? {
            QueryStatus::Affected(n) => Ok(n),
            QueryStatus::Rows(n) => Ok(n as u64),
            QueryStatus::Schema => Ok(0),
        }
    }

    /// Attaches formats, charsets and lengths, then refuses the call if
    /// any value would be altered to fit its column.
    fn process_fields(
        &mut self,
        table: &str,
        data: &[Field<'_>],
        formats: &[Format],
        caller: &'static Location<'static>,
    ) -> Result<Vec<FieldValue>> {
        let mut fields = Vec::with_capacity(data.len());
        for (i, (name, value)) in data.iter().enumerate() {
            let format = formats
                .get(i)
                .or_else(|| formats.first())
                .copied()
                .or_else(|| self.config.field_format(name))
                .unwrap_or_default();
            let mut field = FieldValue::new(*name, value.clone());
            field.format = format;
            if !format.is_numeric() {
                let meta = self.table_meta(table)?;
                field.charset = meta.col_charset(name);
                field.length = meta.col_length(name);
            }
            fields.push(field);
        }

        let converted = self.strip_invalid_text(fields.clone())?;
        let problems: Vec<&str> = fields
            .iter()
            .zip(&converted)
            .filter(|(before, after)| !same_value(&before.value, &after.value))
            .map(|(before, _)| before.name.as_str())
            .collect();

        if !problems.is_empty() {
            let message = if problems.len() == 1 {
                format!(
                    "Processing the value for the following field failed: {}. The supplied value may be too long or contains invalid data.",
                    problems[0]
                )
            } else {
                format!(
                    "Processing the values for the following fields failed: {}. The supplied values may be too long or contain invalid data.",
                    problems.join(", ")
                )
            };
            warn!(table, fields = ?problems, "Refusing write with values that do not fit");
            let err = DbError::InvalidData(message);
            self.reporter.print_error(ErrorRecord::from_error(&err, caller));
            return Err(err);
        }
        Ok(fields)
    }
}

/// Backtick-quoted identifier with `%` doubled for the template.
fn template_identifier(name: &str) -> String {
    quote_qualified_identifier(name).replace('%', "%%")
}

fn same_value(a: &Arg, b: &Arg) -> bool {
    match (a, b) {
        (Arg::Float(x), Arg::Float(y)) => x.to_bits() == y.to_bits(),
        _ => a == b,
    }
}

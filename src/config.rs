use crate::core::{DbError, Result};
use crate::placeholder::Format;
use crate::prefix::{validate_prefix, TableSets};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// SQL modes removed from the session on connect.
pub const DEFAULT_INCOMPATIBLE_SQL_MODES: &[&str] = &[
    "NO_ZERO_DATE",
    "ONLY_FULL_GROUP_BY",
    "STRICT_TRANS_TABLES",
    "STRICT_ALL_TABLES",
    "TRADITIONAL",
    "ANSI",
];

/// Immutable configuration handed to a `Database` at construction.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct DbConfig {
    /// `host[:port]`, `host:/socket`, `[::1]:3306`, or a SQLite path
    pub host: String,
    pub user: String,
    pub password: String,
    /// Schema to select (SQLite: file path or `:memory:`)
    pub name: String,
    /// Connection charset; `utf8` is upgraded to `utf8mb4`
    pub charset: Option<String>,
    pub collate: Option<String>,
    /// Base table prefix, `[A-Za-z0-9_]+`
    pub table_prefix: String,
    /// Enables network tables and tenant switching
    pub multisite: bool,
    pub reconnect_retries: u32,
    pub reconnect_delay_ms: u64,
    /// Setup failures terminate the process
    pub fatal_errors: bool,
    /// Per-query errors are not logged
    pub suppress_errors: bool,
    /// Keep a log of executed statements
    pub save_queries: bool,
    /// Legacy unquoted `%s` handling in the placeholder compiler
    pub allow_unsafe_unquoted_parameters: bool,
    pub incompatible_sql_modes: Vec<String>,
    /// Default CRUD format per column, e.g. `post_author = "%d"`
    pub field_types: HashMap<String, Format>,
    pub custom_user_table: Option<String>,
    pub custom_user_meta_table: Option<String>,
    pub tables: TableSets,
}

impl Default for DbConfig {
    fn default() -> Self {
        DbConfig {
            host: "localhost".to_string(),
            user: String::new(),
            password: String::new(),
            name: String::new(),
            charset: Some("utf8mb4".to_string()),
            collate: None,
            table_prefix: "wp_".to_string(),
            multisite: false,
            reconnect_retries: 5,
            reconnect_delay_ms: 1000,
            fatal_errors: false,
            suppress_errors: false,
            save_queries: false,
            allow_unsafe_unquoted_parameters: false,
            incompatible_sql_modes: DEFAULT_INCOMPATIBLE_SQL_MODES
                .iter()
                .map(|m| m.to_string())
                .collect(),
            field_types: HashMap::new(),
            custom_user_table: None,
            custom_user_meta_table: None,
            tables: TableSets::default(),
        }
    }
}

impl DbConfig {
    /// Parses and validates a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: DbConfig = toml::from_str(content).map_err(|e| DbError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the prefix and retry bounds.
    pub fn validate(&self) -> Result<()> {
        validate_prefix(&self.table_prefix)
            .map_err(|_| DbError::Config(format!("invalid table_prefix '{}'", self.table_prefix)))?;
        if self.reconnect_retries == 0 {
            return Err(DbError::Config("reconnect_retries must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn field_format(&self, field: &str) -> Option<Format> {
        self.field_types.get(field).copied()
    }
}

/// Loads configuration from a TOML file at the given path.
///
/// # Example
///
/// ```no_run
/// let config = tenantdb::config::load_config("db.toml").expect("Failed to load config");
/// println!("{:?}", config.host);
/// ```
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<DbConfig> {
    let content = fs::read_to_string(path)?;
    DbConfig::from_toml_str(&content)
}

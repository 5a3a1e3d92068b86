/// Connection Management Module
///
/// Owns the one physical link of a `Database`: connect, charset and
/// SQL-mode negotiation, schema selection, liveness checks and bounded
/// reconnection.

use super::driver::{ConnectParams, Dialect, Driver, DriverError, DriverErrorKind, DriverResult, Execution};
use crate::config::DbConfig;
use crate::core::{DbError, Result};
use crate::reporter::ErrorReporter;
use crate::sql::{quote_string, EscapeStyle};
use once_cell::sync::Lazy;
use regex::Regex;
use std::cmp::Ordering;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Ready,
    Reconnecting,
    /// Retries exhausted or credentials refused
    Failed,
}

/// Pause between reconnect attempts.
pub trait Sleeper: Send {
    fn sleep(&self, duration: Duration);
}

/// Blocks the current thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Server features gated on version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Collation,
    GroupConcat,
    Subqueries,
    SetCharset,
    Utf8mb4,
    Utf8mb4_520,
    IdentifierPlaceholders,
}

impl std::str::FromStr for Capability {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "collation" => Ok(Capability::Collation),
            "group_concat" => Ok(Capability::GroupConcat),
            "subqueries" => Ok(Capability::Subqueries),
            "set_charset" => Ok(Capability::SetCharset),
            "utf8mb4" => Ok(Capability::Utf8mb4),
            "utf8mb4_520" => Ok(Capability::Utf8mb4_520),
            "identifier_placeholders" => Ok(Capability::IdentifierPlaceholders),
            other => Err(format!("Unknown capability '{}'", other)),
        }
    }
}

/// A parsed `DB_HOST`-style value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostSpec {
    pub host: String,
    pub port: Option<u16>,
    pub socket: Option<String>,
    pub is_ipv6: bool,
}

static IPV6_HOST: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\[?(?P<host>[0-9a-fA-F:]+)(?:\]:(?P<port>\d+))?").expect("valid regex")
});
static IPV4_HOST: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?P<host>[^:/]*)(?::(?P<port>\d+))?").expect("valid regex"));

/// Splits `host[:port]`, `host:/socket`, `[::1]:3306` and bare IPv6
/// literals. The socket is peeled off first; more than one remaining colon
/// means IPv6.
pub fn parse_db_host(host: &str) -> Result<HostSpec> {
    let (host, socket) = match host.find(":/") {
        Some(pos) => (&host[..pos], Some(host[pos + 1..].to_string())),
        None => (host, None),
    };

    let is_ipv6 = host.matches(':').count() > 1;
    let pattern = if is_ipv6 { &*IPV6_HOST } else { &*IPV4_HOST };
    let caps = pattern
        .captures(host)
        .ok_or_else(|| DbError::Config(format!("Unparseable database host '{}'", host)))?;

    let port = match caps.name("port").map(|m| m.as_str()) {
        Some(p) => Some(
            p.parse::<u16>()
                .map_err(|_| DbError::Config(format!("Invalid database port '{}'", p)))?,
        ),
        None => None,
    }
    .filter(|&p| p != 0);

    Ok(HostSpec {
        host: caps.name("host").map(|m| m.as_str().to_string()).unwrap_or_default(),
        port,
        socket,
        is_ipv6,
    })
}

/// Compares dotted numeric versions; missing parts sort first.
pub fn version_compare(a: &str, b: &str) -> Ordering {
    let parts = |v: &str| -> Vec<u64> {
        v.split('.')
            .filter(|p| !p.is_empty())
            .map(|p| p.parse().unwrap_or(0))
            .collect()
    };
    parts(a).cmp(&parts(b))
}

/// `(charset, collate)` upgraded for the server.
pub fn determine_charset(charset: &str, collate: &str, utf8mb4_520: bool) -> (String, String) {
    let charset = if charset == "utf8" { "utf8mb4" } else { charset };
    let mut collate = collate.to_string();
    if charset == "utf8mb4" {
        if collate.is_empty() || collate == "utf8_general_ci" {
            collate = "utf8mb4_unicode_ci".to_string();
        } else {
            collate = collate.replace("utf8_", "utf8mb4_");
        }
    }
    if utf8mb4_520 && collate == "utf8mb4_unicode_ci" {
        collate = "utf8mb4_unicode_520_ci".to_string();
    }
    (charset.to_string(), collate)
}

/// Settings the manager needs from `DbConfig`.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionSettings {
    pub host: String,
    pub user: String,
    pub password: String,
    pub database: String,
    pub charset: Option<String>,
    pub collate: Option<String>,
    pub retries: u32,
    pub delay: Duration,
    pub incompatible_modes: Vec<String>,
}

impl From<&DbConfig> for ConnectionSettings {
    fn from(config: &DbConfig) -> Self {
        ConnectionSettings {
            host: config.host.clone(),
            user: config.user.clone(),
            password: config.password.clone(),
            database: config.name.clone(),
            charset: config.charset.clone(),
            collate: config.collate.clone(),
            retries: config.reconnect_retries,
            delay: config.reconnect_delay(),
            incompatible_modes: config.incompatible_sql_modes.clone(),
        }
    }
}

/// Connection manager for one logical connection.
pub struct ConnectionManager {
    driver: Box<dyn Driver>,
    settings: ConnectionSettings,
    state: ConnectionState,
    charset: Option<String>,
    collate: Option<String>,
    has_connected: bool,
    last_driver_error: Option<DriverError>,
    sleeper: Box<dyn Sleeper>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("host", &self.settings.host)
            .field("database", &self.settings.database)
            .field("state", &self.state)
            .field("charset", &self.charset)
            .field("collate", &self.collate)
            .finish()
    }
}

impl ConnectionManager {
    /// Creates a manager; nothing is opened until `connect`.
    pub fn new(driver: Box<dyn Driver>, settings: ConnectionSettings) -> Self {
        ConnectionManager {
            driver,
            charset: settings.charset.clone(),
            collate: settings.collate.clone(),
            settings,
            state: ConnectionState::Disconnected,
            has_connected: false,
            last_driver_error: None,
            sleeper: Box::new(ThreadSleeper),
        }
    }

    pub fn set_sleeper(&mut self, sleeper: Box<dyn Sleeper>) {
        self.sleeper = sleeper;
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == ConnectionState::Ready
    }

    pub fn charset(&self) -> Option<&str> {
        self.charset.as_deref().filter(|c| !c.is_empty())
    }

    pub fn collate(&self) -> Option<&str> {
        self.collate.as_deref().filter(|c| !c.is_empty())
    }

    pub fn dialect(&self) -> Dialect {
        self.driver.dialect()
    }

    pub fn escape_style(&self) -> EscapeStyle {
        self.driver.escape_style()
    }

    pub fn last_driver_error(&self) -> Option<&DriverError> {
        self.last_driver_error.as_ref()
    }

    pub fn client_charset(&self) -> Option<String> {
        self.driver.client_charset()
    }

    /// Opens the link and prepares the session.
    ///
    /// The first successful connect negotiates the charset. Afterwards the
    /// charset and SQL mode are applied and the schema is selected. With
    /// `allow_bail` set, failures go through the reporter.
    pub fn connect(&mut self, reporter: &mut ErrorReporter, allow_bail: bool) -> Result<()> {
        self.state = ConnectionState::Connecting;
        if let Err(err) = self.open() {
            self.state = ConnectionState::Failed;
            let db_err = to_db_error(&err);
            self.last_driver_error = Some(err);
            if allow_bail {
                return Err(reporter.bail(
                    &format!(
                        "Error establishing a database connection to {}",
                        self.settings.host
                    ),
                    "db_connect_fail",
                    db_err.kind(),
                    self.last_driver_error.as_ref(),
                ));
            }
            return Err(db_err);
        }

        if !self.has_connected {
            self.init_charset();
        }
        self.has_connected = true;
        self.apply_charset();
        self.state = ConnectionState::Ready;
        self.set_sql_mode(&[]);

        let database = self.settings.database.clone();
        if !database.is_empty() {
            self.select(&database, reporter, allow_bail)?;
        }
        info!(host = %self.settings.host, database = %database, "Database connection ready");
        Ok(())
    }

    fn open(&mut self) -> DriverResult<()> {
        let spec = parse_db_host(&self.settings.host).map_err(|e| {
            DriverError::new(DriverErrorKind::ConnectionLost, None, e.to_string())
        })?;
        let host = if spec.is_ipv6 {
            format!("[{}]", spec.host)
        } else {
            spec.host
        };
        let params = ConnectParams {
            host,
            port: spec.port,
            socket: spec.socket,
            user: self.settings.user.clone(),
            password: self.settings.password.clone(),
            database: self.settings.database.clone(),
        };
        debug!(host = %params.host, port = ?params.port, "Connecting");
        self.driver.connect(&params)
    }

    /// Selects the active schema. Failure clears readiness; with
    /// `allow_bail` set it goes through the reporter, otherwise the typed
    /// error is returned.
    pub fn select(&mut self, database: &str, reporter: &mut ErrorReporter, allow_bail: bool) -> Result<()> {
        match self.driver.select_db(database) {
            Ok(()) => {
                self.settings.database = database.to_string();
                Ok(())
            }
            Err(err) => {
                self.state = ConnectionState::Failed;
                let db_err = match err.kind {
                    DriverErrorKind::ConnectionLost | DriverErrorKind::Authentication => to_db_error(&err),
                    DriverErrorKind::Server => {
                        DbError::NotReady(format!("Cannot select database {}: {}", database, err.message))
                    }
                };
                self.last_driver_error = Some(err);
                if allow_bail {
                    return Err(reporter.bail(
                        &format!("Cannot select database {}", database),
                        "db_select_fail",
                        db_err.kind(),
                        self.last_driver_error.as_ref(),
                    ));
                }
                Err(db_err)
            }
        }
    }

    fn init_charset(&mut self) {
        if !self.driver.dialect().has_session_settings() {
            return;
        }
        let charset = self.charset.clone().unwrap_or_default();
        let collate = self.collate.clone().unwrap_or_default();
        if charset.is_empty() {
            return;
        }
        let (charset, collate) = determine_charset(&charset, &collate, self.has_cap(Capability::Utf8mb4_520));
        debug!(charset = %charset, collate = %collate, "Negotiated charset");
        self.charset = Some(charset);
        self.collate = Some(collate).filter(|c| !c.is_empty());
    }

    fn apply_charset(&mut self) {
        let Some(charset) = self.charset().map(str::to_string) else {
            return;
        };
        if !self.driver.dialect().has_session_settings() || !self.has_cap(Capability::Collation) {
            return;
        }
        if self.has_cap(Capability::SetCharset) {
            if let Err(err) = self.driver.set_charset(&charset) {
                warn!(charset = %charset, error = %err, "Client charset switch failed");
                return;
            }
        }
        let style = self.driver.escape_style();
        let mut sql = format!("SET NAMES {}", quote_string(&charset, style));
        if let Some(collate) = self.collate() {
            sql.push_str(&format!(" COLLATE {}", quote_string(collate, style)));
        }
        if let Err(err) = self.driver.execute(&sql) {
            warn!(error = %err, "SET NAMES failed");
        }
    }

    /// Changes the session charset after connect.
    pub fn set_charset(&mut self, charset: &str, collate: Option<&str>) {
        self.charset = Some(charset.to_string());
        self.collate = collate.map(str::to_string);
        self.apply_charset();
    }

    /// Removes incompatible modes from the session SQL mode. An empty
    /// `modes` reads the current mode from the server first.
    pub fn set_sql_mode(&mut self, modes: &[String]) {
        if !self.driver.dialect().has_session_settings() {
            return;
        }
        let modes: Vec<String> = if modes.is_empty() {
            let current = match self.driver.execute("SELECT @@SESSION.sql_mode") {
                Ok(execution) => execution
                    .rows
                    .first()
                    .and_then(|row| row.first())
                    .map(|v| v.to_string())
                    .unwrap_or_default(),
                Err(err) => {
                    warn!(error = %err, "Could not read sql_mode");
                    return;
                }
            };
            if current.is_empty() {
                return;
            }
            current.split(',').map(str::to_string).collect()
        } else {
            modes.to_vec()
        };

        let kept: Vec<String> = modes
            .into_iter()
            .filter(|mode| {
                !self
                    .settings
                    .incompatible_modes
                    .iter()
                    .any(|bad| bad.eq_ignore_ascii_case(mode.trim()))
            })
            .collect();
        let sql = format!("SET SESSION sql_mode='{}'", kept.join(","));
        if let Err(err) = self.driver.execute(&sql) {
            warn!(error = %err, "Could not set sql_mode");
        }
    }

    /// Probes the link and reconnects with bounded retries if it is gone.
    ///
    /// Every failed attempt is followed by one fixed delay. Refused
    /// credentials end the loop at once.
    pub fn check_connection(&mut self, reporter: &mut ErrorReporter, allow_bail: bool) -> Result<()> {
        if self.driver.is_open() && self.driver.ping() {
            return Ok(());
        }

        self.state = ConnectionState::Reconnecting;
        let retries = self.settings.retries;
        for attempt in 1..=retries {
            warn!(attempt, retries, "Reconnecting to database");
            match self.connect(reporter, false) {
                Ok(()) => {
                    info!(attempt, "Reconnected to database");
                    return Ok(());
                }
                Err(DbError::AuthenticationFailure(message)) => {
                    self.state = ConnectionState::Failed;
                    error!(message = %message, "Reconnect refused; not retrying");
                    return Err(self.fail(reporter, allow_bail, DbError::AuthenticationFailure(message)));
                }
                Err(err) if err.is_transient() => self.sleeper.sleep(self.settings.delay),
                Err(err) => {
                    self.state = ConnectionState::Failed;
                    error!(error = %err, "Reconnect failed; not retrying");
                    return Err(self.fail(reporter, allow_bail, err));
                }
            }
        }

        self.state = ConnectionState::Failed;
        error!(retries, "Giving up on database connection");
        let message = self
            .last_driver_error
            .as_ref()
            .map(|e| e.message.clone())
            .unwrap_or_else(|| "connection lost".to_string());
        Err(self.fail(reporter, allow_bail, DbError::ConnectionLost(message)))
    }

    fn fail(&mut self, reporter: &mut ErrorReporter, allow_bail: bool, err: DbError) -> DbError {
        if allow_bail {
            reporter.bail(
                &format!("Error reconnecting to the database {}", self.settings.host),
                "db_connect_fail",
                err.kind(),
                self.last_driver_error.as_ref(),
            )
        } else {
            err
        }
    }

    /// Runs one statement on the link.
    pub fn execute(&mut self, sql: &str) -> DriverResult<Execution> {
        let result = self.driver.execute(sql);
        if let Err(err) = &result {
            self.last_driver_error = Some(err.clone());
        }
        result
    }

    pub fn describe_table(&mut self, table: &str) -> DriverResult<Vec<super::driver::ColumnDescriptor>> {
        self.driver.describe_table(table)
    }

    pub fn server_info(&self) -> Option<String> {
        self.driver.server_info()
    }

    /// Numeric server version, e.g. `8.0.36`. MariaDB's `5.5.5-` prefix is
    /// removed first.
    pub fn db_version(&self) -> String {
        let info = self.server_info().unwrap_or_default();
        let info = match info.strip_prefix("5.5.5-") {
            Some(rest) if info.contains("MariaDB") => rest.to_string(),
            _ => info,
        };
        let end = info
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(info.len());
        info[..end].to_string()
    }

    pub fn has_cap(&self, cap: Capability) -> bool {
        let version = self.db_version();
        let at_least = |min: &str| version_compare(&version, min) != Ordering::Less;
        match cap {
            Capability::Collation | Capability::GroupConcat | Capability::Subqueries => at_least("4.1"),
            Capability::SetCharset => at_least("5.0.7"),
            Capability::Utf8mb4_520 => at_least("5.6"),
            Capability::Utf8mb4 | Capability::IdentifierPlaceholders => true,
        }
    }

    pub fn close(&mut self) {
        if self.driver.is_open() {
            self.driver.close();
        }
        self.state = ConnectionState::Disconnected;
        self.has_connected = false;
        debug!("Database connection closed");
    }
}

fn to_db_error(err: &DriverError) -> DbError {
    match err.kind {
        DriverErrorKind::Authentication => DbError::AuthenticationFailure(err.message.clone()),
        _ => DbError::ConnectionLost(err.message.clone()),
    }
}

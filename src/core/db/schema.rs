/// Schema Metadata Module
///
/// Per-table charset and per-column collation/length metadata, read through
/// the driver's column introspection and cached for the lifetime of the
/// cache. Entries are never invalidated implicitly; call
/// [`SchemaCharsetCache::invalidate`] or [`SchemaCharsetCache::clear`] after
/// a schema change.

use super::driver::ColumnDescriptor;
use crate::core::{DbError, Result};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;

/// Column types that make a whole table binary.
const BINARY_TYPES: &[&str] = &["binary", "varbinary", "tinyblob", "mediumblob", "blob", "longblob"];

/// Whether a length ceiling counts characters or bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LengthKind {
    Char,
    Byte,
}

/// A column's storage ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnLength {
    pub kind: LengthKind,
    pub max: u64,
}

impl ColumnLength {
    pub fn chars(max: u64) -> Self {
        ColumnLength { kind: LengthKind::Char, max }
    }

    pub fn bytes(max: u64) -> Self {
        ColumnLength { kind: LengthKind::Byte, max }
    }
}

/// Represents a database column with its charset-relevant metadata
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnMetadata {
    /// Table the column belongs to
    pub table: String,
    /// Column name as reported by the server
    pub field: String,
    /// Declared type, e.g. `varchar(191)` or `longtext`
    pub column_type: String,
    /// Collation, `None` for non-text columns
    pub collation: Option<String>,
}

impl ColumnMetadata {
    fn base_type(&self) -> (String, Option<&str>) {
        let mut parts = self.column_type.splitn(2, '(');
        let base = parts.next().unwrap_or_default().trim().to_ascii_lowercase();
        let declared = parts
            .next()
            .and_then(|rest| rest.split(')').next())
            .map(str::trim)
            .filter(|s| !s.is_empty());
        (base, declared)
    }

    pub fn is_binary(&self) -> bool {
        BINARY_TYPES.contains(&self.base_type().0.as_str())
    }

    /// Charset derived from the collation prefix.
    pub fn charset(&self) -> Option<String> {
        self.collation.as_deref().and_then(charset_of_collation)
    }

    /// Storage ceiling for the declared type; `None` means unconstrained.
    pub fn length(&self) -> Option<ColumnLength> {
        let (base, declared) = self.base_type();
        let declared = || declared.and_then(|d| d.parse::<u64>().ok());
        match base.as_str() {
            "char" | "varchar" => declared().map(ColumnLength::chars),
            "binary" | "varbinary" => declared().map(ColumnLength::bytes),
            "tinyblob" | "tinytext" => Some(ColumnLength::bytes(255)),
            "blob" | "text" => Some(ColumnLength::bytes(65_535)),
            "mediumblob" | "mediumtext" => Some(ColumnLength::bytes(16_777_215)),
            "longblob" | "longtext" => Some(ColumnLength::bytes(4_294_967_295)),
            _ => None,
        }
    }
}

/// `utf8mb4_unicode_ci` -> `utf8mb4`; `utf8mb3` folds into `utf8`.
pub fn charset_of_collation(collation: &str) -> Option<String> {
    let prefix = collation.split('_').next()?.trim().to_ascii_lowercase();
    match prefix.as_str() {
        "" => None,
        "utf8mb3" => Some("utf8".to_string()),
        _ => Some(prefix),
    }
}

/// Everything cached for one table.
#[derive(Debug, Clone, PartialEq)]
pub struct TableMeta {
    table: String,
    charset: Option<String>,
    columns: Vec<ColumnMetadata>,
    by_name: HashMap<String, usize>,
}

impl TableMeta {
    /// Derives the table charset from its columns.
    ///
    /// Any binary/blob column makes the table `binary`. Otherwise the
    /// distinct collation charsets decide: none means no charset, one is
    /// used as is, and several collapse after dropping `latin1` (a lone
    /// survivor wins, `{utf8, utf8mb4}` resolves to `utf8`, anything else
    /// is `ascii`).
    pub fn from_columns(table: &str, descriptors: Vec<ColumnDescriptor>) -> Result<Self> {
        if descriptors.is_empty() {
            return Err(DbError::CharsetResolution {
                table: table.to_string(),
                message: "no column information".to_string(),
            });
        }

        let columns: Vec<ColumnMetadata> = descriptors
            .into_iter()
            .map(|d| ColumnMetadata {
                table: table.to_string(),
                field: d.field,
                column_type: d.column_type,
                collation: d.collation,
            })
            .collect();
        let by_name = columns
            .iter()
            .enumerate()
            .map(|(i, c)| (c.field.to_ascii_lowercase(), i))
            .collect();

        let mut charsets = BTreeSet::new();
        let mut binary = false;
        for column in &columns {
            if let Some(charset) = column.charset() {
                charsets.insert(charset);
            }
            if column.is_binary() {
                binary = true;
                break;
            }
        }

        let charset = if binary {
            Some("binary".to_string())
        } else {
            resolve_charsets(charsets)
        };

        Ok(TableMeta {
            table: table.to_string(),
            charset,
            columns,
            by_name,
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Table charset; `None` means no declared text charset.
    pub fn charset(&self) -> Option<&str> {
        self.charset.as_deref()
    }

    pub fn is_binary(&self) -> bool {
        self.charset() == Some("binary")
    }

    pub fn columns(&self) -> &[ColumnMetadata] {
        &self.columns
    }

    pub fn column(&self, name: &str) -> Option<&ColumnMetadata> {
        self.by_name
            .get(&name.to_ascii_lowercase())
            .and_then(|&i| self.columns.get(i))
    }

    /// Column charset. Unknown columns fall back to the table charset;
    /// known columns without a collation have none.
    pub fn col_charset(&self, column: &str) -> Option<String> {
        match self.column(column) {
            Some(meta) => meta.charset(),
            None => self.charset.clone(),
        }
    }

    pub fn col_length(&self, column: &str) -> Option<ColumnLength> {
        self.column(column).and_then(ColumnMetadata::length)
    }

    /// Every non-empty collation declared on the table.
    pub fn collations(&self) -> impl Iterator<Item = &str> {
        self.columns
            .iter()
            .filter_map(|c| c.collation.as_deref())
            .filter(|c| !c.is_empty())
    }
}

fn resolve_charsets(mut charsets: BTreeSet<String>) -> Option<String> {
    match charsets.len() {
        0 => None,
        1 => charsets.into_iter().next(),
        _ => {
            charsets.remove("latin1");
            if charsets.len() == 1 {
                return charsets.into_iter().next();
            }
            let utf8_pair = charsets.len() == 2
                && charsets.contains("utf8")
                && charsets.contains("utf8mb4");
            if utf8_pair {
                Some("utf8".to_string())
            } else {
                Some("ascii".to_string())
            }
        }
    }
}

/// Read-mostly cache of table metadata keyed by lowercased table name.
///
/// Lookups share a read lock. Population takes the write lock and checks
/// again before loading, so a table is introspected at most once even when
/// several holders race on it.
#[derive(Debug, Default)]
pub struct SchemaCharsetCache {
    tables: RwLock<HashMap<String, Arc<TableMeta>>>,
}

impl SchemaCharsetCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn get(&self, table: &str) -> Option<Arc<TableMeta>> {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        tables.get(&table.to_ascii_lowercase()).cloned()
    }

    /// Returns the cached metadata, running `load` on a miss.
    pub fn get_or_load<F>(&self, table: &str, load: F) -> Result<Arc<TableMeta>>
    where
        F: FnOnce() -> Result<Vec<ColumnDescriptor>>,
    {
        if let Some(meta) = self.get(table) {
            return Ok(meta);
        }

        let key = table.to_ascii_lowercase();
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(meta) = tables.get(&key) {
            return Ok(Arc::clone(meta));
        }

        let meta = Arc::new(TableMeta::from_columns(table, load()?)?);
        debug!(table, charset = ?meta.charset(), "Cached table charset");
        tables.insert(key, Arc::clone(&meta));
        Ok(meta)
    }

    /// Seeds an entry without introspection.
    pub fn insert(&self, meta: TableMeta) {
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        tables.insert(meta.table.to_ascii_lowercase(), Arc::new(meta));
    }

    /// Drops one table's entry. Returns whether it was cached.
    pub fn invalidate(&self, table: &str) -> bool {
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        tables.remove(&table.to_ascii_lowercase()).is_some()
    }

    pub fn clear(&self) {
        self.tables
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn len(&self) -> usize {
        self.tables.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

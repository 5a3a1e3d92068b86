/// Query Result Module
///
/// Values, rows and the result shapes callers can ask for. A `QueryResult`
/// is produced per executed statement and replaced by the next one.

use serde::ser::{Serialize, SerializeMap, Serializer};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// A single value read from the server.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            Value::Bytes(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Float(f) => Some(*f as i64),
            Value::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Empty text counts as "no value" for scalar reads.
    pub fn is_empty_text(&self) -> bool {
        match self {
            Value::Text(s) => s.is_empty(),
            Value::Bytes(b) => b.is_empty(),
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(v) => write!(f, "{}", v),
            Value::Text(s) => write!(f, "{}", s),
            Value::Bytes(b) => write!(f, "{}", String::from_utf8_lossy(b)),
        }
    }
}

/// One result row. Column names are shared across all rows of a result.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Arc<[String]>,
    values: Vec<Value>,
}

impl Row {
    pub fn new(columns: Arc<[String]>, values: Vec<Value>) -> Self {
        Row { columns, values }
    }

    /// Looks a value up by column name (last duplicate name wins).
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns
            .iter()
            .rposition(|c| c == column)
            .and_then(|i| self.values.get(i))
    }

    pub fn get_index(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Column name / value pairs in column order.
    pub fn to_assoc(&self) -> Vec<(String, Value)> {
        self.columns
            .iter()
            .cloned()
            .zip(self.values.iter().cloned())
            .collect()
    }
}

impl Serialize for Row {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.values.len()))?;
        for (column, value) in self.columns.iter().zip(&self.values) {
            map.serialize_entry(column, value)?;
        }
        map.end()
    }
}

/// Result shape selected per call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Output {
    /// Row objects
    #[default]
    Object,
    /// Row objects keyed by the first column
    ObjectKeyed,
    /// Column name / value pairs per row
    ArrayA,
    /// Positional values per row
    ArrayN,
}

/// A full result set in the requested shape.
#[derive(Debug, Clone, PartialEq)]
pub enum Results {
    Objects(Vec<Row>),
    Keyed(Vec<(String, Row)>),
    Assoc(Vec<Vec<(String, Value)>>),
    Positional(Vec<Vec<Value>>),
}

impl Results {
    pub fn len(&self) -> usize {
        match self {
            Results::Objects(rows) => rows.len(),
            Results::Keyed(rows) => rows.len(),
            Results::Assoc(rows) => rows.len(),
            Results::Positional(rows) => rows.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Serializes the result set to JSON.
    pub fn to_json(&self) -> serde_json::Result<String> {
        match self {
            Results::Objects(rows) => serde_json::to_string(rows),
            Results::Keyed(rows) => {
                let map: serde_json::Map<String, serde_json::Value> = rows
                    .iter()
                    .map(|(k, row)| Ok((k.clone(), serde_json::to_value(row)?)))
                    .collect::<serde_json::Result<_>>()?;
                serde_json::to_string(&map)
            }
            Results::Assoc(rows) => {
                let maps: Vec<serde_json::Map<String, serde_json::Value>> = rows
                    .iter()
                    .map(|row| {
                        row.iter()
                            .map(|(k, v)| Ok((k.clone(), serde_json::to_value(v)?)))
                            .collect::<serde_json::Result<_>>()
                    })
                    .collect::<serde_json::Result<_>>()?;
                serde_json::to_string(&maps)
            }
            Results::Positional(rows) => serde_json::to_string(rows),
        }
    }
}

/// A single row in the requested shape.
#[derive(Debug, Clone, PartialEq)]
pub enum RowShape {
    Object(Row),
    Assoc(Vec<(String, Value)>),
    Positional(Vec<Value>),
}

/// What a statement did, by statement class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
    /// `CREATE`, `ALTER`, `TRUNCATE`, `DROP`
    Schema,
    /// `INSERT`, `DELETE`, `UPDATE`, `REPLACE`
    Affected(u64),
    /// Everything else: number of rows read
    Rows(usize),
}

/// Represents the result of one executed statement.
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    /// Column names from the query result
    pub columns: Vec<String>,
    /// Rows of data
    pub rows: Vec<Row>,
    /// Rows changed by a write
    pub rows_affected: u64,
    /// Id generated by an `INSERT`/`REPLACE`
    pub insert_id: u64,
}

impl QueryResult {
    /// Creates a new QueryResult from column names and positional row data
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        let shared: Arc<[String]> = columns.clone().into();
        let rows = rows
            .into_iter()
            .map(|values| Row::new(Arc::clone(&shared), values))
            .collect();
        QueryResult {
            columns,
            rows,
            rows_affected: 0,
            insert_id: 0,
        }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Reshapes every row. Keyed output lets a later duplicate key replace
    /// the earlier row while keeping the first key's position.
    pub fn shape(&self, output: Output) -> Results {
        match output {
            Output::Object => Results::Objects(self.rows.clone()),
            Output::ObjectKeyed => {
                let mut keyed: Vec<(String, Row)> = Vec::with_capacity(self.rows.len());
                let mut positions: HashMap<String, usize> = HashMap::new();
                for row in &self.rows {
                    let key = row.get_index(0).map(|v| v.to_string()).unwrap_or_default();
                    match positions.get(&key) {
                        Some(&pos) => keyed[pos].1 = row.clone(),
                        None => {
                            positions.insert(key.clone(), keyed.len());
                            keyed.push((key, row.clone()));
                        }
                    }
                }
                Results::Keyed(keyed)
            }
            Output::ArrayA => Results::Assoc(self.rows.iter().map(Row::to_assoc).collect()),
            Output::ArrayN => {
                Results::Positional(self.rows.iter().map(|r| r.values().to_vec()).collect())
            }
        }
    }

    /// Row `y` in the requested shape. Keyed output reads as a plain object.
    pub fn row(&self, output: Output, y: usize) -> Option<RowShape> {
        let row = self.rows.get(y)?;
        Some(match output {
            Output::Object | Output::ObjectKeyed => RowShape::Object(row.clone()),
            Output::ArrayA => RowShape::Assoc(row.to_assoc()),
            Output::ArrayN => RowShape::Positional(row.values().to_vec()),
        })
    }

    /// Every value of column `x`.
    pub fn column(&self, x: usize) -> Vec<Value> {
        self.rows
            .iter()
            .map(|r| r.get_index(x).cloned().unwrap_or(Value::Null))
            .collect()
    }

    /// The value at column `x` of row `y`; empty text reads as `None`.
    pub fn var(&self, x: usize, y: usize) -> Option<Value> {
        let value = self.rows.get(y)?.get_index(x)?;
        if value.is_null() || value.is_empty_text() {
            None
        } else {
            Some(value.clone())
        }
    }
}

/// Text Sanitizer
///
/// Validates and truncates text values against a column's charset and
/// length ceiling. `latin1`, pure ASCII and the utf8 family are handled
/// locally; values in any other charset are transcoded by the server in one
/// batched `SELECT` per call.

use crate::core::db::{ColumnLength, LengthKind, Value};
use crate::core::{DbError, Result};
use crate::placeholder::{Arg, Format};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

static CHARSET_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_]+$").expect("valid regex"));

/// A value on its way into a column, with the metadata that constrains it.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldValue {
    pub name: String,
    pub value: Arg,
    pub format: Format,
    /// `None` means the column has no text charset.
    pub charset: Option<String>,
    pub length: Option<ColumnLength>,
    /// `Some(_)` when the caller already knows whether the value is ASCII.
    pub ascii: Option<bool>,
}

impl FieldValue {
    pub fn new(name: impl Into<String>, value: impl Into<Arg>) -> Self {
        FieldValue {
            name: name.into(),
            value: value.into(),
            format: Format::Str,
            charset: None,
            length: None,
            ascii: None,
        }
    }

    pub fn with_charset(mut self, charset: impl Into<String>) -> Self {
        self.charset = Some(charset.into());
        self
    }

    pub fn with_length(mut self, length: ColumnLength) -> Self {
        self.length = Some(length);
        self
    }
}

/// Result of local processing for one value.
#[derive(Debug, Clone, PartialEq)]
enum Local {
    Done(Arg),
    Server,
}

/// A batched conversion statement: a template with one `%s` per value.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversionQuery {
    pub template: String,
    pub args: Vec<Arg>,
}

/// Strips text a column cannot store.
#[derive(Debug, Clone)]
pub struct TextSanitizer {
    connection_charset: String,
}

impl TextSanitizer {
    /// `connection_charset` is the charset server-side conversions end in.
    pub fn new(connection_charset: impl Into<String>) -> Self {
        TextSanitizer {
            connection_charset: connection_charset.into(),
        }
    }

    pub fn connection_charset(&self) -> &str {
        &self.connection_charset
    }

    /// Returns the fields with every value made storable.
    ///
    /// `transcode` is called at most once, with a single `SELECT` covering
    /// every value that needs the server, and must return that row's values
    /// in column order (or `None` when no row came back).
    pub fn strip_invalid_text<F>(&self, mut fields: Vec<FieldValue>, transcode: F) -> Result<Vec<FieldValue>>
    where
        F: FnOnce(&ConversionQuery) -> Result<Option<Vec<Value>>>,
    {
        let mut pending = Vec::new();
        for (idx, field) in fields.iter_mut().enumerate() {
            match strip_local(&field.value, field.charset.as_deref(), field.length, field.ascii) {
                Local::Done(value) => field.value = value,
                Local::Server => pending.push(idx),
            }
        }

        let mut columns = Vec::new();
        let mut args = Vec::new();
        let mut targets = Vec::new();
        for idx in pending {
            let field = &fields[idx];
            let charset = match field.length {
                Some(ColumnLength { kind: LengthKind::Byte, .. }) => "binary",
                _ => field.charset.as_deref().unwrap_or("binary"),
            };
            let Some(expr) = self.conversion_expr(&field.name, charset, field.length)? else {
                continue;
            };
            columns.push(format!("{} AS x_{}", expr, idx));
            args.push(field.value.clone());
            targets.push(idx);
        }

        if targets.is_empty() {
            return Ok(fields);
        }

        let query = ConversionQuery {
            template: format!("SELECT {}", columns.join(", ")),
            args,
        };
        debug!(values = targets.len(), "Transcoding values on the server");
        let row = transcode(&query)?.ok_or_else(|| {
            DbError::InvalidData("Could not strip invalid text: no row returned".to_string())
        })?;

        for (position, idx) in targets.into_iter().enumerate() {
            let value = row.get(position).ok_or_else(|| {
                DbError::InvalidData(format!(
                    "Could not strip invalid text: missing value for {}",
                    fields[idx].name
                ))
            })?;
            fields[idx].value = match value {
                Value::Null => Arg::Null,
                Value::Bytes(b) => match String::from_utf8(b.clone()) {
                    Ok(text) => Arg::Str(text),
                    Err(_) => Arg::Bytes(b.clone()),
                },
                other => Arg::Str(other.to_string()),
            };
        }

        Ok(fields)
    }

    /// `CONVERT` expression for one value, or `None` when a binary value
    /// has no ceiling to apply.
    fn conversion_expr(&self, field: &str, charset: &str, length: Option<ColumnLength>) -> Result<Option<String>> {
        for name in [charset, self.connection_charset.as_str()] {
            if !CHARSET_NAME.is_match(name) {
                return Err(DbError::CharsetResolution {
                    table: field.to_string(),
                    message: format!("invalid charset name '{}'", name),
                });
            }
        }
        let conn = &self.connection_charset;
        Ok(match length {
            Some(length) => Some(format!(
                "CONVERT( LEFT( CONVERT( %s USING {} ), {} ) USING {} )",
                charset, length.max, conn
            )),
            None if charset != "binary" => Some(format!(
                "CONVERT( CONVERT( %s USING {} ) USING {} )",
                charset, conn
            )),
            None => None,
        })
    }
}

/// Local handling for one value.
fn strip_local(value: &Arg, charset: Option<&str>, length: Option<ColumnLength>, ascii: Option<bool>) -> Local {
    let Some(charset) = charset else {
        return Local::Done(value.clone());
    };
    let bytes: &[u8] = match value {
        Arg::Str(s) => s.as_bytes(),
        Arg::Bytes(b) => b,
        other => return Local::Done(other.clone()),
    };

    let mut by_bytes = matches!(length, Some(ColumnLength { kind: LengthKind::Byte, .. }));
    let mut needs_validation = true;
    if charset == "latin1" || (ascii.is_none() && bytes.is_ascii()) {
        by_bytes = true;
        needs_validation = false;
    }

    let mut bytes = bytes.to_vec();
    if by_bytes {
        if let Some(length) = length {
            truncate_byte_vec(&mut bytes, length.max, value);
        }
        if !needs_validation {
            return Local::Done(rebuild(value, bytes));
        }
    }

    match charset {
        "utf8" | "utf8mb3" | "utf8mb4" => {
            let mut text = filter_utf8(&bytes, charset == "utf8mb4");
            if let Some(length) = length {
                truncate_chars(&mut text, length.max);
            }
            Local::Done(Arg::Str(text))
        }
        _ => Local::Server,
    }
}

/// Byte truncation. Text keeps a whole last character.
fn truncate_byte_vec(bytes: &mut Vec<u8>, max: u64, original: &Arg) {
    let max = usize::try_from(max).unwrap_or(usize::MAX);
    if bytes.len() <= max {
        return;
    }
    match original {
        Arg::Str(s) => {
            let cut = floor_char_boundary(s, max);
            bytes.truncate(cut);
        }
        _ => bytes.truncate(max),
    }
}

fn rebuild(original: &Arg, bytes: Vec<u8>) -> Arg {
    match original {
        Arg::Str(_) => Arg::Str(String::from_utf8_lossy(&bytes).into_owned()),
        _ => Arg::Bytes(bytes),
    }
}

/// Largest char boundary not past `max`.
pub fn floor_char_boundary(s: &str, max: usize) -> usize {
    if max >= s.len() {
        return s.len();
    }
    let mut cut = max;
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    cut
}

/// Truncates `s` to at most `max` bytes without splitting a character.
pub fn truncate_bytes(s: &str, max: u64) -> &str {
    let max = usize::try_from(max).unwrap_or(usize::MAX);
    &s[..floor_char_boundary(s, max)]
}

/// Truncates to at most `max` characters.
pub fn truncate_chars(s: &mut String, max: u64) {
    let max = usize::try_from(max).unwrap_or(usize::MAX);
    if let Some((cut, _)) = s.char_indices().nth(max) {
        s.truncate(cut);
    }
}

/// Keeps well-formed UTF-8 sequences and drops everything else byte by
/// byte. Four-byte sequences survive only when `allow_4byte` is set.
pub fn filter_utf8(bytes: &[u8], allow_4byte: bool) -> String {
    let mut out = String::with_capacity(bytes.len());
    let mut rest = bytes;
    while !rest.is_empty() {
        match std::str::from_utf8(rest) {
            Ok(valid) => {
                push_filtered(&mut out, valid, allow_4byte);
                break;
            }
            Err(err) => {
                let (valid, after) = rest.split_at(err.valid_up_to());
                if let Ok(valid) = std::str::from_utf8(valid) {
                    push_filtered(&mut out, valid, allow_4byte);
                }
                let skip = err.error_len().unwrap_or(after.len());
                rest = &after[skip..];
            }
        }
    }
    out
}

fn push_filtered(out: &mut String, valid: &str, allow_4byte: bool) {
    if allow_4byte {
        out.push_str(valid);
    } else {
        out.extend(valid.chars().filter(|c| c.len_utf8() < 4));
    }
}

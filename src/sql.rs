/// SQL Text Helpers
///
/// Quoting and escaping primitives, statement classification, and the
/// heuristic table-name extraction used to pick a charset for raw queries.
/// Nothing here parses SQL; the patterns pin down the statement shapes the
/// rest of the crate cares about and nothing more.

use once_cell::sync::Lazy;
use regex::Regex;

/// How string literals are escaped before being wrapped in single quotes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EscapeStyle {
    /// Quotes are doubled; backslash is an ordinary character.
    #[default]
    Standard,
    /// MySQL's default mode: backslash starts an escape sequence, so it and
    /// the control characters are escaped too. Quotes are still doubled.
    Backslash,
}

/// Escapes a string literal body (without the surrounding quotes).
pub fn escape_string(value: &str, style: EscapeStyle) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    for c in value.chars() {
        match (style, c) {
            (_, '\'') => out.push_str("''"),
            (EscapeStyle::Backslash, '\\') => out.push_str("\\\\"),
            (EscapeStyle::Backslash, '\0') => out.push_str("\\0"),
            (EscapeStyle::Backslash, '\n') => out.push_str("\\n"),
            (EscapeStyle::Backslash, '\r') => out.push_str("\\r"),
            (EscapeStyle::Backslash, '\x1a') => out.push_str("\\Z"),
            (EscapeStyle::Backslash, '"') => out.push_str("\\\""),
            _ => out.push(c),
        }
    }
    out
}

/// Escapes and single-quotes a string literal.
pub fn quote_string(value: &str, style: EscapeStyle) -> String {
    format!("'{}'", escape_string(value, style))
}

/// Wraps an identifier in backticks, doubling embedded backticks.
pub fn quote_identifier(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

/// Quotes each dot-separated part of `schema.table` separately.
pub fn quote_qualified_identifier(name: &str) -> String {
    name.split('.').map(quote_identifier).collect::<Vec<_>>().join(".")
}

/// Escapes `\`, `%` and `_` so text matches literally inside `LIKE`.
pub fn esc_like(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// True when the text is pure 7-bit.
pub fn check_ascii(text: &str) -> bool {
    text.is_ascii()
}

static SCHEMA_STATEMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*(?:create|alter|truncate|drop)\s").expect("valid regex"));
static WRITE_STATEMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*(?:insert|delete|update|replace)\s").expect("valid regex"));
static INSERT_STATEMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*(?:insert|replace)\s").expect("valid regex"));
static NON_READING_STATEMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(?:SHOW|DESCRIBE|DESC|EXPLAIN|CREATE)\s").expect("valid regex"));

/// `CREATE`, `ALTER`, `TRUNCATE` or `DROP`.
pub fn is_schema_statement(sql: &str) -> bool {
    SCHEMA_STATEMENT.is_match(sql)
}

/// `INSERT`, `DELETE`, `UPDATE` or `REPLACE`.
pub fn is_write_statement(sql: &str) -> bool {
    WRITE_STATEMENT.is_match(sql)
}

/// `INSERT` or `REPLACE`, the statements that generate ids.
pub fn is_insert_statement(sql: &str) -> bool {
    INSERT_STATEMENT.is_match(sql)
}

/// Statements whose text never needs charset checking.
pub fn is_non_reading_statement(sql: &str) -> bool {
    NON_READING_STATEMENT.is_match(sql.trim_start_matches(['\r', '\n', '\t', ' ', '(']))
}

const TABLE_NAME: &str = r"((?:[0-9a-zA-Z$_.`\-]|[\x{80}-\x{7FF}])+)";

static COMMON_DML: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        r"(?is)^\s*(?:SELECT.*?\s+FROM|INSERT(?:\s+LOW_PRIORITY|\s+DELAYED|\s+HIGH_PRIORITY)?(?:\s+IGNORE)?(?:\s+INTO)?|REPLACE(?:\s+LOW_PRIORITY|\s+DELAYED)?(?:\s+INTO)?|UPDATE(?:\s+LOW_PRIORITY)?(?:\s+IGNORE)?|DELETE(?:\s+LOW_PRIORITY|\s+QUICK|\s+IGNORE)*(?:.+?FROM)?)\s+{}",
        TABLE_NAME
    ))
    .expect("valid regex")
});

static SHOW_WHERE_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?is)^\s*SHOW\s+(?:TABLE\s+STATUS|(?:FULL\s+)?TABLES).+WHERE\s+Name\s*=\s*(?:"((?:[0-9a-zA-Z$_.\-]|[\x{80}-\x{7FF}])+)"|'((?:[0-9a-zA-Z$_.\-]|[\x{80}-\x{7FF}])+)')"#,
    )
    .expect("valid regex")
});

static SHOW_LIKE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?is)^\s*SHOW\s+(?:TABLE\s+STATUS|(?:FULL\s+)?TABLES)\s+(?:WHERE\s+Name\s+)?LIKE\s*(?:"((?:[\\0-9a-zA-Z$_.\-]|[\x{80}-\x{7FF}])+)%?"|'((?:[\\0-9a-zA-Z$_.\-]|[\x{80}-\x{7FF}])+)%?')"#,
    )
    .expect("valid regex")
});

static TABLE_STATEMENTS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        r"(?is)^\s*(?:(?:EXPLAIN\s+(?:EXTENDED\s+)?)?SELECT.*?\s+FROM|DESCRIBE|DESC|EXPLAIN|HANDLER|(?:LOCK|UNLOCK)\s+TABLE(?:S)?|(?:RENAME|OPTIMIZE|BACKUP|RESTORE|CHECK|CHECKSUM|ANALYZE|REPAIR).*\s+TABLE|TRUNCATE(?:\s+TABLE)?|CREATE(?:\s+TEMPORARY)?\s+TABLE(?:\s+IF\s+NOT\s+EXISTS)?|ALTER(?:\s+IGNORE)?\s+TABLE|DROP\s+TABLE(?:\s+IF\s+EXISTS)?|CREATE(?:\s+\w+)?\s+INDEX.*\s+ON|DROP\s+INDEX.*\s+ON|LOAD\s+DATA.*INFILE.*INTO\s+TABLE|(?:GRANT|REVOKE).*ON\s+TABLE|SHOW\s+(?:.*FULL\s+)?TABLES.*(?:FROM|IN))\s+\(*\s*{}\s*\)*",
        TABLE_NAME
    ))
    .expect("valid regex")
});

/// Replaces every innermost parenthesized run that is not a sub-`SELECT`
/// with `()`, so column lists and function arguments cannot be mistaken for
/// table references.
fn collapse_parentheses(query: &str) -> String {
    let mut out = String::with_capacity(query.len());
    let mut rest = query;
    while let Some(open) = rest.find('(') {
        out.push_str(&rest[..open]);
        let inner = &rest[open + 1..];
        let subselect = inner
            .trim_start()
            .get(..6)
            .map_or(false, |word| word.eq_ignore_ascii_case("select"));
        match inner.find(['(', ')']) {
            Some(i) if !subselect && inner[i..].starts_with(')') => {
                out.push_str("()");
                rest = &inner[i + 1..];
            }
            _ => {
                out.push('(');
                rest = inner;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Guesses the table a statement targets. First match wins; multi-table
/// statements report only the first table found.
pub fn get_table_from_query(query: &str) -> Option<String> {
    let query = query.trim_end_matches([';', '/', '-', '#']);
    // (select ...) union (...) reports the first query's table
    let query = query.trim_start_matches(['\r', '\n', '\t', ' ', '(']);
    let query = collapse_parentheses(query);

    if let Some(caps) = COMMON_DML.captures(&query) {
        return caps.get(1).map(|m| m.as_str().replace('`', ""));
    }

    if let Some(caps) = SHOW_WHERE_NAME.captures(&query) {
        return caps.get(1).or_else(|| caps.get(2)).map(|m| m.as_str().to_string());
    }

    // A LIKE operand is usually a prefix pattern; report it unescaped so
    // callers can route on the prefix.
    if let Some(caps) = SHOW_LIKE.captures(&query) {
        return caps
            .get(1)
            .or_else(|| caps.get(2))
            .map(|m| m.as_str().replace("\\_", "_"));
    }

    if let Some(caps) = TABLE_STATEMENTS.captures(&query) {
        return caps.get(1).map(|m| m.as_str().replace('`', ""));
    }

    None
}

/// Placeholder Compiler
///
/// Compiles a query template with typed placeholders into escaped SQL.
///
/// A placeholder is `%[n$][flags][width]['pad][.precision]` followed by one
/// of `d` (integer), `f`/`F` (float, always rendered with a `.` decimal
/// point), `s` (string value) or `i` (identifier). `%%` is a literal percent
/// sign and any other `%` that does not start a placeholder is passed
/// through as a literal.
///
/// Compiled text carries every literal `%` as a process-wide escape token so
/// that it can be fed through a second compile without being read as a
/// placeholder. [`Prepared::into_sql`] restores the percents; the database
/// does the same right before execution.

use crate::core::PrepareError;
use crate::sql::{escape_string, EscapeStyle};
use chrono::Utc;
use serde::Deserialize;
use once_cell::sync::Lazy;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use tracing::warn;
use uuid::Uuid;

static ESCAPE_TOKEN: Lazy<String> = Lazy::new(|| {
    let secret = Uuid::new_v4();
    let stamp = Utc::now().timestamp_micros();
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.update(stamp.to_le_bytes());
    hasher.update(secret.as_bytes());
    let digest = hasher.finalize();
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    format!("{{{}}}", hex)
});

/// The token standing in for a literal `%` in compiled text.
pub fn escape_token() -> &'static str {
    &ESCAPE_TOKEN
}

/// Replaces every `%` with the escape token.
pub fn add_placeholder_escape(text: &str) -> String {
    text.replace('%', escape_token())
}

/// Restores every escape token to `%`.
pub fn remove_placeholder_escape(text: &str) -> String {
    text.replace(escape_token(), "%")
}

/// An argument for a placeholder.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    /// A whole argument list passed as one value.
    List(Vec<Arg>),
}

impl Arg {
    pub fn is_null(&self) -> bool {
        matches!(self, Arg::Null)
    }

    /// Text content of string-like arguments.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Arg::Str(s) => Some(s),
            _ => None,
        }
    }

    fn to_int(&self) -> i64 {
        match self {
            Arg::Null | Arg::List(_) => 0,
            Arg::Bool(b) => i64::from(*b),
            Arg::Int(i) => *i,
            Arg::Float(f) => *f as i64,
            Arg::Str(s) => leading_int(s),
            Arg::Bytes(b) => leading_int(&String::from_utf8_lossy(b)),
        }
    }

    fn to_float(&self) -> f64 {
        match self {
            Arg::Null | Arg::List(_) => 0.0,
            Arg::Bool(b) => f64::from(u8::from(*b)),
            Arg::Int(i) => *i as f64,
            Arg::Float(f) => *f,
            Arg::Str(s) => leading_float(s),
            Arg::Bytes(b) => leading_float(&String::from_utf8_lossy(b)),
        }
    }

    fn to_text(&self) -> String {
        match self {
            Arg::Null => String::new(),
            Arg::Bool(true) => "1".to_string(),
            Arg::Bool(false) => String::new(),
            Arg::Int(i) => i.to_string(),
            Arg::Float(f) => f.to_string(),
            Arg::Str(s) => s.clone(),
            Arg::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
            Arg::List(_) => {
                warn!("Unsupported value type (list) passed as a placeholder argument");
                String::new()
            }
        }
    }
}

impl From<i64> for Arg {
    fn from(v: i64) -> Self {
        Arg::Int(v)
    }
}

impl From<i32> for Arg {
    fn from(v: i32) -> Self {
        Arg::Int(i64::from(v))
    }
}

impl From<u32> for Arg {
    fn from(v: u32) -> Self {
        Arg::Int(i64::from(v))
    }
}

impl From<u64> for Arg {
    fn from(v: u64) -> Self {
        i64::try_from(v).map(Arg::Int).unwrap_or(Arg::Float(v as f64))
    }
}

impl From<f64> for Arg {
    fn from(v: f64) -> Self {
        Arg::Float(v)
    }
}

impl From<bool> for Arg {
    fn from(v: bool) -> Self {
        Arg::Bool(v)
    }
}

impl From<&str> for Arg {
    fn from(v: &str) -> Self {
        Arg::Str(v.to_string())
    }
}

impl From<String> for Arg {
    fn from(v: String) -> Self {
        Arg::Str(v)
    }
}

impl From<Vec<u8>> for Arg {
    fn from(v: Vec<u8>) -> Self {
        Arg::Bytes(v)
    }
}

impl<T: Into<Arg>> From<Option<T>> for Arg {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Arg::Null)
    }
}

impl From<crate::core::db::Value> for Arg {
    fn from(v: crate::core::db::Value) -> Self {
        use crate::core::db::Value;
        match v {
            Value::Null => Arg::Null,
            Value::Int(i) => Arg::Int(i),
            Value::Float(f) => Arg::Float(f),
            Value::Text(s) => Arg::Str(s),
            Value::Bytes(b) => Arg::Bytes(b),
        }
    }
}

/// Builds a `Vec<Arg>` from heterogeneous values.
#[macro_export]
macro_rules! args {
    () => { ::std::vec::Vec::<$crate::placeholder::Arg>::new() };
    ($($value:expr),+ $(,)?) => {
        vec![$($crate::placeholder::Arg::from($value)),+]
    };
}

/// Compiled SQL with literal percents still escaped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prepared {
    escaped: String,
}

impl Prepared {
    /// The compiled text with escape tokens in place of `%`.
    pub fn escaped(&self) -> &str {
        &self.escaped
    }

    /// Final SQL for the execution boundary.
    pub fn into_sql(self) -> String {
        remove_placeholder_escape(&self.escaped)
    }

    pub fn to_sql(&self) -> String {
        remove_placeholder_escape(&self.escaped)
    }
}

impl AsRef<str> for Prepared {
    fn as_ref(&self) -> &str {
        &self.escaped
    }
}

impl fmt::Display for Prepared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_sql())
    }
}

impl PartialEq<&str> for Prepared {
    fn eq(&self, other: &&str) -> bool {
        self.to_sql() == *other
    }
}

/// Value format of a CRUD field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(try_from = "String")]
pub enum Format {
    /// `%d`
    Int,
    /// `%f`
    Float,
    /// `%s`
    #[default]
    Str,
}

impl Format {
    pub fn placeholder(self) -> &'static str {
        match self {
            Format::Int => "%d",
            Format::Float => "%f",
            Format::Str => "%s",
        }
    }

    /// Numeric fields never carry a charset.
    pub fn is_numeric(self) -> bool {
        matches!(self, Format::Int | Format::Float)
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.placeholder())
    }
}

impl FromStr for Format {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "%d" => Ok(Format::Int),
            "%f" | "%F" => Ok(Format::Float),
            "%s" => Ok(Format::Str),
            other => Err(format!("Unknown field format '{}'", other)),
        }
    }
}

impl TryFrom<String> for Format {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Placeholder role, decided by the conversion character.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Identifier,
    Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Conversion {
    Int,
    Float,
    Str,
    Ident,
}

/// `[flags][width][.precision]` after the optional `n$`.
#[derive(Debug, Clone, Default, PartialEq)]
struct Modifiers {
    left_align: bool,
    plus_sign: bool,
    pad: Option<char>,
    width: usize,
    precision: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
struct Placeholder {
    /// Token text as written, e.g. `%1$s`
    raw: String,
    argnum: Option<usize>,
    /// Everything between `%`/`n$` and the conversion character
    format: String,
    modifiers: Modifiers,
    conversion: Conversion,
}

impl Placeholder {
    fn role(&self) -> Role {
        match self.conversion {
            Conversion::Ident => Role::Identifier,
            _ => Role::Value,
        }
    }

    fn has_format(&self) -> bool {
        self.argnum.is_some() || !self.format.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    Placeholder(Placeholder),
}

/// Tries to read a placeholder body starting right after a `%`.
/// Returns the placeholder and the number of bytes consumed.
fn parse_placeholder(body: &str) -> Option<(Placeholder, usize)> {
    let bytes = body.as_bytes();
    let mut pos = 0;

    let mut argnum = None;
    if matches!(bytes.first(), Some(b'1'..=b'9')) {
        let mut end = 1;
        while bytes.get(end).map_or(false, u8::is_ascii_digit) {
            end += 1;
        }
        if bytes.get(end) == Some(&b'$') {
            argnum = body[..end].parse::<usize>().ok();
            pos = end + 1;
        }
    }

    let format_start = pos;
    let sign_digits = |pos: &mut usize| {
        while matches!(bytes.get(*pos), Some(b'-' | b'+' | b'0'..=b'9')) {
            *pos += 1;
        }
    };
    sign_digits(&mut pos);
    match bytes.get(pos) {
        Some(b' ') | Some(b'0') => pos += 1,
        Some(b'\'') => {
            let pad = body[pos + 1..].chars().next()?;
            if pad == '\n' {
                return None;
            }
            pos += 1 + pad.len_utf8();
        }
        _ => {}
    }
    sign_digits(&mut pos);
    if bytes.get(pos) == Some(&b'.') && bytes.get(pos + 1).map_or(false, u8::is_ascii_digit) {
        pos += 1;
        while bytes.get(pos).map_or(false, u8::is_ascii_digit) {
            pos += 1;
        }
    }

    let conversion = match bytes.get(pos) {
        Some(b'd') => Conversion::Int,
        Some(b'f') | Some(b'F') => Conversion::Float,
        Some(b's') => Conversion::Str,
        Some(b'i') => Conversion::Ident,
        _ => return None,
    };
    let format = body[format_start..pos].to_string();
    let modifiers = parse_modifiers(&format);
    let raw = format!("%{}", &body[..=pos]);

    Some((
        Placeholder {
            raw,
            argnum,
            format,
            modifiers,
            conversion,
        },
        pos + 1,
    ))
}

/// Reads flags the way `sprintf` does: flag characters, then width, then
/// precision. Anything after that is ignored.
fn parse_modifiers(format: &str) -> Modifiers {
    let mut modifiers = Modifiers::default();
    let mut chars = format.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            '-' => modifiers.left_align = true,
            '+' => modifiers.plus_sign = true,
            ' ' | '0' => modifiers.pad = Some(c),
            '\'' => {
                chars.next();
                modifiers.pad = chars.peek().copied();
            }
            _ => break,
        }
        chars.next();
    }

    let mut width = String::new();
    while let Some(&c) = chars.peek() {
        if !c.is_ascii_digit() {
            break;
        }
        width.push(c);
        chars.next();
    }
    modifiers.width = width.parse().unwrap_or(0);

    if chars.peek() == Some(&'.') {
        chars.next();
        let precision: String = chars.take_while(char::is_ascii_digit).collect();
        modifiers.precision = precision.parse().ok();
    }

    modifiers
}

/// Splits a template into literal and placeholder segments. `'%s'` and
/// `"%s"` lose their quotes first so quoting stays uniform.
fn tokenize(template: &str) -> Vec<Segment> {
    let template = template.replace("'%s'", "%s").replace("\"%s\"", "%s");
    let mut segments = Vec::new();
    let mut literal = String::new();
    let mut rest = template.as_str();

    while let Some(pos) = rest.find('%') {
        literal.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];
        if let Some(stripped) = after.strip_prefix('%') {
            literal.push('%');
            rest = stripped;
        } else if let Some((placeholder, consumed)) = parse_placeholder(after) {
            if !literal.is_empty() {
                segments.push(Segment::Literal(std::mem::take(&mut literal)));
            }
            segments.push(Segment::Placeholder(placeholder));
            rest = &after[consumed..];
        } else {
            // A stray percent stands for itself.
            literal.push('%');
            rest = after;
        }
    }
    literal.push_str(rest);
    if !literal.is_empty() {
        segments.push(Segment::Literal(literal));
    }
    segments
}

/// Compiles query templates into escaped SQL.
#[derive(Debug, Clone, Default)]
pub struct PlaceholderCompiler {
    allow_unsafe_unquoted: bool,
    escape_style: EscapeStyle,
}

impl PlaceholderCompiler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Legacy compatibility: plain `%s` placeholders (no modifiers) and
    /// `%s` directly after a literal percent are emitted without quotes,
    /// and `%f` directly after a literal percent is not a placeholder.
    pub fn allow_unsafe_unquoted(mut self, allow: bool) -> Self {
        self.allow_unsafe_unquoted = allow;
        self
    }

    pub fn with_escape_style(mut self, style: EscapeStyle) -> Self {
        self.escape_style = style;
        self
    }

    pub fn escape_style(&self) -> EscapeStyle {
        self.escape_style
    }

    pub fn set_escape_style(&mut self, style: EscapeStyle) {
        self.escape_style = style;
    }

    pub fn allows_unsafe_unquoted(&self) -> bool {
        self.allow_unsafe_unquoted
    }

    /// Escapes a string literal body the way `%s` does, without quotes.
    pub fn escape(&self, value: &str) -> String {
        add_placeholder_escape(&escape_string(value, self.escape_style))
    }

    /// Compiles `template` against `args`.
    ///
    /// A single `Arg::List` is unpacked into the argument list.
    pub fn compile(&self, template: &str, args: &[Arg]) -> Result<Prepared, PrepareError> {
        if !template.contains('%') {
            warn!(template, "The query argument must have a placeholder");
            return Err(PrepareError::MissingPlaceholder);
        }

        let (args, passed_as_list): (&[Arg], bool) = match args {
            [Arg::List(inner)] => (inner.as_slice(), true),
            _ => (args, false),
        };

        let segments = tokenize(template);

        // Legacy `%%%f`: an `f` right after a literal percent stays literal.
        let mut segments_resolved: Vec<Segment> = Vec::with_capacity(segments.len());
        for segment in segments {
            match segment {
                Segment::Placeholder(p)
                    if self.allow_unsafe_unquoted
                        && p.conversion == Conversion::Float
                        && ends_with_percent(&segments_resolved) =>
                {
                    push_literal(&mut segments_resolved, &p.raw);
                }
                other => segments_resolved.push(other),
            }
        }
        let segments = segments_resolved;

        // Assign argument positions.
        let mut next_sequential = 0;
        let mut bound: Vec<(usize, &Placeholder, bool)> = Vec::new();
        let mut preceded_by_percent = false;
        for segment in &segments {
            match segment {
                Segment::Literal(text) => preceded_by_percent = text.ends_with('%'),
                Segment::Placeholder(p) => {
                    let index = match p.argnum {
                        Some(n) => n - 1,
                        None => {
                            let i = next_sequential;
                            next_sequential += 1;
                            i
                        }
                    };
                    bound.push((index, p, preceded_by_percent));
                    preceded_by_percent = false;
                }
            }
        }
        let placeholder_count = bound.len();

        // Reject arguments used as both identifier and value.
        let mut roles: BTreeMap<usize, BTreeSet<u8>> = BTreeMap::new();
        let mut used: BTreeMap<usize, Vec<&str>> = BTreeMap::new();
        for (index, p, _) in &bound {
            let role = match p.role() {
                Role::Identifier => 0,
                Role::Value => 1,
            };
            roles.entry(*index).or_default().insert(role);
            used.entry(*index).or_default().push(&p.raw);
        }
        let conflicts: Vec<String> = roles
            .iter()
            .filter(|(_, r)| r.len() > 1)
            .map(|(index, _)| used[index].join(" and "))
            .collect();
        if !conflicts.is_empty() {
            let err = PrepareError::DualRoleConflict { conflicts };
            warn!(template, "{}", err);
            return Err(err);
        }

        if args.len() != placeholder_count {
            if placeholder_count == 1 && passed_as_list {
                let err = PrepareError::AmbiguousArity(args.len());
                warn!(template, "{}", err);
                return Err(err);
            }
            warn!(
                template,
                "The query does not contain the correct number of placeholders ({}) for the number of arguments passed ({})",
                placeholder_count,
                args.len()
            );
            if args.len() < placeholder_count {
                let max_numbered = bound.iter().filter_map(|(_, p, _)| p.argnum).max().unwrap_or(0);
                if max_numbered == 0 || args.len() < max_numbered {
                    return Err(PrepareError::ArgumentCountMismatch {
                        placeholders: placeholder_count,
                        arguments: args.len(),
                    });
                }
            }
        }

        let mut sql = String::with_capacity(template.len() + args.len() * 8);
        let missing = Arg::Null;
        let mut bound = bound.into_iter();
        for segment in &segments {
            match segment {
                Segment::Literal(text) => sql.push_str(text),
                Segment::Placeholder(_) => {
                    let Some((index, p, after_percent)) = bound.next() else {
                        break;
                    };
                    let arg = match args.get(index) {
                        Some(arg) => arg,
                        None => {
                            warn!(template, placeholder = %p.raw, "No argument for placeholder; rendering it empty");
                            &missing
                        }
                    };
                    sql.push_str(&self.render(p, arg, after_percent));
                }
            }
        }

        Ok(Prepared {
            escaped: add_placeholder_escape(&sql),
        })
    }

    fn render(&self, p: &Placeholder, arg: &Arg, after_percent: bool) -> String {
        let m = &p.modifiers;
        match p.conversion {
            Conversion::Int => pad_number(format_signed(arg.to_int().to_string(), m), m),
            Conversion::Float => pad_number(format_float(arg.to_float(), m), m),
            Conversion::Ident => {
                let name = arg.to_text().replace('`', "``");
                format!("`{}`", pad_text(&name, m))
            }
            Conversion::Str => {
                let escaped = pad_text(&escape_string(&arg.to_text(), self.escape_style), m);
                let unquoted =
                    self.allow_unsafe_unquoted && (!p.has_format() || after_percent);
                if unquoted {
                    escaped
                } else {
                    format!("'{}'", escaped)
                }
            }
        }
    }
}

fn ends_with_percent(segments: &[Segment]) -> bool {
    matches!(segments.last(), Some(Segment::Literal(text)) if text.ends_with('%'))
}

fn push_literal(segments: &mut Vec<Segment>, text: &str) {
    match segments.last_mut() {
        Some(Segment::Literal(existing)) => existing.push_str(text),
        _ => segments.push(Segment::Literal(text.to_string())),
    }
}

fn format_signed(digits: String, m: &Modifiers) -> String {
    if m.plus_sign && !digits.starts_with('-') {
        format!("+{}", digits)
    } else {
        digits
    }
}

fn format_float(value: f64, m: &Modifiers) -> String {
    let body = if value.is_nan() {
        "NAN".to_string()
    } else if value.is_infinite() {
        let inf = if value > 0.0 { "INF" } else { "-INF" };
        inf.to_string()
    } else {
        let precision = m.precision.unwrap_or(6).min(53);
        format!("{:.*}", precision, value)
    };
    format_signed(body, m)
}

/// Pads numbers; zero padding goes between the sign and the digits.
fn pad_number(text: String, m: &Modifiers) -> String {
    let len = text.chars().count();
    if len >= m.width {
        return text;
    }
    let fill = m.width - len;
    let pad = m.pad.unwrap_or(' ');
    if m.left_align {
        let pad = if pad == '0' { ' ' } else { pad };
        return format!("{}{}", text, pad.to_string().repeat(fill));
    }
    if pad == '0' && (text.starts_with('-') || text.starts_with('+')) {
        let (sign, digits) = text.split_at(1);
        return format!("{}{}{}", sign, "0".repeat(fill), digits);
    }
    format!("{}{}", pad.to_string().repeat(fill), text)
}

/// Applies precision (truncation) and width to text, counting characters.
fn pad_text(text: &str, m: &Modifiers) -> String {
    let truncated: String = match m.precision {
        Some(p) => text.chars().take(p).collect(),
        None => text.to_string(),
    };
    let len = truncated.chars().count();
    if len >= m.width {
        return truncated;
    }
    let fill = m.pad.unwrap_or(' ').to_string().repeat(m.width - len);
    if m.left_align {
        format!("{}{}", truncated, fill)
    } else {
        format!("{}{}", fill, truncated)
    }
}

fn leading_int(text: &str) -> i64 {
    let trimmed = text.trim_start();
    let mut end = 0;
    for (i, c) in trimmed.char_indices() {
        if c.is_ascii_digit() || (i == 0 && (c == '-' || c == '+')) {
            end = i + c.len_utf8();
        } else {
            break;
        }
    }
    trimmed[..end].parse().unwrap_or(0)
}

fn leading_float(text: &str) -> f64 {
    let trimmed = text.trim_start();
    let mut end = 0;
    let mut seen_dot = false;
    let mut seen_exp = false;
    let bytes = trimmed.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i];
        let ok = match c {
            b'0'..=b'9' => true,
            b'-' | b'+' => i == 0 || matches!(bytes[i - 1], b'e' | b'E'),
            b'.' if !seen_dot && !seen_exp => {
                seen_dot = true;
                true
            }
            b'e' | b'E' if !seen_exp && end > 0 => {
                seen_exp = true;
                true
            }
            _ => false,
        };
        if !ok {
            break;
        }
        i += 1;
        if c.is_ascii_digit() {
            end = i;
        }
    }
    trimmed[..end].parse().unwrap_or(0.0)
}

//! Parsing of the extended JSON Pointer syntax used by patch operations.
//!
//! On top of RFC 6901 this supports the `-` append marker and bracketed
//! array filters of the form `[?(@.field.path=='value')]`, which select
//! every array element whose field equals the literal.

use serde_json::Value;

use super::{Error, UnclosedBracketSnafu, UnsupportedFilterSnafu};

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Segment {
    /// Object key, `~0`/`~1` unescaped.
    Field(String),

    /// Numeric array index.
    Index(usize),

    /// The `-` array append marker.
    Append,

    /// `[?(@.field=='value')]`: selects all array elements whose field
    /// (dot path) equals the literal.
    Filter { field: Vec<String>, value: Value },
}

pub(crate) fn parse(path: &str) -> Result<Vec<Segment>, Error> {
    let trimmed = path.strip_prefix('/').unwrap_or(path);
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    trimmed.split('/').map(parse_segment).collect()
}

fn parse_segment(raw: &str) -> Result<Segment, Error> {
    if raw == "-" {
        return Ok(Segment::Append);
    }

    if raw.starts_with('[') {
        return parse_filter(raw);
    }

    if !raw.is_empty() && raw.bytes().all(|byte| byte.is_ascii_digit()) {
        if let Ok(index) = raw.parse::<usize>() {
            return Ok(Segment::Index(index));
        }
    }

    Ok(Segment::Field(unescape(raw)))
}

fn parse_filter(raw: &str) -> Result<Segment, Error> {
    let Some(inner) = raw.strip_suffix(")]") else {
        return UnclosedBracketSnafu { segment: raw }.fail();
    };
    let Some(expression) = inner.strip_prefix("[?(") else {
        return UnsupportedFilterSnafu { segment: raw }.fail();
    };

    // Only `@.field.path==literal` is supported
    let Some((field_path, literal)) = expression.split_once("==") else {
        return UnsupportedFilterSnafu { segment: raw }.fail();
    };
    let Some(field_path) = field_path.trim().strip_prefix("@.") else {
        return UnsupportedFilterSnafu { segment: raw }.fail();
    };
    if field_path.is_empty() || field_path.split('.').any(str::is_empty) {
        return UnsupportedFilterSnafu { segment: raw }.fail();
    }

    let field = field_path.split('.').map(str::to_owned).collect();
    let value = parse_literal(literal.trim(), raw)?;
    Ok(Segment::Filter { field, value })
}

fn parse_literal(literal: &str, segment: &str) -> Result<Value, Error> {
    for quote in ['\'', '"'] {
        if let Some(inner) = literal
            .strip_prefix(quote)
            .and_then(|rest| rest.strip_suffix(quote))
        {
            return Ok(Value::String(inner.to_owned()));
        }
    }

    match literal {
        "true" => Ok(Value::Bool(true)),
        "false" => Ok(Value::Bool(false)),
        _ => literal
            .parse::<i64>()
            .map(Value::from)
            .or_else(|_| literal.parse::<f64>().map(Value::from))
            .map_err(|_| UnsupportedFilterSnafu { segment }.build()),
    }
}

fn unescape(segment: &str) -> String {
    segment.replace("~1", "/").replace("~0", "~")
}

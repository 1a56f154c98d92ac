//! Identifier and value utilities.
//!
//! Every SQL fragment that references a table name must pass through
//! [`sanitize`]; direct concatenation of user input into SQL is forbidden
//! throughout the crate.

use uuid::Uuid;

use crate::error::{LtBaseError, Result};

/// Quote a dotted SQL identifier, one segment at a time.
///
/// Each segment is trimmed of whitespace and surrounding quotes, internal
/// quotes are doubled, and the segment is wrapped in double quotes. Empty
/// input (or input that is nothing but separators) yields an empty string.
/// The output is accepted unchanged by both PostgreSQL and DuckDB.
#[must_use]
pub fn sanitize(name: &str) -> String {
    let segments: Vec<String> = name
        .split('.')
        .map(|segment| segment.trim().trim_matches('"').trim())
        .filter(|segment| !segment.is_empty())
        .map(|segment| format!("\"{}\"", segment.replace('"', "\"\"")))
        .collect();

    segments.join(".")
}

/// Result of [`try_parse_number`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ParsedNumber {
    Int(i64),
    Float(f64),
}

/// Parse a string as a whole number if possible.
///
/// Returns `Int` if the entire string parses as an `i64`, otherwise `Float`
/// if it parses as an `f64`, otherwise `None` (the caller keeps the string).
#[must_use]
pub fn try_parse_number(s: &str) -> Option<ParsedNumber> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(i) = trimmed.parse::<i64>() {
        return Some(ParsedNumber::Int(i));
    }
    if let Ok(f) = trimmed.parse::<f64>() {
        return Some(ParsedNumber::Float(f));
    }
    None
}

/// Parse a UUID from its textual form.
///
/// Accepts hyphenated, simple, urn and braced forms; surrounding whitespace
/// is ignored.
pub fn to_uuid(value: &str) -> Result<Uuid> {
    Uuid::try_parse(value.trim()).map_err(|_| LtBaseError::InvalidUuid {
        value: value.to_string(),
    })
}

/// Coerce a byte slice into a UUID.
///
/// A slice of exactly 16 bytes is taken as the raw UUID; anything else is
/// treated as UTF-8 text and parsed via [`to_uuid`].
pub fn uuid_from_bytes(bytes: &[u8]) -> Result<Uuid> {
    if bytes.len() == 16 {
        let mut raw = [0u8; 16];
        raw.copy_from_slice(bytes);
        return Ok(Uuid::from_bytes(raw));
    }
    let text = std::str::from_utf8(bytes).map_err(|_| LtBaseError::InvalidUuid {
        value: format!("{} raw bytes", bytes.len()),
    })?;
    to_uuid(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_quotes_each_segment() {
        assert_eq!(sanitize("entity_main"), "\"entity_main\"");
        assert_eq!(sanitize("public.entity_main"), "\"public\".\"entity_main\"");
    }

    #[test]
    fn sanitize_trims_whitespace_and_quotes() {
        assert_eq!(sanitize("  \"entity_eav\" "), "\"entity_eav\"");
        assert_eq!(sanitize(" public . \"eav\" "), "\"public\".\"eav\"");
    }

    #[test]
    fn sanitize_empty_is_empty() {
        assert_eq!(sanitize(""), "");
        assert_eq!(sanitize("   "), "");
        assert_eq!(sanitize("."), "");
    }

    #[test]
    fn sanitize_doubles_embedded_quotes() {
        assert_eq!(sanitize("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn parse_number_prefers_int() {
        assert_eq!(try_parse_number("42"), Some(ParsedNumber::Int(42)));
        assert_eq!(try_parse_number("-7"), Some(ParsedNumber::Int(-7)));
        assert_eq!(try_parse_number("3.5"), Some(ParsedNumber::Float(3.5)));
        assert_eq!(try_parse_number("1e3"), Some(ParsedNumber::Float(1000.0)));
        assert_eq!(try_parse_number("scheduled"), None);
        assert_eq!(try_parse_number("42 items"), None);
    }

    #[test]
    fn uuid_round_trips() {
        let id = Uuid::new_v4();
        assert_eq!(to_uuid(&id.to_string()).unwrap(), id);
        assert_eq!(to_uuid(&format!("  {id}  ")).unwrap(), id);
        assert_eq!(uuid_from_bytes(id.as_bytes()).unwrap(), id);
        assert_eq!(uuid_from_bytes(id.to_string().as_bytes()).unwrap(), id);
        assert!(to_uuid("not-a-uuid").is_err());
    }
}

//! Identifier validation and quoting, plus type-expression sanitizing.
//!
//! SQL identifiers (schema, table, column names) cannot be passed as bind
//! parameters, and neither can the target type of an `ADD COLUMN`. Every
//! statement the engine builds therefore interpolates them as text, and this
//! module is the only way they get into that text:
//!
//! 1. Identifiers are validated (non-empty, no null bytes, bounded length),
//!    then wrapped in double quotes with embedded quotes doubled.
//! 2. Type expressions are checked against a character allowlist and have
//!    their whitespace collapsed. Anything that could end a statement or open
//!    a comment or string literal is rejected before a connection is made.

use crate::error::{RetypeError, Result};

/// PostgreSQL's identifier limit (NAMEDATALEN - 1). Longer names are
/// truncated by the server rather than rejected.
pub const PG_MAX_IDENTIFIER_LENGTH: usize = 63;

/// Maximum identifier length accepted for input.
const MAX_IDENTIFIER_LENGTH: usize = 128;

/// Validate an identifier for security issues.
///
/// Rejects:
/// - Empty identifiers
/// - Identifiers containing null bytes (injection vector)
/// - Identifiers exceeding maximum length
///
/// # Errors
///
/// Returns `RetypeError::Config` for invalid identifiers with a descriptive message.
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(RetypeError::Config(
            "Identifier cannot be empty".to_string(),
        ));
    }

    if name.contains('\0') {
        return Err(RetypeError::Config(format!(
            "SECURITY: Identifier contains null byte (possible injection attempt): {:?}",
            name
        )));
    }

    if name.len() > MAX_IDENTIFIER_LENGTH {
        return Err(RetypeError::Config(format!(
            "SECURITY: Identifier exceeds maximum length of {} bytes (got {} bytes): {:?}",
            MAX_IDENTIFIER_LENGTH,
            name.len(),
            name
        )));
    }

    Ok(())
}

/// Quote a PostgreSQL identifier.
///
/// ```ignore
/// assert_eq!(quote_pg("users")?, "\"users\"");
/// assert_eq!(quote_pg("table\"name")?, "\"table\"\"name\"");
/// ```
pub fn quote_pg(name: &str) -> Result<String> {
    validate_identifier(name)?;
    Ok(format!("\"{}\"", name.replace('"', "\"\"")))
}

/// Qualify a PostgreSQL object name with its schema: `"schema"."name"`.
pub fn qualify_pg(schema: &str, name: &str) -> Result<String> {
    Ok(format!("{}.{}", quote_pg(schema)?, quote_pg(name)?))
}

/// Validate and normalize a type expression.
///
/// Accepts letters, digits, underscore, whitespace, parentheses, commas and
/// square brackets, which covers `bigint`, `numeric(10, 2)`,
/// `timestamp with time zone`, `varchar(255)[]`. Whitespace runs collapse to
/// one space.
pub fn sanitize_type(input: &str) -> Result<String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(RetypeError::InvalidType("empty type".into()));
    }

    if let Some(bad) = trimmed.chars().find(|c| !is_type_char(*c)) {
        return Err(RetypeError::InvalidType(format!(
            "{:?} contains disallowed character {:?}",
            trimmed, bad
        )));
    }

    let mut depth: i32 = 0;
    for c in trimmed.chars() {
        match c {
            '(' => depth += 1,
            ')' => depth -= 1,
            _ => {}
        }
        if depth < 0 {
            break;
        }
    }
    if depth != 0 {
        return Err(RetypeError::InvalidType(format!(
            "{:?} has unbalanced parentheses",
            trimmed
        )));
    }

    Ok(trimmed.split_whitespace().collect::<Vec<_>>().join(" "))
}

fn is_type_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c.is_whitespace() || "(),[]".contains(c)
}

/// Strip type modifiers for catalog lookup: `numeric(10, 2)` -> `numeric`,
/// `varchar(20)[]` -> `varchar[]`.
pub fn base_type(type_expr: &str) -> String {
    let mut out = String::with_capacity(type_expr.len());
    let mut depth = 0usize;
    for c in type_expr.chars() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            _ if depth == 0 => out.push(c),
            _ => {}
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

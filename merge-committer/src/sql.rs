//! Helpers for interpolating table and column names into SQL.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid SQL identifier {0:?}: only 1-63 alphanumeric or underscore characters are allowed")]
pub struct InvalidIdentifier(pub String);

/// Validate that a name is safe for use as a Postgres identifier.
///
/// Names come from configuration and table metadata and are interpolated into
/// statements, so anything beyond plain identifier characters is rejected.
pub fn validate_identifier(name: &str) -> Result<(), InvalidIdentifier> {
    if name.is_empty() || name.len() > 63 {
        return Err(InvalidIdentifier(name.to_owned()));
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(InvalidIdentifier(name.to_owned()));
    }
    Ok(())
}

/// Quote a possibly schema-qualified name (`schema.table`) for Postgres.
pub fn quote_identifier(name: &str) -> Result<String, InvalidIdentifier> {
    let parts = name
        .split('.')
        .map(|part| validate_identifier(part).map(|_| format!("\"{part}\"")))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(parts.join("."))
}

/// Split `schema.table` into its parts, defaulting the schema to `public`.
pub fn split_qualified(name: &str) -> (&str, &str) {
    match name.split_once('.') {
        Some((schema, table)) => (schema, table),
        None => ("public", name),
    }
}

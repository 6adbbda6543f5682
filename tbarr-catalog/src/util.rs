//! Small helpers shared across the per-entity modules.

/// Wraps a parse failure on a `TEXT` column (uuid, enum, fingerprint, ...)
/// as a `rusqlite::Error` so it carries the column context through
/// `?` instead of being swallowed into an opaque `FromSql` failure.
pub fn sql_parse_err(field: &str, err: impl std::fmt::Display) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, format!("{field}: {err}").into())
}

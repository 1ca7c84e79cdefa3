//! Identifier policy for every name that reaches SQL text.
//!
//! Table and column names are the only values this workspace ever
//! interpolates into a query string; everything else is bound. A name
//! must pass these checks before it may appear inside `format!`d SQL.

use once_cell::sync::Lazy;
use regex::Regex;

/// Tables owned by the platform itself. Never valid as a destination.
pub const RESERVED_TABLES: &[&str] = &["users", "scripts", "jobs", "alembic_version"];

/// Prefixes claimed by PostgreSQL. Never valid as a destination.
pub const RESERVED_PREFIXES: &[&str] = &["pg_", "sql_", "information_schema"];

static TABLE_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_]{0,62}$").expect("valid table name regex"));

static COLUMN_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,62}$").expect("valid column name regex"));

/// Basic shape check for a table name referenced in a query.
pub fn is_valid_table_name(name: &str) -> bool {
    TABLE_NAME.is_match(name)
}

/// Destination tables are held to a stricter rule: valid shape, not a
/// platform table, not inside a PostgreSQL namespace.
pub fn is_valid_destination_table(name: &str) -> bool {
    if !is_valid_table_name(name) {
        return false;
    }

    let lowered = name.to_lowercase();
    if RESERVED_TABLES.contains(&lowered.as_str()) {
        return false;
    }

    !RESERVED_PREFIXES
        .iter()
        .any(|prefix| lowered.starts_with(prefix))
}

pub fn is_valid_column_name(name: &str) -> bool {
    COLUMN_NAME.is_match(name)
}

/// Quote a previously validated identifier for interpolation.
///
/// Callers must have validated `name` first; the quoting only protects
/// against case folding, not against injection.
pub fn quote(name: &str) -> String {
    format!("\"{}\"", name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_table_names() {
        assert!(is_valid_table_name("sales"));
        assert!(is_valid_table_name("sales_2024"));
        assert!(is_valid_table_name("S"));
        assert!(is_valid_table_name(&format!("a{}", "b".repeat(62))));
    }

    #[test]
    fn test_invalid_table_names() {
        assert!(!is_valid_table_name(""));
        assert!(!is_valid_table_name("_sales"));
        assert!(!is_valid_table_name("1sales"));
        assert!(!is_valid_table_name("sales; DROP TABLE jobs"));
        assert!(!is_valid_table_name("sales-2024"));
        assert!(!is_valid_table_name(&format!("a{}", "b".repeat(63))));
    }

    #[test]
    fn test_destination_rejects_reserved() {
        assert!(!is_valid_destination_table("jobs"));
        assert!(!is_valid_destination_table("Users"));
        assert!(!is_valid_destination_table("alembic_version"));
        assert!(!is_valid_destination_table("pg_catalog"));
        assert!(!is_valid_destination_table("sql_features"));
        assert!(!is_valid_destination_table("information_schema_copy"));
        assert!(is_valid_destination_table("sales_out"));
    }

    #[test]
    fn test_column_names_may_lead_with_underscore() {
        assert!(is_valid_column_name("_internal"));
        assert!(is_valid_column_name("price"));
        assert!(!is_valid_column_name("2fast"));
        assert!(!is_valid_column_name("price\"; --"));
    }
}

//! SQL generation from entity descriptors.
//!
//! Statements are always parameterized with `@name` placeholders; the
//! parameter dictionary travels with the SQL text in [`SqlStatement`] so
//! callers can bind without re-deriving names.

pub mod ddl;
pub mod dml;

pub use dml::SelectOptions;

use rusqlite::ToSql;

use crate::descriptor::EntityDescriptor;
use crate::value::Value;

/// A generated statement plus its parameter dictionary.
#[derive(Debug, Clone)]
pub struct SqlStatement {
    pub sql: String,
    pub params: Vec<(String, Value)>,
}

impl SqlStatement {
    #[must_use]
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    /// Add a named parameter (the name includes the `@` prefix).
    pub fn push_param(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.params.push((name.into(), value.into()));
    }

    /// Parameter slice in the form rusqlite binds.
    #[must_use]
    pub fn param_refs(&self) -> Vec<(&str, &dyn ToSql)> {
        self.params
            .iter()
            .map(|(name, value)| (name.as_str(), value as &dyn ToSql))
            .collect()
    }
}

/// A translated WHERE fragment plus the metadata the select generator needs
/// to choose its latest-version strategy.
#[derive(Debug, Clone, Default)]
pub struct SqlFragment {
    pub sql: String,
    pub params: Vec<(String, Value)>,
    /// The fragment constrains the `Version` column with a literal.
    pub references_version: bool,
    /// Set when the fragment is exactly `key = value`: the parameter name
    /// (with `@`) and the bound key.
    pub single_key: Option<(String, Value)>,
}

impl SqlFragment {
    #[must_use]
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            ..Self::default()
        }
    }
}

// ── Identifier quoting ────────────────────────────────────────

const RESERVED_WORDS: &[&str] = &[
    "ADD", "ALL", "ALTER", "AND", "AS", "BETWEEN", "BY", "CASE", "CHECK", "COLUMN", "CREATE",
    "DEFAULT", "DELETE", "DESC", "DISTINCT", "DROP", "ELSE", "EXISTS", "FOREIGN", "FROM", "GROUP",
    "HAVING", "IN", "INDEX", "INSERT", "INTO", "IS", "JOIN", "KEY", "LIKE", "LIMIT", "NOT",
    "NULL", "ON", "OR", "ORDER", "PRIMARY", "REFERENCES", "SELECT", "SET", "TABLE", "THEN", "TO",
    "TRANSACTION", "UNION", "UNIQUE", "UPDATE", "VALUES", "WHEN", "WHERE",
];

/// Escape an identifier with `[...]` when it is a reserved word or contains
/// anything beyond ASCII alphanumerics and underscores.
#[must_use]
pub fn quote_ident(name: &str) -> String {
    let reserved = RESERVED_WORDS
        .iter()
        .any(|word| word.eq_ignore_ascii_case(name));
    let plain = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if reserved || !plain {
        format!("[{name}]")
    } else {
        name.to_string()
    }
}

/// Quote the (possibly schema-qualified) table reference of a descriptor.
#[must_use]
pub fn quote_table(descriptor: &EntityDescriptor) -> String {
    let table = quote_ident(descriptor.table());
    match descriptor.qualified_table().split_once('.') {
        Some((schema, _)) => format!("{}.{table}", quote_ident(schema)),
        None => table,
    }
}

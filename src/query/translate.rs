//! Predicate → SQL translation.
//!
//! The translator resolves property names through the descriptor, assigns
//! `@p{N}` parameter names from a monotonic counter, and lets the active
//! [`Dialect`] normalize both sides of temporal comparisons.

use crate::descriptor::{track, ColumnDescriptor, EntityDescriptor, TrackingRole};
use crate::error::{Error, Result};
use crate::query::predicate::{CmpOp, Predicate};
use crate::sql::{quote_ident, SqlFragment};
use crate::value::Value;

/// Backend-specific formatting hooks.
///
/// The default implementation is a no-op; backends that store timestamps as
/// text override these to wrap both sides of a comparison in a normalizing
/// function.
pub trait Dialect {
    /// Whether comparisons on this column need datetime normalization.
    fn requires_datetime_conversion(&self, _column: &ColumnDescriptor) -> bool {
        false
    }

    /// Wrap a column reference for datetime comparison.
    fn format_datetime_column(&self, column_sql: &str) -> String {
        column_sql.to_string()
    }

    /// Wrap a parameter placeholder for datetime comparison.
    fn format_datetime_parameter(&self, parameter: &str) -> String {
        parameter.to_string()
    }
}

/// Dialect for the embedded SQLite backend: timestamps live in TEXT columns,
/// so both sides of a temporal comparison go through `datetime(..)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteDialect;

impl Dialect for SqliteDialect {
    fn requires_datetime_conversion(&self, column: &ColumnDescriptor) -> bool {
        column.sql_type.is_temporal()
    }

    fn format_datetime_column(&self, column_sql: &str) -> String {
        format!("datetime({column_sql})")
    }

    fn format_datetime_parameter(&self, parameter: &str) -> String {
        format!("datetime({parameter})")
    }
}

/// Translate a predicate into a WHERE fragment.
///
/// # Errors
///
/// Returns `unsupported-expression` when a property does not resolve to a
/// mapped column, a string operator targets a non-text column, or an `IN`
/// list is empty.
pub fn translate_predicate(
    descriptor: &EntityDescriptor,
    predicate: &Predicate,
    dialect: &dyn Dialect,
) -> Result<SqlFragment> {
    let mut translator = Translator {
        descriptor,
        dialect,
        counter: 0,
        fragment: SqlFragment::default(),
    };
    let sql = translator.walk(predicate)?;
    translator.fragment.sql = sql;
    translator.fragment.single_key = translator.single_key_of(predicate);
    Ok(translator.fragment)
}

struct Translator<'a> {
    descriptor: &'a EntityDescriptor,
    dialect: &'a dyn Dialect,
    counter: usize,
    fragment: SqlFragment,
}

impl Translator<'_> {
    fn walk(&mut self, predicate: &Predicate) -> Result<String> {
        match predicate {
            Predicate::And(left, right) => {
                let l = self.walk(left)?;
                let r = self.walk(right)?;
                Ok(format!("({l} AND {r})"))
            }
            Predicate::Or(left, right) => {
                let l = self.walk(left)?;
                let r = self.walk(right)?;
                Ok(format!("({l} OR {r})"))
            }
            Predicate::Compare {
                property,
                op,
                value,
            } => self.compare(property, *op, value),
            Predicate::Contains { property, fragment } => {
                self.like(property, &format!("%{}%", escape_like(fragment)))
            }
            Predicate::StartsWith { property, prefix } => {
                self.like(property, &format!("{}%", escape_like(prefix)))
            }
            Predicate::EndsWith { property, suffix } => {
                self.like(property, &format!("%{}", escape_like(suffix)))
            }
            Predicate::In { property, values } => self.membership(property, values),
        }
    }

    fn compare(&mut self, property: &str, op: CmpOp, value: &Value) -> Result<String> {
        let column = self.resolve(property)?;
        let column_sql = format!("t.{}", quote_ident(&column.column));
        self.note_version_reference(&column);

        // NULL constants compare with IS / IS NOT regardless of operator
        // direction; anything else is unsupported against NULL.
        if value.is_null() {
            return match op {
                CmpOp::Eq => Ok(format!("{column_sql} IS NULL")),
                CmpOp::Ne => Ok(format!("{column_sql} IS NOT NULL")),
                _ => Err(self.unsupported(&format!(
                    "ordering comparison against NULL on {property}"
                ))),
            };
        }

        let param = self.next_param(value.clone());
        if self.dialect.requires_datetime_conversion(&column) {
            let lhs = self.dialect.format_datetime_column(&column_sql);
            let rhs = self.dialect.format_datetime_parameter(&param);
            Ok(format!("{lhs} {} {rhs}", op.as_sql()))
        } else {
            Ok(format!("{column_sql} {} {param}", op.as_sql()))
        }
    }

    fn like(&mut self, property: &str, pattern: &str) -> Result<String> {
        let column = self.resolve(property)?;
        if column.sql_type.affinity() != crate::descriptor::Affinity::Text {
            return Err(self.unsupported(&format!(
                "string operator on non-text property {property}"
            )));
        }
        let column_sql = format!("t.{}", quote_ident(&column.column));
        let param = self.next_param(Value::Text(pattern.to_string()));
        Ok(format!("{column_sql} LIKE {param} ESCAPE '\\'"))
    }

    fn membership(&mut self, property: &str, values: &[Value]) -> Result<String> {
        if values.is_empty() {
            return Err(self.unsupported(&format!("empty IN list on {property}")));
        }
        let column = self.resolve(property)?;
        let column_sql = format!("t.{}", quote_ident(&column.column));
        self.note_version_reference(&column);
        let params: Vec<String> = values
            .iter()
            .map(|value| self.next_param(value.clone()))
            .collect();
        Ok(format!("{column_sql} IN ({})", params.join(", ")))
    }

    fn resolve(&self, property: &str) -> Result<ColumnDescriptor> {
        if let Some(column) = self.descriptor.column(property) {
            if column.is_mapped() {
                return Ok(column.clone());
            }
            return Err(self.unsupported(&format!("property {property} is not mapped")));
        }
        // Conventional key fallbacks.
        if property == track::ID || property == track::KEY {
            if let Some(column) = self.descriptor.column(self.descriptor.key_property()) {
                return Ok(column.clone());
            }
        }
        Err(self.unsupported(&format!("unknown property {property}")))
    }

    fn next_param(&mut self, value: Value) -> String {
        let name = format!("@p{}", self.counter);
        self.counter += 1;
        self.fragment.params.push((name.clone(), value));
        name
    }

    fn note_version_reference(&mut self, column: &ColumnDescriptor) {
        if column.tracking == Some(TrackingRole::Version) {
            self.fragment.references_version = true;
        }
    }

    fn unsupported(&self, detail: &str) -> Error {
        Error::UnsupportedExpression {
            detail: format!("{} ({})", detail, self.descriptor.entity()),
        }
    }

    /// Detect the `key = constant` shape the select generator optimizes.
    fn single_key_of(&self, predicate: &Predicate) -> Option<(String, Value)> {
        if let Predicate::Compare {
            property,
            op: CmpOp::Eq,
            value,
        } = predicate
        {
            let key = self.descriptor.key_property();
            let is_key = property == key
                || ((property == track::ID || property == track::KEY)
                    && self.descriptor.column(property).is_none());
            if is_key && !value.is_null() {
                // The key comparison is always the first parameter when the
                // predicate is a bare equality.
                return self
                    .fragment
                    .params
                    .first()
                    .map(|(name, _)| (name.clone(), value.clone()));
            }
        }
        None
    }
}

/// Escape LIKE wildcards inside a user-supplied fragment.
fn escape_like(fragment: &str) -> String {
    fragment
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

/// Translate a recorded ORDER BY chain into a clause body.
///
/// # Errors
///
/// Returns `unsupported-expression` when a property cannot be resolved.
pub fn translate_order(
    descriptor: &EntityDescriptor,
    recorder: &crate::query::OrderRecorder,
) -> Result<String> {
    let mut parts: Vec<String> = Vec::new();
    for (property, ascending) in recorder.pairs() {
        let column = descriptor.resolve_column(property).ok_or_else(|| {
            Error::UnsupportedExpression {
                detail: format!("unknown order-by property {property} ({})", descriptor.entity()),
            }
        })?;
        let direction = if *ascending { "ASC" } else { "DESC" };
        parts.push(format!("t.{} {direction}", quote_ident(column)));
    }
    Ok(parts.join(", "))
}

//! DDL generation: `CREATE TABLE` and `CREATE INDEX` from a descriptor.
//!
//! All statements use `IF NOT EXISTS`-style guards when requested, so schema
//! application stays idempotent (additive migration is the only supported
//! schema change).

use std::fmt::Write as _;

use crate::descriptor::{ColumnDescriptor, EntityDescriptor, SqlType};
use crate::sql::{quote_ident, quote_table};

/// Generate the `CREATE TABLE` statement for a descriptor.
#[must_use]
pub fn create_table(descriptor: &EntityDescriptor, if_not_exists: bool) -> String {
    let guard = if if_not_exists { "IF NOT EXISTS " } else { "" };
    let table = quote_table(descriptor);

    let single_autoincrement = single_autoincrement_pk(descriptor);
    let mut lines: Vec<String> = Vec::new();

    for column in descriptor.mapped_columns() {
        let inline_pk = single_autoincrement == Some(column.property.as_str());
        lines.push(column_line(column, inline_pk));
    }

    // Table-level PRIMARY KEY unless the rowid alias form was used.
    if single_autoincrement.is_none() && !descriptor.primary_key().is_empty() {
        let parts: Vec<String> = descriptor
            .primary_key()
            .iter()
            .filter_map(|property| descriptor.column(property))
            .map(|c| quote_ident(&c.column))
            .collect();
        lines.push(format!("PRIMARY KEY ({})", parts.join(", ")));
    }

    // Named CHECK constraints.
    for column in descriptor.mapped_columns() {
        if let Some(check) = check_body(column) {
            lines.push(format!(
                "CONSTRAINT {} CHECK ({check})",
                quote_ident(&format!("CK_{}_{}", descriptor.table(), column.column))
            ));
        }
    }

    for fk in descriptor.foreign_keys() {
        let local: Vec<String> = fk.columns.iter().map(|c| quote_ident(c)).collect();
        let referenced: Vec<String> = fk
            .referenced_columns
            .iter()
            .map(|c| quote_ident(c))
            .collect();
        lines.push(format!(
            "CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({}) ON DELETE {} ON UPDATE {}",
            quote_ident(&fk.name),
            local.join(", "),
            quote_ident(&fk.references_table),
            referenced.join(", "),
            fk.on_delete.as_sql(),
            fk.on_update.as_sql(),
        ));
    }

    let mut sql = format!("CREATE TABLE {guard}{table} (\n    ");
    sql.push_str(&lines.join(",\n    "));
    sql.push_str("\n)");
    sql
}

/// Generate one `CREATE INDEX` statement per index group.
#[must_use]
pub fn create_indexes(descriptor: &EntityDescriptor, if_not_exists: bool) -> Vec<String> {
    let guard = if if_not_exists { "IF NOT EXISTS " } else { "" };
    let table = quote_table(descriptor);

    descriptor
        .indexes()
        .iter()
        .map(|index| {
            let unique = if index.unique { "UNIQUE " } else { "" };
            // Key columns first in declared order; covering columns appended
            // last (the embedded backend has no INCLUDE clause).
            let mut ordered = index.columns.clone();
            ordered.sort_by_key(|c| (c.included, c.order));
            let columns: Vec<String> = ordered
                .iter()
                .map(|c| {
                    if c.descending {
                        format!("{} DESC", quote_ident(&c.column))
                    } else {
                        quote_ident(&c.column)
                    }
                })
                .collect();
            let mut sql = format!(
                "CREATE {unique}INDEX {guard}{} ON {table} ({})",
                quote_ident(&index.name),
                columns.join(", ")
            );
            if let Some(filter) = &index.filter {
                let _ = write!(sql, " WHERE {filter}");
            }
            sql
        })
        .collect()
}

/// The property of a single-column INTEGER PRIMARY KEY AUTOINCREMENT, when
/// the descriptor qualifies for the inline rowid-alias form.
fn single_autoincrement_pk(descriptor: &EntityDescriptor) -> Option<&str> {
    if descriptor.primary_key().len() != 1 {
        return None;
    }
    let property = &descriptor.primary_key()[0];
    let column = descriptor.column(property)?;
    (column.auto_increment
        && column.sql_type.affinity() == crate::descriptor::Affinity::Integer)
        .then_some(property.as_str())
}

fn column_line(column: &ColumnDescriptor, inline_pk: bool) -> String {
    let name = quote_ident(&column.column);

    if let Some(computed) = &column.computed {
        let stored = if computed.persisted { " STORED" } else { "" };
        return format!(
            "{name} {} AS ({}){stored}",
            column.sql_type.affinity().ddl(),
            computed.expression
        );
    }

    let mut line = format!("{name} {}", column.sql_type.affinity().ddl());
    if inline_pk {
        line.push_str(" PRIMARY KEY AUTOINCREMENT");
    }
    if !column.nullable && !inline_pk {
        line.push_str(" NOT NULL");
    }
    if let Some(default) = &column.default {
        let _ = write!(line, " DEFAULT {default}");
    }
    if column.unique && !inline_pk {
        line.push_str(" UNIQUE");
    }
    line
}

/// CHECK body for a column: explicit constraint, or enum membership.
fn check_body(column: &ColumnDescriptor) -> Option<String> {
    if let Some(check) = &column.check {
        return Some(check.clone());
    }
    if let SqlType::Enum { allowed } = &column.sql_type {
        let members: Vec<String> = allowed
            .iter()
            .map(|m| format!("'{}'", m.replace('\'', "''")))
            .collect();
        let name = quote_ident(&column.column);
        let check = format!("{name} IN ({})", members.join(", "));
        return Some(if column.nullable {
            format!("{name} IS NULL OR {check}")
        } else {
            check
        });
    }
    None
}

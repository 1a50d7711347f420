//! DML generation: parameterized INSERT / UPDATE / DELETE / SELECT plans.
//!
//! The select generator owns the latest-version strategy for soft-delete
//! tables: a correlated `MAX(Version)` subquery when the caller targets one
//! key, a grouped self-join otherwise, and no filter at all when the caller
//! asked for every version or pinned a version in the WHERE clause.

use std::fmt::Write as _;

use chrono::{DateTime, Utc};

use crate::descriptor::{EntityDescriptor, TrackingRole};
use crate::entity::Row;
use crate::sql::{quote_ident, quote_table, SqlFragment, SqlStatement};
use crate::value::{format_timestamp, Value};

/// Options steering SELECT generation.
#[derive(Debug, Clone, Default)]
pub struct SelectOptions {
    /// Return every stored version instead of only the latest per key.
    pub include_all_versions: bool,
    /// Do not filter out tombstone rows.
    pub include_deleted: bool,
    /// Do not filter out expired rows.
    pub include_expired: bool,
    /// Translated predicate fragment.
    pub where_clause: Option<SqlFragment>,
    /// Caller-supplied ORDER BY body (wins over generated ordering).
    pub order_by: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

impl SelectOptions {
    /// Options that address a single key.
    #[must_use]
    pub fn by_key(descriptor: &EntityDescriptor, key: &Value) -> Self {
        let column = quote_ident(descriptor.key_column());
        let mut fragment = SqlFragment::new(format!("t.{column} = @Key"));
        fragment.params.push(("@Key".to_string(), key.clone()));
        fragment.single_key = Some(("@Key".to_string(), key.clone()));
        Self {
            where_clause: Some(fragment),
            ..Self::default()
        }
    }
}

// ── INSERT ────────────────────────────────────────────────────

/// Generate an INSERT for one row.
///
/// Columns marked `NotMapped`, computed, or auto-increment are skipped. In
/// soft-delete mode the tombstone column is emitted as a literal and the
/// allocated `Version` travels as an ordinary parameter.
#[must_use]
pub fn insert(descriptor: &EntityDescriptor, row: &Row) -> SqlStatement {
    let table = quote_table(descriptor);
    let mut columns: Vec<String> = Vec::new();
    let mut values: Vec<String> = Vec::new();
    let mut statement = SqlStatement::new(String::new());

    for column in descriptor.insert_columns() {
        columns.push(quote_ident(&column.column));
        if column.tracking == Some(TrackingRole::IsDeleted) {
            let literal = i64::from(row.is_deleted());
            values.push(literal.to_string());
            continue;
        }
        let param = format!("@{}", column.column);
        values.push(param.clone());
        statement.push_param(
            param,
            row.get(&column.property).cloned().unwrap_or(Value::Null),
        );
    }

    statement.sql = format!(
        "INSERT INTO {table} ({}) VALUES ({})",
        columns.join(", "),
        values.join(", ")
    );
    statement
}

/// Generate one INSERT carrying all rows as value tuples, parameters
/// suffixed by row index.
#[must_use]
pub fn batch_insert(descriptor: &EntityDescriptor, rows: &[Row]) -> SqlStatement {
    let table = quote_table(descriptor);
    let insertable: Vec<_> = descriptor.insert_columns().collect();
    let columns: Vec<String> = insertable
        .iter()
        .map(|c| quote_ident(&c.column))
        .collect();

    let mut statement = SqlStatement::new(String::new());
    let mut tuples: Vec<String> = Vec::with_capacity(rows.len());

    for (index, row) in rows.iter().enumerate() {
        let mut values: Vec<String> = Vec::with_capacity(insertable.len());
        for column in &insertable {
            if column.tracking == Some(TrackingRole::IsDeleted) {
                values.push(i64::from(row.is_deleted()).to_string());
                continue;
            }
            let param = format!("@{}_{index}", column.column);
            values.push(param.clone());
            statement.push_param(
                param,
                row.get(&column.property).cloned().unwrap_or(Value::Null),
            );
        }
        tuples.push(format!("({})", values.join(", ")));
    }

    statement.sql = format!(
        "INSERT INTO {table} ({}) VALUES {}",
        columns.join(", "),
        tuples.join(", ")
    );
    statement
}

// ── UPDATE (hard-delete mode) ─────────────────────────────────

/// Generate an in-place UPDATE guarded by the expected version.
///
/// Non-key columns are assigned from parameters; `Version` is incremented
/// atomically from the expected value and `CreatedTime` is preserved.
#[must_use]
pub fn update(descriptor: &EntityDescriptor, row: &Row, expected_version: i64) -> SqlStatement {
    let table = quote_table(descriptor);
    let mut statement = SqlStatement::new(String::new());
    let mut assignments: Vec<String> = Vec::new();

    for column in descriptor.insert_columns() {
        if descriptor.primary_key().contains(&column.property) {
            continue;
        }
        match column.tracking {
            Some(TrackingRole::Version | TrackingRole::CreatedTime) => continue,
            Some(TrackingRole::IsDeleted) => continue,
            _ => {}
        }
        let param = format!("@{}", column.column);
        assignments.push(format!("{} = {param}", quote_ident(&column.column)));
        statement.push_param(
            param,
            row.get(&column.property).cloned().unwrap_or(Value::Null),
        );
    }

    let version_column = version_column(descriptor);
    assignments.push(format!("{version_column} = @Version + 1"));

    let key_column = quote_ident(descriptor.key_column());
    statement.sql = format!(
        "UPDATE {table} SET {} WHERE {key_column} = @Key AND {version_column} = @Version",
        assignments.join(", ")
    );
    statement.push_param(
        "@Key",
        row.get(descriptor.key_property())
            .cloned()
            .unwrap_or(Value::Null),
    );
    statement.push_param("@Version", expected_version);
    statement
}

// ── DELETE (hard-delete mode) ─────────────────────────────────

/// Generate a hard DELETE by key.
#[must_use]
pub fn delete_by_key(descriptor: &EntityDescriptor, key: &Value) -> SqlStatement {
    let table = quote_table(descriptor);
    let key_column = quote_ident(descriptor.key_column());
    let mut statement =
        SqlStatement::new(format!("DELETE FROM {table} WHERE {key_column} = @Key"));
    statement.push_param("@Key", key.clone());
    statement
}

// ── SELECT ────────────────────────────────────────────────────

/// Generate a SELECT per the option set.
#[must_use]
pub fn select(
    descriptor: &EntityDescriptor,
    options: &SelectOptions,
    now: DateTime<Utc>,
) -> SqlStatement {
    let table = quote_table(descriptor);
    let key_column = quote_ident(descriptor.key_column());
    let version_column = version_column(descriptor);

    let columns: Vec<String> = descriptor
        .mapped_columns()
        .map(|c| format!("t.{}", quote_ident(&c.column)))
        .collect();

    let mut statement = SqlStatement::new(String::new());
    let mut conditions: Vec<String> = Vec::new();

    if let Some(fragment) = &options.where_clause {
        conditions.push(format!("({})", fragment.sql));
        statement.params.extend(fragment.params.iter().cloned());
    }

    // Latest-version filtering is needed unless the caller wants every
    // version or already pinned one in the WHERE clause.
    let needs_latest = descriptor.soft_delete()
        && !options.include_all_versions
        && !options
            .where_clause
            .as_ref()
            .is_some_and(|w| w.references_version);
    let single_key = options
        .where_clause
        .as_ref()
        .and_then(|w| w.single_key.as_ref());

    let mut join = String::new();
    let mut used_join = false;
    if needs_latest {
        if let Some((param, _)) = single_key {
            // Correlated subquery: cheaper than the grouped join when only
            // one key can match.
            conditions.push(format!(
                "t.{version_column} = (SELECT MAX({version_column}) FROM {table} \
                 WHERE {key_column} = {param})"
            ));
        } else {
            join = format!(
                " INNER JOIN (SELECT {key_column}, MAX({version_column}) AS MAX_VERSION \
                 FROM {table} GROUP BY {key_column}) AS latest \
                 ON t.{key_column} = latest.{key_column} \
                 AND t.{version_column} = latest.MAX_VERSION"
            );
            used_join = true;
        }
    }

    if descriptor.soft_delete() && !options.include_deleted {
        let tombstone = tracking_ident(descriptor, TrackingRole::IsDeleted);
        conditions.push(format!("t.{tombstone} = 0"));
    }

    if descriptor.expiry_enabled() && !options.include_expired {
        let expiration = tracking_ident(descriptor, TrackingRole::AbsoluteExpiration);
        conditions.push(format!(
            "(t.{expiration} IS NULL OR t.{expiration} > @Now)"
        ));
        statement.push_param("@Now", format_timestamp(&now));
    }

    let mut sql = format!("SELECT {} FROM {table} AS t{join}", columns.join(", "));
    if !conditions.is_empty() {
        let _ = write!(sql, " WHERE {}", conditions.join(" AND "));
    }

    if let Some(order) = &options.order_by {
        let _ = write!(sql, " ORDER BY {order}");
    } else if options.include_all_versions && descriptor.soft_delete() {
        let _ = write!(sql, " ORDER BY t.{key_column}, t.{version_column} DESC");
    } else if used_join {
        let _ = write!(sql, " ORDER BY t.{key_column}");
    }

    if let Some(limit) = options.limit {
        let _ = write!(sql, " LIMIT {limit}");
        if let Some(offset) = options.offset {
            let _ = write!(sql, " OFFSET {offset}");
        }
    }

    statement.sql = sql;
    statement
}

/// Generate a COUNT over the same option set (ordering and paging ignored).
#[must_use]
pub fn count(
    descriptor: &EntityDescriptor,
    options: &SelectOptions,
    now: DateTime<Utc>,
) -> SqlStatement {
    let inner_options = SelectOptions {
        order_by: None,
        limit: None,
        offset: None,
        ..options.clone()
    };
    let mut inner = select(descriptor, &inner_options, now);
    inner.sql = format!("SELECT COUNT(*) FROM ({}) AS counted", inner.sql);
    inner
}

fn version_column(descriptor: &EntityDescriptor) -> String {
    tracking_ident(descriptor, TrackingRole::Version)
}

fn tracking_ident(descriptor: &EntityDescriptor, role: TrackingRole) -> String {
    descriptor
        .tracking_column(role)
        .map_or_else(|| "Version".to_string(), |c| quote_ident(&c.column))
}

//! Entity descriptors: immutable metadata driving SQL generation.
//!
//! A descriptor captures everything the engine needs to know about one
//! persistable type: table identity, columns, primary key, indexes, foreign
//! keys, and the behavioral flags (soft delete, expiry, archive, audit,
//! list sync). Descriptors are built once through [`DescriptorBuilder`] and
//! never mutated afterwards.

pub mod builder;

pub use builder::DescriptorBuilder;

use chrono::TimeDelta;

/// Engine-managed property names.
///
/// Tracking fields are owned by the engine; callers never supply them and
/// the descriptor builder provisions their columns automatically.
pub mod track {
    /// Conventional single-column key property.
    pub const ID: &str = "Id";
    /// Alternate conventional key property.
    pub const KEY: &str = "Key";
    /// Monotonic version counter (global in soft-delete mode).
    pub const VERSION: &str = "Version";
    /// First-write timestamp, preserved across soft-delete versions.
    pub const CREATED_TIME: &str = "CreatedTime";
    /// Last mutation timestamp.
    pub const LAST_WRITE_TIME: &str = "LastWriteTime";
    /// Tombstone marker for soft-delete rows.
    pub const IS_DELETED: &str = "IsDeleted";
    /// Expiry cutoff; NULL means the row never expires.
    pub const ABSOLUTE_EXPIRATION: &str = "AbsoluteExpiration";
    /// Archive marker, shields a row from expiry purges.
    pub const IS_ARCHIVED: &str = "IsArchived";
}

// ── SQL types ─────────────────────────────────────────────────

/// SQLite storage affinity a column narrows to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Affinity {
    Text,
    Integer,
    Real,
    Blob,
}

impl Affinity {
    /// DDL keyword for this affinity.
    #[must_use]
    pub const fn ddl(&self) -> &'static str {
        match self {
            Self::Text => "TEXT",
            Self::Integer => "INTEGER",
            Self::Real => "REAL",
            Self::Blob => "BLOB",
        }
    }
}

/// Logical SQL type of a column.
///
/// The richer variants drive value conversion and CHECK generation; DDL for
/// the embedded backend narrows everything to its [`Affinity`].
#[derive(Debug, Clone, PartialEq)]
pub enum SqlType {
    /// Variable-length text. `length` is advisory on SQLite.
    Text { length: Option<u32> },
    TinyInt,
    SmallInt,
    Int,
    BigInt,
    /// Stored as INTEGER 0/1.
    Boolean,
    Real,
    Double,
    /// Stored as REAL on the embedded backend.
    Decimal { precision: u8, scale: u8 },
    /// RFC 3339 UTC text with millisecond precision.
    Timestamp,
    /// Whole seconds, stored as INTEGER.
    Duration,
    /// Canonical hyphenated text form.
    Uuid,
    /// Text restricted to the allowed members via a CHECK constraint.
    Enum { allowed: Vec<String> },
    Blob,
    /// Arbitrary document serialized as JSON text.
    Json,
}

impl SqlType {
    /// Storage affinity on the embedded backend.
    #[must_use]
    pub const fn affinity(&self) -> Affinity {
        match self {
            Self::Text { .. }
            | Self::Timestamp
            | Self::Uuid
            | Self::Enum { .. }
            | Self::Json => Affinity::Text,
            Self::TinyInt
            | Self::SmallInt
            | Self::Int
            | Self::BigInt
            | Self::Boolean
            | Self::Duration => Affinity::Integer,
            Self::Real | Self::Double | Self::Decimal { .. } => Affinity::Real,
            Self::Blob => Affinity::Blob,
        }
    }

    /// True for timestamp-valued columns (candidates for datetime
    /// normalization in translated expressions).
    #[must_use]
    pub const fn is_temporal(&self) -> bool {
        matches!(self, Self::Timestamp)
    }
}

/// Source-language property kinds, used when a column carries no explicit
/// SQL type annotation.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyKind {
    Str,
    Char,
    I8,
    I16,
    I32,
    I64,
    Bool,
    Decimal,
    F32,
    F64,
    Timestamp,
    Duration,
    Uuid,
    Enum(Vec<String>),
    Binary,
    /// Anything without a scalar mapping; serialized as JSON text.
    Complex,
}

impl PropertyKind {
    /// Default SQL type for this property kind.
    #[must_use]
    pub fn infer(&self) -> SqlType {
        match self {
            Self::Str => SqlType::Text { length: Some(255) },
            Self::Char => SqlType::Text { length: Some(1) },
            Self::I8 => SqlType::TinyInt,
            Self::I16 => SqlType::SmallInt,
            Self::I32 => SqlType::Int,
            Self::I64 => SqlType::BigInt,
            Self::Bool => SqlType::Boolean,
            Self::Decimal => SqlType::Decimal {
                precision: 18,
                scale: 2,
            },
            Self::F32 => SqlType::Real,
            Self::F64 => SqlType::Double,
            Self::Timestamp => SqlType::Timestamp,
            Self::Duration => SqlType::Duration,
            Self::Uuid => SqlType::Uuid,
            Self::Enum(allowed) => SqlType::Enum {
                allowed: allowed.clone(),
            },
            Self::Binary => SqlType::Blob,
            Self::Complex => SqlType::Json,
        }
    }
}

// ── Columns ───────────────────────────────────────────────────

/// Role of an engine-managed tracking column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackingRole {
    Version,
    CreatedTime,
    LastWriteTime,
    IsDeleted,
    AbsoluteExpiration,
    IsArchived,
}

/// A computed column expression.
#[derive(Debug, Clone, PartialEq)]
pub struct ComputedSpec {
    /// SQL expression the column is generated from.
    pub expression: String,
    /// Emit `STORED` so the backend materializes the value.
    pub persisted: bool,
}

/// One property-to-column mapping.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDescriptor {
    /// Property name on the entity.
    pub property: String,
    /// Column name in the table.
    pub column: String,
    pub sql_type: SqlType,
    pub nullable: bool,
    /// SQL literal used as the column default.
    pub default: Option<String>,
    pub unique: bool,
    pub computed: Option<ComputedSpec>,
    /// Extra CHECK constraint body (beyond enum membership checks).
    pub check: Option<String>,
    pub tracking: Option<TrackingRole>,
    /// Position within the primary key, when part of it.
    pub pk_order: Option<u32>,
    pub auto_increment: bool,
    /// Excluded from every generated statement.
    pub not_mapped: bool,
}

impl ColumnDescriptor {
    /// True when the column participates in generated statements.
    #[must_use]
    pub const fn is_mapped(&self) -> bool {
        !self.not_mapped
    }

    /// True when the column receives values on INSERT.
    #[must_use]
    pub const fn is_insertable(&self) -> bool {
        self.is_mapped() && self.computed.is_none() && !self.auto_increment
    }
}

// ── Indexes ───────────────────────────────────────────────────

/// One column inside an index group.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexColumn {
    pub column: String,
    pub descending: bool,
    /// Declaration order within the group.
    pub order: u32,
    /// Included (covering) column rather than a key column.
    pub included: bool,
}

/// A named index group.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexDescriptor {
    pub name: String,
    pub unique: bool,
    /// Partial-index predicate.
    pub filter: Option<String>,
    pub columns: Vec<IndexColumn>,
}

// ── Foreign keys ──────────────────────────────────────────────

/// Referential action on delete/update of the referenced row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FkAction {
    #[default]
    NoAction,
    Restrict,
    SetNull,
    SetDefault,
    Cascade,
}

impl FkAction {
    /// SQL clause body for this action.
    #[must_use]
    pub const fn as_sql(&self) -> &'static str {
        match self {
            Self::NoAction => "NO ACTION",
            Self::Restrict => "RESTRICT",
            Self::SetNull => "SET NULL",
            Self::SetDefault => "SET DEFAULT",
            Self::Cascade => "CASCADE",
        }
    }
}

/// A named foreign-key group (single or composite).
#[derive(Debug, Clone, PartialEq)]
pub struct ForeignKeyDescriptor {
    pub name: String,
    /// Local column names, in declaration order.
    pub columns: Vec<String>,
    pub references_table: String,
    pub referenced_columns: Vec<String>,
    pub on_delete: FkAction,
    pub on_update: FkAction,
}

// ── Descriptor ────────────────────────────────────────────────

/// Immutable metadata for one persistable entity type.
#[derive(Debug, Clone)]
pub struct EntityDescriptor {
    pub(crate) entity: String,
    pub(crate) table: String,
    pub(crate) schema: Option<String>,
    pub(crate) soft_delete: bool,
    pub(crate) sync_with_list: bool,
    pub(crate) audit_trail: bool,
    pub(crate) archive: bool,
    pub(crate) expiry_span: Option<TimeDelta>,
    pub(crate) depends_on: Vec<String>,
    pub(crate) columns: Vec<ColumnDescriptor>,
    /// Property names in primary-key order. In soft-delete mode the final
    /// component is always `Version`.
    pub(crate) primary_key: Vec<String>,
    pub(crate) indexes: Vec<IndexDescriptor>,
    pub(crate) foreign_keys: Vec<ForeignKeyDescriptor>,
}

impl EntityDescriptor {
    /// Logical entity type name.
    #[must_use]
    pub fn entity(&self) -> &str {
        &self.entity
    }

    /// Table name without the schema qualifier.
    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Table name with the schema qualifier when one is set.
    #[must_use]
    pub fn qualified_table(&self) -> String {
        match &self.schema {
            Some(schema) => format!("{schema}.{}", self.table),
            None => self.table.clone(),
        }
    }

    #[must_use]
    pub const fn soft_delete(&self) -> bool {
        self.soft_delete
    }

    #[must_use]
    pub const fn sync_with_list(&self) -> bool {
        self.sync_with_list
    }

    #[must_use]
    pub const fn audit_trail(&self) -> bool {
        self.audit_trail
    }

    #[must_use]
    pub const fn archive(&self) -> bool {
        self.archive
    }

    #[must_use]
    pub const fn expiry_span(&self) -> Option<TimeDelta> {
        self.expiry_span
    }

    #[must_use]
    pub const fn expiry_enabled(&self) -> bool {
        self.expiry_span.is_some()
    }

    /// Tables this one references, in creation order.
    #[must_use]
    pub fn depends_on(&self) -> &[String] {
        &self.depends_on
    }

    /// All columns in declaration order.
    #[must_use]
    pub fn columns(&self) -> &[ColumnDescriptor] {
        &self.columns
    }

    /// Columns that participate in generated statements.
    pub fn mapped_columns(&self) -> impl Iterator<Item = &ColumnDescriptor> {
        self.columns.iter().filter(|c| c.is_mapped())
    }

    /// Columns that receive values on INSERT.
    pub fn insert_columns(&self) -> impl Iterator<Item = &ColumnDescriptor> {
        self.columns.iter().filter(|c| c.is_insertable())
    }

    /// Look up a column by property name.
    #[must_use]
    pub fn column(&self, property: &str) -> Option<&ColumnDescriptor> {
        self.columns.iter().find(|c| c.property == property)
    }

    /// Property names forming the primary key, in order.
    #[must_use]
    pub fn primary_key(&self) -> &[String] {
        &self.primary_key
    }

    /// True when the primary key has more than one component.
    #[must_use]
    pub fn composite_key(&self) -> bool {
        self.primary_key.len() > 1
    }

    /// The caller-facing key property: the first primary-key component.
    ///
    /// In soft-delete mode the full key is `{key, Version}` but callers
    /// address rows by this component alone.
    #[must_use]
    pub fn key_property(&self) -> &str {
        &self.primary_key[0]
    }

    /// Column name for the caller-facing key property.
    #[must_use]
    pub fn key_column(&self) -> &str {
        self.column(self.key_property())
            .map_or_else(|| self.key_property(), |c| c.column.as_str())
    }

    /// Resolve a property to its column name, with `Id`/`Key` convention
    /// fallbacks for unmapped conventional names.
    #[must_use]
    pub fn resolve_column(&self, property: &str) -> Option<&str> {
        if let Some(column) = self.column(property) {
            return Some(column.column.as_str());
        }
        if property == track::ID || property == track::KEY {
            return Some(self.key_column());
        }
        None
    }

    /// Indexes declared on the table.
    #[must_use]
    pub fn indexes(&self) -> &[IndexDescriptor] {
        &self.indexes
    }

    /// Foreign keys declared on the table.
    #[must_use]
    pub fn foreign_keys(&self) -> &[ForeignKeyDescriptor] {
        &self.foreign_keys
    }

    /// The tracking column holding a given role, if provisioned.
    #[must_use]
    pub fn tracking_column(&self, role: TrackingRole) -> Option<&ColumnDescriptor> {
        self.columns.iter().find(|c| c.tracking == Some(role))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn affinity_narrowing() {
        assert_eq!(SqlType::Timestamp.affinity(), Affinity::Text);
        assert_eq!(SqlType::Boolean.affinity(), Affinity::Integer);
        assert_eq!(
            SqlType::Decimal {
                precision: 18,
                scale: 2
            }
            .affinity(),
            Affinity::Real
        );
        assert_eq!(SqlType::Blob.affinity(), Affinity::Blob);
    }

    #[test]
    fn inference_defaults() {
        assert_eq!(
            PropertyKind::Str.infer(),
            SqlType::Text { length: Some(255) }
        );
        assert_eq!(PropertyKind::I64.infer(), SqlType::BigInt);
        assert_eq!(PropertyKind::Duration.infer(), SqlType::Duration);
        assert_eq!(PropertyKind::Complex.infer(), SqlType::Json);
    }

    #[test]
    fn enum_kind_carries_members() {
        let inferred = PropertyKind::Enum(vec!["open".into(), "closed".into()]).infer();
        assert_eq!(
            inferred,
            SqlType::Enum {
                allowed: vec!["open".into(), "closed".into()]
            }
        );
    }
}

//! Builder translating declarative entity annotations into descriptors.
//!
//! The builder is the programmatic equivalent of attribute annotations: each
//! call records one annotation, and [`DescriptorBuilder::build`] validates
//! the whole set and produces an immutable [`EntityDescriptor`]. Modifier
//! methods (`not_null`, `unique`, `check`, ...) apply to the most recently
//! declared column, matching how attributes attach to one property.

use chrono::TimeDelta;

use crate::descriptor::{
    track, ColumnDescriptor, ComputedSpec, EntityDescriptor, FkAction, ForeignKeyDescriptor,
    IndexColumn, IndexDescriptor, PropertyKind, SqlType, TrackingRole,
};
use crate::error::{Error, Result};

/// One foreign-key annotation, grouped by constraint name at build time.
#[derive(Debug, Clone)]
struct FkSpec {
    name: Option<String>,
    property: String,
    references_table: String,
    referenced_column: String,
    on_delete: FkAction,
    on_update: FkAction,
}

/// One index annotation, resolved to a named group at build time.
#[derive(Debug, Clone)]
struct IndexSpec {
    name: Option<String>,
    unique: bool,
    filter: Option<String>,
    /// Raw column specs; a trailing ` DESC` marks descending order and a
    /// trailing ` INCLUDED` marks a covering column.
    columns: Vec<String>,
}

/// Builder for [`EntityDescriptor`].
#[derive(Debug)]
pub struct DescriptorBuilder {
    entity: String,
    table: Option<String>,
    schema: Option<String>,
    soft_delete: bool,
    sync_with_list: bool,
    audit_trail: bool,
    archive: bool,
    expiry_span: Option<TimeDelta>,
    depends_on: Vec<String>,
    columns: Vec<ColumnDescriptor>,
    pk_counter: u32,
    fk_specs: Vec<FkSpec>,
    index_specs: Vec<IndexSpec>,
    misplaced_modifier: bool,
}

impl DescriptorBuilder {
    /// Start a descriptor for the named entity type. The table name defaults
    /// to the entity name until [`Self::table`] overrides it.
    #[must_use]
    pub fn new(entity: &str) -> Self {
        Self {
            entity: entity.to_string(),
            table: None,
            schema: None,
            soft_delete: false,
            sync_with_list: false,
            audit_trail: false,
            archive: false,
            expiry_span: None,
            depends_on: Vec::new(),
            columns: Vec::new(),
            pk_counter: 0,
            fk_specs: Vec::new(),
            index_specs: Vec::new(),
            misplaced_modifier: false,
        }
    }

    // ── Table annotations ─────────────────────────────────────

    #[must_use]
    pub fn table(mut self, name: &str) -> Self {
        self.table = Some(name.to_string());
        self
    }

    #[must_use]
    pub fn schema(mut self, name: &str) -> Self {
        self.schema = Some(name.to_string());
        self
    }

    /// Enable append-only versioned rows with tombstone deletes.
    #[must_use]
    pub const fn soft_delete(mut self, enabled: bool) -> Self {
        self.soft_delete = enabled;
        self
    }

    /// Allow this entity to participate in list mappings.
    #[must_use]
    pub const fn sync_with_list(mut self, enabled: bool) -> Self {
        self.sync_with_list = enabled;
        self
    }

    /// Append an audit record for every mutation.
    #[must_use]
    pub const fn audit_trail(mut self, enabled: bool) -> Self {
        self.audit_trail = enabled;
        self
    }

    /// Rows expire this long after creation unless explicitly overridden.
    #[must_use]
    pub const fn expiry_span(mut self, span: TimeDelta) -> Self {
        self.expiry_span = Some(span);
        self
    }

    /// Archived rows are shielded from expiry purges. Requires expiry.
    #[must_use]
    pub const fn archive(mut self, enabled: bool) -> Self {
        self.archive = enabled;
        self
    }

    /// Declare a creation-order dependency on another table.
    #[must_use]
    pub fn depends_on(mut self, table: &str) -> Self {
        self.depends_on.push(table.to_string());
        self
    }

    // ── Column annotations ────────────────────────────────────

    /// Declare the key property (single primary key, or the first component
    /// of a composite one when combined with further [`Self::primary_key`]
    /// calls).
    #[must_use]
    pub fn key(self, property: &str, kind: PropertyKind) -> Self {
        self.column(property, kind).primary_key()
    }

    /// Declare a column with an inferred SQL type.
    #[must_use]
    pub fn column(self, property: &str, kind: PropertyKind) -> Self {
        let sql_type = kind.infer();
        self.column_typed(property, sql_type)
    }

    /// Declare a column with an explicit SQL type annotation.
    ///
    /// Re-declaring a property replaces the earlier declaration in place;
    /// the most-derived declaration wins.
    #[must_use]
    pub fn column_typed(mut self, property: &str, sql_type: SqlType) -> Self {
        let descriptor = ColumnDescriptor {
            property: property.to_string(),
            column: property.to_string(),
            sql_type,
            nullable: false,
            default: None,
            unique: false,
            computed: None,
            check: None,
            tracking: None,
            pk_order: None,
            auto_increment: false,
            not_mapped: false,
        };
        if let Some(existing) = self.columns.iter_mut().find(|c| c.property == property) {
            *existing = descriptor;
        } else {
            self.columns.push(descriptor);
        }
        self
    }

    /// Map the last column to a differently named database column.
    #[must_use]
    pub fn map_to(mut self, column: &str) -> Self {
        match self.last_column() {
            Some(c) => c.column = column.to_string(),
            None => self.misplaced_modifier = true,
        }
        self
    }

    /// Mark the last column nullable.
    #[must_use]
    pub fn nullable(mut self) -> Self {
        match self.last_column() {
            Some(c) => c.nullable = true,
            None => self.misplaced_modifier = true,
        }
        self
    }

    /// Mark the last column unique.
    #[must_use]
    pub fn unique(mut self) -> Self {
        match self.last_column() {
            Some(c) => c.unique = true,
            None => self.misplaced_modifier = true,
        }
        self
    }

    /// Set a SQL-literal default on the last column.
    #[must_use]
    pub fn default_value(mut self, literal: &str) -> Self {
        match self.last_column() {
            Some(c) => c.default = Some(literal.to_string()),
            None => self.misplaced_modifier = true,
        }
        self
    }

    /// Attach a CHECK constraint body to the last column.
    #[must_use]
    pub fn check(mut self, constraint: &str) -> Self {
        match self.last_column() {
            Some(c) => c.check = Some(constraint.to_string()),
            None => self.misplaced_modifier = true,
        }
        self
    }

    /// Make the last column computed from a SQL expression.
    #[must_use]
    pub fn computed(mut self, expression: &str, persisted: bool) -> Self {
        match self.last_column() {
            Some(c) => {
                c.computed = Some(ComputedSpec {
                    expression: expression.to_string(),
                    persisted,
                });
            }
            None => self.misplaced_modifier = true,
        }
        self
    }

    /// Mark the last column auto-incrementing.
    #[must_use]
    pub fn auto_increment(mut self) -> Self {
        match self.last_column() {
            Some(c) => c.auto_increment = true,
            None => self.misplaced_modifier = true,
        }
        self
    }

    /// Exclude the last column from every generated statement.
    #[must_use]
    pub fn not_mapped(mut self) -> Self {
        match self.last_column() {
            Some(c) => c.not_mapped = true,
            None => self.misplaced_modifier = true,
        }
        self
    }

    /// Add the last column to the primary key, in call order.
    #[must_use]
    pub fn primary_key(mut self) -> Self {
        let order = self.pk_counter;
        match self.last_column() {
            Some(c) => {
                if c.pk_order.is_none() {
                    c.pk_order = Some(order);
                }
            }
            None => self.misplaced_modifier = true,
        }
        self.pk_counter += 1;
        self
    }

    // ── Foreign-key annotations ───────────────────────────────

    /// Declare a foreign key from the given local property. Combine several
    /// calls under one [`Self::fk_named`] name to form a composite key.
    #[must_use]
    pub fn foreign_key(
        mut self,
        property: &str,
        references_table: &str,
        referenced_column: &str,
    ) -> Self {
        self.fk_specs.push(FkSpec {
            name: None,
            property: property.to_string(),
            references_table: references_table.to_string(),
            referenced_column: referenced_column.to_string(),
            on_delete: FkAction::NoAction,
            on_update: FkAction::NoAction,
        });
        self
    }

    /// Name the last foreign-key annotation (groups annotations that share
    /// a name into one composite constraint).
    #[must_use]
    pub fn fk_named(mut self, name: &str) -> Self {
        match self.fk_specs.last_mut() {
            Some(spec) => spec.name = Some(name.to_string()),
            None => self.misplaced_modifier = true,
        }
        self
    }

    #[must_use]
    pub fn fk_on_delete(mut self, action: FkAction) -> Self {
        match self.fk_specs.last_mut() {
            Some(spec) => spec.on_delete = action,
            None => self.misplaced_modifier = true,
        }
        self
    }

    #[must_use]
    pub fn fk_on_update(mut self, action: FkAction) -> Self {
        match self.fk_specs.last_mut() {
            Some(spec) => spec.on_update = action,
            None => self.misplaced_modifier = true,
        }
        self
    }

    // ── Index annotations ─────────────────────────────────────

    /// Declare an index. Column specs may carry a trailing ` DESC` for
    /// descending order or ` INCLUDED` for covering columns. The name falls
    /// back to `IX_{table}_{first column}`.
    #[must_use]
    pub fn index(mut self, columns: &[&str]) -> Self {
        self.index_specs.push(IndexSpec {
            name: None,
            unique: false,
            filter: None,
            columns: columns.iter().map(ToString::to_string).collect(),
        });
        self
    }

    /// Declare a uniquely named index.
    #[must_use]
    pub fn named_index(mut self, name: &str, columns: &[&str]) -> Self {
        self.index_specs.push(IndexSpec {
            name: Some(name.to_string()),
            unique: false,
            filter: None,
            columns: columns.iter().map(ToString::to_string).collect(),
        });
        self
    }

    /// Mark the last index unique.
    #[must_use]
    pub fn index_unique(mut self) -> Self {
        match self.index_specs.last_mut() {
            Some(spec) => spec.unique = true,
            None => self.misplaced_modifier = true,
        }
        self
    }

    /// Attach a partial-index predicate to the last index.
    #[must_use]
    pub fn index_filter(mut self, filter: &str) -> Self {
        match self.index_specs.last_mut() {
            Some(spec) => spec.filter = Some(filter.to_string()),
            None => self.misplaced_modifier = true,
        }
        self
    }

    // ── Build ─────────────────────────────────────────────────

    /// Validate the annotation set and produce the immutable descriptor.
    ///
    /// # Errors
    ///
    /// Fails with `invalid-descriptor` when the table name is empty, no key
    /// can be resolved, a composite foreign-key group disagrees on its
    /// referenced table or actions, or archive is enabled without expiry.
    pub fn build(mut self) -> Result<EntityDescriptor> {
        if self.misplaced_modifier {
            return Err(self.invalid("column modifier before any column declaration"));
        }
        if self.entity.trim().is_empty() {
            return Err(self.invalid("entity name is empty"));
        }
        let table = self.table.clone().unwrap_or_else(|| self.entity.clone());
        if table.trim().is_empty() {
            return Err(self.invalid("table name is empty"));
        }
        if self.archive && self.expiry_span.is_none() {
            return Err(self.invalid("archive requires an expiry span"));
        }

        self.resolve_primary_key()?;
        self.provision_tracking_columns();

        let mut primary_key = self.ordered_primary_key();
        if self.soft_delete && primary_key.last().map(String::as_str) != Some(track::VERSION) {
            primary_key.push(track::VERSION.to_string());
        }

        let foreign_keys = self.resolve_foreign_keys(&table)?;
        let indexes = self.resolve_indexes(&table);

        Ok(EntityDescriptor {
            entity: self.entity,
            table,
            schema: self.schema,
            soft_delete: self.soft_delete,
            sync_with_list: self.sync_with_list,
            audit_trail: self.audit_trail,
            archive: self.archive,
            expiry_span: self.expiry_span,
            depends_on: self.depends_on,
            columns: self.columns,
            primary_key,
            indexes,
            foreign_keys,
        })
    }

    fn last_column(&mut self) -> Option<&mut ColumnDescriptor> {
        self.columns.last_mut()
    }

    fn invalid(&self, message: &str) -> Error {
        Error::InvalidDescriptor {
            entity: self.entity.clone(),
            message: message.to_string(),
        }
    }

    /// Ensure at least one primary-key component exists, falling back to the
    /// conventional `Id`/`Key` properties.
    fn resolve_primary_key(&mut self) -> Result<()> {
        if self.columns.iter().any(|c| c.pk_order.is_some()) {
            return Ok(());
        }
        for conventional in [track::ID, track::KEY] {
            if let Some(column) = self
                .columns
                .iter_mut()
                .find(|c| c.property == conventional)
            {
                column.pk_order = Some(0);
                return Ok(());
            }
        }
        Err(self.invalid("no primary key annotation and no conventional Id/Key property"))
    }

    /// Provision the engine-managed tracking columns that the flag set
    /// requires. Caller-declared columns keep their declaration; only the
    /// tracking role is stamped on.
    fn provision_tracking_columns(&mut self) {
        self.ensure_tracking(track::VERSION, SqlType::BigInt, false, TrackingRole::Version);
        self.ensure_tracking(
            track::CREATED_TIME,
            SqlType::Timestamp,
            false,
            TrackingRole::CreatedTime,
        );
        self.ensure_tracking(
            track::LAST_WRITE_TIME,
            SqlType::Timestamp,
            false,
            TrackingRole::LastWriteTime,
        );
        if self.soft_delete {
            self.ensure_tracking(
                track::IS_DELETED,
                SqlType::Boolean,
                false,
                TrackingRole::IsDeleted,
            );
        }
        if self.expiry_span.is_some() {
            self.ensure_tracking(
                track::ABSOLUTE_EXPIRATION,
                SqlType::Timestamp,
                true,
                TrackingRole::AbsoluteExpiration,
            );
        }
        if self.archive {
            self.ensure_tracking(
                track::IS_ARCHIVED,
                SqlType::Boolean,
                false,
                TrackingRole::IsArchived,
            );
        }
    }

    fn ensure_tracking(
        &mut self,
        property: &str,
        sql_type: SqlType,
        nullable: bool,
        role: TrackingRole,
    ) {
        if let Some(existing) = self.columns.iter_mut().find(|c| c.property == property) {
            existing.tracking = Some(role);
            return;
        }
        self.columns.push(ColumnDescriptor {
            property: property.to_string(),
            column: property.to_string(),
            sql_type,
            nullable,
            default: None,
            unique: false,
            computed: None,
            check: None,
            tracking: Some(role),
            pk_order: None,
            auto_increment: false,
            not_mapped: false,
        });
    }

    /// Primary-key property names sorted by their annotation order.
    fn ordered_primary_key(&self) -> Vec<String> {
        let mut components: Vec<(u32, String)> = self
            .columns
            .iter()
            .filter_map(|c| c.pk_order.map(|order| (order, c.property.clone())))
            .collect();
        components.sort_by_key(|(order, _)| *order);
        components.into_iter().map(|(_, p)| p).collect()
    }

    /// Group foreign-key annotations by constraint name and validate that
    /// composite groups agree on table and actions.
    fn resolve_foreign_keys(&self, table: &str) -> Result<Vec<ForeignKeyDescriptor>> {
        let mut groups: Vec<ForeignKeyDescriptor> = Vec::new();
        for spec in &self.fk_specs {
            let name = spec
                .name
                .clone()
                .unwrap_or_else(|| format!("FK_{table}_{}", spec.property));
            let column = self
                .columns
                .iter()
                .find(|c| c.property == spec.property)
                .ok_or_else(|| {
                    self.invalid(&format!(
                        "foreign key references undeclared property {}",
                        spec.property
                    ))
                })?
                .column
                .clone();

            if let Some(group) = groups.iter_mut().find(|g| g.name == name) {
                if group.references_table != spec.references_table {
                    return Err(self.invalid(&format!(
                        "foreign key group {name} references both {} and {}",
                        group.references_table, spec.references_table
                    )));
                }
                if group.on_delete != spec.on_delete || group.on_update != spec.on_update {
                    return Err(self.invalid(&format!(
                        "foreign key group {name} has mismatched referential actions"
                    )));
                }
                group.columns.push(column);
                group
                    .referenced_columns
                    .push(spec.referenced_column.clone());
            } else {
                groups.push(ForeignKeyDescriptor {
                    name,
                    columns: vec![column],
                    references_table: spec.references_table.clone(),
                    referenced_columns: vec![spec.referenced_column.clone()],
                    on_delete: spec.on_delete,
                    on_update: spec.on_update,
                });
            }
        }
        Ok(groups)
    }

    /// Resolve index specs into named groups, parsing ` DESC`/` INCLUDED`
    /// suffixes and applying the `IX_{table}_{column}` fallback name.
    fn resolve_indexes(&self, table: &str) -> Vec<IndexDescriptor> {
        self.index_specs
            .iter()
            .map(|spec| {
                let columns: Vec<IndexColumn> = spec
                    .columns
                    .iter()
                    .enumerate()
                    .map(|(position, raw)| {
                        let mut name = raw.trim();
                        let mut descending = false;
                        let mut included = false;
                        if let Some(stripped) = name.strip_suffix(" INCLUDED") {
                            included = true;
                            name = stripped.trim();
                        }
                        if let Some(stripped) = name.strip_suffix(" DESC") {
                            descending = true;
                            name = stripped.trim();
                        }
                        IndexColumn {
                            column: name.to_string(),
                            descending,
                            order: u32::try_from(position).unwrap_or(u32::MAX),
                            included,
                        }
                    })
                    .collect();
                let name = spec.name.clone().unwrap_or_else(|| {
                    let first = columns
                        .first()
                        .map_or("unnamed", |c| c.column.as_str());
                    format!("IX_{table}_{first}")
                });
                IndexDescriptor {
                    name,
                    unique: spec.unique,
                    filter: spec.filter.clone(),
                    columns,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn order_builder() -> DescriptorBuilder {
        DescriptorBuilder::new("Order")
            .table("Orders")
            .key("Id", PropertyKind::Str)
            .column("Name", PropertyKind::Str)
            .column("Total", PropertyKind::Decimal)
    }

    #[test]
    fn conventional_id_becomes_key() {
        let descriptor = DescriptorBuilder::new("Widget")
            .column("Id", PropertyKind::Str)
            .column("Label", PropertyKind::Str)
            .build()
            .unwrap();
        assert_eq!(descriptor.primary_key(), ["Id"]);
        assert_eq!(descriptor.key_property(), "Id");
    }

    #[test]
    fn missing_key_is_fatal() {
        let err = DescriptorBuilder::new("Widget")
            .column("Label", PropertyKind::Str)
            .build()
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidDescriptor);
    }

    #[test]
    fn soft_delete_extends_primary_key_with_version() {
        let descriptor = order_builder().soft_delete(true).build().unwrap();
        assert_eq!(descriptor.primary_key(), ["Id", "Version"]);
        assert!(descriptor.composite_key());
        assert!(descriptor.tracking_column(TrackingRole::IsDeleted).is_some());
    }

    #[test]
    fn tracking_columns_are_provisioned() {
        let descriptor = order_builder().build().unwrap();
        for property in [track::VERSION, track::CREATED_TIME, track::LAST_WRITE_TIME] {
            assert!(descriptor.column(property).is_some(), "missing {property}");
        }
        // No soft delete, so no tombstone column.
        assert!(descriptor.column(track::IS_DELETED).is_none());
    }

    #[test]
    fn expiry_provisions_expiration_column() {
        let descriptor = order_builder()
            .expiry_span(TimeDelta::try_hours(1).unwrap())
            .build()
            .unwrap();
        let column = descriptor.column(track::ABSOLUTE_EXPIRATION).unwrap();
        assert!(column.nullable);
        assert_eq!(column.sql_type, SqlType::Timestamp);
    }

    #[test]
    fn archive_without_expiry_is_fatal() {
        let err = order_builder().archive(true).build().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidDescriptor);
    }

    #[test]
    fn redeclared_property_keeps_most_derived() {
        let descriptor = order_builder()
            .column_typed("Name", SqlType::Text { length: Some(64) })
            .build()
            .unwrap();
        let name = descriptor.column("Name").unwrap();
        assert_eq!(name.sql_type, SqlType::Text { length: Some(64) });
        // Still a single declaration.
        assert_eq!(
            descriptor
                .columns()
                .iter()
                .filter(|c| c.property == "Name")
                .count(),
            1
        );
    }

    #[test]
    fn composite_fk_groups_by_name() {
        let descriptor = DescriptorBuilder::new("Shipment")
            .key("Id", PropertyKind::Str)
            .column("Region", PropertyKind::Str)
            .column("Code", PropertyKind::Str)
            .foreign_key("Region", "Depots", "Region")
            .fk_named("FK_Shipment_Depot")
            .fk_on_delete(FkAction::Cascade)
            .foreign_key("Code", "Depots", "Code")
            .fk_named("FK_Shipment_Depot")
            .fk_on_delete(FkAction::Cascade)
            .build()
            .unwrap();
        assert_eq!(descriptor.foreign_keys().len(), 1);
        let fk = &descriptor.foreign_keys()[0];
        assert_eq!(fk.columns, ["Region", "Code"]);
        assert_eq!(fk.referenced_columns, ["Region", "Code"]);
    }

    #[test]
    fn composite_fk_mismatch_is_fatal() {
        let err = DescriptorBuilder::new("Shipment")
            .key("Id", PropertyKind::Str)
            .column("Region", PropertyKind::Str)
            .column("Code", PropertyKind::Str)
            .foreign_key("Region", "Depots", "Region")
            .fk_named("FK_Shipment_Depot")
            .foreign_key("Code", "Warehouses", "Code")
            .fk_named("FK_Shipment_Depot")
            .build()
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidDescriptor);
    }

    #[test]
    fn index_name_fallback() {
        let descriptor = order_builder()
            .index(&["Name", "CreatedTime DESC"])
            .build()
            .unwrap();
        let index = &descriptor.indexes()[0];
        assert_eq!(index.name, "IX_Orders_Name");
        assert!(!index.columns[0].descending);
        assert!(index.columns[1].descending);
        assert_eq!(index.columns[1].column, "CreatedTime");
    }
}

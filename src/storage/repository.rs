//! The typed repository facade.
//!
//! `Repository<E>` binds an entity type to a [`Store`] and exposes the full
//! operation contract: versioned CRUD, batches, predicate queries, list
//! mappings, bulk import/export, and purge. Every mutation goes through the
//! store's transaction protocol and retry policy; every failure carries the
//! operation, entity type, and key.

use std::marker::PhantomData;
use std::path::Path;

use crate::bulk::{
    export, import, purge, ExportOptions, ExportSummary, ImportOptions, ImportSummary,
    Progress, PurgeOptions, PurgeSummary,
};
use crate::descriptor::EntityDescriptor;
use crate::entity::{CallerInfo, Entity, KeyValue, Row};
use crate::error::{Error, Result};
use crate::query::{translate_order, translate_predicate, OrderRecorder, Predicate, SqliteDialect};
use crate::sql::dml::{self, SelectOptions};
use crate::sql::{ddl, SqlStatement};
use crate::storage::audit::{self, AuditOperation, AuditRecord};
use crate::storage::engine::{engine_now, Store};
use crate::storage::transaction::Scope;
use crate::storage::{lists, ops};

/// Options for predicate queries.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub include_all_versions: bool,
    pub include_deleted: bool,
    pub include_expired: bool,
    pub order: Option<OrderRecorder>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

/// One page of query results.
#[derive(Debug, Clone)]
pub struct Page<E> {
    pub items: Vec<E>,
    pub total: i64,
    pub page_count: u32,
}

/// Typed facade over a [`Store`] for one entity type.
pub struct Repository<'store, E: Entity> {
    store: &'store mut Store,
    _entity: PhantomData<E>,
}

impl Store {
    /// A typed repository handle for one entity type.
    pub fn repository<E: Entity>(&mut self) -> Repository<'_, E> {
        Repository {
            store: self,
            _entity: PhantomData,
        }
    }
}

impl<E: Entity> Repository<'_, E> {
    fn descriptor() -> &'static EntityDescriptor {
        E::descriptor()
    }

    /// Create the entity's table and indexes (idempotent).
    ///
    /// Tables this one depends on must be initialized first; the
    /// descriptor's dependency list gives the order.
    ///
    /// # Errors
    ///
    /// Returns an error if DDL execution fails.
    pub fn initialize(&mut self) -> Result<()> {
        let table = ddl::create_table(Self::descriptor(), true);
        let indexes = ddl::create_indexes(Self::descriptor(), true);
        self.store.execute("initialize", |tx| {
            tx.execute(&table, [])?;
            for index in &indexes {
                tx.execute(index, [])?;
            }
            Ok(())
        })
    }

    // ── Create ────────────────────────────────────────────────

    /// Create a new entity.
    ///
    /// # Errors
    ///
    /// Fails with `entity-already-exists` when a live row holds the key.
    pub fn create(&mut self, entity: &E, caller: &CallerInfo) -> Result<E> {
        let row = entity.to_row();
        let stored = self.store.execute("create", |tx| {
            ops::create_row(tx, Self::descriptor(), row.clone(), caller, None)
        })?;
        E::from_row(&stored)
    }

    /// Create a batch of entities inside one transaction.
    ///
    /// Any failure rolls back the whole batch; key conflicts are collected
    /// into one aggregate error naming every offending entity.
    ///
    /// # Errors
    ///
    /// See [`Self::create`]; conflicts aggregate into `concurrency-conflict`.
    pub fn create_batch(&mut self, entities: &[E], caller: &CallerInfo) -> Result<Vec<E>> {
        let rows: Vec<Row> = entities.iter().map(Entity::to_row).collect();
        let stored = self.store.execute("create_batch", |tx| {
            let mut created = Vec::with_capacity(rows.len());
            let mut conflicts = Vec::new();
            for row in &rows {
                match ops::create_row(tx, Self::descriptor(), row.clone(), caller, None) {
                    Ok(stored) => created.push(stored),
                    Err(Error::AlreadyExists { key, .. }) => conflicts.push(key),
                    Err(other) => return Err(other),
                }
            }
            if conflicts.is_empty() {
                Ok(created)
            } else {
                Err(Error::BatchConflict {
                    entity: Self::descriptor().entity().to_string(),
                    operation: "create",
                    keys: conflicts,
                })
            }
        })?;
        stored.iter().map(E::from_row).collect()
    }

    // ── Read ──────────────────────────────────────────────────

    /// The visible entity for a key: latest version, not deleted, not
    /// expired.
    ///
    /// # Errors
    ///
    /// Returns an error if the query or materialization fails.
    pub fn get(&self, key: &E::Key) -> Result<Option<E>> {
        let row = ops::get_visible(self.store.connection(), Self::descriptor(), &key.to_value())?;
        row.map(|r| E::from_row(&r)).transpose()
    }

    /// All stored rows for a key, newest version first, with visibility
    /// controlled per flag.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get_by_key(
        &self,
        key: &E::Key,
        include_all_versions: bool,
        include_deleted: bool,
        include_expired: bool,
    ) -> Result<Vec<E>> {
        let descriptor = Self::descriptor();
        let mut options = SelectOptions::by_key(descriptor, &key.to_value());
        options.include_all_versions = include_all_versions;
        options.include_deleted = include_deleted;
        options.include_expired = include_expired;
        let statement = dml::select(descriptor, &options, engine_now());
        let rows = self.store.select_rows(descriptor, &statement)?;
        rows.iter().map(E::from_row).collect()
    }

    /// All visible entities, optionally filtered.
    ///
    /// # Errors
    ///
    /// Returns an error if translation or the query fails.
    pub fn get_all(&self, filter: Option<&Predicate>) -> Result<Vec<E>> {
        self.run_query(filter, &QueryOptions::default())
    }

    /// Entities matching a predicate.
    ///
    /// # Errors
    ///
    /// Fails with `unsupported-expression` when the predicate does not
    /// translate.
    pub fn query(&self, predicate: &Predicate, options: &QueryOptions) -> Result<Vec<E>> {
        self.run_query(Some(predicate), options)
    }

    /// One page of matches plus the total count.
    ///
    /// Pages are 1-based.
    ///
    /// # Errors
    ///
    /// See [`Self::query`].
    pub fn query_paged(
        &self,
        predicate: &Predicate,
        page_size: u32,
        page_number: u32,
    ) -> Result<Page<E>> {
        let page_size = page_size.max(1);
        let page_number = page_number.max(1);
        let total = self.count(Some(predicate))?;
        let options = QueryOptions {
            limit: Some(page_size),
            offset: Some((page_number - 1) * page_size),
            ..QueryOptions::default()
        };
        let items = self.run_query(Some(predicate), &options)?;
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let page_count = ((total.max(0) as u64).div_ceil(u64::from(page_size))) as u32;
        Ok(Page {
            items,
            total,
            page_count,
        })
    }

    /// Count of visible entities matching an optional predicate.
    ///
    /// # Errors
    ///
    /// See [`Self::query`].
    pub fn count(&self, predicate: Option<&Predicate>) -> Result<i64> {
        let statement = self.build_select(predicate, &QueryOptions::default(), true)?;
        self.store.select_scalar(&statement)
    }

    /// Whether any visible entity matches the predicate.
    ///
    /// # Errors
    ///
    /// See [`Self::query`].
    pub fn exists(&self, predicate: &Predicate) -> Result<bool> {
        Ok(self.count(Some(predicate))? > 0)
    }

    // ── Update ────────────────────────────────────────────────

    /// Update an entity. Its `Version` field is the optimistic concurrency
    /// token.
    ///
    /// # Errors
    ///
    /// Fails with `entity-not-found`, `entity-deleted`, or
    /// `concurrency-conflict` per the versioning state machine.
    pub fn update(&mut self, entity: &E, caller: &CallerInfo) -> Result<E> {
        let row = entity.to_row();
        let expected = version_token::<E>(&row)?;
        let stored = self.store.execute("update", |tx| {
            ops::update_row(tx, Self::descriptor(), row.clone(), caller, expected)
        })?;
        E::from_row(&stored)
    }

    /// Update a batch inside one transaction, applying `mutate_fn` to each
    /// entity before writing.
    ///
    /// Version conflicts across the batch aggregate into one error naming
    /// the offending entities; any error rolls back the whole batch.
    ///
    /// # Errors
    ///
    /// See [`Self::update`].
    pub fn update_batch(
        &mut self,
        mut entities: Vec<E>,
        mutate_fn: Option<&dyn Fn(&mut E)>,
        caller: &CallerInfo,
    ) -> Result<Vec<E>> {
        if let Some(mutate) = mutate_fn {
            for entity in &mut entities {
                mutate(entity);
            }
        }
        let rows: Vec<(Row, i64)> = entities
            .iter()
            .map(|entity| {
                let row = entity.to_row();
                let token = version_token::<E>(&row)?;
                Ok((row, token))
            })
            .collect::<Result<_>>()?;

        let stored = self.store.execute("update_batch", |tx| {
            let mut updated = Vec::with_capacity(rows.len());
            let mut conflicts = Vec::new();
            for (row, expected) in &rows {
                match ops::update_row(tx, Self::descriptor(), row.clone(), caller, *expected) {
                    Ok(stored) => updated.push(stored),
                    Err(
                        Error::VersionConflict { key, .. } | Error::Deleted { key, .. },
                    ) => conflicts.push(key),
                    Err(other) => return Err(other),
                }
            }
            if conflicts.is_empty() {
                Ok(updated)
            } else {
                Err(Error::BatchConflict {
                    entity: Self::descriptor().entity().to_string(),
                    operation: "update",
                    keys: conflicts,
                })
            }
        })?;
        stored.iter().map(E::from_row).collect()
    }

    // ── Delete ────────────────────────────────────────────────

    /// Delete an entity. Returns `false` when the key never existed;
    /// deleting an already-deleted entity is success.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn delete(&mut self, key: &E::Key, caller: &CallerInfo) -> Result<bool> {
        let key = key.to_value();
        self.store
            .execute("delete", |tx| ops::delete_row(tx, Self::descriptor(), &key, caller))
    }

    /// Delete a batch inside one transaction. Returns how many keys were
    /// actually removed or tombstoned.
    ///
    /// # Errors
    ///
    /// Any failure rolls back the whole batch.
    pub fn delete_batch(&mut self, keys: &[E::Key], caller: &CallerInfo) -> Result<usize> {
        let values: Vec<crate::value::Value> = keys.iter().map(KeyValue::to_value).collect();
        self.store.execute("delete_batch", |tx| {
            let mut removed = 0;
            for key in &values {
                if ops::delete_row(tx, Self::descriptor(), key, caller)? {
                    removed += 1;
                }
            }
            Ok(removed)
        })
    }

    // ── Transactions ──────────────────────────────────────────

    /// Open a caller-managed transaction scope.
    ///
    /// # Errors
    ///
    /// Fails with `nested-transaction` when a scope is already open.
    pub fn begin_transaction(&mut self) -> Result<Scope<'_>> {
        self.store.begin_scope()
    }

    // ── Lists ─────────────────────────────────────────────────

    /// Create a list and its member entities.
    ///
    /// # Errors
    ///
    /// Fails with `list-already-exists` or the per-entity create errors.
    pub fn create_list(
        &mut self,
        list_key: &str,
        entities: &[E],
        caller: &CallerInfo,
    ) -> Result<Vec<E>> {
        let rows: Vec<Row> = entities.iter().map(Entity::to_row).collect();
        let stored = self.store.execute("create_list", |tx| {
            lists::create_list(tx, Self::descriptor(), list_key, rows.clone(), caller)
        })?;
        stored.iter().map(E::from_row).collect()
    }

    /// Assemble a list in mapping order, reconciling mapping versions.
    ///
    /// # Errors
    ///
    /// Fails with `entity-not-found` for missing or deleted members and
    /// `concurrency-conflict` when a mapping is ahead of storage.
    pub fn get_list(&mut self, list_key: &str) -> Result<Vec<E>> {
        let stored = self
            .store
            .execute("get_list", |tx| lists::get_list(tx, Self::descriptor(), list_key))?;
        stored.iter().map(E::from_row).collect()
    }

    /// Replace a list's membership as a unit.
    ///
    /// Dropped members lose their mapping only; kept members are
    /// deep-compared against storage and rewritten only when they differ;
    /// new members are created.
    ///
    /// # Errors
    ///
    /// Fails with the per-entity create/update errors.
    pub fn update_list(
        &mut self,
        list_key: &str,
        entities: &[E],
        caller: &CallerInfo,
    ) -> Result<Vec<E>> {
        let rows: Vec<Row> = entities.iter().map(Entity::to_row).collect();
        let stored = self.store.execute("update_list", |tx| {
            lists::update_list(tx, Self::descriptor(), list_key, rows.clone(), caller)
        })?;
        stored.iter().map(E::from_row).collect()
    }

    /// Remove a list's mappings, leaving entities untouched. Returns the
    /// removed mapping count.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub fn delete_list(&mut self, list_key: &str) -> Result<usize> {
        self.store
            .execute("delete_list", |tx| lists::delete_list(tx, list_key))
    }

    // ── Bulk ──────────────────────────────────────────────────

    /// Export entities into a package directory.
    ///
    /// # Errors
    ///
    /// See [`crate::bulk::export`].
    pub fn bulk_export(
        &mut self,
        dest: &Path,
        options: &ExportOptions,
        progress: Option<Progress<'_>>,
    ) -> Result<ExportSummary> {
        export::run(self.store, Self::descriptor(), dest, options, progress)
    }

    /// Import a package directory.
    ///
    /// # Errors
    ///
    /// See [`crate::bulk::import`].
    pub fn bulk_import(
        &mut self,
        source: &Path,
        options: &ImportOptions,
        progress: Option<Progress<'_>>,
    ) -> Result<ImportSummary> {
        import::run(self.store, Self::descriptor(), source, options, progress)
    }

    /// Purge rows per the selected strategy.
    ///
    /// # Errors
    ///
    /// See [`crate::bulk::purge`].
    pub fn purge(&mut self, options: &PurgeOptions) -> Result<PurgeSummary> {
        purge::run(self.store, Self::descriptor(), options)
    }

    // ── Audit ─────────────────────────────────────────────────

    /// The audit trail for one entity, most recent first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn audit_trail(&self, key: &E::Key, limit: u32) -> Result<Vec<AuditRecord>> {
        audit::trail(
            self.store.connection(),
            Self::descriptor().entity(),
            &key.to_string(),
            limit,
        )
    }

    /// Append a READ audit record for an audited entity.
    ///
    /// Reads are not audited implicitly; callers that need read trails
    /// record them explicitly.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn record_read_audit(&mut self, key: &E::Key, caller: &CallerInfo) -> Result<()> {
        let key_value = key.to_value();
        let key_text = key.to_string();
        self.store.execute("record_read_audit", |tx| {
            let latest = ops::read_latest_any(tx, Self::descriptor(), &key_value)?;
            audit::append(
                tx,
                Self::descriptor().entity(),
                &key_text,
                AuditOperation::Read,
                latest.as_ref().and_then(Row::version),
                None,
                0,
                caller,
            )?;
            Ok(())
        })
    }

    // ── Internals ─────────────────────────────────────────────

    fn run_query(&self, predicate: Option<&Predicate>, options: &QueryOptions) -> Result<Vec<E>> {
        let statement = self.build_select(predicate, options, false)?;
        let rows = self.store.select_rows(Self::descriptor(), &statement)?;
        rows.iter().map(E::from_row).collect()
    }

    fn build_select(
        &self,
        predicate: Option<&Predicate>,
        options: &QueryOptions,
        counting: bool,
    ) -> Result<SqlStatement> {
        let descriptor = Self::descriptor();
        let dialect = SqliteDialect;
        let where_clause = predicate
            .map(|p| translate_predicate(descriptor, p, &dialect))
            .transpose()?;
        let order_by = options
            .order
            .as_ref()
            .filter(|recorder| !recorder.is_empty())
            .map(|recorder| translate_order(descriptor, recorder))
            .transpose()?;
        let select_options = SelectOptions {
            include_all_versions: options.include_all_versions,
            include_deleted: options.include_deleted,
            include_expired: options.include_expired,
            where_clause,
            order_by,
            limit: options.limit,
            offset: options.offset,
        };
        let now = engine_now();
        Ok(if counting {
            dml::count(descriptor, &select_options, now)
        } else {
            dml::select(descriptor, &select_options, now)
        })
    }
}

fn version_token<E: Entity>(row: &Row) -> Result<i64> {
    row.version().ok_or_else(|| Error::Constraint {
        message: format!(
            "update on {} requires a Version token",
            E::descriptor().entity()
        ),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{track, DescriptorBuilder, PropertyKind};
    use crate::entity::missing_property;
    use crate::error::ErrorKind;
    use crate::query::col;
    use std::sync::LazyLock;

    #[derive(Debug, Clone, PartialEq)]
    struct Article {
        id: String,
        title: String,
        views: i64,
        version: i64,
    }

    impl Article {
        fn new(id: &str, title: &str) -> Self {
            Self {
                id: id.to_string(),
                title: title.to_string(),
                views: 0,
                version: 0,
            }
        }
    }

    static ARTICLE: LazyLock<EntityDescriptor> = LazyLock::new(|| {
        DescriptorBuilder::new("Article")
            .table("Articles")
            .key("Id", PropertyKind::Str)
            .column("Title", PropertyKind::Str)
            .column("Views", PropertyKind::I64)
            .soft_delete(true)
            .sync_with_list(true)
            .audit_trail(true)
            .index(&["Title"])
            .build()
            .unwrap()
    });

    impl Entity for Article {
        type Key = String;

        fn descriptor() -> &'static EntityDescriptor {
            &ARTICLE
        }

        fn key(&self) -> String {
            self.id.clone()
        }

        fn to_row(&self) -> Row {
            let mut row = Row::new()
                .with("Id", self.id.as_str())
                .with("Title", self.title.as_str())
                .with("Views", self.views);
            if self.version > 0 {
                row.set(track::VERSION, self.version);
            }
            row
        }

        fn from_row(row: &Row) -> Result<Self> {
            Ok(Self {
                id: row
                    .get_str("Id")
                    .ok_or_else(|| missing_property("Article", "Id"))?
                    .to_string(),
                title: row
                    .get_str("Title")
                    .ok_or_else(|| missing_property("Article", "Title"))?
                    .to_string(),
                views: row.get_i64("Views").unwrap_or(0),
                version: row.version().unwrap_or(0),
            })
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    struct Gadget {
        id: String,
        name: String,
        version: i64,
    }

    static GADGET: LazyLock<EntityDescriptor> = LazyLock::new(|| {
        DescriptorBuilder::new("Gadget")
            .table("Gadgets")
            .key("Id", PropertyKind::Str)
            .column("Name", PropertyKind::Str)
            .build()
            .unwrap()
    });

    impl Entity for Gadget {
        type Key = String;

        fn descriptor() -> &'static EntityDescriptor {
            &GADGET
        }

        fn key(&self) -> String {
            self.id.clone()
        }

        fn to_row(&self) -> Row {
            let mut row = Row::new()
                .with("Id", self.id.as_str())
                .with("Name", self.name.as_str());
            if self.version > 0 {
                row.set(track::VERSION, self.version);
            }
            row
        }

        fn from_row(row: &Row) -> Result<Self> {
            Ok(Self {
                id: row
                    .get_str("Id")
                    .ok_or_else(|| missing_property("Gadget", "Id"))?
                    .to_string(),
                name: row
                    .get_str("Name")
                    .ok_or_else(|| missing_property("Gadget", "Name"))?
                    .to_string(),
                version: row.version().unwrap_or(0),
            })
        }
    }

    fn store() -> Store {
        let mut store = Store::open_in_memory().unwrap();
        store.repository::<Article>().initialize().unwrap();
        store.repository::<Gadget>().initialize().unwrap();
        store
    }

    fn caller() -> CallerInfo {
        CallerInfo::new("repository.rs", "test", 1)
    }

    #[test]
    fn hard_delete_roundtrip() {
        let mut store = store();
        let mut repo = store.repository::<Gadget>();

        let created = repo
            .create(
                &Gadget {
                    id: "a".to_string(),
                    name: "x".to_string(),
                    version: 0,
                },
                &caller(),
            )
            .unwrap();
        assert_eq!(created.version, 1);

        let fetched = repo.get(&"a".to_string()).unwrap().unwrap();
        assert_eq!(fetched.name, "x");
        assert_eq!(fetched.version, 1);

        let updated = repo
            .update(
                &Gadget {
                    name: "y".to_string(),
                    ..fetched
                },
                &caller(),
            )
            .unwrap();
        assert_eq!(updated.version, 2);
        assert_eq!(repo.get(&"a".to_string()).unwrap().unwrap().name, "y");

        assert!(repo.delete(&"a".to_string(), &caller()).unwrap());
        assert!(repo.get(&"a".to_string()).unwrap().is_none());
    }

    #[test]
    fn soft_delete_history_is_visible_on_request() {
        let mut store = store();
        let mut repo = store.repository::<Article>();

        let created = repo.create(&Article::new("b", "t1"), &caller()).unwrap();
        let updated = repo
            .update(
                &Article {
                    title: "t2".to_string(),
                    ..created
                },
                &caller(),
            )
            .unwrap();
        assert!(updated.version > created.version);
        assert!(repo.delete(&"b".to_string(), &caller()).unwrap());

        assert!(repo.get(&"b".to_string()).unwrap().is_none());

        let history = repo
            .get_by_key(&"b".to_string(), true, true, true)
            .unwrap();
        assert_eq!(history.len(), 3);
        // Newest first, strictly decreasing versions.
        let versions: Vec<i64> = history.iter().map(|a| a.version).collect();
        assert!(versions.windows(2).all(|w| w[0] > w[1]));

        // Without deleted rows the tombstone disappears.
        let visible = repo
            .get_by_key(&"b".to_string(), true, false, true)
            .unwrap();
        assert_eq!(visible.len(), 2);
    }

    #[test]
    fn optimistic_concurrency_lets_exactly_one_writer_win() {
        let mut store = store();
        let mut repo = store.repository::<Article>();
        repo.create(&Article::new("c", "original"), &caller()).unwrap();

        let reader_one = repo.get(&"c".to_string()).unwrap().unwrap();
        let reader_two = reader_one.clone();

        repo.update(
            &Article {
                title: "winner".to_string(),
                ..reader_one
            },
            &caller(),
        )
        .unwrap();

        let err = repo
            .update(
                &Article {
                    title: "loser".to_string(),
                    ..reader_two
                },
                &caller(),
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConcurrencyConflict);

        assert_eq!(repo.get(&"c".to_string()).unwrap().unwrap().title, "winner");
    }

    #[test]
    fn create_batch_rolls_back_on_conflict() {
        let mut store = store();
        let mut repo = store.repository::<Article>();
        repo.create(&Article::new("taken", "existing"), &caller())
            .unwrap();

        let err = repo
            .create_batch(
                &[Article::new("fresh", "one"), Article::new("taken", "two")],
                &caller(),
            )
            .unwrap_err();
        match err {
            Error::BatchConflict { keys, .. } => assert_eq!(keys, vec!["taken".to_string()]),
            other => panic!("unexpected error: {other:?}"),
        }

        // The non-conflicting entity rolled back with the batch.
        assert!(repo.get(&"fresh".to_string()).unwrap().is_none());
    }

    #[test]
    fn update_batch_applies_mutation_and_aggregates_conflicts() {
        let mut store = store();
        let mut repo = store.repository::<Article>();
        let a = repo.create(&Article::new("a", "t"), &caller()).unwrap();
        let b = repo.create(&Article::new("b", "t"), &caller()).unwrap();

        let bump = |article: &mut Article| article.views += 1;
        let updated = repo
            .update_batch(vec![a.clone(), b], Some(&bump), &caller())
            .unwrap();
        assert!(updated.iter().all(|article| article.views == 1));

        // Reusing the stale token for "a" now conflicts.
        let err = repo
            .update_batch(vec![a], None, &caller())
            .unwrap_err();
        match err {
            Error::BatchConflict { keys, operation, .. } => {
                assert_eq!(operation, "update");
                assert_eq!(keys, vec!["a".to_string()]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn delete_batch_counts_removals() {
        let mut store = store();
        let mut repo = store.repository::<Article>();
        repo.create(&Article::new("a", "t"), &caller()).unwrap();
        repo.create(&Article::new("b", "t"), &caller()).unwrap();

        let removed = repo
            .delete_batch(
                &["a".to_string(), "b".to_string(), "ghost".to_string()],
                &caller(),
            )
            .unwrap();
        assert_eq!(removed, 2);
    }

    #[test]
    fn query_filters_orders_and_pages() {
        let mut store = store();
        let mut repo = store.repository::<Article>();
        for (id, views) in [("a", 5i64), ("b", 10), ("c", 1), ("d", 7)] {
            let mut article = Article::new(id, "seeded");
            article.views = views;
            repo.create(&article, &caller()).unwrap();
        }

        let busy = repo
            .query(
                &col("Views").ge(5i64),
                &QueryOptions {
                    order: Some(OrderRecorder::new().order_by_descending("Views")),
                    ..QueryOptions::default()
                },
            )
            .unwrap();
        let ids: Vec<&str> = busy.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, ["b", "d", "a"]);

        assert_eq!(repo.count(Some(&col("Views").ge(5i64))).unwrap(), 3);
        assert!(repo.exists(&col("Views").eq(1i64)).unwrap());
        assert!(!repo.exists(&col("Views").eq(99i64)).unwrap());

        let page = repo
            .query_paged(&col("Views").ge(0i64), 3, 2)
            .unwrap();
        assert_eq!(page.total, 4);
        assert_eq!(page.page_count, 2);
        assert_eq!(page.items.len(), 1);
    }

    #[test]
    fn queries_skip_deleted_versions() {
        let mut store = store();
        let mut repo = store.repository::<Article>();
        repo.create(&Article::new("kept", "t"), &caller()).unwrap();
        repo.create(&Article::new("gone", "t"), &caller()).unwrap();
        repo.delete(&"gone".to_string(), &caller()).unwrap();

        let all = repo.get_all(None).unwrap();
        let ids: Vec<&str> = all.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, ["kept"]);
        assert_eq!(repo.count(None).unwrap(), 1);
    }

    #[test]
    fn scope_rolls_back_uncommitted_work() {
        let mut store = store();
        {
            let mut repo = store.repository::<Article>();
            let scope = repo.begin_transaction().unwrap();
            scope.create(&Article::new("tx", "t"), &caller()).unwrap();
            // Dropped without commit.
        }
        let repo = store.repository::<Article>();
        assert!(repo.get(&"tx".to_string()).unwrap().is_none());
    }

    #[test]
    fn scope_commits_queued_operations_in_order() {
        let mut store = store();
        {
            let mut repo = store.repository::<Article>();
            let scope = repo.begin_transaction().unwrap();
            let created = scope.create(&Article::new("tx", "t1"), &caller()).unwrap();
            let updated = scope
                .update(
                    &Article {
                        title: "t2".to_string(),
                        ..created
                    },
                    &caller(),
                )
                .unwrap();
            assert!(updated.version > 1);
            scope.commit().unwrap();
        }
        let repo = store.repository::<Article>();
        assert_eq!(repo.get(&"tx".to_string()).unwrap().unwrap().title, "t2");
    }

    #[test]
    fn list_replace_scenario() {
        let mut store = store();
        let mut repo = store.repository::<Article>();

        repo.create_list(
            "L",
            &[
                Article::new("e1", "one"),
                Article::new("e2", "two"),
                Article::new("e3", "three"),
            ],
            &caller(),
        )
        .unwrap();

        repo.update_list(
            "L",
            &[
                Article::new("e1", "one-changed"),
                Article::new("e2", "two"),
                Article::new("e4", "four"),
            ],
            &caller(),
        )
        .unwrap();

        let members = repo.get_list("L").unwrap();
        let ids: Vec<&str> = members.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, ["e1", "e2", "e4"]);
        assert_eq!(members[0].title, "one-changed");

        // Deleting the list leaves members retrievable.
        let removed = repo.delete_list("L").unwrap();
        assert_eq!(removed, 3);
        assert!(repo.get(&"e3".to_string()).unwrap().is_some());
        assert!(repo.get(&"e1".to_string()).unwrap().is_some());
    }

    #[test]
    fn audited_repository_records_mutations() {
        let mut store = store();
        let mut repo = store.repository::<Article>();
        let created = repo.create(&Article::new("a", "t"), &caller()).unwrap();
        repo.update(
            &Article {
                title: "t2".to_string(),
                ..created
            },
            &caller(),
        )
        .unwrap();
        repo.delete(&"a".to_string(), &caller()).unwrap();

        let repo = store.repository::<Article>();
        let trail = repo.audit_trail(&"a".to_string(), 10).unwrap();
        let operations: Vec<&str> = trail.iter().map(|r| r.operation.as_str()).collect();
        assert_eq!(operations, ["DELETE", "UPDATE", "CREATE"]);
        assert!(trail.iter().all(|r| r.caller.file == "repository.rs"));
    }

    #[test]
    fn unaudited_repository_stays_silent() {
        let mut store = store();
        let mut repo = store.repository::<Gadget>();
        repo.create(
            &Gadget {
                id: "g".to_string(),
                name: "n".to_string(),
                version: 0,
            },
            &caller(),
        )
        .unwrap();
        let trail = repo.audit_trail(&"g".to_string(), 10).unwrap();
        assert!(trail.is_empty());
    }
}

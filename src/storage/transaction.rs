//! Caller-managed transaction scopes.
//!
//! A scope owns one transaction on the store's connection. Operations
//! queued on the scope share that transaction and observe strict FIFO
//! ordering. The safe default on drop is rollback; only an explicit
//! [`Scope::commit`] persists the work.

use rusqlite::Transaction;

use crate::entity::{CallerInfo, Entity, KeyValue};
use crate::error::Result;
use crate::storage::ops;

type Hook = Box<dyn FnMut()>;

#[derive(Default)]
struct Hooks {
    before_commit: Vec<Hook>,
    after_commit: Vec<Hook>,
    before_rollback: Vec<Hook>,
    after_rollback: Vec<Hook>,
}

impl Hooks {
    fn run(hooks: &mut [Hook]) {
        for hook in hooks {
            hook();
        }
    }
}

/// A transaction scope bound to one connection.
pub struct Scope<'conn> {
    tx: Option<Transaction<'conn>>,
    hooks: Hooks,
}

impl<'conn> Scope<'conn> {
    pub(crate) fn new(tx: Transaction<'conn>) -> Self {
        Self {
            tx: Some(tx),
            hooks: Hooks::default(),
        }
    }

    // ── Hooks ─────────────────────────────────────────────────

    pub fn on_before_commit(&mut self, hook: impl FnMut() + 'static) {
        self.hooks.before_commit.push(Box::new(hook));
    }

    pub fn on_after_commit(&mut self, hook: impl FnMut() + 'static) {
        self.hooks.after_commit.push(Box::new(hook));
    }

    pub fn on_before_rollback(&mut self, hook: impl FnMut() + 'static) {
        self.hooks.before_rollback.push(Box::new(hook));
    }

    pub fn on_after_rollback(&mut self, hook: impl FnMut() + 'static) {
        self.hooks.after_rollback.push(Box::new(hook));
    }

    // ── Outcome ───────────────────────────────────────────────

    /// Commit the scope's transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend rejects the commit; the transaction
    /// is rolled back in that case.
    pub fn commit(mut self) -> Result<()> {
        Hooks::run(&mut self.hooks.before_commit);
        if let Some(tx) = self.tx.take() {
            tx.commit()?;
        }
        Hooks::run(&mut self.hooks.after_commit);
        Ok(())
    }

    /// Roll the scope's transaction back explicitly.
    ///
    /// # Errors
    ///
    /// Returns an error if the rollback itself fails.
    pub fn rollback(mut self) -> Result<()> {
        Hooks::run(&mut self.hooks.before_rollback);
        if let Some(tx) = self.tx.take() {
            tx.rollback()?;
        }
        Hooks::run(&mut self.hooks.after_rollback);
        Ok(())
    }

    /// The underlying transaction, for engine-internal operations.
    pub(crate) fn tx(&self) -> &Transaction<'conn> {
        self.tx
            .as_ref()
            .expect("scope transaction already consumed")
    }

    // ── Queued entity operations ──────────────────────────────

    /// Create an entity inside this scope.
    ///
    /// # Errors
    ///
    /// Same failure modes as the repository operation.
    pub fn create<E: Entity>(&self, entity: &E, caller: &CallerInfo) -> Result<E> {
        let row = ops::create_row(self.tx(), E::descriptor(), entity.to_row(), caller, None)?;
        E::from_row(&row)
    }

    /// Read the visible row for a key inside this scope.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or materialization fails.
    pub fn get<E: Entity>(&self, key: &E::Key) -> Result<Option<E>> {
        let row = ops::get_visible(self.tx(), E::descriptor(), &key.to_value())?;
        row.map(|r| E::from_row(&r)).transpose()
    }

    /// Update an entity inside this scope. The entity's `Version` is the
    /// optimistic concurrency token.
    ///
    /// # Errors
    ///
    /// Same failure modes as the repository operation.
    pub fn update<E: Entity>(&self, entity: &E, caller: &CallerInfo) -> Result<E> {
        let row = entity.to_row();
        let expected = row.version().ok_or_else(|| crate::error::Error::Constraint {
            message: format!(
                "update on {} requires a Version token",
                E::descriptor().entity()
            ),
        })?;
        let row = ops::update_row(self.tx(), E::descriptor(), row, caller, expected)?;
        E::from_row(&row)
    }

    /// Delete an entity inside this scope.
    ///
    /// # Errors
    ///
    /// Same failure modes as the repository operation.
    pub fn delete<E: Entity>(&self, key: &E::Key, caller: &CallerInfo) -> Result<bool> {
        ops::delete_row(self.tx(), E::descriptor(), &key.to_value(), caller)
    }
}

impl Drop for Scope<'_> {
    fn drop(&mut self) {
        // Not committed: roll back (the transaction's own drop does the
        // backend work; the hooks still observe the boundary).
        if self.tx.is_some() {
            Hooks::run(&mut self.hooks.before_rollback);
            self.tx.take();
            Hooks::run(&mut self.hooks.after_rollback);
        }
    }
}

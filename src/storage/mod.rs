//! The storage engine.
//!
//! One [`Store`] owns one SQLite connection with:
//! - WAL mode and busy-timeout handling for cluster-shared files
//! - An IMMEDIATE-transaction mutation protocol wrapped by the retry policy
//! - The global version sequence serializing soft-delete writers
//! - The unified audit log and the list-mapping table
//!
//! # Submodules
//!
//! - [`engine`] - Connection lifecycle, pragmas, version sequence
//! - [`repository`] - The typed operation facade
//! - [`transaction`] - Caller-managed scopes with commit/rollback hooks
//! - [`retry`] - Transient-fault retry policy
//! - [`audit`] - Unified audit trail

pub mod audit;
pub mod engine;
pub(crate) mod lists;
pub(crate) mod ops;
pub mod repository;
pub mod retry;
pub mod transaction;

pub use audit::{AuditOperation, AuditRecord};
pub use engine::{CancelToken, Store, SCHEMA_VERSION};
pub use repository::{Page, QueryOptions, Repository};
pub use retry::RetryPolicy;
pub use transaction::Scope;

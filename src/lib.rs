//! strata — a versioned entity persistence engine for embedded SQLite.
//!
//! Entities declare their shape once through a [`DescriptorBuilder`] (or a
//! generated descriptor); the engine derives DDL and parameterized DML from
//! the descriptor and drives a versioned CRUD pipeline over it: soft-delete
//! version chains, optimistic concurrency, expiry, list mappings, audit
//! trails, and bulk import/export/purge that all share the same rules.
//!
//! # Architecture
//!
//! - [`descriptor`] - Entity metadata and the builder that validates it
//! - [`sql`] - DDL and DML generation from descriptors
//! - [`query`] - Predicate DSL, ORDER BY capture, SQL translation
//! - [`entity`] - The `Entity` contract and property-keyed rows
//! - [`storage`] - The engine: transactions, retry, versioning, audit, lists
//! - [`bulk`] - Package export/import and retention purges
//! - [`config`] - Declarative engine configuration
//! - [`error`] - Error taxonomy
//!
//! # Example
//!
//! ```no_run
//! use strata::{EngineConfig, Store};
//!
//! # fn main() -> strata::Result<()> {
//! let mut store = Store::open(EngineConfig::new("data/engine.db"))?;
//! let _ = store.cancel_token();
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod bulk;
pub mod config;
pub mod descriptor;
pub mod entity;
pub mod error;
pub mod query;
pub mod sql;
pub mod storage;
pub mod value;

pub use config::{EngineConfig, JournalMode, RetryConfig};
pub use descriptor::{DescriptorBuilder, EntityDescriptor, PropertyKind, SqlType};
pub use entity::{CallerInfo, Entity, KeyValue, Row};
pub use error::{Error, ErrorKind, Result};
pub use query::{col, OrderRecorder, Predicate};
pub use storage::{CancelToken, Page, QueryOptions, Repository, Scope, Store};
pub use value::Value;

//! Predicate DSL and SQL translation.
//!
//! Callers express filters as [`Predicate`] values built with [`col`], and
//! orderings as chained calls on an [`OrderRecorder`]. The translator turns
//! both into SQL fragments with `@p{N}` parameters, resolving property names
//! through the entity descriptor.

pub mod order;
pub mod predicate;
pub mod translate;

pub use order::OrderRecorder;
pub use predicate::{col, CmpOp, Predicate};
pub use translate::{translate_order, translate_predicate, Dialect, SqliteDialect};

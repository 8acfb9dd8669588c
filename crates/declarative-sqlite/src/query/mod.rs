//! Structural query representation (spec.md §3 "Query", §4.3 "Dependency
//! analysis"). Deliberately not a SQL string: callers build an AST, and
//! that same AST is both executed and walked for stream dependencies.

pub mod builder;
pub mod dependency;
pub mod expr;
pub mod render;

pub use builder::{FromSource, Join, JoinKind, JoinOn, OrderBy, OrderDirection, Query, SelectItem};
pub use dependency::{analyze, Dependencies};
pub use expr::{ColumnRef, CompareOp, InList, Operand, Where};
pub use render::render;

//! # vibe-guard
//!
//! Statement validation for Vibe.
//!
//! Every request passes through [`StatementGuard::validate`] before any
//! connection is touched. The guard accepts either raw SQL or a structured
//! [`Operation`] and produces a [`ValidatedOperation`]: the exact SQL text,
//! its bound parameters and how the engine should shape the result.
//!
//! Raw SQL goes through, in order:
//!
//! 1. the unconditional deny-list (`DROP DATABASE`, role management,
//!    `GRANT`, `COPY ... PROGRAM`, server-side file functions ...)
//! 2. parsing with the Postgres dialect (exactly one statement)
//! 3. the read-only keyword scan, when the request asks for it
//! 4. capability checks on every referenced table
//! 5. row-policy weaving into the WHERE clause
//!
//! Structured operations never interpolate values: identifiers are
//! validated and quoted, values are bound as `$n` parameters, masked columns
//! are dropped from projections and writes are checked column by column.

pub mod analyzer;
pub mod builder;
pub mod deny;
pub mod error;
pub mod guard;
pub mod operation;
pub mod validated;
pub mod weave;

pub use analyzer::{AnalyzedStatement, RelationRef, SqlAnalyzer};
pub use error::GuardError;
pub use guard::StatementGuard;
pub use operation::{
    AlterAction, AlterTableOp, ColumnSpec, CreateSchemaOp, CreateTableOp, DeleteOp, DropTableOp,
    Filter, FilterOp, InsertOp, Operation, OrderBy, RawSql, SelectOp, SortDirection, UpdateOp,
};
pub use validated::{OutputShape, RowCheck, StatementKind, ValidatedOperation};
pub use weave::CHECK_COLUMN;

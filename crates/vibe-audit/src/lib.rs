//! # vibe-audit
//!
//! Audit entries for Vibe.
//!
//! The execution engine writes exactly one [`AuditEntry`] per operation
//! attempt: tenant, operation, target, outcome, error, duration and time.
//! Entries are immutable and go to a pluggable [`AuditStorage`]:
//!
//! | Backend | Storage | Queryable |
//! |---------|---------|-----------|
//! | `control` | `audit_logs` table of the control database (Postgres adapter) | yes |
//! | `file` | [`FileStorage`], JSON Lines | yes |
//! | `console` | [`ConsoleStorage`], one log line per entry | no |
//! | `none` | [`NullStorage`] | no |
//!
//! With `stdout: true` a queryable backend is wrapped in [`DualStorage`] so
//! each entry is also printed.

pub mod entry;
pub mod error;
pub mod filter;
pub mod logger;
pub mod storage;

pub use entry::{AuditEntry, AuditEntryBuilder, AuditOutcome};
pub use error::AuditError;
pub use filter::AuditFilter;
pub use logger::AuditLogger;
pub use storage::{
    AuditStorage, ConsoleStorage, DualStorage, FileStorage, MemoryStorage, NullStorage,
    create_storage,
};

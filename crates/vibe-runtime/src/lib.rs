//! # vibe-runtime
//!
//! Runs tenant operations. [`AccessService`] is the pipeline the calling
//! layer uses:
//!
//! 1. refuse reserved databases and unknown or inactive tenants
//! 2. require an active grant for the target database
//! 3. validate the operation with the statement guard
//! 4. acquire a session through the [`Backend`]
//! 5. run it in the [`ExecutionEngine`] under a timeout and row cap
//! 6. write one audit entry for the attempt
//!
//! Single statements run in their own transaction. [`AccessService::begin`]
//! opens an explicit one whose [`TransactionHandle`] is bound to the tenant
//! and database that opened it. [`TenantRemover`] deletes a tenant and its
//! dependents in a fixed order.
//!
//! Introspection ([`AccessService::list_tables`],
//! [`AccessService::describe_table`]) reads the catalog through the tenant's
//! own session and drops whatever the tenant holds no capability on.

pub mod audit;
pub mod backend;
pub mod catalog;
pub mod engine;
pub mod removal;
pub mod result;
pub mod service;
pub mod transaction;

pub use audit::PendingAudit;
pub use backend::{Backend, BackendError, FetchedRows, SQLSTATE_QUERY_CANCELED, Session};
pub use catalog::{ColumnDescription, TableDescription, TableSummary};
pub use engine::{ExecutionEngine, ExecutionOptions};
pub use removal::{AccountReaper, RemovalError, RemovalReport, TenantRemover};
pub use result::ResultSet;
pub use service::AccessService;
pub use transaction::TransactionHandle;

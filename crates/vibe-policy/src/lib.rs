//! # vibe-policy
//!
//! Permission resolution for Vibe.
//!
//! Given a tenant, a database, a schema and optionally a table, the
//! [`PermissionResolver`] reads the tenant's Schema Permission, Table
//! Permission and Row Policies from the control store and produces a
//! [`CapabilitySet`]:
//!
//! | Source | Capabilities |
//! |--------|--------------|
//! | none | empty (deny by default) |
//! | schema `read_only` | `select` |
//! | schema `read_write` | `select insert update delete` + DDL flags |
//! | table permission | its own booleans (+ schema DDL flags), column mask |
//! | `information_schema` | `select` if the tenant holds any schema permission |
//!
//! Row policies are attached to the set; [`CapabilitySet::row_filter`] and
//! [`CapabilitySet::check_filter`] combine them (PERMISSIVE with OR,
//! RESTRICTIVE with AND).
//!
//! The resolver also summarizes what a tenant can reach: its accessible
//! databases, the schemas it holds permissions in, and every stored
//! permission.

pub mod access;
pub mod capability_set;
pub mod error;
pub mod reserved;
pub mod resolver;

pub use access::{PermissionSummary, SchemaAccess};
pub use capability_set::{CapabilitySet, CapabilitySource, PolicyClause, RowFilter};
pub use error::PolicyError;
pub use reserved::ReservedDatabases;
pub use resolver::{INFORMATION_SCHEMA, PermissionResolver, level_capabilities};

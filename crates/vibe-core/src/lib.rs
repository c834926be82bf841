//! # vibe-core
//!
//! Shared types for the Vibe tenant access layer: the control-database data
//! model, capability kinds, identifier validation, typed query parameters,
//! the error taxonomy, configuration and the [`ControlStore`] contract.

pub mod capability;
pub mod config;
pub mod error;
pub mod ident;
pub mod model;
pub mod params;
pub mod store;

pub use capability::{Capability, ColumnMask, ColumnMaskError};
pub use config::{
    AuditBackend, AuditConfig, ConfigError, ControlDatabaseConfig, GuardrailsConfig, LogFormat,
    PoolConfig, SslMode, VibeConfig,
};
pub use error::{AccessError, ErrorResponse, RetryPolicy, redact_secrets};
pub use ident::{Identifier, IdentifierError};
pub use model::{
    ApiCredential, DatabaseGrant, DdlFlags, GrantSummary, PermissionLevel, PolicyCommand,
    PolicyKind, Principal, ProvisionedAccount, RowPolicy, SchemaPermission, ServerRecord, TablePermission,
    Tenant, TenantId,
};
pub use params::{SqlParam, TypedParam};
pub use store::{ControlStore, MemoryControlStore, PurgeStep, StoreError};

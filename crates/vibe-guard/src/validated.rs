//! The guard's output: a statement ready for the execution engine.

use serde::Serialize;
use vibe_core::{Capability, SqlParam, TenantId};

/// What a validated statement does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatementKind {
    Select,
    Insert,
    Update,
    Delete,
    Truncate,
    CreateTable,
    AlterTable,
    DropTable,
    CreateSchema,
}

impl StatementKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Select => "select",
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Truncate => "truncate",
            Self::CreateTable => "create_table",
            Self::AlterTable => "alter_table",
            Self::DropTable => "drop_table",
            Self::CreateSchema => "create_schema",
        }
    }

    /// Capability needed on the statement's target.
    pub fn required_capability(&self) -> Capability {
        match self {
            Self::Select => Capability::Select,
            Self::Insert => Capability::Insert,
            Self::Update => Capability::Update,
            Self::Delete => Capability::Delete,
            Self::Truncate => Capability::Truncate,
            Self::CreateTable => Capability::CreateTable,
            Self::AlterTable => Capability::AlterTable,
            Self::DropTable => Capability::DropTable,
            Self::CreateSchema => Capability::CreateSchema,
        }
    }

    pub fn is_ddl(&self) -> bool {
        matches!(
            self,
            Self::CreateTable | Self::AlterTable | Self::DropTable | Self::CreateSchema
        )
    }

    /// Destroys data in bulk or irreversibly.
    pub fn is_dangerous(&self) -> bool {
        matches!(self, Self::Delete | Self::Truncate | Self::DropTable)
    }
}

/// How the engine should run the statement and shape the result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputShape {
    /// Fetch rows, capped at the max-rows limit.
    Rows,
    /// Only the affected-row count is returned.
    RowCount,
}

/// A post-write row check woven into the statement.
///
/// The statement returns an extra boolean column named [`CHECK_COLUMN`];
/// every returned row must carry `true` or the transaction is rolled back.
///
/// [`CHECK_COLUMN`]: crate::weave::CHECK_COLUMN
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RowCheck {
    /// `schema.table`, for the violation error.
    pub object: String,
}

/// A statement that passed validation. Values are only ever carried in
/// `params`; `sql` references them as `$1..$n`.
#[derive(Debug, Clone, Serialize)]
pub struct ValidatedOperation {
    pub tenant: TenantId,
    pub database: String,
    pub kind: StatementKind,
    pub sql: String,
    pub params: Vec<SqlParam>,
    pub output: OutputShape,
    pub row_check: Option<RowCheck>,
    /// Qualified names of every object the statement touches.
    pub objects: Vec<String>,
    pub dangerous: bool,
    /// Number of row-policy filters woven into `sql`.
    pub policies_applied: usize,
}

impl ValidatedOperation {
    /// The first object touched, for audit records.
    pub fn primary_object(&self) -> Option<&str> {
        self.objects.first().map(String::as_str)
    }
}

//! Operations a tenant can ask for.
//!
//! Either raw SQL, or a structured intent from which the guard generates
//! SQL itself. Structured operations deserialize from the JSON the calling
//! layer receives, tagged by `op`:
//!
//! ```json
//! { "op": "select", "table": "orders", "filters": [{ "column": "status", "op": "=", "value": "open" }] }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use vibe_core::TypedParam;

fn default_schema() -> String {
    crate::analyzer::DEFAULT_SCHEMA.to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    RawSql(RawSql),
    Select(SelectOp),
    Insert(InsertOp),
    Update(UpdateOp),
    Delete(DeleteOp),
    CreateTable(CreateTableOp),
    AlterTable(AlterTableOp),
    DropTable(DropTableOp),
    CreateSchema(CreateSchemaOp),
}

impl Operation {
    /// Short name used in audit entries.
    pub fn name(&self) -> &'static str {
        match self {
            Self::RawSql(raw) if raw.read_only => "raw_query",
            Self::RawSql(_) => "raw_sql",
            Self::Select(_) => "select",
            Self::Insert(_) => "insert",
            Self::Update(_) => "update",
            Self::Delete(_) => "delete",
            Self::CreateTable(_) => "create_table",
            Self::AlterTable(_) => "alter_table",
            Self::DropTable(_) => "drop_table",
            Self::CreateSchema(_) => "create_schema",
        }
    }

    /// `(schema, table)` named by a structured operation.
    pub fn target(&self) -> Option<(&str, Option<&str>)> {
        match self {
            Self::RawSql(_) => None,
            Self::Select(op) => Some((&op.schema, Some(&op.table))),
            Self::Insert(op) => Some((&op.schema, Some(&op.table))),
            Self::Update(op) => Some((&op.schema, Some(&op.table))),
            Self::Delete(op) => Some((&op.schema, Some(&op.table))),
            Self::CreateTable(op) => Some((&op.schema, Some(&op.table))),
            Self::AlterTable(op) => Some((&op.schema, Some(&op.table))),
            Self::DropTable(op) => Some((&op.schema, Some(&op.table))),
            Self::CreateSchema(op) => Some((&op.schema, None)),
        }
    }

    pub fn raw(sql: impl Into<String>, read_only: bool) -> Self {
        Self::RawSql(RawSql {
            sql: sql.into(),
            params: Vec::new(),
            read_only,
        })
    }
}

/// A raw SQL statement with positional parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawSql {
    pub sql: String,
    #[serde(default)]
    pub params: Vec<TypedParam>,
    /// Additionally forbid any write or DDL keyword.
    #[serde(default)]
    pub read_only: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FilterOp {
    #[default]
    #[serde(rename = "=", alias = "eq")]
    Eq,
    #[serde(rename = "!=", alias = "ne", alias = "<>")]
    Ne,
    #[serde(rename = ">", alias = "gt")]
    Gt,
    #[serde(rename = "<", alias = "lt")]
    Lt,
    #[serde(rename = ">=", alias = "gte")]
    Gte,
    #[serde(rename = "<=", alias = "lte")]
    Lte,
    #[serde(rename = "LIKE", alias = "like")]
    Like,
    #[serde(rename = "ILIKE", alias = "ilike")]
    ILike,
    #[serde(rename = "IN", alias = "in")]
    In,
    #[serde(rename = "NOT IN", alias = "not_in")]
    NotIn,
    #[serde(rename = "IS NULL", alias = "is_null")]
    IsNull,
    #[serde(rename = "IS NOT NULL", alias = "is_not_null")]
    IsNotNull,
}

impl FilterOp {
    pub fn sql(&self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "<>",
            Self::Gt => ">",
            Self::Lt => "<",
            Self::Gte => ">=",
            Self::Lte => "<=",
            Self::Like => "LIKE",
            Self::ILike => "ILIKE",
            Self::In => "IN",
            Self::NotIn => "NOT IN",
            Self::IsNull => "IS NULL",
            Self::IsNotNull => "IS NOT NULL",
        }
    }
}

/// `column op value`, AND-combined with the other filters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub column: String,
    #[serde(default)]
    pub op: FilterOp,
    #[serde(default)]
    pub value: Value,
}

impl Filter {
    pub fn new(column: impl Into<String>, op: FilterOp, value: Value) -> Self {
        Self {
            column: column.into(),
            op,
            value,
        }
    }

    pub fn eq(column: impl Into<String>, value: Value) -> Self {
        Self::new(column, FilterOp::Eq, value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
    pub column: String,
    #[serde(default)]
    pub direction: SortDirection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectOp {
    #[serde(default = "default_schema")]
    pub schema: String,
    pub table: String,
    /// `None` selects every readable column.
    #[serde(default)]
    pub columns: Option<Vec<String>>,
    #[serde(default)]
    pub filters: Vec<Filter>,
    #[serde(default)]
    pub order_by: Vec<OrderBy>,
    #[serde(default)]
    pub limit: Option<u64>,
    #[serde(default)]
    pub offset: Option<u64>,
    #[serde(default)]
    pub distinct: bool,
}

impl SelectOp {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
            columns: None,
            filters: Vec::new(),
            order_by: Vec::new(),
            limit: None,
            offset: None,
            distinct: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsertOp {
    #[serde(default = "default_schema")]
    pub schema: String,
    pub table: String,
    /// One or more rows; columns missing from a row take their default.
    pub rows: Vec<Map<String, Value>>,
    #[serde(default)]
    pub returning: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateOp {
    #[serde(default = "default_schema")]
    pub schema: String,
    pub table: String,
    pub set: Map<String, Value>,
    /// Required and non-empty.
    pub filters: Vec<Filter>,
    #[serde(default)]
    pub returning: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteOp {
    #[serde(default = "default_schema")]
    pub schema: String,
    pub table: String,
    /// Required and non-empty.
    pub filters: Vec<Filter>,
    #[serde(default)]
    pub returning: Option<Vec<String>>,
}

/// A column definition for CREATE TABLE and ADD COLUMN.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: String,
    #[serde(default = "default_true")]
    pub nullable: bool,
    #[serde(default)]
    pub primary_key: bool,
    #[serde(default)]
    pub unique: bool,
    /// A literal, or one of a few allow-listed functions such as `now()`.
    #[serde(default)]
    pub default: Option<Value>,
}

impl ColumnSpec {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            nullable: true,
            primary_key: false,
            unique: false,
            default: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateTableOp {
    #[serde(default = "default_schema")]
    pub schema: String,
    pub table: String,
    pub columns: Vec<ColumnSpec>,
    #[serde(default)]
    pub if_not_exists: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum AlterAction {
    AddColumn {
        column: ColumnSpec,
    },
    DropColumn {
        name: String,
        #[serde(default)]
        if_exists: bool,
    },
    RenameColumn {
        from: String,
        to: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlterTableOp {
    #[serde(default = "default_schema")]
    pub schema: String,
    pub table: String,
    #[serde(flatten)]
    pub action: AlterAction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DropTableOp {
    #[serde(default = "default_schema")]
    pub schema: String,
    pub table: String,
    #[serde(default)]
    pub if_exists: bool,
    #[serde(default)]
    pub cascade: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateSchemaOp {
    pub schema: String,
    #[serde(default)]
    pub if_not_exists: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn structured_select_from_json() {
        let op: Operation = serde_json::from_value(json!({
            "op": "select",
            "table": "orders",
            "filters": [
                { "column": "status", "op": "=", "value": "open" },
                { "column": "total", "op": "gte", "value": 10 },
                { "column": "deleted_at", "op": "IS NULL" }
            ],
            "order_by": [{ "column": "id", "direction": "desc" }],
            "limit": 5
        }))
        .unwrap();
        let Operation::Select(select) = op else {
            panic!("expected select");
        };
        assert_eq!(select.schema, "public");
        assert_eq!(select.filters[1].op, FilterOp::Gte);
        assert_eq!(select.filters[2].op, FilterOp::IsNull);
        assert_eq!(select.order_by[0].direction, SortDirection::Desc);
    }

    #[test]
    fn raw_sql_defaults() {
        let op: Operation =
            serde_json::from_value(json!({ "op": "raw_sql", "sql": "SELECT 1" })).unwrap();
        assert_eq!(op, Operation::raw("SELECT 1", false));
        assert_eq!(op.name(), "raw_sql");
    }

    #[test]
    fn alter_action_is_flattened() {
        let op: Operation = serde_json::from_value(json!({
            "op": "alter_table",
            "table": "notes",
            "action": "rename_column",
            "from": "body",
            "to": "content"
        }))
        .unwrap();
        assert_eq!(op.target(), Some(("public", Some("notes"))));
        let Operation::AlterTable(alter) = op else {
            panic!("expected alter_table");
        };
        assert_eq!(
            alter.action,
            AlterAction::RenameColumn {
                from: "body".into(),
                to: "content".into()
            }
        );
    }
}

//! Catalog reads for tenant-facing introspection: the tables of a schema and
//! the columns of a table, as the tenant's own login sees them.

use serde::Serialize;
use serde_json::Value;

use vibe_core::AccessError;

use crate::backend::FetchedRows;

pub(crate) const LIST_TABLES_SQL: &str = "\
SELECT t.table_name::text AS name, \
t.table_type::text AS kind, \
pg_catalog.obj_description(c.oid, 'pg_class') AS comment \
FROM information_schema.tables t \
LEFT JOIN pg_catalog.pg_namespace n ON n.nspname = t.table_schema \
LEFT JOIN pg_catalog.pg_class c ON c.relnamespace = n.oid AND c.relname = t.table_name \
WHERE t.table_schema = $1 \
ORDER BY t.table_name";

pub(crate) const DESCRIBE_TABLE_SQL: &str = "\
SELECT c.column_name::text AS name, \
c.data_type::text AS data_type, \
(c.is_nullable = 'YES') AS nullable, \
c.column_default::text AS default_value, \
c.character_maximum_length::int4 AS max_length, \
c.numeric_precision::int4 AS numeric_precision, \
c.numeric_scale::int4 AS numeric_scale, \
EXISTS (SELECT 1 FROM information_schema.table_constraints tc \
JOIN information_schema.key_column_usage ku \
ON ku.constraint_schema = tc.constraint_schema AND ku.constraint_name = tc.constraint_name \
WHERE tc.table_schema = c.table_schema AND tc.table_name = c.table_name \
AND tc.constraint_type = 'PRIMARY KEY' AND ku.column_name = c.column_name) AS primary_key, \
EXISTS (SELECT 1 FROM information_schema.table_constraints tc \
JOIN information_schema.key_column_usage ku \
ON ku.constraint_schema = tc.constraint_schema AND ku.constraint_name = tc.constraint_name \
WHERE tc.table_schema = c.table_schema AND tc.table_name = c.table_name \
AND tc.constraint_type = 'UNIQUE' AND ku.column_name = c.column_name) AS is_unique \
FROM information_schema.columns c \
WHERE c.table_schema = $1 AND c.table_name = $2 \
ORDER BY c.ordinal_position";

/// A table or view of a schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableSummary {
    pub name: String,
    /// `BASE TABLE`, `VIEW`, `FOREIGN` ...
    pub kind: String,
    pub comment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnDescription {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    pub default: Option<String>,
    pub max_length: Option<i64>,
    pub numeric_precision: Option<i64>,
    pub numeric_scale: Option<i64>,
    pub primary_key: bool,
    pub unique: bool,
}

/// Columns of one table, in ordinal order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableDescription {
    pub schema: String,
    pub table: String,
    pub columns: Vec<ColumnDescription>,
}

/// Named access into the rows of a catalog query.
struct Catalog<'a> {
    fetched: &'a FetchedRows,
}

impl<'a> Catalog<'a> {
    fn get(&self, row: &'a [Value], column: &str) -> Result<&'a Value, AccessError> {
        self.fetched
            .columns
            .iter()
            .position(|c| c == column)
            .and_then(|i| row.get(i))
            .ok_or_else(|| {
                AccessError::backend(&format!("catalog query did not return '{column}'"), None)
            })
    }

    fn text(&self, row: &'a [Value], column: &str) -> Result<String, AccessError> {
        self.get(row, column)?
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| unexpected(column))
    }

    fn opt_text(&self, row: &'a [Value], column: &str) -> Result<Option<String>, AccessError> {
        match self.get(row, column)? {
            Value::Null => Ok(None),
            Value::String(s) => Ok(Some(s.clone())),
            _ => Err(unexpected(column)),
        }
    }

    fn opt_int(&self, row: &'a [Value], column: &str) -> Result<Option<i64>, AccessError> {
        match self.get(row, column)? {
            Value::Null => Ok(None),
            value => value.as_i64().map(Some).ok_or_else(|| unexpected(column)),
        }
    }

    fn flag(&self, row: &'a [Value], column: &str) -> Result<bool, AccessError> {
        match self.get(row, column)? {
            Value::Null => Ok(false),
            value => value.as_bool().ok_or_else(|| unexpected(column)),
        }
    }
}

fn unexpected(column: &str) -> AccessError {
    AccessError::backend(&format!("catalog column '{column}' has an unexpected type"), None)
}

pub(crate) fn parse_tables(fetched: &FetchedRows) -> Result<Vec<TableSummary>, AccessError> {
    let catalog = Catalog { fetched };
    fetched
        .rows
        .iter()
        .map(|row| {
            Ok(TableSummary {
                name: catalog.text(row, "name")?,
                kind: catalog.text(row, "kind")?,
                comment: catalog.opt_text(row, "comment")?,
            })
        })
        .collect()
}

pub(crate) fn parse_columns(fetched: &FetchedRows) -> Result<Vec<ColumnDescription>, AccessError> {
    let catalog = Catalog { fetched };
    fetched
        .rows
        .iter()
        .map(|row| {
            Ok(ColumnDescription {
                name: catalog.text(row, "name")?,
                data_type: catalog.text(row, "data_type")?,
                nullable: catalog.flag(row, "nullable")?,
                default: catalog.opt_text(row, "default_value")?,
                max_length: catalog.opt_int(row, "max_length")?,
                numeric_precision: catalog.opt_int(row, "numeric_precision")?,
                numeric_scale: catalog.opt_int(row, "numeric_scale")?,
                primary_key: catalog.flag(row, "primary_key")?,
                unique: catalog.flag(row, "is_unique")?,
            })
        })
        .collect()
}

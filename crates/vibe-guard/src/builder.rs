//! SQL text generation for structured operations.
//!
//! Identifiers reach this module already validated and are emitted
//! double-quoted. Values are never rendered into the text: they are pushed
//! onto a [`ParamList`] and referenced as `$n`. The only literals written
//! into SQL are column DEFAULTs in DDL, which cannot take parameters.

use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

use vibe_core::{Identifier, SqlParam, TenantId};

use crate::error::GuardError;
use crate::operation::{Filter, FilterOp, OrderBy, SortDirection};

/// Positional parameters collected while building a statement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParamList {
    params: Vec<SqlParam>,
    tenant_slot: Option<usize>,
}

impl ParamList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start after caller-supplied parameters (raw SQL).
    pub fn with_params(params: Vec<SqlParam>) -> Self {
        Self {
            params,
            tenant_slot: None,
        }
    }

    /// Append a value and return its placeholder.
    pub fn push(&mut self, param: SqlParam) -> String {
        self.params.push(param);
        format!("${}", self.params.len())
    }

    /// Placeholder bound to the tenant id, added on first use.
    pub fn tenant(&mut self, tenant: TenantId) -> String {
        let slot = match self.tenant_slot {
            Some(slot) => slot,
            None => {
                self.params.push(SqlParam::Text(tenant.to_string()));
                let slot = self.params.len();
                self.tenant_slot = Some(slot);
                slot
            }
        };
        format!("${slot}")
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn into_inner(self) -> Vec<SqlParam> {
        self.params
    }
}

/// `"schema"."table"`
pub fn table_ref(schema: &Identifier, table: &Identifier) -> String {
    format!("{}.{}", schema.quoted(), table.quoted())
}

pub fn column_list<'a, I>(columns: I) -> String
where
    I: IntoIterator<Item = &'a Identifier>,
{
    columns
        .into_iter()
        .map(Identifier::quoted)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Render one filter with its value bound.
pub fn render_filter(
    column: &Identifier,
    filter: &Filter,
    params: &mut ParamList,
) -> Result<String, GuardError> {
    let col = column.quoted();
    let sql = match filter.op {
        FilterOp::IsNull | FilterOp::IsNotNull => format!("{col} {}", filter.op.sql()),
        FilterOp::Eq if filter.value.is_null() => format!("{col} IS NULL"),
        FilterOp::Ne if filter.value.is_null() => format!("{col} IS NOT NULL"),
        FilterOp::In | FilterOp::NotIn => {
            let Value::Array(values) = &filter.value else {
                return Err(GuardError::invalid(format!(
                    "filter on '{}' with {} needs an array value",
                    filter.column,
                    filter.op.sql()
                )));
            };
            if values.is_empty() {
                // x IN () is not valid SQL; the empty set matches nothing.
                return Ok(if filter.op == FilterOp::In {
                    "FALSE".to_string()
                } else {
                    "TRUE".to_string()
                });
            }
            let placeholders: Vec<String> = values
                .iter()
                .map(|v| params.push(SqlParam::from_json(v)))
                .collect();
            format!("{col} {} ({})", filter.op.sql(), placeholders.join(", "))
        }
        op => {
            if filter.value.is_null() {
                return Err(GuardError::invalid(format!(
                    "filter on '{}' with {} needs a value",
                    filter.column,
                    op.sql()
                )));
            }
            let placeholder = params.push(SqlParam::from_json(&filter.value));
            format!("{col} {} {placeholder}", op.sql())
        }
    };
    Ok(sql)
}

/// AND-combine predicates, each parenthesised. `None` if there are none.
pub fn where_clause(predicates: &[String]) -> Option<String> {
    if predicates.is_empty() {
        return None;
    }
    Some(
        predicates
            .iter()
            .map(|p| format!("({p})"))
            .collect::<Vec<_>>()
            .join(" AND "),
    )
}

pub fn order_by_clause(order: &[(Identifier, &OrderBy)]) -> Option<String> {
    if order.is_empty() {
        return None;
    }
    Some(
        order
            .iter()
            .map(|(col, o)| match o.direction {
                SortDirection::Asc => format!("{} ASC", col.quoted()),
                SortDirection::Desc => format!("{} DESC", col.quoted()),
            })
            .collect::<Vec<_>>()
            .join(", "),
    )
}

const SIMPLE_TYPES: &[&str] = &[
    "smallint", "integer", "int", "int2", "int4", "int8", "bigint", "smallserial", "serial",
    "bigserial", "real", "float4", "float8", "double precision", "numeric", "decimal",
    "boolean", "bool", "text", "varchar", "character varying", "char", "character", "uuid",
    "json", "jsonb", "date", "time", "timetz", "timestamp", "timestamptz",
    "timestamp with time zone", "timestamp without time zone", "time with time zone",
    "time without time zone", "interval", "bytea", "inet", "cidr", "macaddr", "money",
];

static TYPE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([a-z][a-z0-9 ]*?)\s*(\(\s*(\d{1,4})\s*(,\s*(\d{1,4})\s*)?\))?\s*(\[\])?$")
        .expect("valid type pattern")
});

/// Normalise a caller-supplied column type, accepting only known Postgres
/// types with an optional `(n)` / `(p, s)` modifier and `[]` suffix.
pub fn column_type(data_type: &str) -> Result<String, GuardError> {
    let lowered = data_type
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_ascii_lowercase();
    let invalid = || GuardError::invalid(format!("unsupported column type '{data_type}'"));
    let caps = TYPE_RE.captures(&lowered).ok_or_else(invalid)?;
    let base = caps.get(1).map(|m| m.as_str().trim()).ok_or_else(invalid)?;
    if !SIMPLE_TYPES.contains(&base) {
        return Err(invalid());
    }
    let mut out = base.to_string();
    if let Some(precision) = caps.get(3) {
        out.push('(');
        out.push_str(precision.as_str());
        if let Some(scale) = caps.get(5) {
            out.push_str(", ");
            out.push_str(scale.as_str());
        }
        out.push(')');
    }
    if caps.get(6).is_some() {
        out.push_str("[]");
    }
    Ok(out)
}

const DEFAULT_FUNCTIONS: &[&str] = &[
    "now()",
    "current_timestamp",
    "current_date",
    "current_time",
    "gen_random_uuid()",
];

/// Render a DEFAULT value as a SQL literal.
pub fn default_literal(value: &Value) -> Result<String, GuardError> {
    Ok(match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(true) => "TRUE".to_string(),
        Value::Bool(false) => "FALSE".to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => {
            let lowered = s.trim().to_ascii_lowercase();
            if DEFAULT_FUNCTIONS.contains(&lowered.as_str()) {
                lowered
            } else {
                quote_literal(s)?
            }
        }
        other => format!("{}::jsonb", quote_literal(&other.to_string())?),
    })
}

fn quote_literal(value: &str) -> Result<String, GuardError> {
    if value.contains('\0') {
        return Err(GuardError::invalid("default values cannot contain NUL"));
    }
    Ok(format!("'{}'", value.replace('\'', "''")))
}

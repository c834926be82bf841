//! Typed SQL parameters.
//!
//! Values supplied by callers are never interpolated into SQL text. They are
//! converted to [`SqlParam`] and bound positionally (`$1`, `$2`, ...) by the
//! backend.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A value bound to a statement placeholder.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum SqlParam {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Json(Value),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
    Uuid(Uuid),
}

impl SqlParam {
    /// Convert an untyped JSON value (structured operation payloads and
    /// filters). Arrays and objects are bound as `jsonb`.
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Self::Int(i),
                None => Self::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            Value::String(s) => Self::Text(s.clone()),
            other => Self::Json(other.clone()),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Text(_) => "text",
            Self::Json(_) => "json",
            Self::Date(_) => "date",
            Self::Timestamp(_) => "timestamp",
            Self::TimestampTz(_) => "timestamptz",
            Self::Uuid(_) => "uuid",
        }
    }
}

/// A caller-supplied `{value, type}` pair for raw queries.
///
/// `type` is optional; without it the value is converted as untyped JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypedParam {
    pub value: Value,
    #[serde(default, rename = "type")]
    pub param_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("parameter {index}: cannot convert {found} to {expected}")]
pub struct ParamError {
    pub index: usize,
    pub expected: String,
    pub found: String,
}

impl TypedParam {
    pub fn new(value: Value, param_type: impl Into<String>) -> Self {
        Self {
            value,
            param_type: Some(param_type.into()),
        }
    }

    /// Convert to a bindable parameter. `index` is only used in errors.
    pub fn to_sql_param(&self, index: usize) -> Result<SqlParam, ParamError> {
        let Some(kind) = self.param_type.as_deref() else {
            return Ok(SqlParam::from_json(&self.value));
        };
        if self.value.is_null() {
            return Ok(SqlParam::Null);
        }

        let kind = kind.trim().to_ascii_lowercase();
        let fail = || ParamError {
            index,
            expected: kind.clone(),
            found: short_repr(&self.value),
        };

        let param = match kind.as_str() {
            "int" | "integer" | "bigint" | "smallint" => match &self.value {
                Value::Number(n) => n.as_i64().map(SqlParam::Int),
                Value::String(s) => s.trim().parse().ok().map(SqlParam::Int),
                _ => None,
            },
            // numeric is bound as float8; Postgres casts on assignment.
            "float" | "double" | "real" | "numeric" | "decimal" => match &self.value {
                Value::Number(n) => n.as_f64().map(SqlParam::Float),
                Value::String(s) => s.trim().parse().ok().map(SqlParam::Float),
                _ => None,
            },
            "bool" | "boolean" => match &self.value {
                Value::Bool(b) => Some(SqlParam::Bool(*b)),
                Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                    "true" | "t" | "1" | "yes" => Some(SqlParam::Bool(true)),
                    "false" | "f" | "0" | "no" => Some(SqlParam::Bool(false)),
                    _ => None,
                },
                Value::Number(n) => n.as_i64().map(|i| SqlParam::Bool(i != 0)),
                _ => None,
            },
            "text" | "string" | "varchar" => match &self.value {
                Value::String(s) => Some(SqlParam::Text(s.clone())),
                other => Some(SqlParam::Text(other.to_string())),
            },
            "json" | "jsonb" => Some(SqlParam::Json(self.value.clone())),
            "date" => self
                .value
                .as_str()
                .and_then(|s| NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").ok())
                .map(SqlParam::Date),
            "timestamp" | "datetime" | "timestamptz" => {
                self.value.as_str().and_then(|s| parse_timestamp(s.trim()))
            }
            "uuid" => self
                .value
                .as_str()
                .and_then(|s| Uuid::parse_str(s.trim()).ok())
                .map(SqlParam::Uuid),
            _ => None,
        };
        param.ok_or_else(fail)
    }
}

/// Convert a list of typed parameters, failing on the first bad one.
pub fn convert_params(params: &[TypedParam]) -> Result<Vec<SqlParam>, ParamError> {
    params
        .iter()
        .enumerate()
        .map(|(i, p)| p.to_sql_param(i + 1))
        .collect()
}

fn parse_timestamp(s: &str) -> Option<SqlParam> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Some(SqlParam::TimestampTz(ts.with_timezone(&Utc)));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(SqlParam::Timestamp)
}

fn short_repr(value: &Value) -> String {
    let text = value.to_string();
    if text.len() > 40 {
        let cut = (0..=40).rev().find(|i| text.is_char_boundary(*i)).unwrap_or(0);
        format!("{}...", &text[..cut])
    } else {
        text
    }
}

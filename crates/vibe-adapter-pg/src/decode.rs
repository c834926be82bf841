//! Postgres rows to JSON values.
//!
//! Columns are decoded by their reported type name. NUMERIC is returned as
//! a string so no precision is lost; types without a JSON mapping come back
//! as `null`.

use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde_json::{Value, json};
use sqlx::postgres::{PgRow, PgTypeKind};
use sqlx::{Column, Row, TypeInfo, ValueRef};
use tracing::debug;
use uuid::Uuid;

/// JSON mapping chosen for a column type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ValueKind {
    Bool,
    Int2,
    Int4,
    Int8,
    Float4,
    Float8,
    Numeric,
    Text,
    Json,
    Uuid,
    Date,
    Time,
    Timestamp,
    TimestampTz,
    TextArray,
    Int4Array,
    Int8Array,
    Unsupported,
}

impl ValueKind {
    pub(crate) fn for_type(name: &str) -> Self {
        match name {
            "BOOL" => Self::Bool,
            "INT2" => Self::Int2,
            "INT4" => Self::Int4,
            "INT8" => Self::Int8,
            "FLOAT4" => Self::Float4,
            "FLOAT8" => Self::Float8,
            "NUMERIC" => Self::Numeric,
            "TEXT" | "VARCHAR" | "BPCHAR" | "CHAR" | "NAME" | "CITEXT" => Self::Text,
            "JSON" | "JSONB" => Self::Json,
            "UUID" => Self::Uuid,
            "DATE" => Self::Date,
            "TIME" => Self::Time,
            "TIMESTAMP" => Self::Timestamp,
            "TIMESTAMPTZ" => Self::TimestampTz,
            "TEXT[]" | "VARCHAR[]" | "NAME[]" => Self::TextArray,
            "INT4[]" => Self::Int4Array,
            "INT8[]" => Self::Int8Array,
            _ => Self::Unsupported,
        }
    }
}

/// Column names of a row, in order.
pub(crate) fn column_names(row: &PgRow) -> Vec<String> {
    row.columns().iter().map(|c| c.name().to_string()).collect()
}

pub(crate) fn decode_row(row: &PgRow) -> Vec<Value> {
    (0..row.columns().len()).map(|i| decode_value(row, i)).collect()
}

fn decode_value(row: &PgRow, index: usize) -> Value {
    match row.try_get_raw(index) {
        Ok(raw) if raw.is_null() => return Value::Null,
        Ok(_) => {}
        Err(_) => return Value::Null,
    }

    let type_info = row.columns()[index].type_info();
    let kind = ValueKind::for_type(type_info.name());
    let value = match kind {
        ValueKind::Bool => row.try_get::<bool, _>(index).map(Value::from),
        ValueKind::Int2 => row.try_get::<i16, _>(index).map(Value::from),
        ValueKind::Int4 => row.try_get::<i32, _>(index).map(Value::from),
        ValueKind::Int8 => row.try_get::<i64, _>(index).map(Value::from),
        ValueKind::Float4 => row.try_get::<f32, _>(index).map(|v| json!(v)),
        ValueKind::Float8 => row.try_get::<f64, _>(index).map(|v| json!(v)),
        ValueKind::Numeric => row
            .try_get::<BigDecimal, _>(index)
            .map(|v| Value::String(v.to_string())),
        ValueKind::Text => row.try_get::<String, _>(index).map(Value::String),
        ValueKind::Json => row.try_get::<Value, _>(index),
        ValueKind::Uuid => row
            .try_get::<Uuid, _>(index)
            .map(|v| Value::String(v.to_string())),
        ValueKind::Date => row
            .try_get::<NaiveDate, _>(index)
            .map(|v| Value::String(v.to_string())),
        ValueKind::Time => row
            .try_get::<NaiveTime, _>(index)
            .map(|v| Value::String(v.to_string())),
        ValueKind::Timestamp => row
            .try_get::<NaiveDateTime, _>(index)
            .map(|v| Value::String(v.format("%Y-%m-%dT%H:%M:%S%.f").to_string())),
        ValueKind::TimestampTz => row
            .try_get::<DateTime<Utc>, _>(index)
            .map(|v| Value::String(v.to_rfc3339())),
        ValueKind::TextArray => row.try_get::<Vec<String>, _>(index).map(|v| json!(v)),
        ValueKind::Int4Array => row.try_get::<Vec<i32>, _>(index).map(|v| json!(v)),
        ValueKind::Int8Array => row.try_get::<Vec<i64>, _>(index).map(|v| json!(v)),
        // Enum labels are sent as their text.
        ValueKind::Unsupported if matches!(type_info.kind(), PgTypeKind::Enum(_)) => row
            .try_get_unchecked::<String, _>(index)
            .map(Value::String),
        ValueKind::Unsupported => {
            debug!(column = index, pg_type = type_info.name(), "no JSON mapping for column type");
            return Value::Null;
        }
    };

    value.unwrap_or_else(|e| {
        debug!(column = index, pg_type = type_info.name(), error = %e, "column decode failed");
        Value::Null
    })
}

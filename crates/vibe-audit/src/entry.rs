//! Audit entries.
//!
//! One entry is written for every operation attempt, successful or not.
//! Entries are immutable once built.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use vibe_core::TenantId;

/// How an operation attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    /// The operation ran and its result was returned.
    Success,
    /// Refused before execution (permissions, deny-list, validation).
    Rejected,
    /// Execution started and failed, or timed out.
    Failure,
    /// The caller went away before a result was produced.
    Cancelled,
}

impl AuditOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Rejected => "rejected",
            Self::Failure => "failure",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for AuditOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AuditOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Self::Success),
            "rejected" => Ok(Self::Rejected),
            "failure" => Ok(Self::Failure),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown audit outcome '{other}'")),
        }
    }
}

/// An audit entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,

    pub occurred_at: DateTime<Utc>,

    pub tenant_id: TenantId,

    /// Operation name, e.g. `select`, `raw_sql`, `begin`, `commit`.
    pub operation: String,

    pub database: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,

    pub outcome: AuditOutcome,

    /// Stable error code when the outcome is not a success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,

    /// Full error detail, credentials already stripped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    pub duration_ms: u64,

    /// The SQL that was sent, or would have been sent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,

    /// Rows returned or affected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_count: Option<u64>,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub truncated: bool,

    /// DROP TABLE, TRUNCATE or DELETE.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub dangerous: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<Uuid>,

    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub meta: serde_json::Value,
}

impl AuditEntry {
    pub fn builder(
        tenant_id: TenantId,
        operation: impl Into<String>,
        database: impl Into<String>,
    ) -> AuditEntryBuilder {
        AuditEntryBuilder::new(tenant_id, operation, database)
    }

    /// `schema.table`, `schema` or the database name.
    pub fn target(&self) -> String {
        match (&self.schema, &self.table) {
            (Some(schema), Some(table)) => format!("{}.{schema}.{table}", self.database),
            (Some(schema), None) => format!("{}.{schema}", self.database),
            _ => self.database.clone(),
        }
    }

    /// Human-readable single line for console output.
    ///
    /// Format: `[timestamp] OUTCOME tenant=... op=... target=... duration_ms=...`
    pub fn to_log_line(&self) -> String {
        let mut line = format!(
            "[{}] {} tenant={} op={} target={} duration_ms={}",
            self.occurred_at.format("%Y-%m-%dT%H:%M:%S%.3fZ"),
            self.outcome.as_str().to_ascii_uppercase(),
            self.tenant_id,
            self.operation,
            self.target(),
            self.duration_ms,
        );

        if let Some(rows) = self.row_count {
            line.push_str(&format!(" rows={rows}"));
        }
        if self.truncated {
            line.push_str(" truncated=true");
        }
        if self.dangerous {
            line.push_str(" dangerous=true");
        }
        if let Some(tx) = self.transaction_id {
            line.push_str(&format!(" tx={tx}"));
        }
        if let Some(code) = &self.error_code {
            line.push_str(&format!(" code={code}"));
        }
        if let Some(sql) = &self.sql {
            let preview: String = sql.chars().take(100).collect();
            let ellipsis = if preview.len() < sql.len() { "..." } else { "" };
            line.push_str(&format!(" sql=\"{}{ellipsis}\"", preview.replace('\n', " ")));
        }
        if let Some(error) = &self.error {
            line.push_str(&format!(" error=\"{}\"", error.replace('"', "'")));
        }
        line
    }
}

/// Builder for [`AuditEntry`].
#[derive(Debug)]
pub struct AuditEntryBuilder {
    entry: AuditEntry,
}

impl AuditEntryBuilder {
    pub fn new(
        tenant_id: TenantId,
        operation: impl Into<String>,
        database: impl Into<String>,
    ) -> Self {
        Self {
            entry: AuditEntry {
                id: Uuid::new_v4(),
                occurred_at: Utc::now(),
                tenant_id,
                operation: operation.into(),
                database: database.into(),
                schema: None,
                table: None,
                outcome: AuditOutcome::Success,
                error_code: None,
                error: None,
                duration_ms: 0,
                sql: None,
                row_count: None,
                truncated: false,
                dangerous: false,
                transaction_id: None,
                meta: serde_json::Value::Null,
            },
        }
    }

    pub fn schema(mut self, schema: impl Into<String>) -> Self {
        self.entry.schema = Some(schema.into());
        self
    }

    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.entry.table = Some(table.into());
        self
    }

    /// Set schema and table from an optional `(schema, table?)` pair.
    pub fn target(mut self, target: Option<(&str, Option<&str>)>) -> Self {
        if let Some((schema, table)) = target {
            self.entry.schema = Some(schema.to_string());
            self.entry.table = table.map(str::to_string);
        }
        self
    }

    pub fn outcome(mut self, outcome: AuditOutcome) -> Self {
        self.entry.outcome = outcome;
        self
    }

    /// Record a failure: code plus full detail.
    pub fn error(mut self, code: impl Into<String>, detail: impl Into<String>) -> Self {
        self.entry.error_code = Some(code.into());
        self.entry.error = Some(detail.into());
        self
    }

    pub fn duration_ms(mut self, duration: u64) -> Self {
        self.entry.duration_ms = duration;
        self
    }

    pub fn sql(mut self, sql: impl Into<String>) -> Self {
        self.entry.sql = Some(sql.into());
        self
    }

    pub fn row_count(mut self, count: u64) -> Self {
        self.entry.row_count = Some(count);
        self
    }

    pub fn truncated(mut self, truncated: bool) -> Self {
        self.entry.truncated = truncated;
        self
    }

    pub fn dangerous(mut self, dangerous: bool) -> Self {
        self.entry.dangerous = dangerous;
        self
    }

    pub fn transaction_id(mut self, id: Uuid) -> Self {
        self.entry.transaction_id = Some(id);
        self
    }

    pub fn meta(mut self, meta: serde_json::Value) -> Self {
        self.entry.meta = meta;
        self
    }

    pub fn build(self) -> AuditEntry {
        self.entry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn builder_sets_fields() {
        let tenant = TenantId::new();
        let entry = AuditEntry::builder(tenant, "select", "db1")
            .target(Some(("public", Some("orders"))))
            .sql("SELECT * FROM \"public\".\"orders\"")
            .row_count(42)
            .truncated(true)
            .duration_ms(15)
            .build();

        assert_eq!(entry.tenant_id, tenant);
        assert_eq!(entry.outcome, AuditOutcome::Success);
        assert_eq!(entry.target(), "db1.public.orders");
        assert_eq!(entry.row_count, Some(42));
        assert!(entry.truncated);
    }

    #[test]
    fn log_line_carries_failure_details() {
        let entry = AuditEntry::builder(TenantId::new(), "raw_sql", "db1")
            .outcome(AuditOutcome::Rejected)
            .error("FORBIDDEN_OPERATION", "forbidden operation: GRANT is never permitted")
            .sql("GRANT ALL ON t TO \"x\"")
            .build();

        let line = entry.to_log_line();
        assert!(line.contains("REJECTED"));
        assert!(line.contains("op=raw_sql"));
        assert!(line.contains("target=db1"));
        assert!(line.contains("code=FORBIDDEN_OPERATION"));
        assert!(line.contains("sql="));
    }

    #[test]
    fn serialization_skips_empty_fields() {
        let entry = AuditEntry::builder(TenantId::new(), "commit", "db1").build();
        let json = serde_json::to_value(&entry).unwrap();
        let obj = json.as_object().unwrap();
        assert!(!obj.contains_key("truncated"));
        assert!(!obj.contains_key("error"));
        assert_eq!(obj["outcome"], "success");

        let back: AuditEntry = serde_json::from_value(json).unwrap();
        assert_eq!(back, entry);
    }
}

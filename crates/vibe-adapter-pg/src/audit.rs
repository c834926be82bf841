//! Audit storage in the control database's `audit_logs` table.

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{Postgres, QueryBuilder, Row};
use uuid::Uuid;

use vibe_audit::{AuditEntry, AuditError, AuditFilter, AuditOutcome, AuditStorage};
use vibe_core::TenantId;

const COLUMNS: &str = "id, occurred_at, tenant_id, operation, database_name, schema_name, \
     table_name, outcome, error_code, error, duration_ms, sql, row_count, truncated, dangerous, \
     transaction_id, meta";

pub struct PgAuditStorage {
    pool: PgPool,
}

impl PgAuditStorage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn storage_error(err: sqlx::Error) -> AuditError {
    AuditError::Storage(vibe_core::redact_secrets(&err.to_string()))
}

fn entry_from_row(row: &PgRow) -> Result<AuditEntry, sqlx::Error> {
    let outcome: String = row.try_get("outcome")?;
    let row_count: Option<i64> = row.try_get("row_count")?;
    let duration_ms: i64 = row.try_get("duration_ms")?;
    let meta: Option<serde_json::Value> = row.try_get("meta")?;
    Ok(AuditEntry {
        id: row.try_get("id")?,
        occurred_at: row.try_get("occurred_at")?,
        tenant_id: TenantId(row.try_get("tenant_id")?),
        operation: row.try_get("operation")?,
        database: row.try_get("database_name")?,
        schema: row.try_get("schema_name")?,
        table: row.try_get("table_name")?,
        outcome: outcome
            .parse::<AuditOutcome>()
            .map_err(|e| sqlx::Error::Decode(e.into()))?,
        error_code: row.try_get("error_code")?,
        error: row.try_get("error")?,
        duration_ms: u64::try_from(duration_ms).unwrap_or(0),
        sql: row.try_get("sql")?,
        row_count: row_count.map(|n| u64::try_from(n).unwrap_or(0)),
        truncated: row.try_get("truncated")?,
        dangerous: row.try_get("dangerous")?,
        transaction_id: row.try_get("transaction_id")?,
        meta: meta.unwrap_or(serde_json::Value::Null),
    })
}

/// `WHERE` clause for a filter, without ordering or paging.
fn push_filter<'a>(query: &mut QueryBuilder<'a, Postgres>, filter: &'a AuditFilter) {
    query.push(" WHERE TRUE");
    if let Some(tenant) = filter.tenant_id {
        query.push(" AND tenant_id = ").push_bind(tenant.0);
    }
    if let Some(database) = &filter.database {
        query.push(" AND database_name = ").push_bind(database);
    }
    if let Some(operation) = &filter.operation {
        query.push(" AND operation = ").push_bind(operation);
    }
    if let Some(outcome) = filter.outcome {
        query.push(" AND outcome = ").push_bind(outcome.as_str());
    }
    if let Some(start) = filter.start_time {
        query.push(" AND occurred_at >= ").push_bind(start);
    }
    if let Some(end) = filter.end_time {
        query.push(" AND occurred_at <= ").push_bind(end);
    }
}

#[async_trait]
impl AuditStorage for PgAuditStorage {
    async fn store(&self, entry: AuditEntry) -> Result<(), AuditError> {
        let meta = (!entry.meta.is_null()).then_some(&entry.meta);
        sqlx::query(&format!(
            "INSERT INTO audit_logs ({COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)"
        ))
        .bind(entry.id)
        .bind(entry.occurred_at)
        .bind(entry.tenant_id.0)
        .bind(&entry.operation)
        .bind(&entry.database)
        .bind(&entry.schema)
        .bind(&entry.table)
        .bind(entry.outcome.as_str())
        .bind(&entry.error_code)
        .bind(&entry.error)
        .bind(i64::try_from(entry.duration_ms).unwrap_or(i64::MAX))
        .bind(&entry.sql)
        .bind(entry.row_count.map(|n| i64::try_from(n).unwrap_or(i64::MAX)))
        .bind(entry.truncated)
        .bind(entry.dangerous)
        .bind(entry.transaction_id)
        .bind(meta)
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;
        Ok(())
    }

    async fn query(&self, filter: AuditFilter) -> Result<Vec<AuditEntry>, AuditError> {
        let mut query = QueryBuilder::<Postgres>::new(format!("SELECT {COLUMNS} FROM audit_logs"));
        push_filter(&mut query, &filter);
        query.push(" ORDER BY occurred_at DESC");
        if let Some(limit) = filter.limit {
            query.push(" LIMIT ").push_bind(i64::try_from(limit).unwrap_or(i64::MAX));
        }
        if let Some(offset) = filter.offset {
            query.push(" OFFSET ").push_bind(i64::try_from(offset).unwrap_or(i64::MAX));
        }

        let rows = query
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(storage_error)?;
        rows.iter()
            .map(entry_from_row)
            .collect::<Result<_, _>>()
            .map_err(storage_error)
    }

    async fn get(&self, id: Uuid) -> Result<Option<AuditEntry>, AuditError> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM audit_logs WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_error)?;
        row.as_ref()
            .map(entry_from_row)
            .transpose()
            .map_err(storage_error)
    }

    async fn count(&self, filter: AuditFilter) -> Result<usize, AuditError> {
        let mut query = QueryBuilder::<Postgres>::new("SELECT COUNT(*) AS n FROM audit_logs");
        push_filter(&mut query, &filter);
        let row = query
            .build()
            .fetch_one(&self.pool)
            .await
            .map_err(storage_error)?;
        let n: i64 = row.try_get("n").map_err(storage_error)?;
        Ok(usize::try_from(n).unwrap_or(0))
    }

    async fn purge_tenant(&self, tenant: TenantId) -> Result<u64, AuditError> {
        let result = sqlx::query("DELETE FROM audit_logs WHERE tenant_id = $1")
            .bind(tenant.0)
            .execute(&self.pool)
            .await
            .map_err(storage_error)?;
        Ok(result.rows_affected())
    }
}

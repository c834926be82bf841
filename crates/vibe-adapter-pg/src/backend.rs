//! Tenant sessions on Postgres.

use async_trait::async_trait;
use futures::TryStreamExt;
use sqlx::encode::IsNull;
use sqlx::error::BoxDynError;
use sqlx::pool::PoolConnection;
use sqlx::postgres::types::Oid;
use sqlx::postgres::{PgArgumentBuffer, PgArguments, PgConnection, PgTypeInfo};
use sqlx::{Arguments, Encode, Postgres, Type};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use vibe_core::{SqlParam, TenantId};
use vibe_runtime::{Backend, BackendError, FetchedRows, Session};

use crate::decode::{column_names, decode_row};
use crate::error::execution_error;
use crate::router::ConnectionRouter;

/// [`Backend`] over the connection router.
#[derive(Clone)]
pub struct PgBackend {
    router: Arc<ConnectionRouter>,
}

impl PgBackend {
    pub fn new(router: Arc<ConnectionRouter>) -> Self {
        Self { router }
    }

    pub fn router(&self) -> &Arc<ConnectionRouter> {
        &self.router
    }
}

#[async_trait]
impl Backend for PgBackend {
    async fn connect(
        &self,
        tenant: TenantId,
        database: &str,
    ) -> Result<Box<dyn Session>, BackendError> {
        let conn = self.router.acquire(tenant, database).await?;
        Ok(Box::new(PgSession::new(conn)))
    }
}

/// Search path pinned for every tenant transaction. It matches how the
/// guard resolves unqualified names and keeps `$user` out of it.
pub const TENANT_SEARCH_PATH: &str = "pg_catalog, public";

/// One pooled connection.
///
/// A session dropped inside an open transaction closes its connection
/// rather than returning it to the pool.
pub struct PgSession {
    conn: Option<PoolConnection<Postgres>>,
    in_transaction: bool,
}

impl PgSession {
    pub fn new(conn: PoolConnection<Postgres>) -> Self {
        Self {
            conn: Some(conn),
            in_transaction: false,
        }
    }

    fn conn(&mut self) -> Result<&mut PgConnection, BackendError> {
        self.conn
            .as_deref_mut()
            .ok_or_else(|| BackendError::execution("session was discarded", None))
    }

    async fn control(&mut self, statement: &str) -> Result<(), BackendError> {
        sqlx::Executor::execute(self.conn()?, sqlx::raw_sql(statement))
            .await
            .map_err(execution_error)?;
        Ok(())
    }
}

#[async_trait]
impl Session for PgSession {
    async fn begin(&mut self) -> Result<(), BackendError> {
        self.control("BEGIN").await?;
        self.in_transaction = true;
        self.control(&format!("SET LOCAL search_path = {TENANT_SEARCH_PATH}"))
            .await
    }

    async fn set_statement_timeout(&mut self, timeout: Duration) -> Result<(), BackendError> {
        let millis = timeout.as_millis().max(1);
        self.control(&format!("SET LOCAL statement_timeout = {millis}"))
            .await
    }

    async fn commit(&mut self) -> Result<(), BackendError> {
        self.control("COMMIT").await?;
        self.in_transaction = false;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), BackendError> {
        self.control("ROLLBACK").await?;
        self.in_transaction = false;
        Ok(())
    }

    async fn fetch(
        &mut self,
        sql: &str,
        params: &[SqlParam],
        limit: usize,
    ) -> Result<FetchedRows, BackendError> {
        let args = bind_params(params)?;
        let conn = self.conn()?;
        let mut stream = sqlx::query_with(sql, args).fetch(conn);

        let mut fetched = FetchedRows::default();
        while fetched.rows.len() < limit {
            let Some(row) = stream.try_next().await.map_err(execution_error)? else {
                break;
            };
            if fetched.columns.is_empty() {
                fetched.columns = column_names(&row);
            }
            fetched.rows.push(decode_row(&row));
        }
        debug!(rows = fetched.rows.len(), limit, "fetched rows");
        Ok(fetched)
    }

    async fn execute(&mut self, sql: &str, params: &[SqlParam]) -> Result<u64, BackendError> {
        let args = bind_params(params)?;
        let result = sqlx::query_with(sql, args)
            .execute(self.conn()?)
            .await
            .map_err(execution_error)?;
        Ok(result.rows_affected())
    }

    fn discard(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            conn.close_on_drop();
            debug!("discarded connection");
        }
        self.in_transaction = false;
    }
}

impl Drop for PgSession {
    fn drop(&mut self) {
        if self.in_transaction {
            warn!("session dropped inside a transaction; closing its connection");
            self.discard();
        }
    }
}

/// A NULL without a declared type, so Postgres infers it from context.
struct UntypedNull;

impl Type<Postgres> for UntypedNull {
    fn type_info() -> PgTypeInfo {
        PgTypeInfo::with_oid(Oid(0))
    }
}

impl Encode<'_, Postgres> for UntypedNull {
    fn encode_by_ref(&self, _buf: &mut PgArgumentBuffer) -> Result<IsNull, BoxDynError> {
        Ok(IsNull::Yes)
    }
}

fn args_add<'q, T>(args: &mut PgArguments, index: usize, value: T) -> Result<(), BackendError>
where
    T: Encode<'q, Postgres> + Type<Postgres> + Send + 'q,
{
    args.add(value)
        .map_err(|e| BackendError::execution(format!("cannot bind parameter ${}: {e}", index + 1), None))
}

/// Bind parameters positionally, `$1` first.
pub(crate) fn bind_params(params: &[SqlParam]) -> Result<PgArguments, BackendError> {
    let mut args = PgArguments::default();
    for (i, param) in params.iter().enumerate() {
        match param {
            SqlParam::Null => args_add(&mut args, i, UntypedNull)?,
            SqlParam::Bool(v) => args_add(&mut args, i, *v)?,
            SqlParam::Int(v) => args_add(&mut args, i, *v)?,
            SqlParam::Float(v) => args_add(&mut args, i, *v)?,
            SqlParam::Text(v) => args_add(&mut args, i, v.clone())?,
            SqlParam::Json(v) => args_add(&mut args, i, sqlx::types::Json(v.clone()))?,
            SqlParam::Date(v) => args_add(&mut args, i, *v)?,
            SqlParam::Timestamp(v) => args_add(&mut args, i, *v)?,
            SqlParam::TimestampTz(v) => args_add(&mut args, i, *v)?,
            SqlParam::Uuid(v) => args_add(&mut args, i, *v)?,
        }
    }
    Ok(args)
}

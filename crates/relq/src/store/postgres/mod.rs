//! Postgres implementation of the store traits.
//!
//! Claims use `FOR UPDATE SKIP LOCKED`, so concurrent receivers never wait on each other's
//! candidate rows, and held-transaction mode keeps the row lock until commit or rollback.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::store::{
    BackendType, Capabilities, Command, ConnectionScope, MessageStore, QueryParam, Rows, StoreRow,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgArguments, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::{PgPool, Postgres, Row};

mod scope;

use self::scope::PostgresScope;

const CAPABILITIES: Capabilities = Capabilities {
    row_locks: true,
    skip_locked: true,
    priority: true,
};

#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(config: &Config) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.connection_timeout())
            .connect(&config.dsn)
            .await
            .map_err(|e| Error::ConnectionFailed {
                source: Box::new(e),
                context: "Failed to connect to postgres".into(),
            })?;
        Ok(Self::new(pool))
    }

    /// Get access to the underlying PgPool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

pub(crate) fn bind_params(
    mut query: Query<'_, Postgres, PgArguments>,
    params: Vec<QueryParam>,
) -> Query<'_, Postgres, PgArguments> {
    for param in params {
        query = match param {
            QueryParam::I64(value) => query.bind(value),
            QueryParam::F64(value) => query.bind(value),
            QueryParam::Bool(value) => query.bind(value),
            QueryParam::String(value) => query.bind(value),
            QueryParam::Bytes(value) => query.bind(value),
            QueryParam::DateTime(value) => query.bind(value),
        };
    }
    query
}

pub(crate) fn wrap_rows(rows: Vec<PgRow>) -> Rows {
    rows.into_iter()
        .map(|row| Box::new(PgStoreRow(row)) as Box<dyn StoreRow>)
        .collect()
}

pub(crate) fn query_label(command: &Command) -> String {
    format!("{:?}", command.kind)
}

struct PgStoreRow(PgRow);

impl StoreRow for PgStoreRow {
    fn i64(&self, column: &str) -> Result<Option<i64>> {
        Ok(self.0.try_get(column)?)
    }

    fn f64(&self, column: &str) -> Result<Option<f64>> {
        Ok(self.0.try_get(column)?)
    }

    fn bool(&self, column: &str) -> Result<Option<bool>> {
        Ok(self.0.try_get(column)?)
    }

    fn string(&self, column: &str) -> Result<Option<String>> {
        Ok(self.0.try_get(column)?)
    }

    fn bytes(&self, column: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.0.try_get(column)?)
    }

    fn datetime(&self, column: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self.0.try_get(column)?)
    }
}

#[async_trait]
impl MessageStore for PostgresStore {
    fn backend(&self) -> BackendType {
        BackendType::Postgres
    }

    fn capabilities(&self) -> Capabilities {
        CAPABILITIES
    }

    async fn execute(&self, command: &Command, params: Vec<QueryParam>) -> Result<u64> {
        let result = bind_params(sqlx::query(&command.sql), params)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::query(query_label(command), "Failed to execute statement", e))?;
        Ok(result.rows_affected())
    }

    async fn fetch(&self, command: &Command, params: Vec<QueryParam>) -> Result<Rows> {
        let rows = bind_params(sqlx::query(&command.sql), params)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Error::query(query_label(command), "Failed to fetch rows", e))?;
        Ok(wrap_rows(rows))
    }

    async fn open_scope(&self) -> Result<Box<dyn ConnectionScope>> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Error::transaction("Failed to begin transaction", e))?;
        Ok(Box::new(PostgresScope::new(tx)))
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

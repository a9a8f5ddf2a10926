//! SQLite implementation of the store traits.
//!
//! SQLite serialises writers, so a claim expressed as one `UPDATE ... RETURNING` (or
//! `DELETE ... RETURNING`) statement is atomic without row locks. Held-transaction mode is not
//! available. Timestamps are stored as fixed-width TEXT so they compare lexically.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::store::{
    BackendType, Capabilities, Command, ConnectionScope, MessageStore, QueryParam, Rows, StoreRow,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use std::str::FromStr;

const CAPABILITIES: Capabilities = Capabilities {
    row_locks: false,
    skip_locked: false,
    priority: true,
};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// Parse SQLite TEXT timestamp to DateTime<Utc>
pub fn parse_sqlite_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_str(&format!("{} +0000", s), "%Y-%m-%d %H:%M:%S%.f %z")
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Internal {
            message: format!("Invalid timestamp '{}': {}", s, e),
        })
}

/// Format DateTime<Utc> for SQLite TEXT storage
pub fn format_sqlite_timestamp(dt: &DateTime<Utc>) -> String {
    dt.format(TIMESTAMP_FORMAT).to_string()
}

#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Create a new SQLite store with default optimizations.
    ///
    /// This initializes the pool with:
    /// - 5s busy timeout
    /// - WAL mode enabled for concurrency
    /// - Foreign Keys enforced
    pub async fn connect(config: &Config) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&config.dsn)
            .map_err(|e| Error::ConnectionFailed {
                source: Box::new(e),
                context: format!("Invalid sqlite DSN '{}'", config.dsn),
            })?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.connection_timeout())
            .after_connect(|conn, _meta| {
                Box::pin(async move {
                    sqlx::query("PRAGMA busy_timeout=5000")
                        .execute(&mut *conn)
                        .await?;
                    sqlx::query("PRAGMA journal_mode=WAL")
                        .execute(&mut *conn)
                        .await?;
                    sqlx::query("PRAGMA foreign_keys=ON")
                        .execute(&mut *conn)
                        .await?;
                    Ok(())
                })
            })
            .connect_with(options)
            .await
            .map_err(|e| Error::ConnectionFailed {
                source: Box::new(e),
                context: "Failed to connect to sqlite".into(),
            })?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn bind_params<'q>(
    mut query: Query<'q, Sqlite, SqliteArguments<'q>>,
    params: Vec<QueryParam>,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    for param in params {
        query = match param {
            QueryParam::I64(value) => query.bind(value),
            QueryParam::F64(value) => query.bind(value),
            QueryParam::Bool(value) => query.bind(value),
            QueryParam::String(value) => query.bind(value),
            QueryParam::Bytes(value) => query.bind(value),
            QueryParam::DateTime(value) => query.bind(value.as_ref().map(format_sqlite_timestamp)),
        };
    }
    query
}

fn wrap_rows(rows: Vec<SqliteRow>) -> Rows {
    rows.into_iter()
        .map(|row| Box::new(SqliteStoreRow(row)) as Box<dyn StoreRow>)
        .collect()
}

fn query_label(command: &Command) -> String {
    format!("{:?}", command.kind)
}

struct SqliteStoreRow(SqliteRow);

impl StoreRow for SqliteStoreRow {
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
        let text: Option<String> = self.0.try_get(column)?;
        text.as_deref().map(parse_sqlite_timestamp).transpose()
    }
}

#[async_trait]
impl MessageStore for SqliteStore {
    fn backend(&self) -> BackendType {
        BackendType::Sqlite
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
        Ok(Box::new(SqliteScope { tx }))
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

/// Transaction scope used for multi-statement writes.
///
/// The first statement of every such write is itself a write, so the scope takes SQLite's
/// write lock up front instead of upgrading from a read snapshot.
struct SqliteScope {
    tx: Transaction<'static, Sqlite>,
}

#[async_trait]
impl ConnectionScope for SqliteScope {
    async fn execute(&mut self, command: &Command, params: Vec<QueryParam>) -> Result<u64> {
        let result = bind_params(sqlx::query(&command.sql), params)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| {
                Error::query(query_label(command), "Failed to execute statement in transaction", e)
            })?;
        Ok(result.rows_affected())
    }

    async fn fetch(&mut self, command: &Command, params: Vec<QueryParam>) -> Result<Rows> {
        let rows = bind_params(sqlx::query(&command.sql), params)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| Error::query(query_label(command), "Failed to fetch rows in transaction", e))?;
        Ok(wrap_rows(rows))
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx
            .commit()
            .await
            .map_err(|e| Error::transaction("Failed to commit transaction", e))
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx
            .rollback()
            .await
            .map_err(|e| Error::transaction("Failed to roll back transaction", e))
    }
}

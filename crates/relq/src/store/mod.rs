//! Backend abstraction for relq.
//!
//! The claim, commit and rollback algorithms are written once, in [`crate::queue`], against the
//! traits in this module. A backend adapter only has to do three things:
//!
//! - bind [`QueryParam`] values to a prepared [`Command`] and run it,
//! - expose result rows through [`StoreRow`],
//! - open a [`ConnectionScope`] (a connection with an open transaction) for held-transaction
//!   mode and multi-statement writes.
//!
//! SQL text is never written by adapters; it comes from the [`query`] builder, rendered for the
//! adapter's [`Dialect`].

use crate::config::Config;
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

#[cfg(feature = "postgres")]
pub mod postgres;
pub mod query;
pub mod rows;
pub mod schema;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use query::{Arg, Command, CommandCache, CommandKind, Dialect};

/// What a backend can do beyond plain single-statement reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Row locks can be held by an open transaction across statements.
    pub row_locks: bool,
    /// Locked rows can be skipped by other claimants (`SKIP LOCKED`).
    pub skip_locked: bool,
    pub priority: bool,
}

/// A value bound to one placeholder of a [`Command`].
///
/// Nulls are typed so backends with strict parameter typing bind them correctly.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryParam {
    I64(Option<i64>),
    F64(Option<f64>),
    Bool(Option<bool>),
    String(Option<String>),
    Bytes(Vec<u8>),
    DateTime(Option<DateTime<Utc>>),
}

/// Read access to one result row, independent of the backend's row type.
pub trait StoreRow: Send {
    fn i64(&self, column: &str) -> Result<Option<i64>>;
    fn f64(&self, column: &str) -> Result<Option<f64>>;
    fn bool(&self, column: &str) -> Result<Option<bool>>;
    fn string(&self, column: &str) -> Result<Option<String>>;
    fn bytes(&self, column: &str) -> Result<Option<Vec<u8>>>;
    fn datetime(&self, column: &str) -> Result<Option<DateTime<Utc>>>;
}

pub type Rows = Vec<Box<dyn StoreRow>>;

/// A connection with an open transaction, owned by one logical operation.
///
/// Dropping a scope without calling [`commit`](Self::commit) rolls the transaction back.
#[async_trait]
pub trait ConnectionScope: Send {
    async fn execute(&mut self, command: &Command, params: Vec<QueryParam>) -> Result<u64>;
    async fn fetch(&mut self, command: &Command, params: Vec<QueryParam>) -> Result<Rows>;
    async fn commit(self: Box<Self>) -> Result<()>;
    async fn rollback(self: Box<Self>) -> Result<()>;
}

#[async_trait]
pub trait MessageStore: Send + Sync + std::fmt::Debug {
    fn backend(&self) -> BackendType;

    fn capabilities(&self) -> Capabilities;

    fn dialect(&self) -> Dialect {
        self.backend().dialect()
    }

    /// Run one statement in autocommit mode and return the affected row count.
    async fn execute(&self, command: &Command, params: Vec<QueryParam>) -> Result<u64>;

    /// Run one statement in autocommit mode and return its rows.
    async fn fetch(&self, command: &Command, params: Vec<QueryParam>) -> Result<Rows>;

    async fn open_scope(&self) -> Result<Box<dyn ConnectionScope>>;

    /// Run statements in order inside one transaction.
    async fn execute_all(&self, statements: Vec<(Arc<Command>, Vec<QueryParam>)>) -> Result<Vec<u64>> {
        let mut scope = self.open_scope().await?;
        let mut counts = Vec::with_capacity(statements.len());
        for (command, params) in statements {
            match scope.execute(&command, params).await {
                Ok(n) => counts.push(n),
                Err(e) => {
                    if let Err(rollback_err) = scope.rollback().await {
                        tracing::warn!(error = %rollback_err, "rollback after failed statement failed");
                    }
                    return Err(e);
                }
            }
        }
        scope.commit().await?;
        Ok(counts)
    }

    async fn close(&self);
}

/// Supported database backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendType {
    #[cfg(feature = "postgres")]
    Postgres,
    #[cfg(feature = "sqlite")]
    Sqlite,
}

impl BackendType {
    const POSTGRES_PREFIXES: &'static [&'static str] = &["postgres://", "postgresql://"];
    const SQLITE_PREFIXES: &'static [&'static str] = &["sqlite://", "sqlite:"];

    pub fn detect(dsn: &str) -> Result<Self> {
        if Self::POSTGRES_PREFIXES.iter().any(|p| dsn.starts_with(p)) {
            #[cfg(feature = "postgres")]
            return Ok(Self::Postgres);

            #[cfg(not(feature = "postgres"))]
            return Err(Error::InvalidConfig {
                field: "dsn".to_string(),
                message: "Postgres backend is not enabled".to_string(),
            });
        }

        if Self::SQLITE_PREFIXES.iter().any(|p| dsn.starts_with(p)) {
            #[cfg(feature = "sqlite")]
            return Ok(Self::Sqlite);

            #[cfg(not(feature = "sqlite"))]
            return Err(Error::InvalidConfig {
                field: "dsn".to_string(),
                message: "Sqlite backend is not enabled".to_string(),
            });
        }

        Err(Error::InvalidConfig {
            field: "dsn".to_string(),
            message: format!(
                "Unsupported DSN format: {}",
                dsn.split("://").next().unwrap_or(dsn)
            ),
        })
    }

    pub fn dialect(&self) -> Dialect {
        match self {
            #[cfg(feature = "postgres")]
            BackendType::Postgres => Dialect::Postgres,
            #[cfg(feature = "sqlite")]
            BackendType::Sqlite => Dialect::Sqlite,
        }
    }
}

/// Connect to the backend named by `config.dsn`.
pub async fn connect(config: &Config) -> Result<Arc<dyn MessageStore>> {
    match BackendType::detect(&config.dsn)? {
        #[cfg(feature = "postgres")]
        BackendType::Postgres => Ok(Arc::new(postgres::PostgresStore::connect(config).await?)),
        #[cfg(feature = "sqlite")]
        BackendType::Sqlite => Ok(Arc::new(sqlite::SqliteStore::connect(config).await?)),
    }
}

/// Connect with default settings for everything but the DSN.
pub async fn connect_with_dsn(dsn: &str) -> Result<Arc<dyn MessageStore>> {
    connect(&Config::from_dsn(dsn)).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_backend() {
        #[cfg(feature = "postgres")]
        assert_eq!(
            BackendType::detect("postgresql://localhost/db").unwrap(),
            BackendType::Postgres
        );
        #[cfg(feature = "sqlite")]
        assert_eq!(
            BackendType::detect("sqlite://queue.db").unwrap(),
            BackendType::Sqlite
        );
        assert!(matches!(
            BackendType::detect("mysql://localhost/db"),
            Err(Error::InvalidConfig { .. })
        ));
    }
}

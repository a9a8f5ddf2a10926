use super::{bind_params, query_label, wrap_rows};
use crate::error::{Error, Result};
use crate::store::{Command, ConnectionScope, QueryParam, Rows};
use async_trait::async_trait;
use sqlx::{Postgres, Transaction};

/// One pooled connection inside an open transaction.
pub(crate) struct PostgresScope {
    tx: Transaction<'static, Postgres>,
}

impl PostgresScope {
    pub(crate) fn new(tx: Transaction<'static, Postgres>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl ConnectionScope for PostgresScope {
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

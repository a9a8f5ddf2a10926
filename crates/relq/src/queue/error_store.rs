//! Quarantine for messages that must not be delivered again.

use super::Queue;
use crate::context::MessageContext;
use crate::error::{Error, Result};
use crate::metrics::QueueEvent;
use crate::store::query::Arg;
use crate::store::rows::{decode_count, decode_error, decode_id};
use crate::store::{CommandKind, QueryParam};
use crate::types::{ErrorKind, ErrorRecord, ReceivedMessage};
use chrono::{DateTime, Utc};

/// Which error records a purge removes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurgeFilter {
    All,
    /// Records that failed before this instant.
    OlderThan(DateTime<Utc>),
}

/// The error table of one queue.
#[derive(Debug, Clone)]
pub struct ErrorStore {
    queue: Queue,
}

impl ErrorStore {
    pub(crate) fn new(queue: Queue) -> Self {
        Self { queue }
    }

    /// Move a claimed message into the error table.
    ///
    /// The error record is written and the live row deleted in one transaction (the held
    /// transaction itself in held mode), so the message is never delivered again. Quarantine
    /// resolves the claim without counting a rollback.
    pub async fn handle(&self, ctx: &mut MessageContext, kind: ErrorKind, error: &Error) -> Result<()> {
        let queue = &self.queue;
        let queue_id = ctx.queue_id();
        if ctx.is_resolved() {
            tracing::debug!(queue = %queue.name(), queue_id, "Quarantine skipped, already resolved");
            return Ok(());
        }

        let insert = queue.command(CommandKind::InsertError);
        let insert_params = self.error_params(ctx.message(), kind, error)?;
        let delete = queue.command(CommandKind::DeleteMessage);
        let id = vec![QueryParam::I64(Some(queue_id))];

        let result = if let Some(mut scope) = ctx.take_scope() {
            let written = async {
                scope.execute(&insert, insert_params).await?;
                scope.execute(&delete, id).await
            }
            .await;
            match written {
                Ok(_) => scope.commit().await,
                Err(e) => Err(e),
            }
        } else if queue.options().held_mode() {
            tracing::debug!(queue = %queue.name(), queue_id, "Quarantine skipped, transaction already closed");
            return Ok(());
        } else {
            let mut statements = vec![(insert, insert_params)];
            if queue.options().claim_keeps_row() {
                statements.push((delete, id));
            }
            queue.store().execute_all(statements).await.map(|_| ())
        };
        if let Err(e) = result {
            tracing::warn!(queue = %queue.name(), queue_id, error = %e, "Quarantine failed");
            return Err(e);
        }

        queue.sync_status_row(queue_id, None).await;
        let event = match kind {
            ErrorKind::Poison => QueueEvent::Poisoned,
            ErrorKind::RetriesExhausted => QueueEvent::RetriesExhausted,
        };
        queue.resolve(ctx, event);
        tracing::warn!(
            queue = %queue.name(),
            queue_id,
            kind = %kind,
            error = %error,
            "Message moved to error store"
        );
        Ok(())
    }

    fn error_params(&self, message: &ReceivedMessage, kind: ErrorKind, error: &Error) -> Result<Vec<QueryParam>> {
        let command = self.queue.command(CommandKind::InsertError);
        let headers = serde_json::to_string(&message.headers)?;
        let failed_at = self.queue.now();
        command.bind(|arg| match arg {
            Arg::QueueId => Some(QueryParam::I64(Some(message.queue_id))),
            Arg::Payload => Some(QueryParam::Bytes(message.payload.clone())),
            Arg::Headers => Some(QueryParam::String(Some(headers.clone()))),
            Arg::MessageRoute => Some(QueryParam::String(message.route.clone())),
            Arg::CorrelationId => Some(QueryParam::String(Some(message.correlation_id.clone()))),
            Arg::RetryCount => Some(QueryParam::I64(Some(message.retry_count as i64))),
            Arg::EnqueuedAt => Some(QueryParam::DateTime(Some(message.enqueued_at))),
            Arg::ErrorKind => Some(QueryParam::String(Some(kind.as_str().to_string()))),
            Arg::Exception => Some(QueryParam::String(Some(error.to_string()))),
            Arg::FailedAt => Some(QueryParam::DateTime(Some(failed_at))),
            _ => None,
        })
    }

    /// Delete error records and return how many were removed.
    pub async fn clear_messages(&self, filter: PurgeFilter) -> Result<u64> {
        let removed = match filter {
            PurgeFilter::All => {
                let command = self.queue.command(CommandKind::PurgeErrors);
                self.queue.store().execute(&command, Vec::new()).await?
            }
            PurgeFilter::OlderThan(cutoff) => {
                let command = self.queue.command(CommandKind::PurgeErrorsOlderThan);
                self.queue
                    .store()
                    .execute(&command, vec![QueryParam::DateTime(Some(cutoff))])
                    .await?
            }
        };
        tracing::debug!(queue = %self.queue.name(), removed, filter = ?filter, "Purged error records");
        Ok(removed)
    }

    /// Ids of up to `limit` records that failed before `older_than`, oldest first.
    pub async fn find_error_messages_to_delete(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<i64>> {
        let command = self.queue.command(CommandKind::FindErrorsToDelete);
        let params = command.bind(|arg| match arg {
            Arg::OlderThan => Some(QueryParam::DateTime(Some(older_than))),
            Arg::Limit => Some(QueryParam::I64(Some(limit))),
            _ => None,
        })?;
        let rows = self.queue.store().fetch(&command, params).await?;
        rows.iter()
            .map(|row| decode_id(row.as_ref(), "error_id"))
            .collect()
    }

    /// Delete one error record. Returns whether it existed.
    pub async fn delete(&self, error_id: i64) -> Result<bool> {
        let command = self.queue.command(CommandKind::DeleteError);
        let deleted = self
            .queue
            .store()
            .execute(&command, vec![QueryParam::I64(Some(error_id))])
            .await?;
        Ok(deleted > 0)
    }

    pub async fn list(&self, limit: i64, offset: i64) -> Result<Vec<ErrorRecord>> {
        let command = self.queue.command(CommandKind::ListErrors);
        let params = command.bind(|arg| match arg {
            Arg::Limit => Some(QueryParam::I64(Some(limit))),
            Arg::Offset => Some(QueryParam::I64(Some(offset))),
            _ => None,
        })?;
        let rows = self.queue.store().fetch(&command, params).await?;
        rows.iter().map(|row| decode_error(row.as_ref())).collect()
    }

    pub async fn get(&self, error_id: i64) -> Result<Option<ErrorRecord>> {
        let command = self.queue.command(CommandKind::GetError);
        let rows = self
            .queue
            .store()
            .fetch(&command, vec![QueryParam::I64(Some(error_id))])
            .await?;
        rows.first().map(|row| decode_error(row.as_ref())).transpose()
    }

    pub async fn count(&self) -> Result<i64> {
        let command = self.queue.command(CommandKind::CountErrors);
        let rows = self.queue.store().fetch(&command, Vec::new()).await?;
        match rows.first() {
            Some(row) => decode_count(row.as_ref()),
            None => Ok(0),
        }
    }
}

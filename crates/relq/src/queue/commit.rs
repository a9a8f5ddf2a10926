use super::Queue;
use crate::context::MessageContext;
use crate::error::Result;
use crate::metrics::QueueEvent;
use crate::store::{CommandKind, QueryParam};

impl Queue {
    /// Acknowledge a processed message. The row is deleted and its id is never delivered again.
    ///
    /// Committing an already resolved context is a no-op. In held-transaction mode the
    /// transaction is taken out of the context first, so a failed commit cannot be retried on
    /// the same transaction; the error is returned and the store rolls the claim back.
    pub async fn commit(&self, ctx: &mut MessageContext) -> Result<()> {
        let queue_id = ctx.queue_id();
        if ctx.is_resolved() {
            tracing::debug!(queue = %self.name(), queue_id, "Commit skipped, already resolved");
            return Ok(());
        }

        let delete = self.command(CommandKind::DeleteMessage);
        let params = vec![QueryParam::I64(Some(queue_id))];

        if let Some(mut scope) = ctx.take_scope() {
            let result = match scope.execute(&delete, params).await {
                Ok(_) => scope.commit().await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                tracing::warn!(
                    queue = %self.name(),
                    queue_id,
                    error = %e,
                    "Commit failed, held transaction discarded"
                );
                return Err(e);
            }
            self.sync_status_row(queue_id, None).await;
        } else if self.inner.options.held_mode() {
            tracing::debug!(queue = %self.name(), queue_id, "Commit skipped, transaction already closed");
            return Ok(());
        } else if self.inner.options.claim_keeps_row() {
            let deleted = self
                .inner
                .store
                .execute(&delete, params)
                .await
                .inspect_err(|e| {
                    tracing::warn!(queue = %self.name(), queue_id, error = %e, "Commit failed");
                })?;
            if deleted == 0 {
                tracing::debug!(queue = %self.name(), queue_id, "Commit found no row to delete");
            }
            self.sync_status_row(queue_id, None).await;
        }

        self.resolve(ctx, QueueEvent::Committed);
        tracing::debug!(queue = %self.name(), queue_id, "Committed message");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::options::TransportOptions;
    use crate::queue::test_support::sqlite_queue;
    use crate::types::{MessageStatus, NewMessage};
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn test_commit_deletes_and_is_idempotent() {
        let t = sqlite_queue(TransportOptions {
            enable_status_table: true,
            ..TransportOptions::standard()
        })
        .await;
        let id = t.queue.send(NewMessage::new(b"x".to_vec())).await.unwrap();
        let cancel = CancellationToken::new();
        let mut ctx = t.queue.receive(&cancel).await.unwrap().unwrap();

        t.queue.commit(&mut ctx).await.unwrap();
        assert!(ctx.is_resolved());
        assert_eq!(t.queue.count().await.unwrap(), 0);
        assert_eq!(t.queue.status_of(id).await.unwrap(), None);

        t.queue.commit(&mut ctx).await.unwrap();
        assert_eq!(t.metrics.snapshot().committed, 1);
        assert!(t.queue.receive(&cancel).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_commit_without_status_is_noop_delete() {
        let t = sqlite_queue(TransportOptions::default()).await;
        t.queue.send(NewMessage::new(b"x".to_vec())).await.unwrap();
        let mut ctx = t
            .queue
            .receive(&CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        t.queue.commit(&mut ctx).await.unwrap();
        assert_eq!(t.metrics.snapshot().committed, 1);
    }

    #[tokio::test]
    async fn test_commit_after_reclaim_still_removes_row() {
        let t = sqlite_queue(TransportOptions::standard()).await;
        let id = t.queue.send(NewMessage::new(b"x".to_vec())).await.unwrap();
        let mut ctx = t
            .queue
            .receive(&CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        t.clock.advance(chrono::Duration::seconds(120));
        let reset = t
            .queue
            .heartbeat_monitor()
            .reset(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(reset.len(), 1);
        assert_eq!(
            t.queue.status_of(id).await.unwrap(),
            Some(MessageStatus::Waiting)
        );

        // work finished after all; the delete is unconditional
        t.queue.commit(&mut ctx).await.unwrap();
        assert_eq!(t.queue.status_of(id).await.unwrap(), None);
    }
}

use super::Queue;
use crate::context::MessageContext;
use crate::error::Result;
use crate::metrics::QueueEvent;
use crate::store::query::Arg;
use crate::store::{CommandKind, QueryParam};
use crate::types::MessageStatus;

impl Queue {
    /// Return a failed message to circulation.
    ///
    /// Returns `true` when this call released the claim. `false` means there was nothing to
    /// release: the context was already resolved, the claim had removed the row, or another
    /// actor (the heartbeat monitor or a second worker) resolved the claim first.
    ///
    /// Each successful rollback counts one failed attempt against the message's retry budget
    /// and, with delayed processing, pushes its visibility out by the retry policy's backoff.
    pub async fn rollback(&self, ctx: &mut MessageContext) -> Result<bool> {
        if ctx.is_resolved() {
            tracing::debug!(queue = %self.name(), queue_id = ctx.queue_id(), "Rollback skipped, already resolved");
            return Ok(false);
        }
        if self.inner.options.held_mode() {
            return self.rollback_held(ctx).await;
        }

        let options = &self.inner.options;
        let queue_id = ctx.queue_id();
        if !options.rollback_applies() || !options.claim_keeps_row() {
            tracing::warn!(
                queue = %self.name(),
                queue_id,
                "Rollback has nothing to restore, the claim removed the message"
            );
            return Ok(false);
        }

        let delay = self.retry_delay(ctx.message().retry_count);
        let expected = ctx.heartbeat();
        let command = self.command(CommandKind::ResetClaim {
            check_heartbeat: options.enable_heartbeat && expected.is_some(),
            advance_process_time: delay.is_some(),
            count_failure: true,
        });
        let now = self.now();
        let params = command.bind(|arg| match arg {
            Arg::QueueId => Some(QueryParam::I64(Some(queue_id))),
            Arg::ProcessTime => delay.map(|d| QueryParam::DateTime(Some(now + d))),
            Arg::ExpectedHeartbeat => Some(QueryParam::DateTime(expected)),
            _ => None,
        })?;

        let updated = self
            .inner
            .store
            .execute(&command, params)
            .await
            .inspect_err(|e| {
                tracing::warn!(queue = %self.name(), queue_id, error = %e, "Rollback failed");
            })?;

        if updated == 0 {
            tracing::debug!(
                queue = %self.name(),
                queue_id,
                "Rollback lost the race, claim already resolved elsewhere"
            );
            ctx.mark_resolved();
            return Ok(false);
        }

        self.sync_status_row(queue_id, Some(MessageStatus::Waiting)).await;
        self.resolve(ctx, QueueEvent::RolledBack);
        tracing::debug!(queue = %self.name(), queue_id, delay = ?delay, "Rolled back message");
        Ok(true)
    }

    async fn rollback_held(&self, ctx: &mut MessageContext) -> Result<bool> {
        let queue_id = ctx.queue_id();
        let Some(scope) = ctx.take_scope() else {
            tracing::debug!(queue = %self.name(), queue_id, "Rollback skipped, transaction already closed");
            return Ok(false);
        };

        self.sync_status_row(queue_id, Some(MessageStatus::Waiting)).await;
        scope.rollback().await.inspect_err(|e| {
            tracing::warn!(queue = %self.name(), queue_id, error = %e, "Rollback of held transaction failed");
        })?;
        self.resolve(ctx, QueueEvent::RolledBack);

        // the rolled back transaction took nothing with it; count the attempt separately
        let delay = self.retry_delay(ctx.message().retry_count);
        let command = self.command(CommandKind::RecordFailure {
            advance_process_time: delay.is_some(),
        });
        let now = self.now();
        let params = command.bind(|arg| match arg {
            Arg::QueueId => Some(QueryParam::I64(Some(queue_id))),
            Arg::ProcessTime => delay.map(|d| QueryParam::DateTime(Some(now + d))),
            _ => None,
        })?;
        let counted = self.inner.store.execute(&command, params).await?;
        if counted == 0 {
            tracing::debug!(
                queue = %self.name(),
                queue_id,
                "Failure not counted, message already claimed again"
            );
        }
        tracing::debug!(queue = %self.name(), queue_id, delay = ?delay, "Rolled back held transaction");
        Ok(true)
    }
}

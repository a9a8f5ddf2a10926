use super::Queue;
use crate::error::Result;
use crate::metrics::QueueEvent;
use crate::store::{CommandKind, QueryParam};
use tokio_util::sync::CancellationToken;

/// Deletes waiting messages whose expiration time has passed.
#[derive(Debug, Clone)]
pub struct ExpirationMonitor {
    queue: Queue,
}

impl ExpirationMonitor {
    pub(crate) fn new(queue: Queue) -> Self {
        Self { queue }
    }

    /// Delete expired messages and return how many were removed.
    ///
    /// Claimed messages are left to their worker; they expire only once they are back in
    /// circulation.
    pub async fn clear_messages(&self, cancel: &CancellationToken) -> Result<u64> {
        let queue = &self.queue;
        if !queue.options().enable_message_expiration || cancel.is_cancelled() {
            return Ok(0);
        }

        let command = queue.command(CommandKind::DeleteExpired);
        let rows = queue
            .store()
            .fetch(&command, vec![QueryParam::DateTime(Some(queue.now()))])
            .await?;
        let removed = rows.len() as u64;

        if removed > 0 {
            if queue.options().enable_status_table {
                let prune = queue.command(CommandKind::PruneStatusRows);
                queue.store().execute(&prune, Vec::new()).await?;
            }
            queue.record(QueueEvent::Expired(removed));
        }
        tracing::debug!(queue = %queue.name(), removed, "Expiration sweep finished");
        Ok(removed)
    }
}

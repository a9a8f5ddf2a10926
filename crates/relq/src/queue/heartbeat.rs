use super::Queue;
use crate::context::MessageContext;
use crate::error::{Error, Result};
use crate::metrics::QueueEvent;
use crate::store::query::Arg;
use crate::store::rows::decode_reset;
use crate::store::{CommandKind, QueryParam};
use crate::types::{MessageStatus, ResetRecord};
use tokio_util::sync::CancellationToken;

impl Queue {
    /// Renew the heartbeat of a claim.
    ///
    /// The renewal is a compare-and-swap on the heartbeat this worker last wrote. Returns
    /// `false` when the stored value differs, meaning the claim was reclaimed and the worker no
    /// longer owns the message.
    pub async fn send_heartbeat(&self, ctx: &mut MessageContext) -> Result<bool> {
        if !self.inner.options.enable_heartbeat {
            return Err(Error::InvalidOptions {
                option: "enable_heartbeat".to_string(),
                message: "queue does not track heartbeats".to_string(),
            });
        }
        let queue_id = ctx.queue_id();
        let Some(previous) = ctx.heartbeat() else {
            return Ok(false);
        };
        if ctx.is_resolved() {
            return Ok(false);
        }

        let now = self.now();
        let command = self.command(CommandKind::RenewHeartbeat);
        let params = command.bind(|arg| match arg {
            Arg::Heartbeat => Some(QueryParam::DateTime(Some(now))),
            Arg::QueueId => Some(QueryParam::I64(Some(queue_id))),
            Arg::ExpectedHeartbeat => Some(QueryParam::DateTime(Some(previous))),
            _ => None,
        })?;

        if self.inner.store.execute(&command, params).await? == 0 {
            tracing::debug!(queue = %self.name(), queue_id, "Heartbeat rejected, lease lost");
            return Ok(false);
        }
        ctx.set_heartbeat(now);
        Ok(true)
    }
}

/// Reclaims messages whose worker stopped renewing the heartbeat.
#[derive(Debug, Clone)]
pub struct HeartbeatMonitor {
    queue: Queue,
}

impl HeartbeatMonitor {
    pub(crate) fn new(queue: Queue) -> Self {
        Self { queue }
    }

    /// Reset every claim whose heartbeat is older than the heartbeat window.
    ///
    /// Each reset is conditional on the heartbeat the scan saw, so a claim renewed between the
    /// scan and the reset is left alone. Only claims actually reset are returned. Reset claims
    /// are immediately eligible for receive; the failed attempt is not counted.
    pub async fn reset(&self, cancel: &CancellationToken) -> Result<Vec<ResetRecord>> {
        let queue = &self.queue;
        if !queue.options().enable_heartbeat || cancel.is_cancelled() {
            return Ok(Vec::new());
        }

        let stale_before = queue.now() - queue.heartbeat_window();
        let find = queue.command(CommandKind::FindStale);
        let rows = queue
            .store()
            .fetch(&find, vec![QueryParam::DateTime(Some(stale_before))])
            .await?;
        let candidates = rows
            .iter()
            .map(|row| decode_reset(row.as_ref()))
            .collect::<Result<Vec<_>>>()?;

        let reset = queue.command(CommandKind::ResetClaim {
            check_heartbeat: true,
            advance_process_time: false,
            count_failure: false,
        });
        let mut records = Vec::new();
        for candidate in candidates {
            if cancel.is_cancelled() {
                tracing::debug!(queue = %queue.name(), "Heartbeat sweep cancelled");
                break;
            }
            let params = reset.bind(|arg| match arg {
                Arg::QueueId => Some(QueryParam::I64(Some(candidate.queue_id))),
                Arg::ExpectedHeartbeat => Some(QueryParam::DateTime(Some(candidate.heartbeat))),
                _ => None,
            })?;
            if queue.store().execute(&reset, params).await? == 1 {
                queue
                    .sync_status_row(candidate.queue_id, Some(MessageStatus::Waiting))
                    .await;
                records.push(candidate);
            }
        }

        if !records.is_empty() {
            queue.record(QueueEvent::HeartbeatReset(records.len() as u64));
        }
        tracing::debug!(queue = %queue.name(), reset = records.len(), "Heartbeat sweep finished");
        Ok(records)
    }
}

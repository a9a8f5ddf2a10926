use super::Queue;
use crate::context::MessageContext;
use crate::error::{Error, Result};
use crate::metrics::QueueEvent;
use crate::store::query::Arg;
use crate::store::rows::{decode_message, salvage_message};
use crate::store::{CommandKind, QueryParam};
use crate::types::{ErrorKind, MessageStatus, QueueId};
use tokio_util::sync::CancellationToken;

/// Narrows what [`Queue::receive_with`] may claim.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReceiveRequest {
    /// Route filter. `None` falls back to the queue's configured routes.
    pub routes: Option<Vec<String>>,
    /// Claim exactly this message, if it is eligible.
    pub queue_id: Option<QueueId>,
}

impl ReceiveRequest {
    pub fn routes<I, S>(mut self, routes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.routes = Some(routes.into_iter().map(Into::into).collect());
        self
    }

    pub fn queue_id(mut self, queue_id: QueueId) -> Self {
        self.queue_id = Some(queue_id);
        self
    }
}

enum Claimed {
    Message(MessageContext),
    /// Claimed, but the row did not decode. It goes to the error store instead of a worker.
    Undecodable(MessageContext, Error),
    Empty,
}

impl Queue {
    /// Claim the next eligible message.
    ///
    /// Returns `Ok(None)` when nothing is eligible, and without touching the store when
    /// `cancel` is already set. A claimed row that cannot be decoded is quarantined as poison
    /// and the next eligible row is tried.
    pub async fn receive(&self, cancel: &CancellationToken) -> Result<Option<MessageContext>> {
        self.receive_with(cancel, ReceiveRequest::default()).await
    }

    pub async fn receive_with(
        &self,
        cancel: &CancellationToken,
        request: ReceiveRequest,
    ) -> Result<Option<MessageContext>> {
        if cancel.is_cancelled() {
            self.record(QueueEvent::Empty);
            return Ok(None);
        }

        let options = &self.inner.options;
        let routes = request.routes.unwrap_or_else(|| options.routes.clone());
        if !routes.is_empty() && !options.enable_route {
            return Err(Error::InvalidOptions {
                option: "routes".to_string(),
                message: "requires enable_route".to_string(),
            });
        }

        let now = self.now();
        let by_id = request.queue_id.is_some();
        let value = |arg: &Arg| match arg {
            Arg::Now | Arg::Heartbeat => Some(QueryParam::DateTime(Some(now))),
            Arg::QueueId => request.queue_id.map(|id| QueryParam::I64(Some(id))),
            Arg::Route(i) => routes.get(*i).map(|r| QueryParam::String(Some(r.clone()))),
            _ => None,
        };

        let context = loop {
            let claimed = if options.held_mode() {
                let command = self.command(CommandKind::HeldSelect {
                    routes: routes.len(),
                    by_id,
                });
                let params = command.bind(&value)?;
                let mut scope = self.inner.store.open_scope().await?;
                let row = scope.fetch(&command, params).await?.into_iter().next();
                match row {
                    Some(row) => match decode_message(&*row, options, true) {
                        Ok(mut message) => {
                            message.status = MessageStatus::Processing;
                            Claimed::Message(MessageContext::new(message, Some(scope)))
                        }
                        Err(e) => {
                            let message = salvage_message(&*row, now)?;
                            Claimed::Undecodable(MessageContext::new(message, Some(scope)), e)
                        }
                    },
                    None => {
                        scope.rollback().await?;
                        Claimed::Empty
                    }
                }
            } else {
                let command = self.command(CommandKind::Claim {
                    routes: routes.len(),
                    by_id,
                });
                let params = command.bind(&value)?;
                let row = self.inner.store.fetch(&command, params).await?.into_iter().next();
                match row {
                    Some(row) => match decode_message(&*row, options, true) {
                        Ok(message) => {
                            // outside the claim statement; only external readers see the lag
                            self.sync_status_row(message.queue_id, Some(MessageStatus::Processing))
                                .await;
                            Claimed::Message(MessageContext::new(message, None))
                        }
                        Err(e) => {
                            let message = salvage_message(&*row, now)?;
                            Claimed::Undecodable(MessageContext::new(message, None), e)
                        }
                    },
                    None => Claimed::Empty,
                }
            };

            match claimed {
                Claimed::Message(ctx) => break Some(ctx),
                Claimed::Empty => break None,
                Claimed::Undecodable(mut ctx, e) => {
                    tracing::warn!(
                        queue = %self.name(),
                        queue_id = ctx.queue_id(),
                        error = %e,
                        "Claimed message could not be decoded"
                    );
                    let reason = Error::Poison {
                        reason: format!("message row could not be decoded: {}", e),
                    };
                    self.error_store().handle(&mut ctx, ErrorKind::Poison, &reason).await?;
                    if by_id || cancel.is_cancelled() {
                        break None;
                    }
                }
            }
        };

        match &context {
            Some(ctx) => {
                self.record(QueueEvent::Received);
                tracing::debug!(
                    queue = %self.name(),
                    queue_id = ctx.queue_id(),
                    retry_count = ctx.message().retry_count,
                    "Claimed message"
                );
            }
            None => self.record(QueueEvent::Empty),
        }
        Ok(context)
    }
}

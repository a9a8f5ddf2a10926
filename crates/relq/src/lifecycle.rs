//! The message lifecycle as a trait, and a logging wrapper around it.
//!
//! [`Queue`] implements [`MessageLifecycle`] directly. [`Logged`] wraps any implementation
//! and records each step through `tracing` without changing what the step returns, so the
//! consumer can be driven by either.

use crate::context::MessageContext;
use crate::error::{Error, Result};
use crate::options::TransportOptions;
use crate::policy::RetryPolicy;
use crate::queue::Queue;
use crate::types::{ErrorKind, ResetRecord};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

#[async_trait]
pub trait MessageLifecycle: Send + Sync {
    fn name(&self) -> &str;

    fn options(&self) -> &TransportOptions;

    fn retry_policy(&self) -> &RetryPolicy;

    async fn receive(&self, cancel: &CancellationToken) -> Result<Option<MessageContext>>;

    async fn commit(&self, ctx: &mut MessageContext) -> Result<()>;

    async fn rollback(&self, ctx: &mut MessageContext) -> Result<bool>;

    /// Move the message into the error store.
    async fn quarantine(&self, ctx: &mut MessageContext, kind: ErrorKind, error: &Error) -> Result<()>;

    async fn send_heartbeat(&self, ctx: &mut MessageContext) -> Result<bool>;

    async fn reset_heartbeats(&self, cancel: &CancellationToken) -> Result<Vec<ResetRecord>>;

    async fn clear_expired(&self, cancel: &CancellationToken) -> Result<u64>;
}

#[async_trait]
impl MessageLifecycle for Queue {
    fn name(&self) -> &str {
        Queue::name(self)
    }

    fn options(&self) -> &TransportOptions {
        Queue::options(self)
    }

    fn retry_policy(&self) -> &RetryPolicy {
        Queue::retry_policy(self)
    }

    async fn receive(&self, cancel: &CancellationToken) -> Result<Option<MessageContext>> {
        Queue::receive(self, cancel).await
    }

    async fn commit(&self, ctx: &mut MessageContext) -> Result<()> {
        Queue::commit(self, ctx).await
    }

    async fn rollback(&self, ctx: &mut MessageContext) -> Result<bool> {
        Queue::rollback(self, ctx).await
    }

    async fn quarantine(&self, ctx: &mut MessageContext, kind: ErrorKind, error: &Error) -> Result<()> {
        self.error_store().handle(ctx, kind, error).await
    }

    async fn send_heartbeat(&self, ctx: &mut MessageContext) -> Result<bool> {
        Queue::send_heartbeat(self, ctx).await
    }

    async fn reset_heartbeats(&self, cancel: &CancellationToken) -> Result<Vec<ResetRecord>> {
        self.heartbeat_monitor().reset(cancel).await
    }

    async fn clear_expired(&self, cancel: &CancellationToken) -> Result<u64> {
        self.expiration_monitor().clear_messages(cancel).await
    }
}

/// Logs every lifecycle step of the wrapped implementation.
#[derive(Debug, Clone)]
pub struct Logged<L> {
    inner: L,
}

impl<L: MessageLifecycle> Logged<L> {
    pub fn new(inner: L) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &L {
        &self.inner
    }

    pub fn into_inner(self) -> L {
        self.inner
    }
}

#[async_trait]
impl<L: MessageLifecycle> MessageLifecycle for Logged<L> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn options(&self) -> &TransportOptions {
        self.inner.options()
    }

    fn retry_policy(&self) -> &RetryPolicy {
        self.inner.retry_policy()
    }

    async fn receive(&self, cancel: &CancellationToken) -> Result<Option<MessageContext>> {
        let result = self.inner.receive(cancel).await;
        match &result {
            Ok(Some(ctx)) => tracing::debug!(
                queue = %self.name(),
                queue_id = ctx.queue_id(),
                retry_count = ctx.message().retry_count,
                "Received message"
            ),
            Ok(None) => tracing::trace!(queue = %self.name(), "No message received"),
            Err(e) => tracing::warn!(queue = %self.name(), error = %e, "Receive failed"),
        }
        result
    }

    async fn commit(&self, ctx: &mut MessageContext) -> Result<()> {
        let queue_id = ctx.queue_id();
        let result = self.inner.commit(ctx).await;
        match &result {
            Ok(()) => tracing::debug!(queue = %self.name(), queue_id, "Committed message"),
            Err(e) => tracing::warn!(queue = %self.name(), queue_id, error = %e, "Commit failed"),
        }
        result
    }

    async fn rollback(&self, ctx: &mut MessageContext) -> Result<bool> {
        let queue_id = ctx.queue_id();
        let result = self.inner.rollback(ctx).await;
        match &result {
            Ok(true) => tracing::debug!(queue = %self.name(), queue_id, "Rolled back message"),
            Ok(false) => tracing::debug!(queue = %self.name(), queue_id, "Rollback was a no-op"),
            Err(e) => tracing::warn!(queue = %self.name(), queue_id, error = %e, "Rollback failed"),
        }
        result
    }

    async fn quarantine(&self, ctx: &mut MessageContext, kind: ErrorKind, error: &Error) -> Result<()> {
        let queue_id = ctx.queue_id();
        let result = self.inner.quarantine(ctx, kind, error).await;
        match &result {
            Ok(()) => tracing::warn!(
                queue = %self.name(),
                queue_id,
                kind = %kind,
                reason = %error,
                "Quarantined message"
            ),
            Err(e) => tracing::error!(
                queue = %self.name(),
                queue_id,
                kind = %kind,
                error = %e,
                "Quarantine failed"
            ),
        }
        result
    }

    async fn send_heartbeat(&self, ctx: &mut MessageContext) -> Result<bool> {
        let queue_id = ctx.queue_id();
        let result = self.inner.send_heartbeat(ctx).await;
        match &result {
            Ok(true) => tracing::trace!(queue = %self.name(), queue_id, "Heartbeat renewed"),
            Ok(false) => tracing::warn!(queue = %self.name(), queue_id, "Heartbeat lease lost"),
            Err(e) => tracing::warn!(queue = %self.name(), queue_id, error = %e, "Heartbeat failed"),
        }
        result
    }

    async fn reset_heartbeats(&self, cancel: &CancellationToken) -> Result<Vec<ResetRecord>> {
        let result = self.inner.reset_heartbeats(cancel).await;
        match &result {
            Ok(records) if !records.is_empty() => {
                let ids: Vec<_> = records.iter().map(|r| r.queue_id).collect();
                tracing::info!(queue = %self.name(), count = records.len(), ids = ?ids, "Reset abandoned claims");
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(queue = %self.name(), error = %e, "Heartbeat sweep failed"),
        }
        result
    }

    async fn clear_expired(&self, cancel: &CancellationToken) -> Result<u64> {
        let result = self.inner.clear_expired(cancel).await;
        match &result {
            Ok(0) => {}
            Ok(n) => tracing::info!(queue = %self.name(), count = n, "Removed expired messages"),
            Err(e) => tracing::warn!(queue = %self.name(), error = %e, "Expiration sweep failed"),
        }
        result
    }
}

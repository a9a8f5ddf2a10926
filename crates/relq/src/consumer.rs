//! Consumption loop and monitor loop.
//!
//! A [`Consumer`] reserves a worker slot, claims a message and runs the handler on that slot.
//! Every claim ends in exactly one of commit, rollback or quarantine:
//!
//! - handler returns `Ok(())` → commit
//! - handler returns a poison error ([`Error::is_poison`]) → quarantine as poison
//! - retryable failure with retries left → rollback (the retry count goes up)
//! - retryable failure with no retries left → quarantine as retries exhausted
//!
//! Two exceptions: a claim whose heartbeat lease was taken over while the handler ran is
//! left to its new owner, and a claim the pool refuses at stop is rolled back unprocessed.
//!
//! [`MonitorLoop`] periodically reclaims abandoned claims and removes expired messages.

use crate::config::Config;
use crate::context::MessageContext;
use crate::error::{Error, Result};
use crate::lifecycle::MessageLifecycle;
use crate::scheduler::WorkerPool;
use crate::types::{ErrorKind, ReceivedMessage};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<()>> + Send + 'static>>;

/// Processes one message.
///
/// Implemented for every `Fn(ReceivedMessage) -> impl Future<Output = Result<()>>`, so plain
/// async closures can be used as handlers.
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, message: ReceivedMessage) -> HandlerFuture;
}

impl<F, Fut> Handler for F
where
    F: Fn(ReceivedMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    fn handle(&self, message: ReceivedMessage) -> HandlerFuture {
        Box::pin((self)(message))
    }
}

/// Runs a handler over every message of a queue on a bounded worker pool.
///
/// ```no_run
/// # async fn example(queue: relq::Queue, config: relq::Config) -> relq::Result<()> {
/// use relq::{Consumer, ReceivedMessage};
///
/// let consumer = Consumer::new(queue, &config, |message: ReceivedMessage| async move {
///     let body: serde_json::Value = message.body()?;
///     println!("{body}");
///     Ok::<_, relq::Error>(())
/// });
/// let runner = tokio::spawn({
///     let consumer = consumer.clone();
///     async move { consumer.run().await }
/// });
/// // ...
/// consumer.stop().await?;
/// # let _ = runner.await;
/// # Ok(())
/// # }
/// ```
pub struct Consumer<L> {
    lifecycle: Arc<L>,
    handler: Arc<dyn Handler>,
    pool: WorkerPool,
    poll_interval: Duration,
    max_poll_interval: Duration,
    heartbeat_interval: Duration,
    monitor_interval: Duration,
}

impl<L> Clone for Consumer<L> {
    fn clone(&self) -> Self {
        Self {
            lifecycle: self.lifecycle.clone(),
            handler: self.handler.clone(),
            pool: self.pool.clone(),
            poll_interval: self.poll_interval,
            max_poll_interval: self.max_poll_interval,
            heartbeat_interval: self.heartbeat_interval,
            monitor_interval: self.monitor_interval,
        }
    }
}

impl<L: MessageLifecycle + 'static> Consumer<L> {
    pub fn new<H: Handler>(lifecycle: L, config: &Config, handler: H) -> Self {
        Self {
            lifecycle: Arc::new(lifecycle),
            handler: Arc::new(handler),
            pool: WorkerPool::from_config(config),
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(1)),
            max_poll_interval: Duration::from_millis(
                config.max_poll_interval_ms.max(config.poll_interval_ms).max(1),
            ),
            heartbeat_interval: config.heartbeat_interval(),
            monitor_interval: config.monitor_interval(),
        }
    }

    pub fn lifecycle(&self) -> &L {
        &self.lifecycle
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// A monitor loop over the same lifecycle, on the configured monitor interval.
    pub fn monitor(&self) -> MonitorLoop<L> {
        MonitorLoop {
            lifecycle: self.lifecycle.clone(),
            interval: self.monitor_interval,
        }
    }

    /// Claim and process messages until [`stop`](Self::stop) is called.
    pub async fn run(&self) -> Result<()> {
        self.pool.start();
        let factory = self.pool.factory();
        let cancel = factory.cancellation_token();
        let queue = self.lifecycle.name().to_string();
        let renew = self
            .lifecycle
            .options()
            .enable_heartbeat
            .then_some(self.heartbeat_interval)
            .filter(|interval| !interval.is_zero());
        let mut idle = self.poll_interval;

        tracing::info!(queue = %queue, slots = self.pool.max_threads(), "Consumer started");
        loop {
            let slot = match factory.reserve().await {
                Ok(slot) => slot,
                Err(Error::PoolStopped) => break,
                Err(e) => return Err(e),
            };
            if cancel.is_cancelled() {
                break;
            }

            let claimed = match self.lifecycle.receive(&cancel).await {
                Ok(claimed) => claimed,
                Err(e) => {
                    tracing::warn!(queue = %queue, error = %e, "Receive failed, backing off");
                    None
                }
            };
            let Some(ctx) = claimed else {
                drop(slot);
                if !sleep_or_cancel(idle, &cancel).await {
                    break;
                }
                idle = (idle * 2).min(self.max_poll_interval);
                continue;
            };
            idle = self.poll_interval;

            let lifecycle = self.lifecycle.clone();
            let handler = self.handler.clone();
            let spawned = slot.spawn_with(ctx, move |ctx| process(lifecycle, handler, ctx, renew));
            if let Err(mut ctx) = spawned {
                let queue_id = ctx.queue_id();
                tracing::warn!(
                    queue = %queue,
                    queue_id,
                    "Pool stopped before the message could run, returning it to the queue"
                );
                if let Err(e) = self.lifecycle.rollback(&mut ctx).await {
                    tracing::error!(queue = %queue, queue_id, error = %e, "Failed to return unprocessed message");
                }
                break;
            }
        }
        tracing::info!(queue = %queue, "Consumer stopped");
        Ok(())
    }

    /// Cancel the loop and wait for in-flight messages, up to the stop timeout.
    ///
    /// Returns [`Error::Timeout`] if handlers had to be aborted.
    pub async fn stop(&self) -> Result<()> {
        self.pool.stop().await
    }
}

/// Returns `false` if cancelled before the delay elapsed.
async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

async fn process<L: MessageLifecycle>(
    lifecycle: Arc<L>,
    handler: Arc<dyn Handler>,
    mut ctx: MessageContext,
    renew: Option<Duration>,
) {
    let mut handled = handler.handle(ctx.message().clone());
    let mut lease_lost = false;
    let outcome = match renew {
        Some(interval) => {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    result = &mut handled => break result,
                    _ = ticker.tick(), if !lease_lost => {
                        match lifecycle.send_heartbeat(&mut ctx).await {
                            Ok(true) => {}
                            Ok(false) => {
                                lease_lost = true;
                                tracing::warn!(
                                    queue = %lifecycle.name(),
                                    queue_id = ctx.queue_id(),
                                    "Heartbeat lease lost, the message will not be settled by this worker"
                                );
                            }
                            Err(e) => tracing::warn!(
                                queue = %lifecycle.name(),
                                queue_id = ctx.queue_id(),
                                error = %e,
                                "Heartbeat renewal failed"
                            ),
                        }
                    }
                }
            }
        }
        None => handled.await,
    };
    if lease_lost {
        // the row belongs to whoever reclaimed it
        tracing::debug!(
            queue = %lifecycle.name(),
            queue_id = ctx.queue_id(),
            succeeded = outcome.is_ok(),
            "Dropping outcome of a message whose lease was lost"
        );
        return;
    }
    settle(lifecycle.as_ref(), &mut ctx, outcome).await;
}

async fn settle<L: MessageLifecycle>(lifecycle: &L, ctx: &mut MessageContext, outcome: Result<()>) {
    let queue_id = ctx.queue_id();
    let retry_count = ctx.message().retry_count;
    let settled = match outcome {
        Ok(()) => lifecycle.commit(ctx).await,
        Err(e) if e.is_poison() => lifecycle.quarantine(ctx, ErrorKind::Poison, &e).await,
        Err(e) if !lifecycle.retry_policy().should_retry(retry_count) => {
            lifecycle
                .quarantine(ctx, ErrorKind::RetriesExhausted, &e)
                .await
        }
        Err(e) => {
            tracing::debug!(
                queue = %lifecycle.name(),
                queue_id,
                retry_count,
                error = %e,
                "Handler failed, rolling back for retry"
            );
            lifecycle.rollback(ctx).await.map(|_| ())
        }
    };
    if let Err(e) = settled {
        tracing::error!(
            queue = %lifecycle.name(),
            queue_id,
            error = %e,
            "Failed to settle message"
        );
    }
}

/// Result of one monitor pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MonitorReport {
    pub reset: usize,
    pub expired: u64,
}

/// Periodically runs the heartbeat sweep and the expiration sweep.
pub struct MonitorLoop<L> {
    lifecycle: Arc<L>,
    interval: Duration,
}

impl<L: MessageLifecycle> MonitorLoop<L> {
    pub fn new(lifecycle: L, config: &Config) -> Self {
        Self {
            lifecycle: Arc::new(lifecycle),
            interval: config.monitor_interval(),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// One pass of both sweeps. A failing sweep is logged and does not stop the other.
    pub async fn run_once(&self, cancel: &CancellationToken) -> MonitorReport {
        let mut report = MonitorReport::default();
        match self.lifecycle.reset_heartbeats(cancel).await {
            Ok(records) => report.reset = records.len(),
            Err(e) => tracing::warn!(queue = %self.lifecycle.name(), error = %e, "Heartbeat sweep failed"),
        }
        match self.lifecycle.clear_expired(cancel).await {
            Ok(expired) => report.expired = expired,
            Err(e) => tracing::warn!(queue = %self.lifecycle.name(), error = %e, "Expiration sweep failed"),
        }
        report
    }

    /// Run passes every interval until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let report = self.run_once(&cancel).await;
                    tracing::debug!(
                        queue = %self.lifecycle.name(),
                        reset = report.reset,
                        expired = report.expired,
                        "Monitor pass finished"
                    );
                }
            }
        }
    }
}

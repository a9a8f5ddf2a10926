//! Queue handle: the message lifecycle bound to one store.
//!
//! This module defines [`Queue`], the object producers and workers share. It owns the queue's
//! validated [`TransportOptions`], its instance-local [`CommandCache`], and the collaborators
//! (clock, metrics sink, payload codec, retry policy) the lifecycle reports to.
//!
//! ## What
//!
//! - [`Queue::send`] and friends enqueue messages.
//! - [`Queue::receive`] claims the next eligible message and returns a [`MessageContext`].
//! - [`Queue::commit`] and [`Queue::rollback`] resolve a claim.
//! - [`HeartbeatMonitor`], [`ExpirationMonitor`] and [`ErrorStore`] are the periodic sweeps and
//!   the quarantine.
//!
//! ## How
//!
//! ```no_run
//! use relq::{Queue, TransportOptions};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> relq::Result<()> {
//! let store = relq::store::connect_with_dsn("sqlite://queue.db").await?;
//! let queue = Queue::builder("emails", store)
//!     .options(TransportOptions::standard())
//!     .build()?;
//! queue.install().await?;
//!
//! queue.send_json(&serde_json::json!({"to": "user@example.com"})).await?;
//!
//! let cancel = CancellationToken::new();
//! if let Some(mut ctx) = queue.receive(&cancel).await? {
//!     println!("processing {}", ctx.message());
//!     queue.commit(&mut ctx).await?;
//! }
//! # Ok(())
//! # }
//! ```

use crate::clock::{Clock, SystemClock};
use crate::codec::{JsonCodec, PayloadCodec};
use crate::config::{validate_identifier, Config, DEFAULT_HEARTBEAT_WINDOW_SECONDS};
use crate::context::MessageContext;
use crate::error::{Error, Result};
use crate::metrics::{MetricsSink, NoopMetrics};
use crate::options::TransportOptions;
use crate::policy::RetryPolicy;
use crate::store::query::{CommandBuilder, TableNames};
use crate::store::rows::{decode_count, decode_message};
use crate::store::{schema, Command, CommandCache, CommandKind, MessageStore, QueryParam};
use crate::types::{MessageStatus, QueueId, QueueStats, ReceivedMessage};
use chrono::{DateTime, Utc};
use std::sync::Arc;

mod commit;
mod error_store;
mod expiration;
mod heartbeat;
mod receive;
mod rollback;
mod send;

pub use error_store::{ErrorStore, PurgeFilter};
pub use expiration::ExpirationMonitor;
pub use heartbeat::HeartbeatMonitor;
pub use receive::ReceiveRequest;

/// Longest queue name accepted; leaves room for table and index suffixes.
const MAX_QUEUE_NAME_LEN: usize = 40;

#[derive(Debug)]
struct QueueInner {
    tables: TableNames,
    options: TransportOptions,
    store: Arc<dyn MessageStore>,
    commands: CommandCache,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn MetricsSink>,
    codec: Arc<dyn PayloadCodec>,
    retry_policy: RetryPolicy,
    heartbeat_window: chrono::Duration,
}

/// A queue bound to one store. Cheap to clone; clones share the command cache.
#[derive(Debug, Clone)]
pub struct Queue {
    inner: Arc<QueueInner>,
}

/// Builder for [`Queue`]. Validation happens in [`build`](Self::build).
pub struct QueueBuilder {
    name: String,
    store: Arc<dyn MessageStore>,
    options: TransportOptions,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn MetricsSink>,
    codec: Arc<dyn PayloadCodec>,
    retry_policy: RetryPolicy,
    heartbeat_window: chrono::Duration,
}

impl QueueBuilder {
    pub fn options(mut self, options: TransportOptions) -> Self {
        self.options = options;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn codec(mut self, codec: Arc<dyn PayloadCodec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Claims whose heartbeat is older than this are reclaimed by the heartbeat monitor.
    pub fn heartbeat_window(mut self, window: chrono::Duration) -> Self {
        self.heartbeat_window = window;
        self
    }

    /// Take the retry policy and heartbeat window from `config`.
    pub fn config(self, config: &Config) -> Self {
        self.retry_policy(config.retry_policy.clone())
            .heartbeat_window(config.heartbeat_window())
    }

    pub fn build(self) -> Result<Queue> {
        validate_identifier("queue", &self.name, MAX_QUEUE_NAME_LEN)?;
        self.options.validate(&self.store.capabilities())?;

        let tables = TableNames::new(&self.name);
        let builder = CommandBuilder::new(self.store.dialect(), tables.clone(), self.options.clone());

        Ok(Queue {
            inner: Arc::new(QueueInner {
                tables,
                options: self.options,
                store: self.store,
                commands: CommandCache::new(builder),
                clock: self.clock,
                metrics: self.metrics,
                codec: self.codec,
                retry_policy: self.retry_policy,
                heartbeat_window: self.heartbeat_window,
            }),
        })
    }
}

impl Queue {
    pub fn builder(name: impl Into<String>, store: Arc<dyn MessageStore>) -> QueueBuilder {
        QueueBuilder {
            name: name.into(),
            store,
            options: TransportOptions::default(),
            clock: Arc::new(SystemClock),
            metrics: Arc::new(NoopMetrics),
            codec: Arc::new(JsonCodec),
            retry_policy: RetryPolicy::default(),
            heartbeat_window: chrono::Duration::seconds(DEFAULT_HEARTBEAT_WINDOW_SECONDS as i64),
        }
    }

    /// Connect to `config.dsn` and open the queue `name` with `options`.
    pub async fn connect(config: &Config, name: &str, options: TransportOptions) -> Result<Self> {
        let store = crate::store::connect(config).await?;
        Queue::builder(name, store)
            .options(options)
            .config(config)
            .build()
    }

    pub fn name(&self) -> &str {
        &self.inner.tables.queue
    }

    pub fn tables(&self) -> &TableNames {
        &self.inner.tables
    }

    pub fn options(&self) -> &TransportOptions {
        &self.inner.options
    }

    pub fn store(&self) -> &Arc<dyn MessageStore> {
        &self.inner.store
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.inner.retry_policy
    }

    pub fn heartbeat_window(&self) -> chrono::Duration {
        self.inner.heartbeat_window
    }

    pub fn codec(&self) -> &dyn PayloadCodec {
        self.inner.codec.as_ref()
    }

    pub(crate) fn command(&self, kind: CommandKind) -> Arc<Command> {
        self.inner.commands.get(kind)
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.inner.clock.now()
    }

    pub fn error_store(&self) -> ErrorStore {
        ErrorStore::new(self.clone())
    }

    pub fn heartbeat_monitor(&self) -> HeartbeatMonitor {
        HeartbeatMonitor::new(self.clone())
    }

    pub fn expiration_monitor(&self) -> ExpirationMonitor {
        ExpirationMonitor::new(self.clone())
    }

    /// Create the queue's tables and indexes. Safe to run repeatedly.
    pub async fn install(&self) -> Result<()> {
        let statements = schema::install(self.inner.commands.builder())
            .into_iter()
            .map(|command| (Arc::new(command), Vec::new()))
            .collect();
        self.inner.store.execute_all(statements).await?;
        tracing::info!(queue = %self.name(), "Installed queue tables");
        Ok(())
    }

    /// Drop the queue's tables, including quarantined messages.
    pub async fn uninstall(&self) -> Result<()> {
        let statements = schema::uninstall(self.inner.commands.builder())
            .into_iter()
            .map(|command| (Arc::new(command), Vec::new()))
            .collect();
        self.inner.store.execute_all(statements).await?;
        tracing::info!(queue = %self.name(), "Dropped queue tables");
        Ok(())
    }

    /// Check that the queue's tables exist.
    pub async fn verify(&self) -> Result<()> {
        let command = self.command(CommandKind::CountMessages);
        self.inner
            .store
            .fetch(&command, Vec::new())
            .await
            .map_err(|e| {
                tracing::debug!(queue = %self.name(), error = %e, "Queue verification failed");
                Error::QueueNotFound {
                    name: self.name().to_string(),
                }
            })?;
        Ok(())
    }

    /// Read a message without claiming it.
    pub async fn get_message(&self, queue_id: QueueId) -> Result<Option<ReceivedMessage>> {
        let command = self.command(CommandKind::GetMessage);
        let rows = self
            .inner
            .store
            .fetch(&command, vec![QueryParam::I64(Some(queue_id))])
            .await?;
        rows.first()
            .map(|row| decode_message(row.as_ref(), &self.inner.options, false))
            .transpose()
    }

    /// Number of rows in the message table, claimed or not.
    pub async fn count(&self) -> Result<i64> {
        self.fetch_count(CommandKind::CountMessages, Vec::new()).await
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        let (waiting, processing) = if self.inner.options.enable_status {
            (
                self.fetch_count(CommandKind::CountByStatus(MessageStatus::Waiting), Vec::new())
                    .await?,
                self.fetch_count(CommandKind::CountByStatus(MessageStatus::Processing), Vec::new())
                    .await?,
            )
        } else {
            (self.count().await?, 0)
        };
        Ok(QueueStats {
            queue: self.name().to_string(),
            waiting,
            processing,
            errors: self.error_store().count().await?,
        })
    }

    /// Where a message currently is.
    ///
    /// Reads the status table when the queue keeps one, otherwise the message row. Ids found
    /// only in the error store report [`MessageStatus::Error`]; unknown ids report `None`.
    pub async fn status_of(&self, queue_id: QueueId) -> Result<Option<MessageStatus>> {
        let options = &self.inner.options;
        let id = || vec![QueryParam::I64(Some(queue_id))];

        if options.enable_status_table {
            let command = self.command(CommandKind::GetStatusRow);
            let rows = self.inner.store.fetch(&command, id()).await?;
            if let Some(row) = rows.first() {
                if let Some(code) = row.i64("status")? {
                    return MessageStatus::from_code(code).map(Some);
                }
            }
        } else if let Some(message) = self.get_message(queue_id).await? {
            return Ok(Some(message.status));
        }

        let quarantined = self
            .fetch_count(CommandKind::CountErrorsForMessage, id())
            .await?;
        Ok((quarantined > 0).then_some(MessageStatus::Error))
    }

    async fn fetch_count(&self, kind: CommandKind, params: Vec<QueryParam>) -> Result<i64> {
        let command = self.command(kind);
        let rows = self.inner.store.fetch(&command, params).await?;
        match rows.first() {
            Some(row) => decode_count(row.as_ref()),
            None => Ok(0),
        }
    }

    /// Upsert the status-table row of `queue_id`.
    pub(crate) async fn set_status_row(&self, queue_id: QueueId, status: MessageStatus) -> Result<()> {
        let command = self.command(CommandKind::SetStatusRow(status));
        self.inner
            .store
            .execute(&command, vec![QueryParam::I64(Some(queue_id))])
            .await?;
        Ok(())
    }

    /// Best-effort status-table update. The status table is eventually consistent, so a
    /// failure here never fails the lifecycle step that triggered it.
    pub(crate) async fn sync_status_row(&self, queue_id: QueueId, status: Option<MessageStatus>) {
        if !self.inner.options.enable_status_table {
            return;
        }
        let result = match status {
            Some(status) => self.set_status_row(queue_id, status).await,
            None => {
                let command = self.command(CommandKind::DeleteStatusRow);
                self.inner
                    .store
                    .execute(&command, vec![QueryParam::I64(Some(queue_id))])
                    .await
                    .map(|_| ())
            }
        };
        if let Err(e) = result {
            tracing::warn!(
                queue = %self.name(),
                queue_id,
                error = %e,
                "Failed to update status table"
            );
        }
    }

    /// Delay before a failed message becomes visible again, if delayed processing is enabled
    /// and the retry policy asks for one.
    pub(crate) fn retry_delay(&self, retry_count: u32) -> Option<chrono::Duration> {
        if !self.inner.options.enable_delayed_processing {
            return None;
        }
        match self.inner.retry_policy.calculate_delay(retry_count) {
            0 => None,
            seconds => Some(chrono::Duration::seconds(seconds as i64)),
        }
    }

    pub(crate) fn record(&self, event: crate::metrics::QueueEvent) {
        self.inner.metrics.record(event);
    }

    pub(crate) fn resolve(&self, ctx: &mut MessageContext, event: crate::metrics::QueueEvent) {
        if !ctx.is_resolved() {
            self.record(event);
            ctx.mark_resolved();
        }
    }
}

/// Convert a std duration to a chrono duration for timestamp arithmetic.
pub(crate) fn chrono_duration(field: &str, duration: std::time::Duration) -> Result<chrono::Duration> {
    chrono::Duration::from_std(duration).map_err(|e| Error::InvalidOptions {
        option: field.to_string(),
        message: format!("duration out of range: {}", e),
    })
}

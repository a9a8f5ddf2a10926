//! # relq
//!
//! **relq** is a durable work queue stored in a relational database. Producers enqueue
//! messages; a pool of workers claims, processes and acknowledges them.
//!
//! ## Features
//!
//! ### Delivery
//! - **No double claims**: a message is handed to at most one worker at a time, across threads
//!   and across processes sharing the same database.
//! - **Two claim modes**: hold the database transaction (and its row lock) until the message is
//!   committed, or claim optimistically and recover abandoned claims through heartbeats.
//! - **Priorities, delays and expiration**: served by priority, then visibility time, then
//!   insertion order.
//!
//! ### Failure handling
//! - **Retries with backoff**: fixed, exponential or jittered delays before a message is
//!   visible again.
//! - **Poison quarantine**: unreadable messages and messages out of retries move to a per-queue
//!   error table and are never delivered again.
//!
//! ### Backends
//! - **PostgreSQL** (`postgres` feature), including held-transaction mode via
//!   `FOR UPDATE SKIP LOCKED`.
//! - **SQLite** (`sqlite` feature) for embedded use and tests.
//!
//! ## Quick Start
//!
//! ```no_run
//! use relq::{Config, Consumer, Queue, ReceivedMessage, TransportOptions};
//! use serde_json::json;
//!
//! # async fn example() -> relq::Result<()> {
//! let config = Config::from_dsn("postgresql://localhost/mydb");
//! let queue = Queue::connect(&config, "emails", TransportOptions::standard()).await?;
//!
//! // Setup (run once)
//! queue.install().await?;
//!
//! // Producer
//! queue.send_json(&json!({"to": "user@example.com"})).await?;
//!
//! // Workers
//! let consumer = Consumer::new(queue.clone(), &config, |msg: ReceivedMessage| async move {
//!     let body: serde_json::Value = msg.body()?;
//!     println!("sending {body}");
//!     Ok::<_, relq::Error>(())
//! });
//! let monitor = consumer.monitor();
//! let cancel = consumer.pool().cancellation_token();
//! tokio::spawn(async move { monitor.run(cancel).await });
//! consumer.run().await?;
//! # Ok(())
//! # }
//! ```

pub mod blocking;
pub mod clock;
pub mod codec;
pub mod config;
pub mod consumer;
pub mod context;
pub mod error;
pub mod lifecycle;
pub mod metrics;
pub mod options;
pub mod policy;
pub mod queue;
pub mod scheduler;
pub mod store;
pub mod types;

pub use crate::blocking::BlockingQueue;
pub use crate::clock::{Clock, ManualClock, SystemClock};
pub use crate::codec::{JsonCodec, PayloadCodec};
pub use crate::config::Config;
pub use crate::consumer::{Consumer, Handler, MonitorLoop, MonitorReport};
pub use crate::context::MessageContext;
pub use crate::error::{Error, Result};
pub use crate::lifecycle::{Logged, MessageLifecycle};
pub use crate::metrics::{CounterMetrics, MetricsSink, MetricsSnapshot, NoopMetrics, QueueEvent};
pub use crate::options::{ColumnDef, ColumnType, TransportOptions};
pub use crate::policy::{BackoffStrategy, RetryPolicy};
pub use crate::queue::{
    ErrorStore, ExpirationMonitor, HeartbeatMonitor, PurgeFilter, Queue, QueueBuilder,
    ReceiveRequest,
};
pub use crate::scheduler::{PoolState, Slot, TaskFactory, WorkerPool};
pub use crate::store::{BackendType, MessageStore};
pub use crate::types::{
    ColumnValue, ErrorKind, ErrorRecord, MessageStatus, NewMessage, QueueId, QueueStats,
    ReceivedMessage, ResetRecord,
};

//! Synchronous facade over [`Queue`].
//!
//! [`BlockingQueue`] owns a Tokio runtime and drives the async lifecycle on it, for callers
//! that are not async themselves. The claim, commit and rollback algorithms are the same ones
//! [`Queue`] runs. Do not call these methods from inside an async context; blocking on a
//! runtime from within another runtime panics.

use crate::config::Config;
use crate::context::MessageContext;
use crate::error::{Error, Result};
use crate::options::TransportOptions;
use crate::queue::Queue;
use crate::types::{NewMessage, QueueId};
use std::future::Future;
use std::sync::Arc;
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;

pub struct BlockingQueue {
    runtime: Arc<Runtime>,
    queue: Queue,
}

impl BlockingQueue {
    /// Connect to `config.dsn` and open `name` on a new multi-threaded runtime.
    pub fn connect(config: &Config, name: &str, options: TransportOptions) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .map_err(|e| Error::Internal {
                message: format!("failed to start runtime: {e}"),
            })?;
        let queue = runtime.block_on(Queue::connect(config, name, options))?;
        Ok(Self {
            runtime: Arc::new(runtime),
            queue,
        })
    }

    /// Wrap a queue whose store was opened on `runtime`.
    pub fn with_runtime(runtime: Arc<Runtime>, queue: Queue) -> Self {
        Self { runtime, queue }
    }

    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }

    pub fn install(&self) -> Result<()> {
        self.block_on(self.queue.install())
    }

    pub fn send(&self, msg: NewMessage) -> Result<QueueId> {
        self.block_on(self.queue.send(msg))
    }

    pub fn receive(&self, cancel: &CancellationToken) -> Result<Option<MessageContext>> {
        self.block_on(self.queue.receive(cancel))
    }

    pub fn commit(&self, ctx: &mut MessageContext) -> Result<()> {
        self.block_on(self.queue.commit(ctx))
    }

    pub fn rollback(&self, ctx: &mut MessageContext) -> Result<bool> {
        self.block_on(self.queue.rollback(ctx))
    }

    pub fn count(&self) -> Result<i64> {
        self.block_on(self.queue.count())
    }
}

impl std::fmt::Debug for BlockingQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockingQueue")
            .field("queue", &self.queue.name())
            .finish()
    }
}

//! Bounded worker pool.
//!
//! A [`WorkerPool`] owns a fixed number of execution slots and a bounded backlog of submitted
//! tasks waiting for a slot. Submission blocks once the backlog is full, so producers of work
//! are slowed down instead of the backlog growing without limit.
//!
//! The pool moves through [`PoolState::Created`] → [`PoolState::Started`] →
//! [`PoolState::Stopping`] → [`PoolState::Stopped`]. Stopping cancels the pool's
//! [`CancellationToken`], which every task is expected to observe, then waits up to the stop
//! timeout before aborting whatever is still running.

use crate::config::Config;
use crate::error::{Error, Result};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

type Task = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    Created,
    Started,
    Stopping,
    Stopped,
}

impl PoolState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => PoolState::Created,
            1 => PoolState::Started,
            2 => PoolState::Stopping,
            _ => PoolState::Stopped,
        }
    }
}

struct PoolInner {
    state: AtomicU8,
    slots: Arc<Semaphore>,
    max_threads: usize,
    max_queue_size: usize,
    stop_timeout: Duration,
    cancel: CancellationToken,
    backlog: mpsc::Sender<Task>,
    receiver: Mutex<Option<mpsc::Receiver<Task>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    tasks: Mutex<JoinSet<()>>,
}

impl PoolInner {
    fn state(&self) -> PoolState {
        PoolState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn transition(&self, from: PoolState, to: PoolState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn accepting(&self) -> bool {
        matches!(self.state(), PoolState::Created | PoolState::Started)
    }

    /// Run `task` on a slot already acquired by the caller. Returns `false` once the pool
    /// has begun stopping.
    fn spawn(&self, permit: OwnedSemaphorePermit, task: Task) -> bool {
        self.spawn_with(permit, task, |task| task).is_ok()
    }

    /// Build the task from `input` and spawn it, or hand `input` back if the pool is not running.
    fn spawn_with<T>(
        &self,
        permit: OwnedSemaphorePermit,
        input: T,
        make: impl FnOnce(T) -> Task,
    ) -> std::result::Result<(), T> {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        // checked under the lock that stop() drains the set with
        if self.state() != PoolState::Started {
            return Err(input);
        }
        // reap finished tasks so the set only tracks live work
        while tasks.try_join_next().is_some() {}
        let task = make(input);
        tasks.spawn(async move {
            task.await;
            drop(permit);
        });
        Ok(())
    }
}

/// Fixed-size pool of execution slots with a bounded submission backlog.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("state", &self.inner.state())
            .field("max_threads", &self.inner.max_threads)
            .field("max_queue_size", &self.inner.max_queue_size)
            .field("available_slots", &self.inner.slots.available_permits())
            .finish()
    }
}

impl WorkerPool {
    pub fn new(max_threads: usize, max_queue_size: usize, stop_timeout: Duration) -> Self {
        let max_threads = max_threads.max(1);
        let max_queue_size = max_queue_size.max(1);
        let (backlog, receiver) = mpsc::channel(max_queue_size);
        Self {
            inner: Arc::new(PoolInner {
                state: AtomicU8::new(PoolState::Created as u8),
                slots: Arc::new(Semaphore::new(max_threads)),
                max_threads,
                max_queue_size,
                stop_timeout,
                cancel: CancellationToken::new(),
                backlog,
                receiver: Mutex::new(Some(receiver)),
                dispatcher: Mutex::new(None),
                tasks: Mutex::new(JoinSet::new()),
            }),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.max_threads, config.max_queue_size, config.stop_timeout())
    }

    pub fn state(&self) -> PoolState {
        self.inner.state()
    }

    pub fn max_threads(&self) -> usize {
        self.inner.max_threads
    }

    pub fn available_slots(&self) -> usize {
        self.inner.slots.available_permits()
    }

    /// Token cancelled when the pool stops. Tasks should watch it.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    /// Start dispatching the backlog. Returns `false` if the pool was not in the created state.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) -> bool {
        if !self.inner.transition(PoolState::Created, PoolState::Started) {
            return false;
        }
        let receiver = self
            .inner
            .receiver
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(receiver) = receiver {
            let handle = tokio::spawn(dispatch(self.inner.clone(), receiver));
            *self
                .inner
                .dispatcher
                .lock()
                .unwrap_or_else(|e| e.into_inner()) = Some(handle);
        }
        tracing::debug!(
            max_threads = self.inner.max_threads,
            max_queue_size = self.inner.max_queue_size,
            "Worker pool started"
        );
        true
    }

    pub fn factory(&self) -> TaskFactory {
        TaskFactory {
            inner: self.inner.clone(),
        }
    }

    /// Cancel all work and wait for it to finish.
    ///
    /// Tasks still running after the stop timeout are aborted and [`Error::Timeout`] is
    /// returned; the pool is stopped either way. Calling stop again, or on a pool that is
    /// already stopping, returns `Ok` immediately.
    pub async fn stop(&self) -> Result<()> {
        let stopping = self.inner.transition(PoolState::Started, PoolState::Stopping)
            || self.inner.transition(PoolState::Created, PoolState::Stopping);
        if !stopping {
            return Ok(());
        }
        self.inner.cancel.cancel();

        let dispatcher = self
            .inner
            .dispatcher
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = dispatcher {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Worker pool dispatcher ended abnormally");
            }
        }

        let mut tasks = std::mem::take(&mut *self.inner.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        let drained = tokio::time::timeout(self.inner.stop_timeout, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        let aborted = drained.is_err() && !tasks.is_empty();
        if aborted {
            tracing::warn!(
                remaining = tasks.len(),
                timeout = ?self.inner.stop_timeout,
                "Aborting workers that did not stop in time"
            );
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }

        self.inner
            .state
            .store(PoolState::Stopped as u8, Ordering::SeqCst);
        tracing::debug!("Worker pool stopped");
        if aborted {
            return Err(Error::Timeout {
                operation: "worker pool stop".to_string(),
            });
        }
        Ok(())
    }
}

async fn dispatch(inner: Arc<PoolInner>, mut receiver: mpsc::Receiver<Task>) {
    loop {
        let task = tokio::select! {
            _ = inner.cancel.cancelled() => break,
            task = receiver.recv() => match task {
                Some(task) => task,
                None => break,
            },
        };
        let permit = tokio::select! {
            _ = inner.cancel.cancelled() => break,
            permit = inner.slots.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };
        if !inner.spawn(permit, task) {
            break;
        }
    }
    receiver.close();
}

/// Handle for submitting work to a [`WorkerPool`].
#[derive(Clone)]
pub struct TaskFactory {
    inner: Arc<PoolInner>,
}

impl TaskFactory {
    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Queue `task` for the next free slot. Waits while the backlog is full.
    pub async fn submit<F>(&self, task: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if !self.inner.accepting() {
            return Err(Error::PoolStopped);
        }
        tokio::select! {
            _ = self.inner.cancel.cancelled() => Err(Error::PoolStopped),
            sent = self.inner.backlog.send(Box::pin(task)) => sent.map_err(|_| Error::PoolStopped),
        }
    }

    /// Wait for a free slot and hold it. The slot is released when the returned [`Slot`] is
    /// dropped or the task spawned on it finishes.
    pub async fn reserve(&self) -> Result<Slot> {
        if !self.inner.accepting() {
            return Err(Error::PoolStopped);
        }
        tokio::select! {
            _ = self.inner.cancel.cancelled() => Err(Error::PoolStopped),
            permit = self.inner.slots.clone().acquire_owned() => permit
                .map(|permit| Slot { inner: self.inner.clone(), permit })
                .map_err(|_| Error::PoolStopped),
        }
    }
}

/// An execution slot reserved ahead of the work that will run on it.
pub struct Slot {
    inner: Arc<PoolInner>,
    permit: OwnedSemaphorePermit,
}

impl Slot {
    /// Run `task` on this slot.
    pub fn spawn<F>(self, task: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.inner.spawn(self.permit, Box::pin(task)) {
            Ok(())
        } else {
            Err(Error::PoolStopped)
        }
    }

    /// Run the task built from `input` on this slot.
    ///
    /// `make` only runs once the pool has accepted the work. If the pool stopped in the
    /// meantime, `input` comes back untouched so the caller can release whatever it holds.
    pub fn spawn_with<T, F, Fut>(self, input: T, make: F) -> std::result::Result<(), T>
    where
        F: FnOnce(T) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.inner
            .spawn_with(self.permit, input, |input| Box::pin(make(input)) as Task)
    }
}

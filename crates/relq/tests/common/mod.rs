//! Shared helpers for the integration tests.
//!
//! Tests run against SQLite in a temporary directory unless `RELQ_TEST_BACKEND=postgres`
//! is set, in which case `RELQ_TEST_POSTGRES_DSN` names the database to use.

use relq::store::BackendType;
use relq::{Config, CounterMetrics, ManualClock, Queue, RetryPolicy, TransportOptions};
use std::sync::Arc;
use tempfile::TempDir;

/// A queue wired to a controllable clock and counting metrics.
#[allow(dead_code)]
pub struct TestQueue {
    pub queue: Queue,
    pub clock: Arc<ManualClock>,
    pub metrics: Arc<CounterMetrics>,
    pub dsn: String,
    _dir: Option<TempDir>,
}

/// Backend selected for this run. Defaults to SQLite.
#[allow(dead_code)]
pub fn current_backend() -> BackendType {
    match std::env::var("RELQ_TEST_BACKEND") {
        Ok(name) if name.eq_ignore_ascii_case("postgres") => BackendType::Postgres,
        _ => BackendType::Sqlite,
    }
}

#[allow(dead_code)]
pub fn postgres_dsn() -> Option<String> {
    std::env::var("RELQ_TEST_POSTGRES_DSN").ok()
}

/// Queue names are unique per call so tests can share one Postgres database.
#[allow(dead_code)]
pub fn unique_name(prefix: &str) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}_{}", prefix, &suffix[..8])
}

/// Install a fresh queue on the selected backend.
#[allow(dead_code)]
pub async fn create_queue(prefix: &str, options: TransportOptions) -> anyhow::Result<TestQueue> {
    match current_backend() {
        BackendType::Postgres => {
            let dsn = postgres_dsn()
                .ok_or_else(|| anyhow::anyhow!("RELQ_TEST_POSTGRES_DSN must be set for postgres runs"))?;
            queue_on(dsn, None, prefix, options).await
        }
        BackendType::Sqlite => sqlite_queue(prefix, options).await,
    }
}

#[allow(dead_code)]
pub async fn sqlite_queue(prefix: &str, options: TransportOptions) -> anyhow::Result<TestQueue> {
    let dir = tempfile::tempdir()?;
    let dsn = format!("sqlite://{}", dir.path().join("relq.db").display());
    queue_on(dsn, Some(dir), prefix, options).await
}

/// Install a queue on Postgres, or `None` when no Postgres DSN is configured.
#[allow(dead_code)]
pub async fn postgres_queue(prefix: &str, options: TransportOptions) -> anyhow::Result<Option<TestQueue>> {
    match postgres_dsn() {
        Some(dsn) => Ok(Some(queue_on(dsn, None, prefix, options).await?)),
        None => {
            eprintln!("RELQ_TEST_POSTGRES_DSN not set, skipping");
            Ok(None)
        }
    }
}

async fn queue_on(
    dsn: String,
    dir: Option<TempDir>,
    prefix: &str,
    options: TransportOptions,
) -> anyhow::Result<TestQueue> {
    let config = Config::from_dsn(dsn.clone()).with_max_connections(16);
    let store = relq::store::connect(&config).await?;
    let clock = Arc::new(ManualClock::default());
    let metrics = Arc::new(CounterMetrics::new());
    let queue = Queue::builder(unique_name(prefix), store)
        .options(options)
        .config(&config)
        .clock(clock.clone())
        .metrics(metrics.clone())
        .retry_policy(RetryPolicy::immediate(3))
        .build()?;
    queue.install().await?;
    Ok(TestQueue {
        queue,
        clock,
        metrics,
        dsn,
        _dir: dir,
    })
}

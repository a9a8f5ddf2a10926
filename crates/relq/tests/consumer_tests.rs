//! End-to-end drains through the worker pool.

mod common;

use common::{create_queue, TestQueue};
use relq::{Config, Consumer, Error, Logged, NewMessage, ReceivedMessage, TransportOptions};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const MESSAGES: usize = 100;
const WORKERS: usize = 10;

fn worker_config(t: &TestQueue) -> Config {
    Config::from_dsn(t.dsn.clone())
        .with_max_threads(WORKERS)
        .with_max_queue_size(WORKERS)
        .with_poll_interval(5, 50)
}

async fn fill(t: &TestQueue) -> anyhow::Result<()> {
    let batch = (0..MESSAGES)
        .map(|i| NewMessage::new((i as u32).to_be_bytes().to_vec()))
        .collect();
    assert_eq!(t.queue.send_batch(batch).await?.len(), MESSAGES);
    Ok(())
}

async fn drain<L: relq::MessageLifecycle + 'static>(
    consumer: &Consumer<L>,
    mut done: impl FnMut() -> bool,
) -> anyhow::Result<()> {
    let runner = tokio::spawn({
        let consumer = consumer.clone();
        async move { consumer.run().await }
    });
    let finished = tokio::time::timeout(Duration::from_secs(60), async {
        while !done() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    consumer.stop().await?;
    runner.await??;
    finished.map_err(|_| anyhow::anyhow!("queue was not drained in time"))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_drain_with_successful_handler() -> anyhow::Result<()> {
    let t = create_queue("drain", TransportOptions::standard()).await?;
    fill(&t).await?;

    let processed = Arc::new(Mutex::new(Vec::new()));
    let seen = processed.clone();
    let consumer = Consumer::new(t.queue.clone(), &worker_config(&t), move |msg: ReceivedMessage| {
        let seen = seen.clone();
        async move {
            seen.lock().unwrap().push(msg.queue_id);
            Ok::<_, Error>(())
        }
    });

    let metrics = t.metrics.clone();
    drain(&consumer, || metrics.snapshot().committed == MESSAGES as u64).await?;

    let processed = processed.lock().unwrap().clone();
    let distinct: HashSet<_> = processed.iter().collect();
    assert_eq!(processed.len(), MESSAGES);
    assert_eq!(distinct.len(), MESSAGES);

    let snap = t.metrics.snapshot();
    assert_eq!(snap.committed, MESSAGES as u64);
    assert_eq!(snap.rolled_back, 0);
    assert_eq!(snap.errors(), 0);
    assert_eq!(t.queue.count().await?, 0);
    assert_eq!(t.queue.error_store().count().await?, 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_drain_with_handler_failing_once() -> anyhow::Result<()> {
    let t = create_queue("retry", TransportOptions::standard()).await?;
    fill(&t).await?;

    let consumer = Consumer::new(
        Logged::new(t.queue.clone()),
        &worker_config(&t),
        |msg: ReceivedMessage| async move {
            if msg.retry_count == 0 {
                Err(Error::handler("first attempt fails"))
            } else {
                Ok(())
            }
        },
    );

    let metrics = t.metrics.clone();
    drain(&consumer, || metrics.snapshot().committed == MESSAGES as u64).await?;

    let snap = t.metrics.snapshot();
    assert_eq!(snap.rolled_back, MESSAGES as u64);
    assert_eq!(snap.committed, MESSAGES as u64);
    assert_eq!(snap.errors(), 0);
    assert_eq!(t.queue.count().await?, 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_undecodable_payload_is_quarantined() -> anyhow::Result<()> {
    #[derive(serde::Deserialize)]
    #[allow(dead_code)]
    struct Email {
        to: String,
    }

    let t = create_queue("poison", TransportOptions::standard()).await?;
    t.queue.send_json(&serde_json::json!({"to": "a@example.com"})).await?;
    let bad = t.queue.send(NewMessage::new(b"not json".to_vec())).await?;

    let consumer = Consumer::new(t.queue.clone(), &worker_config(&t), |msg: ReceivedMessage| async move {
        let _email: Email = msg.body()?;
        Ok::<_, Error>(())
    });

    let metrics = t.metrics.clone();
    drain(&consumer, || {
        let snap = metrics.snapshot();
        snap.committed == 1 && snap.poisoned == 1
    })
    .await?;

    let records = t.queue.error_store().list(10, 0).await?;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].queue_id, bad);
    assert_eq!(records[0].kind, relq::ErrorKind::Poison);
    assert_eq!(t.metrics.snapshot().rolled_back, 0);
    Ok(())
}

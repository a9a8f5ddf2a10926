//! Lifecycle properties that must hold on every backend.

mod common;

use common::create_queue;
use relq::{MessageStatus, NewMessage, TransportOptions};
use std::collections::HashSet;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_receivers_never_share_a_message() -> anyhow::Result<()> {
    let t = create_queue("claims", TransportOptions::standard()).await?;
    let messages = 20;
    let workers = 30;
    let mut sent = HashSet::new();
    for i in 0..messages {
        sent.insert(t.queue.send(NewMessage::new(vec![i as u8])).await?);
    }

    let mut handles = Vec::new();
    for _ in 0..workers {
        let queue = t.queue.clone();
        handles.push(tokio::spawn(async move {
            let cancel = CancellationToken::new();
            let mut claimed = Vec::new();
            while let Some(ctx) = queue.receive(&cancel).await? {
                claimed.push(ctx.queue_id());
            }
            Ok::<_, relq::Error>(claimed)
        }));
    }

    let mut claimed = Vec::new();
    for handle in handles {
        claimed.extend(handle.await??);
    }
    let distinct: HashSet<_> = claimed.iter().copied().collect();
    assert_eq!(claimed.len(), messages);
    assert_eq!(distinct, sent);
    assert_eq!(t.metrics.snapshot().received, messages as u64);
    Ok(())
}

#[tokio::test]
async fn test_priority_order() -> anyhow::Result<()> {
    let t = create_queue("priority", TransportOptions::standard()).await?;
    for priority in [5, 1, 3] {
        t.queue
            .send(NewMessage::new(b"x".to_vec()).with_priority(priority))
            .await?;
    }
    let cancel = CancellationToken::new();
    let mut seen = Vec::new();
    while let Some(mut ctx) = t.queue.receive(&cancel).await? {
        seen.push(ctx.message().priority);
        t.queue.commit(&mut ctx).await?;
    }
    assert_eq!(seen, vec![Some(1), Some(3), Some(5)]);
    Ok(())
}

#[tokio::test]
async fn test_commit_twice_deletes_once() -> anyhow::Result<()> {
    let t = create_queue("commits", TransportOptions::standard()).await?;
    let id = t.queue.send(NewMessage::new(b"x".to_vec())).await?;
    let cancel = CancellationToken::new();
    let mut ctx = t.queue.receive(&cancel).await?.expect("claimed");

    t.queue.commit(&mut ctx).await?;
    t.queue.commit(&mut ctx).await?;
    assert!(t.queue.get_message(id).await?.is_none());
    assert_eq!(t.metrics.snapshot().committed, 1);
    Ok(())
}

#[tokio::test]
async fn test_abandoned_claim_is_reclaimed() -> anyhow::Result<()> {
    let t = create_queue("reclaim", TransportOptions::standard()).await?;
    let id = t.queue.send(NewMessage::new(b"x".to_vec())).await?;
    let cancel = CancellationToken::new();
    let abandoned = t.queue.receive(&cancel).await?.expect("claimed");
    assert_eq!(t.queue.status_of(id).await?, Some(MessageStatus::Processing));

    let window = t.queue.heartbeat_window();
    t.clock.advance(window + chrono::Duration::seconds(1));
    let reset = t.queue.heartbeat_monitor().reset(&cancel).await?;
    assert_eq!(reset.len(), 1);
    assert_eq!(reset[0].queue_id, id);
    assert_eq!(Some(reset[0].heartbeat), abandoned.heartbeat());
    assert_eq!(t.queue.status_of(id).await?, Some(MessageStatus::Waiting));

    let again = t.queue.receive(&cancel).await?.expect("claimable again");
    assert_eq!(again.queue_id(), id);
    assert_eq!(t.metrics.snapshot().heartbeat_reset, 1);
    Ok(())
}

#[tokio::test]
async fn test_rollback_after_reclaim_is_a_noop() -> anyhow::Result<()> {
    let t = create_queue("race", TransportOptions::standard()).await?;
    let id = t.queue.send(NewMessage::new(b"x".to_vec())).await?;
    let cancel = CancellationToken::new();
    let mut original = t.queue.receive(&cancel).await?.expect("claimed");

    t.clock.advance(t.queue.heartbeat_window() + chrono::Duration::seconds(1));
    assert_eq!(t.queue.heartbeat_monitor().reset(&cancel).await?.len(), 1);

    assert!(!t.queue.rollback(&mut original).await?);
    let message = t.queue.get_message(id).await?.expect("still queued");
    assert_eq!(message.status, MessageStatus::Waiting);
    // the reclaim does not count as a failure, and neither does the stale rollback
    assert_eq!(message.retry_count, 0);
    assert_eq!(t.metrics.snapshot().rolled_back, 0);
    assert_eq!(t.queue.count().await?, 1);
    Ok(())
}

#[tokio::test]
async fn test_expired_message_is_never_delivered() -> anyhow::Result<()> {
    let t = create_queue("expiry", TransportOptions::standard()).await?;
    let expired = t
        .queue
        .send(NewMessage::new(b"old".to_vec()).with_expiration(Duration::from_secs(30)))
        .await?;
    t.clock.advance(chrono::Duration::minutes(1));

    let cancel = CancellationToken::new();
    assert!(t.queue.receive(&cancel).await?.is_none());
    assert_eq!(t.queue.expiration_monitor().clear_messages(&cancel).await?, 1);
    assert!(t.queue.get_message(expired).await?.is_none());
    assert_eq!(t.queue.expiration_monitor().clear_messages(&cancel).await?, 0);
    Ok(())
}

#[tokio::test]
async fn test_stats_track_the_lifecycle() -> anyhow::Result<()> {
    let t = create_queue("stats", TransportOptions::standard()).await?;
    for _ in 0..3 {
        t.queue.send(NewMessage::new(b"x".to_vec())).await?;
    }
    let cancel = CancellationToken::new();
    let mut ctx = t.queue.receive(&cancel).await?.expect("claimed");
    let stats = t.queue.stats().await?;
    assert_eq!((stats.waiting, stats.processing, stats.errors), (2, 1, 0));

    t.queue
        .error_store()
        .handle(&mut ctx, relq::ErrorKind::Poison, &relq::Error::poison("bad"))
        .await?;
    let stats = t.queue.stats().await?;
    assert_eq!((stats.waiting, stats.processing, stats.errors), (2, 0, 1));
    Ok(())
}

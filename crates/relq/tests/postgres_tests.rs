//! Held-transaction mode needs row locks, so these run on Postgres only.
//! They skip themselves when `RELQ_TEST_POSTGRES_DSN` is not set.

mod common;

use common::postgres_queue;
use relq::store::{Command, CommandKind};
use relq::{Error, ErrorKind, MessageStatus, NewMessage, TransportOptions};
use std::collections::HashSet;
use tokio_util::sync::CancellationToken;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_held_claims_skip_locked_rows() -> anyhow::Result<()> {
    let Some(t) = postgres_queue("held", TransportOptions::held()).await? else {
        return Ok(());
    };
    for i in 0..5u8 {
        t.queue.send(NewMessage::new(vec![i])).await?;
    }
    let cancel = CancellationToken::new();
    let mut held = Vec::new();
    while let Some(ctx) = t.queue.receive(&cancel).await? {
        assert!(ctx.holds_transaction());
        held.push(ctx);
    }
    let ids: HashSet<_> = held.iter().map(|ctx| ctx.queue_id()).collect();
    assert_eq!(ids.len(), 5);

    for ctx in held.iter_mut() {
        t.queue.commit(ctx).await?;
        assert!(!ctx.holds_transaction());
    }
    assert_eq!(t.queue.count().await?, 0);
    Ok(())
}

#[tokio::test]
async fn test_held_rollback_releases_and_counts() -> anyhow::Result<()> {
    let Some(t) = postgres_queue("heldrb", TransportOptions::held()).await? else {
        return Ok(());
    };
    let id = t.queue.send(NewMessage::new(b"x".to_vec())).await?;
    let cancel = CancellationToken::new();

    let mut ctx = t.queue.receive(&cancel).await?.expect("claimed");
    assert!(t.queue.receive(&cancel).await?.is_none(), "row is locked");
    assert!(t.queue.rollback(&mut ctx).await?);
    assert!(!t.queue.rollback(&mut ctx).await?);

    let message = t.queue.get_message(id).await?.expect("still queued");
    assert_eq!(message.retry_count, 1);
    assert_eq!(message.status, MessageStatus::Waiting);

    let again = t.queue.receive(&cancel).await?.expect("released");
    assert_eq!(again.queue_id(), id);
    Ok(())
}

#[tokio::test]
async fn test_held_quarantine_uses_the_claim_transaction() -> anyhow::Result<()> {
    let Some(t) = postgres_queue("heldq", TransportOptions::held()).await? else {
        return Ok(());
    };
    let id = t.queue.send(NewMessage::new(b"x".to_vec())).await?;
    let cancel = CancellationToken::new();
    let mut ctx = t.queue.receive(&cancel).await?.expect("claimed");

    t.queue
        .error_store()
        .handle(&mut ctx, ErrorKind::Poison, &Error::poison("bad"))
        .await?;
    assert!(t.queue.get_message(id).await?.is_none());
    assert_eq!(t.queue.error_store().count().await?, 1);
    assert!(t.queue.receive(&cancel).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn test_held_undecodable_row_is_quarantined() -> anyhow::Result<()> {
    let Some(t) = postgres_queue("heldbad", TransportOptions::held()).await? else {
        return Ok(());
    };
    let broken = t.queue.send(NewMessage::new(b"broken".to_vec())).await?;
    let healthy = t.queue.send(NewMessage::new(b"fine".to_vec())).await?;
    let sql = format!(
        "UPDATE {} SET headers = 'not json' WHERE queue_id = {}",
        t.queue.tables().messages,
        broken
    );
    t.queue
        .store()
        .execute(&Command::raw(CommandKind::Schema, sql), Vec::new())
        .await?;

    let cancel = CancellationToken::new();
    let ctx = t.queue.receive(&cancel).await?.expect("healthy message claimed");
    assert_eq!(ctx.queue_id(), healthy);
    assert!(t.queue.get_message(broken).await?.is_none());

    let errors = t.queue.error_store().list(10, 0).await?;
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].queue_id, broken);
    assert_eq!(errors[0].kind, ErrorKind::Poison);
    Ok(())
}

#[tokio::test]
async fn test_status_table_follows_claims() -> anyhow::Result<()> {
    let options = TransportOptions {
        enable_status_table: true,
        ..TransportOptions::standard()
    };
    let Some(t) = postgres_queue("stable", options).await? else {
        return Ok(());
    };
    let id = t.queue.send(NewMessage::new(b"x".to_vec())).await?;
    assert_eq!(t.queue.status_of(id).await?, Some(MessageStatus::Waiting));

    let cancel = CancellationToken::new();
    let mut ctx = t.queue.receive(&cancel).await?.expect("claimed");
    assert_eq!(t.queue.status_of(id).await?, Some(MessageStatus::Processing));
    t.queue.commit(&mut ctx).await?;
    assert_eq!(t.queue.status_of(id).await?, None);
    Ok(())
}

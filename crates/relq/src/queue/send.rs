use super::{chrono_duration, Queue};
use crate::error::{Error, Result};
use crate::metrics::QueueEvent;
use crate::options::{ColumnDef, ColumnType};
use crate::store::query::Arg;
use crate::store::rows::decode_id;
use crate::store::{Command, CommandKind, ConnectionScope, QueryParam, Rows};
use crate::types::{ColumnValue, NewMessage, QueueId};
use serde::Serialize;
use uuid::Uuid;

fn column_param(def: &ColumnDef, value: Option<&ColumnValue>) -> QueryParam {
    match (def.kind, value) {
        (ColumnType::Integer, Some(ColumnValue::Integer(v))) => QueryParam::I64(Some(*v)),
        (ColumnType::Integer, _) => QueryParam::I64(None),
        (ColumnType::Real, Some(ColumnValue::Real(v))) => QueryParam::F64(Some(*v)),
        (ColumnType::Real, Some(ColumnValue::Integer(v))) => QueryParam::F64(Some(*v as f64)),
        (ColumnType::Real, _) => QueryParam::F64(None),
        (ColumnType::Text, Some(ColumnValue::Text(v))) => QueryParam::String(Some(v.clone())),
        (ColumnType::Text, _) => QueryParam::String(None),
        (ColumnType::Boolean, Some(ColumnValue::Bool(v))) => QueryParam::Bool(Some(*v)),
        (ColumnType::Boolean, _) => QueryParam::Bool(None),
    }
}

fn inserted_id(rows: Rows) -> Result<QueueId> {
    let row = rows.first().ok_or_else(|| Error::Internal {
        message: "insert returned no id".to_string(),
    })?;
    decode_id(row.as_ref(), "queue_id")
}

impl Queue {
    /// Enqueue one message and return its id.
    pub async fn send(&self, msg: NewMessage) -> Result<QueueId> {
        self.inner.options.check_message(&msg)?;
        let insert = self.command(CommandKind::Insert);
        let params = self.insert_params(&insert, &msg)?;

        let queue_id = if self.inner.options.enable_status_table {
            // message row and status row appear together
            let mut scope = self.inner.store.open_scope().await?;
            let queue_id = self.insert_in(scope.as_mut(), &insert, params).await?;
            scope.commit().await?;
            queue_id
        } else {
            inserted_id(self.inner.store.fetch(&insert, params).await?)?
        };

        self.record(QueueEvent::Sent);
        tracing::debug!(queue = %self.name(), queue_id, "Sent message");
        Ok(queue_id)
    }

    /// Enqueue several messages in one transaction. Either all are stored or none.
    pub async fn send_batch(&self, messages: Vec<NewMessage>) -> Result<Vec<QueueId>> {
        if messages.is_empty() {
            return Ok(Vec::new());
        }
        for msg in &messages {
            self.inner.options.check_message(msg)?;
        }

        let insert = self.command(CommandKind::Insert);
        let mut scope = self.inner.store.open_scope().await?;
        let mut ids = Vec::with_capacity(messages.len());
        for msg in &messages {
            let params = self.insert_params(&insert, msg)?;
            ids.push(self.insert_in(scope.as_mut(), &insert, params).await?);
        }
        scope.commit().await?;

        for _ in &ids {
            self.record(QueueEvent::Sent);
        }
        tracing::debug!(queue = %self.name(), count = ids.len(), "Sent message batch");
        Ok(ids)
    }

    /// Encode `body` with the queue's codec and enqueue it.
    pub async fn send_json<T: Serialize>(&self, body: &T) -> Result<QueueId> {
        let value = serde_json::to_value(body)?;
        let payload = self.inner.codec.encode(&value)?;
        self.send(NewMessage::new(payload)).await
    }

    async fn insert_in(
        &self,
        scope: &mut dyn ConnectionScope,
        insert: &Command,
        params: Vec<QueryParam>,
    ) -> Result<QueueId> {
        let queue_id = inserted_id(scope.fetch(insert, params).await?)?;
        if self.inner.options.enable_status_table {
            let status = self.command(CommandKind::InsertStatusRow);
            scope
                .execute(&status, vec![QueryParam::I64(Some(queue_id))])
                .await?;
        }
        Ok(queue_id)
    }

    fn insert_params(&self, insert: &Command, msg: &NewMessage) -> Result<Vec<QueryParam>> {
        let now = self.now();
        let headers = serde_json::to_string(&msg.headers)?;
        let correlation_id = msg.correlation_id.unwrap_or_else(Uuid::new_v4).to_string();
        let visible_at = now + chrono_duration("delay", msg.delay.unwrap_or_default())?;
        let expires_at = msg
            .expiration
            .map(|ttl| chrono_duration("expiration", ttl).map(|ttl| now + ttl))
            .transpose()?;
        let columns = &self.inner.options.additional_columns;

        insert.bind(|arg| match arg {
            Arg::Payload => Some(QueryParam::Bytes(msg.payload.clone())),
            Arg::Headers => Some(QueryParam::String(Some(headers.clone()))),
            Arg::Priority => Some(QueryParam::I64(Some(msg.priority.unwrap_or(0)))),
            Arg::VisibleAt => Some(QueryParam::DateTime(Some(visible_at))),
            Arg::ExpirationTime => Some(QueryParam::DateTime(expires_at)),
            Arg::MessageRoute => Some(QueryParam::String(msg.route.clone())),
            Arg::CorrelationId => Some(QueryParam::String(Some(correlation_id.clone()))),
            Arg::SourceQueueId => Some(QueryParam::I64(msg.source_queue_id)),
            Arg::EnqueuedAt => Some(QueryParam::DateTime(Some(now))),
            Arg::Column(i) => columns
                .get(*i)
                .map(|def| column_param(def, msg.columns.get(&def.name))),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::clock::Clock;
    use crate::options::{ColumnDef, ColumnType, TransportOptions};
    use crate::queue::test_support::sqlite_queue;
    use crate::types::{ColumnValue, MessageStatus, NewMessage};
    use std::time::Duration;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_send_round_trips_fields() {
        let t = sqlite_queue(TransportOptions {
            enable_route: true,
            additional_columns: vec![
                ColumnDef::new("tenant", ColumnType::Text),
                ColumnDef::new("weight", ColumnType::Real),
                ColumnDef::new("urgent", ColumnType::Boolean),
            ],
            ..TransportOptions::standard()
        })
        .await;

        let correlation = Uuid::new_v4();
        let id = t
            .queue
            .send(
                NewMessage::new(b"payload".to_vec())
                    .with_header("trace", "abc")
                    .with_priority(4)
                    .with_delay(Duration::from_secs(30))
                    .with_expiration(Duration::from_secs(600))
                    .with_route("emails")
                    .with_correlation_id(correlation)
                    .with_source_queue_id(77)
                    .with_column("tenant", ColumnValue::Text("acme".into()))
                    .with_column("weight", ColumnValue::Integer(2))
                    .with_column("urgent", ColumnValue::Bool(true)),
            )
            .await
            .unwrap();

        let msg = t.queue.get_message(id).await.unwrap().unwrap();
        let now = t.clock.now();
        assert_eq!(msg.payload, b"payload");
        assert_eq!(msg.header("trace"), Some("abc"));
        assert_eq!(msg.status, MessageStatus::Waiting);
        assert_eq!(msg.priority, Some(4));
        assert_eq!(msg.queue_process_time, Some(now + chrono::Duration::seconds(30)));
        assert_eq!(msg.expiration_time, Some(now + chrono::Duration::seconds(600)));
        assert_eq!(msg.route.as_deref(), Some("emails"));
        assert_eq!(msg.correlation_id, correlation.to_string());
        assert_eq!(msg.source_queue_id, Some(77));
        assert_eq!(msg.enqueued_at, now);
        assert_eq!(msg.columns["tenant"], ColumnValue::Text("acme".into()));
        assert_eq!(msg.columns["weight"], ColumnValue::Real(2.0));
        assert_eq!(msg.columns["urgent"], ColumnValue::Bool(true));
    }

    #[tokio::test]
    async fn test_send_rejects_disabled_fields() {
        let t = sqlite_queue(TransportOptions::default()).await;
        let err = t
            .queue
            .send(NewMessage::new(b"x".to_vec()).with_priority(1))
            .await
            .unwrap_err();
        assert!(matches!(err, crate::Error::InvalidOptions { .. }));
        assert_eq!(t.queue.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_send_batch_with_status_table() {
        let t = sqlite_queue(TransportOptions {
            enable_status_table: true,
            ..TransportOptions::standard()
        })
        .await;
        let ids = t
            .queue
            .send_batch(vec![
                NewMessage::new(b"1".to_vec()),
                NewMessage::new(b"2".to_vec()),
                NewMessage::new(b"3".to_vec()),
            ])
            .await
            .unwrap();
        assert_eq!(ids.len(), 3);
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
        for id in ids {
            assert_eq!(
                t.queue.status_of(id).await.unwrap(),
                Some(MessageStatus::Waiting)
            );
        }
        assert_eq!(t.metrics.snapshot().sent, 3);
    }

    #[tokio::test]
    async fn test_send_json_uses_codec() {
        let t = sqlite_queue(TransportOptions::default()).await;
        let id = t
            .queue
            .send_json(&serde_json::json!({"to": "a@b.c"}))
            .await
            .unwrap();
        let msg = t.queue.get_message(id).await.unwrap().unwrap();
        let body: serde_json::Value = msg.body().unwrap();
        assert_eq!(body["to"], "a@b.c");
    }
}

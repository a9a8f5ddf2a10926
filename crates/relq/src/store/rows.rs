//! Decoding result rows into relq types.

use crate::error::{Error, Result};
use crate::options::{ColumnType, TransportOptions};
use crate::store::StoreRow;
use crate::types::{ColumnValue, ErrorKind, ErrorRecord, Headers, MessageStatus, ReceivedMessage, ResetRecord};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

fn required<T>(value: Option<T>, column: &str) -> Result<T> {
    value.ok_or_else(|| Error::Internal {
        message: format!("column {} is NULL", column),
    })
}

fn headers(row: &dyn StoreRow) -> Result<Headers> {
    let text = required(row.string("headers")?, "headers")?;
    Ok(serde_json::from_str(&text)?)
}

fn retry_count(row: &dyn StoreRow) -> Result<u32> {
    let n = required(row.i64("retry_count")?, "retry_count")?;
    u32::try_from(n).map_err(|_| Error::Internal {
        message: format!("retry_count {} out of range", n),
    })
}

/// Decode a message row.
///
/// Without a status column a row's state is implied: `claimed` rows were just taken by this
/// worker, every other row is waiting.
pub fn decode_message(
    row: &dyn StoreRow,
    options: &TransportOptions,
    claimed: bool,
) -> Result<ReceivedMessage> {
    let status = if options.enable_status {
        MessageStatus::from_code(required(row.i64("status")?, "status")?)?
    } else if claimed {
        MessageStatus::Processing
    } else {
        MessageStatus::Waiting
    };

    let mut columns = BTreeMap::new();
    for def in &options.additional_columns {
        let name = def.name.as_str();
        let value = match def.kind {
            ColumnType::Integer => row.i64(name)?.map(ColumnValue::Integer),
            ColumnType::Real => row.f64(name)?.map(ColumnValue::Real),
            ColumnType::Text => row.string(name)?.map(ColumnValue::Text),
            ColumnType::Boolean => row.bool(name)?.map(ColumnValue::Bool),
        };
        columns.insert(def.name.clone(), value.unwrap_or(ColumnValue::Null));
    }

    Ok(ReceivedMessage {
        queue_id: required(row.i64("queue_id")?, "queue_id")?,
        payload: required(row.bytes("payload")?, "payload")?,
        headers: headers(row)?,
        status,
        priority: if options.enable_priority {
            row.i64("priority")?
        } else {
            None
        },
        heartbeat: if options.enable_heartbeat {
            row.datetime("heartbeat")?
        } else {
            None
        },
        queue_process_time: if options.enable_delayed_processing {
            row.datetime("queue_process_time")?
        } else {
            None
        },
        expiration_time: if options.enable_message_expiration {
            row.datetime("expiration_time")?
        } else {
            None
        },
        route: if options.enable_route {
            row.string("route")?
        } else {
            None
        },
        correlation_id: required(row.string("correlation_id")?, "correlation_id")?,
        source_queue_id: row.i64("source_queue_id")?,
        retry_count: retry_count(row)?,
        enqueued_at: required(row.datetime("enqueued_at")?, "enqueued_at")?,
        columns,
    })
}

/// Best-effort decode of a claimed row that [`decode_message`] rejected, so it can still be
/// quarantined. Only `queue_id` is required; unreadable columns fall back to empty values and
/// `enqueued_at` to `now`.
pub fn salvage_message(row: &dyn StoreRow, now: DateTime<Utc>) -> Result<ReceivedMessage> {
    Ok(ReceivedMessage {
        queue_id: required(row.i64("queue_id")?, "queue_id")?,
        payload: row.bytes("payload").ok().flatten().unwrap_or_default(),
        headers: headers(row).unwrap_or_default(),
        status: MessageStatus::Processing,
        priority: None,
        heartbeat: None,
        queue_process_time: None,
        expiration_time: None,
        route: row.string("route").ok().flatten(),
        correlation_id: row.string("correlation_id").ok().flatten().unwrap_or_default(),
        source_queue_id: None,
        retry_count: retry_count(row).unwrap_or_default(),
        enqueued_at: row.datetime("enqueued_at").ok().flatten().unwrap_or(now),
        columns: BTreeMap::new(),
    })
}

pub fn decode_error(row: &dyn StoreRow) -> Result<ErrorRecord> {
    Ok(ErrorRecord {
        error_id: required(row.i64("error_id")?, "error_id")?,
        queue_id: required(row.i64("queue_id")?, "queue_id")?,
        payload: required(row.bytes("payload")?, "payload")?,
        headers: headers(row)?,
        route: row.string("route")?,
        correlation_id: required(row.string("correlation_id")?, "correlation_id")?,
        retry_count: retry_count(row)?,
        enqueued_at: required(row.datetime("enqueued_at")?, "enqueued_at")?,
        kind: ErrorKind::parse(&required(row.string("kind")?, "kind")?)?,
        exception: required(row.string("exception")?, "exception")?,
        failed_at: required(row.datetime("failed_at")?, "failed_at")?,
    })
}

pub fn decode_reset(row: &dyn StoreRow) -> Result<ResetRecord> {
    Ok(ResetRecord {
        queue_id: required(row.i64("queue_id")?, "queue_id")?,
        heartbeat: required(row.datetime("heartbeat")?, "heartbeat")?,
    })
}

pub fn decode_id(row: &dyn StoreRow, column: &str) -> Result<i64> {
    required(row.i64(column)?, column)
}

pub fn decode_count(row: &dyn StoreRow) -> Result<i64> {
    required(row.i64("cnt")?, "cnt")
}

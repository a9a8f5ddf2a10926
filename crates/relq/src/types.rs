//! Core types for relq: messages going in, claimed messages coming out, and quarantined records.
//!
//! ## What
//!
//! - [`NewMessage`] is what a producer hands to [`Queue::send`](crate::Queue::send).
//! - [`ReceivedMessage`] is a claimed row as seen by a worker.
//! - [`ErrorRecord`] is a message moved to the error store.
//! - [`ResetRecord`] reports one claim reclaimed by the heartbeat monitor.
//!
//! ### Example
//!
//! ```rust
//! use relq::types::NewMessage;
//! use std::time::Duration;
//!
//! let msg = NewMessage::new(b"resize:42".to_vec())
//!     .with_priority(1)
//!     .with_delay(Duration::from_secs(30))
//!     .with_header("tenant", "acme");
//! assert_eq!(msg.priority, Some(1));
//! ```

use crate::codec::{JsonCodec, PayloadCodec};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use tabled::Tabled;
use uuid::Uuid;

/// Store-assigned message identifier.
pub type QueueId = i64;

/// Key/value metadata travelling with a message.
pub type Headers = BTreeMap<String, String>;

/// Claim state of a message.
///
/// `Error` is never stored in the message table; it is reported for ids that live in the
/// error store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Waiting,
    Processing,
    Error,
}

impl MessageStatus {
    pub fn code(self) -> i64 {
        match self {
            MessageStatus::Waiting => 0,
            MessageStatus::Processing => 1,
            MessageStatus::Error => 2,
        }
    }

    pub fn from_code(code: i64) -> Result<Self> {
        match code {
            0 => Ok(MessageStatus::Waiting),
            1 => Ok(MessageStatus::Processing),
            2 => Ok(MessageStatus::Error),
            other => Err(Error::Internal {
                message: format!("Unknown message status code {}", other),
            }),
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageStatus::Waiting => write!(f, "waiting"),
            MessageStatus::Processing => write!(f, "processing"),
            MessageStatus::Error => write!(f, "error"),
        }
    }
}

/// Value of a caller-defined additional column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ColumnValue {
    Null,
    Bool(bool),
    Integer(i64),
    Real(f64),
    Text(String),
}

impl fmt::Display for ColumnValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnValue::Null => write!(f, "NULL"),
            ColumnValue::Bool(v) => write!(f, "{}", v),
            ColumnValue::Integer(v) => write!(f, "{}", v),
            ColumnValue::Real(v) => write!(f, "{}", v),
            ColumnValue::Text(v) => write!(f, "{}", v),
        }
    }
}

/// A message to enqueue.
///
/// Optional fields only take effect when the queue enabled the matching feature; setting one
/// on a queue without the feature is rejected at send time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewMessage {
    pub payload: Vec<u8>,
    pub headers: Headers,
    pub priority: Option<i64>,
    pub delay: Option<Duration>,
    /// Time to live, measured from enqueue.
    pub expiration: Option<Duration>,
    pub route: Option<String>,
    pub correlation_id: Option<Uuid>,
    pub source_queue_id: Option<QueueId>,
    pub columns: BTreeMap<String, ColumnValue>,
}

impl NewMessage {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            ..Default::default()
        }
    }

    /// Encode `body` with the default JSON codec.
    pub fn json<T: Serialize>(body: &T) -> Result<Self> {
        let value = serde_json::to_value(body)?;
        Ok(Self::new(JsonCodec.encode(&value)?))
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_expiration(mut self, ttl: Duration) -> Self {
        self.expiration = Some(ttl);
        self
    }

    pub fn with_route(mut self, route: impl Into<String>) -> Self {
        self.route = Some(route.into());
        self
    }

    pub fn with_correlation_id(mut self, id: Uuid) -> Self {
        self.correlation_id = Some(id);
        self
    }

    /// Mark this message as a reply to `queue_id`.
    pub fn with_source_queue_id(mut self, queue_id: QueueId) -> Self {
        self.source_queue_id = Some(queue_id);
        self
    }

    pub fn with_column(mut self, name: impl Into<String>, value: ColumnValue) -> Self {
        self.columns.insert(name.into(), value);
        self
    }
}

/// A message row as read from the message table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceivedMessage {
    pub queue_id: QueueId,
    pub payload: Vec<u8>,
    pub headers: Headers,
    pub status: MessageStatus,
    pub priority: Option<i64>,
    pub heartbeat: Option<DateTime<Utc>>,
    pub queue_process_time: Option<DateTime<Utc>>,
    pub expiration_time: Option<DateTime<Utc>>,
    pub route: Option<String>,
    pub correlation_id: String,
    pub source_queue_id: Option<QueueId>,
    pub retry_count: u32,
    pub enqueued_at: DateTime<Utc>,
    pub columns: BTreeMap<String, ColumnValue>,
}

impl ReceivedMessage {
    /// Decode the payload as JSON into `T`.
    ///
    /// Decoding failures are poison: the payload will never decode on a later attempt.
    pub fn body<T: DeserializeOwned>(&self) -> Result<T> {
        self.body_with(&JsonCodec)
    }

    pub fn body_with<T: DeserializeOwned>(&self, codec: &dyn PayloadCodec) -> Result<T> {
        let value = codec.decode(&self.payload)?;
        serde_json::from_value(value).map_err(|e| Error::Poison {
            reason: format!("payload of message {} does not match: {}", self.queue_id, e),
        })
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }
}

impl fmt::Display for ReceivedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ReceivedMessage {{ queue_id: {}, status: {}, retry_count: {}, enqueued_at: {}, payload: {} bytes }}",
            self.queue_id,
            self.status,
            self.retry_count,
            self.enqueued_at,
            self.payload.len()
        )
    }
}

/// Why a message ended up in the error store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The message could not be processed at all.
    Poison,
    /// The retry budget ran out.
    RetriesExhausted,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Poison => "poison",
            ErrorKind::RetriesExhausted => "retries_exhausted",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "poison" => Ok(ErrorKind::Poison),
            "retries_exhausted" => Ok(ErrorKind::RetriesExhausted),
            other => Err(Error::Internal {
                message: format!("Unknown error kind '{}'", other),
            }),
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A quarantined message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub error_id: i64,
    pub queue_id: QueueId,
    pub payload: Vec<u8>,
    pub headers: Headers,
    pub route: Option<String>,
    pub correlation_id: String,
    pub retry_count: u32,
    pub enqueued_at: DateTime<Utc>,
    pub kind: ErrorKind,
    pub exception: String,
    pub failed_at: DateTime<Utc>,
}

impl Tabled for ErrorRecord {
    const LENGTH: usize = 7;

    fn fields(&self) -> Vec<Cow<'_, str>> {
        vec![
            self.error_id.to_string().into(),
            self.queue_id.to_string().into(),
            self.kind.to_string().into(),
            self.retry_count.to_string().into(),
            self.failed_at.to_rfc3339().into(),
            self.exception.clone().into(),
            format!("{} bytes", self.payload.len()).into(),
        ]
    }

    fn headers() -> Vec<Cow<'static, str>> {
        vec![
            "error_id",
            "queue_id",
            "kind",
            "retry_count",
            "failed_at",
            "exception",
            "payload",
        ]
        .into_iter()
        .map(Cow::from)
        .collect()
    }
}

/// A claim reclaimed by the heartbeat monitor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Tabled)]
pub struct ResetRecord {
    pub queue_id: QueueId,
    /// The stale heartbeat the claim was reset from.
    pub heartbeat: DateTime<Utc>,
}

/// Message counts for one queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Tabled)]
pub struct QueueStats {
    pub queue: String,
    pub waiting: i64,
    pub processing: i64,
    pub errors: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn received(payload: &[u8]) -> ReceivedMessage {
        ReceivedMessage {
            queue_id: 7,
            payload: payload.to_vec(),
            headers: Headers::new(),
            status: MessageStatus::Processing,
            priority: None,
            heartbeat: None,
            queue_process_time: None,
            expiration_time: None,
            route: None,
            correlation_id: Uuid::new_v4().to_string(),
            source_queue_id: None,
            retry_count: 0,
            enqueued_at: Utc::now(),
            columns: BTreeMap::new(),
        }
    }

    #[test]
    fn test_status_codes() {
        for status in [
            MessageStatus::Waiting,
            MessageStatus::Processing,
            MessageStatus::Error,
        ] {
            assert_eq!(MessageStatus::from_code(status.code()).unwrap(), status);
        }
        assert!(MessageStatus::from_code(9).is_err());
    }

    #[test]
    fn test_body_decodes_json() {
        #[derive(Deserialize, PartialEq, Debug)]
        struct Job {
            id: u32,
        }
        let msg = received(br#"{"id": 3}"#);
        assert_eq!(msg.body::<Job>().unwrap(), Job { id: 3 });
    }

    #[test]
    fn test_body_failures_are_poison() {
        #[derive(Deserialize, Debug)]
        #[allow(dead_code)]
        struct Job {
            id: u32,
        }
        assert!(received(b"not json").body::<Job>().unwrap_err().is_poison());
        assert!(received(br#"{"name": "x"}"#)
            .body::<Job>()
            .unwrap_err()
            .is_poison());
    }

    #[test]
    fn test_new_message_json() {
        let msg = NewMessage::json(&serde_json::json!({"k": 1}))
            .unwrap()
            .with_route("emails");
        assert_eq!(msg.route.as_deref(), Some("emails"));
        let value: serde_json::Value = serde_json::from_slice(&msg.payload).unwrap();
        assert_eq!(value["k"], 1);
    }

    #[test]
    fn test_error_kind_parse() {
        assert_eq!(ErrorKind::parse("poison").unwrap(), ErrorKind::Poison);
        assert_eq!(
            ErrorKind::parse(ErrorKind::RetriesExhausted.as_str()).unwrap(),
            ErrorKind::RetriesExhausted
        );
        assert!(ErrorKind::parse("other").is_err());
    }
}

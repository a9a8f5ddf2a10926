//! Per-claim worker state.

use crate::store::ConnectionScope;
use crate::types::{QueueId, ReceivedMessage};
use chrono::{DateTime, Utc};
use std::fmt;

/// A claimed message plus everything commit, rollback and heartbeat renewal need to know
/// about the claim.
///
/// In held-transaction mode the context owns the open transaction. Commit and rollback take
/// it out, so a second call finds nothing to reuse.
pub struct MessageContext {
    message: ReceivedMessage,
    heartbeat: Option<DateTime<Utc>>,
    scope: Option<Box<dyn ConnectionScope>>,
    resolved: bool,
}

impl MessageContext {
    pub(crate) fn new(message: ReceivedMessage, scope: Option<Box<dyn ConnectionScope>>) -> Self {
        Self {
            heartbeat: message.heartbeat,
            message,
            scope,
            resolved: false,
        }
    }

    pub fn message(&self) -> &ReceivedMessage {
        &self.message
    }

    pub fn into_message(self) -> ReceivedMessage {
        self.message
    }

    pub fn queue_id(&self) -> QueueId {
        self.message.queue_id
    }

    /// Last heartbeat this worker wrote for the claim.
    pub fn heartbeat(&self) -> Option<DateTime<Utc>> {
        self.heartbeat
    }

    pub(crate) fn set_heartbeat(&mut self, heartbeat: DateTime<Utc>) {
        self.heartbeat = Some(heartbeat);
    }

    pub fn holds_transaction(&self) -> bool {
        self.scope.is_some()
    }

    pub(crate) fn take_scope(&mut self) -> Option<Box<dyn ConnectionScope>> {
        self.scope.take()
    }

    /// Whether commit, rollback or quarantine already ran for this claim.
    pub fn is_resolved(&self) -> bool {
        self.resolved
    }

    pub(crate) fn mark_resolved(&mut self) {
        self.resolved = true;
    }
}

impl fmt::Debug for MessageContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageContext")
            .field("queue_id", &self.message.queue_id)
            .field("heartbeat", &self.heartbeat)
            .field("holds_transaction", &self.scope.is_some())
            .field("resolved", &self.resolved)
            .finish()
    }
}

//! Per-queue feature flags.
//!
//! [`TransportOptions`] decides which columns exist in a queue's tables and which branches of
//! the receive/commit/rollback protocol apply. Options are validated once, when the queue is
//! built, against the [`Capabilities`] of the backend; they are read-only afterwards.

use crate::config::validate_identifier;
use crate::error::{Error, Result};
use crate::store::Capabilities;
use crate::types::{ColumnValue, NewMessage};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// Column names owned by the queue itself.
pub(crate) const BUILTIN_COLUMNS: &[&str] = &[
    "queue_id",
    "payload",
    "headers",
    "status",
    "priority",
    "heartbeat",
    "queue_process_time",
    "expiration_time",
    "route",
    "correlation_id",
    "source_queue_id",
    "retry_count",
    "enqueued_at",
];

const MAX_COLUMN_NAME_LEN: usize = 63;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Integer,
    Real,
    Text,
    Boolean,
}

/// A caller-defined column on the message table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ColumnType,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
}

fn default_nullable() -> bool {
    true
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, kind: ColumnType) -> Self {
        Self {
            name: name.into(),
            kind,
            nullable: true,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    fn accepts(&self, value: &ColumnValue) -> bool {
        matches!(
            (self.kind, value),
            (_, ColumnValue::Null)
                | (ColumnType::Integer, ColumnValue::Integer(_))
                | (ColumnType::Real, ColumnValue::Real(_))
                | (ColumnType::Real, ColumnValue::Integer(_))
                | (ColumnType::Text, ColumnValue::Text(_))
                | (ColumnType::Boolean, ColumnValue::Bool(_))
        ) && (self.nullable || *value != ColumnValue::Null)
    }
}

/// Feature flags for one queue. Every flag defaults to off.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportOptions {
    /// Messages carry `queue_process_time`; receive skips rows not yet visible.
    pub enable_delayed_processing: bool,
    /// Claims carry a heartbeat that workers renew and the heartbeat monitor inspects.
    pub enable_heartbeat: bool,
    /// The receive transaction stays open, holding a row lock, until commit or rollback.
    pub enable_hold_transaction_until_message_committed: bool,
    /// Messages carry a status column; a claim flips it to processing.
    pub enable_status: bool,
    /// Maintain a separate status table for readers outside the claim path.
    pub enable_status_table: bool,
    pub enable_priority: bool,
    pub enable_message_expiration: bool,
    pub enable_route: bool,
    /// Default route filter for receive. Empty means any route.
    pub routes: Vec<String>,
    pub additional_columns: Vec<ColumnDef>,
}

impl TransportOptions {
    /// Options for the common non-held mode: status, heartbeat, delay, priority and expiration.
    pub fn standard() -> Self {
        Self {
            enable_delayed_processing: true,
            enable_heartbeat: true,
            enable_status: true,
            enable_priority: true,
            enable_message_expiration: true,
            ..Default::default()
        }
    }

    /// Options for held-transaction mode.
    pub fn held() -> Self {
        Self {
            enable_hold_transaction_until_message_committed: true,
            enable_delayed_processing: true,
            enable_priority: true,
            enable_message_expiration: true,
            ..Default::default()
        }
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| Error::InvalidConfig {
            field: "options".to_string(),
            message: format!("Failed to read options file '{}': {}", path.display(), e),
        })?;
        serde_yaml::from_str(&content).map_err(|e| Error::InvalidConfig {
            field: "options".to_string(),
            message: format!("Failed to parse options YAML: {}", e),
        })
    }

    pub fn held_mode(&self) -> bool {
        self.enable_hold_transaction_until_message_committed
    }

    /// Whether a claimed row stays in the table until commit.
    ///
    /// Without status or held mode the claim itself removes the row.
    pub fn claim_keeps_row(&self) -> bool {
        self.enable_status || self.held_mode()
    }

    /// Whether a non-held rollback has anything to undo.
    pub fn rollback_applies(&self) -> bool {
        self.enable_delayed_processing || self.enable_heartbeat || self.enable_status
    }

    /// Reject flag combinations that cannot work, or that the backend cannot serve.
    pub fn validate(&self, caps: &Capabilities) -> Result<()> {
        let invalid = |option: &str, message: &str| {
            Err(Error::InvalidOptions {
                option: option.to_string(),
                message: message.to_string(),
            })
        };

        if self.enable_heartbeat && !self.enable_status {
            return invalid("enable_heartbeat", "requires enable_status");
        }
        if self.held_mode() {
            if !caps.row_locks {
                return invalid(
                    "enable_hold_transaction_until_message_committed",
                    "backend does not support row locks held across statements",
                );
            }
            if self.enable_heartbeat {
                return invalid(
                    "enable_heartbeat",
                    "held-transaction claims are guarded by the open transaction, not a heartbeat",
                );
            }
        } else if self.enable_status_table && !self.enable_status {
            return invalid(
                "enable_status_table",
                "requires enable_status unless held-transaction mode is on",
            );
        }
        if self.enable_priority && !caps.priority {
            return invalid("enable_priority", "backend does not support priority ordering");
        }
        if !self.routes.is_empty() {
            if !self.enable_route {
                return invalid("routes", "requires enable_route");
            }
            if self.routes.iter().any(|r| r.is_empty()) {
                return invalid("routes", "route names cannot be empty");
            }
        }

        let mut seen = HashSet::new();
        for column in &self.additional_columns {
            validate_identifier("additional_columns", &column.name, MAX_COLUMN_NAME_LEN).map_err(
                |e| Error::InvalidOptions {
                    option: "additional_columns".to_string(),
                    message: e.to_string(),
                },
            )?;
            let lower = column.name.to_ascii_lowercase();
            if BUILTIN_COLUMNS.contains(&lower.as_str()) {
                return Err(Error::InvalidOptions {
                    option: "additional_columns".to_string(),
                    message: format!("'{}' is a built-in column", column.name),
                });
            }
            if !seen.insert(lower) {
                return Err(Error::InvalidOptions {
                    option: "additional_columns".to_string(),
                    message: format!("'{}' is defined more than once", column.name),
                });
            }
        }
        Ok(())
    }

    /// Reject message fields that this queue has no column for.
    pub fn check_message(&self, msg: &NewMessage) -> Result<()> {
        let disabled = |option: &str, field: &str| {
            Err(Error::InvalidOptions {
                option: option.to_string(),
                message: format!("message sets {} but the queue does not enable it", field),
            })
        };

        if msg.priority.is_some() && !self.enable_priority {
            return disabled("enable_priority", "priority");
        }
        if msg.delay.is_some() && !self.enable_delayed_processing {
            return disabled("enable_delayed_processing", "delay");
        }
        if msg.expiration.is_some() && !self.enable_message_expiration {
            return disabled("enable_message_expiration", "expiration");
        }
        if msg.route.is_some() && !self.enable_route {
            return disabled("enable_route", "route");
        }

        for (name, value) in &msg.columns {
            let Some(def) = self.additional_columns.iter().find(|c| &c.name == name) else {
                return Err(Error::InvalidOptions {
                    option: "additional_columns".to_string(),
                    message: format!("unknown column '{}'", name),
                });
            };
            if !def.accepts(value) {
                return Err(Error::InvalidOptions {
                    option: "additional_columns".to_string(),
                    message: format!("value {} does not fit column '{}'", value, name),
                });
            }
        }
        if let Some(def) = self
            .additional_columns
            .iter()
            .find(|c| !c.nullable && !msg.columns.contains_key(&c.name))
        {
            return Err(Error::InvalidOptions {
                option: "additional_columns".to_string(),
                message: format!("column '{}' requires a value", def.name),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const ALL: Capabilities = Capabilities {
        row_locks: true,
        skip_locked: true,
        priority: true,
    };
    const NO_LOCKS: Capabilities = Capabilities {
        row_locks: false,
        skip_locked: false,
        priority: true,
    };

    fn option_of(err: Error) -> String {
        match err {
            Error::InvalidOptions { option, .. } => option,
            other => panic!("expected InvalidOptions, got {:?}", other),
        }
    }

    #[test]
    fn test_presets_are_valid() {
        assert!(TransportOptions::default().validate(&NO_LOCKS).is_ok());
        assert!(TransportOptions::standard().validate(&NO_LOCKS).is_ok());
        assert!(TransportOptions::held().validate(&ALL).is_ok());
    }

    #[test]
    fn test_heartbeat_requires_status() {
        let opts = TransportOptions {
            enable_heartbeat: true,
            ..Default::default()
        };
        assert_eq!(option_of(opts.validate(&ALL).unwrap_err()), "enable_heartbeat");
    }

    #[test]
    fn test_held_requires_row_locks() {
        let err = TransportOptions::held().validate(&NO_LOCKS).unwrap_err();
        assert_eq!(
            option_of(err),
            "enable_hold_transaction_until_message_committed"
        );
    }

    #[test]
    fn test_held_rejects_heartbeat() {
        let opts = TransportOptions {
            enable_status: true,
            enable_heartbeat: true,
            ..TransportOptions::held()
        };
        assert_eq!(option_of(opts.validate(&ALL).unwrap_err()), "enable_heartbeat");
    }

    #[test]
    fn test_status_table_needs_status_when_not_held() {
        let opts = TransportOptions {
            enable_status_table: true,
            ..Default::default()
        };
        assert_eq!(option_of(opts.validate(&ALL).unwrap_err()), "enable_status_table");
        let held = TransportOptions {
            enable_status_table: true,
            ..TransportOptions::held()
        };
        assert!(held.validate(&ALL).is_ok());
    }

    #[test]
    fn test_routes_require_flag() {
        let opts = TransportOptions {
            routes: vec!["emails".into()],
            ..Default::default()
        };
        assert_eq!(option_of(opts.validate(&ALL).unwrap_err()), "routes");
    }

    #[test]
    fn test_additional_columns() {
        let mut opts = TransportOptions {
            additional_columns: vec![ColumnDef::new("tenant", ColumnType::Text)],
            ..Default::default()
        };
        assert!(opts.validate(&ALL).is_ok());

        opts.additional_columns
            .push(ColumnDef::new("Tenant", ColumnType::Integer));
        assert!(opts.validate(&ALL).is_err());

        opts.additional_columns = vec![ColumnDef::new("heartbeat", ColumnType::Text)];
        assert!(opts.validate(&ALL).is_err());

        opts.additional_columns = vec![ColumnDef::new("bad name", ColumnType::Text)];
        assert!(opts.validate(&ALL).is_err());
    }

    #[test]
    fn test_check_message() {
        let opts = TransportOptions {
            enable_priority: true,
            additional_columns: vec![ColumnDef::new("tenant", ColumnType::Text).not_null()],
            ..Default::default()
        };
        let ok = NewMessage::new(b"x".to_vec())
            .with_priority(2)
            .with_column("tenant", ColumnValue::Text("acme".into()));
        assert!(opts.check_message(&ok).is_ok());

        let delayed = ok.clone().with_delay(Duration::from_secs(1));
        assert_eq!(
            option_of(opts.check_message(&delayed).unwrap_err()),
            "enable_delayed_processing"
        );

        let missing = NewMessage::new(b"x".to_vec());
        assert!(opts.check_message(&missing).is_err());

        let wrong_type = NewMessage::new(b"x".to_vec())
            .with_column("tenant", ColumnValue::Integer(3));
        assert!(opts.check_message(&wrong_type).is_err());

        let unknown = ok.with_column("region", ColumnValue::Text("eu".into()));
        assert!(opts.check_message(&unknown).is_err());
    }

    #[test]
    fn test_options_yaml() {
        let yaml = "enable_status: true\nenable_heartbeat: true\nadditional_columns:\n  - name: tenant\n    type: text\n";
        let opts: TransportOptions = serde_yaml::from_str(yaml).unwrap();
        assert!(opts.enable_heartbeat);
        assert!(!opts.enable_priority);
        assert_eq!(opts.additional_columns[0].kind, ColumnType::Text);
        assert!(opts.additional_columns[0].nullable);
    }
}

//! SQL commands for one queue, rendered per dialect and memoised per queue instance.
//!
//! Every statement the lifecycle issues is built here from the queue's
//! [`TransportOptions`]. A [`Command`] carries its SQL text plus the ordered list of [`Arg`]s
//! its placeholders stand for, so callers bind values by meaning and the adapter binds them
//! by position.

use crate::error::{Error, Result};
use crate::options::{ColumnType, TransportOptions};
use crate::store::QueryParam;
use crate::types::MessageStatus;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// SQL flavour of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dialect {
    Postgres,
    Sqlite,
}

impl Dialect {
    /// Numbered placeholder for the `n`th (1-based) parameter.
    pub fn placeholder(&self, n: usize) -> String {
        match self {
            Dialect::Postgres => format!("${}", n),
            Dialect::Sqlite => format!("?{}", n),
        }
    }

    pub(crate) fn id_column(&self) -> &'static str {
        match self {
            Dialect::Postgres => "BIGSERIAL PRIMARY KEY",
            Dialect::Sqlite => "INTEGER PRIMARY KEY AUTOINCREMENT",
        }
    }

    pub(crate) fn bytes_type(&self) -> &'static str {
        match self {
            Dialect::Postgres => "BYTEA",
            Dialect::Sqlite => "BLOB",
        }
    }

    pub(crate) fn timestamp_type(&self) -> &'static str {
        match self {
            Dialect::Postgres => "TIMESTAMPTZ",
            Dialect::Sqlite => "TEXT",
        }
    }

    pub(crate) fn integer_type(&self) -> &'static str {
        match self {
            Dialect::Postgres => "BIGINT",
            Dialect::Sqlite => "INTEGER",
        }
    }

    pub(crate) fn column_type(&self, kind: ColumnType) -> &'static str {
        match (self, kind) {
            (_, ColumnType::Integer) => self.integer_type(),
            (Dialect::Postgres, ColumnType::Real) => "DOUBLE PRECISION",
            (Dialect::Sqlite, ColumnType::Real) => "REAL",
            (_, ColumnType::Text) => "TEXT",
            (Dialect::Postgres, ColumnType::Boolean) => "BOOLEAN",
            (Dialect::Sqlite, ColumnType::Boolean) => "INTEGER",
        }
    }

    fn skip_locked(&self) -> &'static str {
        match self {
            Dialect::Postgres => " FOR UPDATE SKIP LOCKED",
            Dialect::Sqlite => "",
        }
    }
}

/// Quote an identifier that has already passed identifier validation.
pub(crate) fn quote(ident: &str) -> String {
    format!("\"{}\"", ident)
}

/// Table names derived from a queue name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableNames {
    pub queue: String,
    pub messages: String,
    pub status: String,
    pub errors: String,
}

impl TableNames {
    pub fn new(queue: &str) -> Self {
        Self {
            queue: queue.to_string(),
            messages: format!("{}_messages", queue),
            status: format!("{}_status", queue),
            errors: format!("{}_errors", queue),
        }
    }
}

/// What a placeholder stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arg {
    Now,
    QueueId,
    /// Heartbeat value being written.
    Heartbeat,
    /// Heartbeat value the row must still hold.
    ExpectedHeartbeat,
    /// New `queue_process_time` after a delayed rollback.
    ProcessTime,
    /// Claims with a heartbeat older than this are stale.
    StaleBefore,
    Route(usize),
    Payload,
    Headers,
    Priority,
    VisibleAt,
    ExpirationTime,
    MessageRoute,
    CorrelationId,
    SourceQueueId,
    RetryCount,
    EnqueuedAt,
    Column(usize),
    ErrorId,
    ErrorKind,
    Exception,
    FailedAt,
    OlderThan,
    Limit,
    Offset,
}

/// Cache key of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Insert,
    InsertStatusRow,
    SetStatusRow(MessageStatus),
    DeleteStatusRow,
    PruneStatusRows,
    GetStatusRow,
    /// Non-held claim of the next eligible row (or of one id).
    Claim { routes: usize, by_id: bool },
    /// Held-transaction select of the next eligible row (or of one id).
    HeldSelect { routes: usize, by_id: bool },
    DeleteMessage,
    ResetClaim {
        check_heartbeat: bool,
        advance_process_time: bool,
        count_failure: bool,
    },
    /// Count a failed held-transaction attempt after its transaction rolled back. Skips the
    /// row if another claimant already holds it.
    RecordFailure { advance_process_time: bool },
    RenewHeartbeat,
    FindStale,
    DeleteExpired,
    GetMessage,
    CountMessages,
    CountByStatus(MessageStatus),
    InsertError,
    ListErrors,
    GetError,
    CountErrors,
    CountErrorsForMessage,
    PurgeErrors,
    PurgeErrorsOlderThan,
    FindErrorsToDelete,
    DeleteError,
    Schema,
}

/// A rendered statement and the meaning of each of its placeholders, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub kind: CommandKind,
    pub sql: String,
    pub args: Vec<Arg>,
}

impl Command {
    /// A statement without parameters (DDL).
    pub fn raw(kind: CommandKind, sql: impl Into<String>) -> Self {
        Self {
            kind,
            sql: sql.into(),
            args: Vec::new(),
        }
    }

    /// Produce the positional parameters by asking `value` for each placeholder in order.
    pub fn bind<F>(&self, mut value: F) -> Result<Vec<QueryParam>>
    where
        F: FnMut(&Arg) -> Option<QueryParam>,
    {
        self.args
            .iter()
            .map(|arg| {
                value(arg).ok_or_else(|| Error::Internal {
                    message: format!("no value for {:?} in {:?}", arg, self.kind),
                })
            })
            .collect()
    }
}

/// Statement text under construction.
struct Sql {
    dialect: Dialect,
    text: String,
    args: Vec<Arg>,
}

impl Sql {
    fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            text: String::new(),
            args: Vec::new(),
        }
    }

    fn push(&mut self, s: &str) -> &mut Self {
        self.text.push_str(s);
        self
    }

    /// Append a placeholder for `arg`.
    fn arg(&mut self, arg: Arg) -> &mut Self {
        self.args.push(arg);
        let placeholder = self.dialect.placeholder(self.args.len());
        self.text.push_str(&placeholder);
        self
    }

    fn finish(self, kind: CommandKind) -> Command {
        Command {
            kind,
            sql: self.text,
            args: self.args,
        }
    }
}

const WAITING: i64 = 0;
const PROCESSING: i64 = 1;

/// Renders commands for one queue.
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    dialect: Dialect,
    tables: TableNames,
    options: TransportOptions,
}

impl CommandBuilder {
    pub fn new(dialect: Dialect, tables: TableNames, options: TransportOptions) -> Self {
        Self {
            dialect,
            tables,
            options,
        }
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn tables(&self) -> &TableNames {
        &self.tables
    }

    pub fn options(&self) -> &TransportOptions {
        &self.options
    }

    fn messages(&self) -> String {
        quote(&self.tables.messages)
    }

    fn status_table(&self) -> String {
        quote(&self.tables.status)
    }

    fn errors(&self) -> String {
        quote(&self.tables.errors)
    }

    /// Columns read back for a message, in table order.
    pub fn message_columns(&self) -> Vec<String> {
        let o = &self.options;
        let mut cols: Vec<String> = vec!["queue_id".into(), "payload".into(), "headers".into()];
        let optional = [
            (o.enable_status, "status"),
            (o.enable_priority, "priority"),
            (o.enable_heartbeat, "heartbeat"),
            (o.enable_delayed_processing, "queue_process_time"),
            (o.enable_message_expiration, "expiration_time"),
            (o.enable_route, "route"),
        ];
        cols.extend(
            optional
                .iter()
                .filter(|(on, _)| *on)
                .map(|(_, name)| name.to_string()),
        );
        cols.extend(
            ["correlation_id", "source_queue_id", "retry_count", "enqueued_at"]
                .iter()
                .map(|s| s.to_string()),
        );
        cols.extend(self.options.additional_columns.iter().map(|c| quote(&c.name)));
        cols
    }

    fn select_list(&self) -> String {
        self.message_columns().join(", ")
    }

    /// `WHERE` clause selecting rows a receive may claim.
    fn eligible(&self, sql: &mut Sql, routes: usize, by_id: bool) {
        let o = &self.options;
        let mut first = true;
        let mut and = |sql: &mut Sql| {
            sql.push(if first { " WHERE " } else { " AND " });
            first = false;
        };

        if by_id {
            and(sql);
            sql.push("queue_id = ").arg(Arg::QueueId);
        }
        if o.enable_status {
            and(sql);
            sql.push(&format!("status = {}", WAITING));
        }
        if o.enable_delayed_processing {
            and(sql);
            sql.push("queue_process_time <= ").arg(Arg::Now);
        }
        if o.enable_message_expiration {
            and(sql);
            sql.push("(expiration_time IS NULL OR expiration_time > ")
                .arg(Arg::Now)
                .push(")");
        }
        if routes > 0 {
            and(sql);
            sql.push("route IN (");
            for i in 0..routes {
                if i > 0 {
                    sql.push(", ");
                }
                sql.arg(Arg::Route(i));
            }
            sql.push(")");
        }
    }

    fn order_by(&self) -> String {
        let mut keys = Vec::new();
        if self.options.enable_priority {
            keys.push("priority ASC");
        }
        if self.options.enable_delayed_processing {
            keys.push("queue_process_time ASC");
        }
        keys.push("queue_id ASC");
        format!(" ORDER BY {}", keys.join(", "))
    }

    /// Subquery picking the single best eligible row.
    fn next_eligible(&self, sql: &mut Sql, routes: usize) {
        sql.push(&format!("(SELECT queue_id FROM {}", self.messages()));
        self.eligible(sql, routes, false);
        sql.push(&self.order_by());
        sql.push(" LIMIT 1");
        sql.push(self.dialect.skip_locked());
        sql.push(")");
    }

    pub fn build(&self, kind: CommandKind) -> Command {
        let mut sql = Sql::new(self.dialect);
        let o = &self.options;
        match kind {
            CommandKind::Insert => {
                let mut cols: Vec<(String, Arg)> = vec![
                    ("payload".into(), Arg::Payload),
                    ("headers".into(), Arg::Headers),
                ];
                if o.enable_priority {
                    cols.push(("priority".into(), Arg::Priority));
                }
                if o.enable_delayed_processing {
                    cols.push(("queue_process_time".into(), Arg::VisibleAt));
                }
                if o.enable_message_expiration {
                    cols.push(("expiration_time".into(), Arg::ExpirationTime));
                }
                if o.enable_route {
                    cols.push(("route".into(), Arg::MessageRoute));
                }
                cols.push(("correlation_id".into(), Arg::CorrelationId));
                cols.push(("source_queue_id".into(), Arg::SourceQueueId));
                cols.push(("enqueued_at".into(), Arg::EnqueuedAt));
                for (i, c) in o.additional_columns.iter().enumerate() {
                    cols.push((quote(&c.name), Arg::Column(i)));
                }

                let names: Vec<&str> = cols.iter().map(|(n, _)| n.as_str()).collect();
                sql.push(&format!(
                    "INSERT INTO {} ({}) VALUES (",
                    self.messages(),
                    names.join(", ")
                ));
                for (i, (_, arg)) in cols.iter().enumerate() {
                    if i > 0 {
                        sql.push(", ");
                    }
                    sql.arg(*arg);
                }
                sql.push(") RETURNING queue_id");
            }
            CommandKind::InsertStatusRow => {
                sql.push(&format!(
                    "INSERT INTO {} (queue_id, status) VALUES (",
                    self.status_table()
                ))
                .arg(Arg::QueueId)
                .push(&format!(", {})", WAITING));
            }
            CommandKind::SetStatusRow(status) => {
                sql.push(&format!(
                    "INSERT INTO {} (queue_id, status) VALUES (",
                    self.status_table()
                ))
                .arg(Arg::QueueId)
                .push(&format!(
                    ", {}) ON CONFLICT (queue_id) DO UPDATE SET status = excluded.status",
                    status.code()
                ));
            }
            CommandKind::DeleteStatusRow => {
                sql.push(&format!("DELETE FROM {} WHERE queue_id = ", self.status_table()))
                    .arg(Arg::QueueId);
            }
            CommandKind::PruneStatusRows => {
                sql.push(&format!(
                    "DELETE FROM {} WHERE queue_id NOT IN (SELECT queue_id FROM {})",
                    self.status_table(),
                    self.messages()
                ));
            }
            CommandKind::GetStatusRow => {
                sql.push(&format!("SELECT status FROM {} WHERE queue_id = ", self.status_table()))
                    .arg(Arg::QueueId);
            }
            CommandKind::Claim { routes, by_id } => {
                if o.enable_status {
                    sql.push(&format!(
                        "UPDATE {} SET status = {}",
                        self.messages(),
                        PROCESSING
                    ));
                    if o.enable_heartbeat {
                        sql.push(", heartbeat = ").arg(Arg::Heartbeat);
                    }
                } else {
                    sql.push(&format!("DELETE FROM {}", self.messages()));
                }
                if by_id {
                    self.eligible(&mut sql, routes, true);
                } else {
                    sql.push(" WHERE queue_id = ");
                    self.next_eligible(&mut sql, routes);
                    if o.enable_status {
                        sql.push(&format!(" AND status = {}", WAITING));
                    }
                }
                sql.push(&format!(" RETURNING {}", self.select_list()));
            }
            CommandKind::HeldSelect { routes, by_id } => {
                sql.push(&format!("SELECT {} FROM {}", self.select_list(), self.messages()));
                self.eligible(&mut sql, routes, by_id);
                sql.push(&self.order_by());
                sql.push(" LIMIT 1");
                sql.push(self.dialect.skip_locked());
            }
            CommandKind::DeleteMessage => {
                sql.push(&format!("DELETE FROM {} WHERE queue_id = ", self.messages()))
                    .arg(Arg::QueueId);
            }
            CommandKind::ResetClaim {
                check_heartbeat,
                advance_process_time,
                count_failure,
            } => {
                sql.push(&format!("UPDATE {} SET status = {}", self.messages(), WAITING));
                if o.enable_heartbeat {
                    sql.push(", heartbeat = NULL");
                }
                if advance_process_time && o.enable_delayed_processing {
                    sql.push(", queue_process_time = ").arg(Arg::ProcessTime);
                }
                if count_failure {
                    sql.push(", retry_count = retry_count + 1");
                }
                sql.push(" WHERE queue_id = ")
                    .arg(Arg::QueueId)
                    .push(&format!(" AND status = {}", PROCESSING));
                if check_heartbeat && o.enable_heartbeat {
                    sql.push(" AND heartbeat = ").arg(Arg::ExpectedHeartbeat);
                }
            }
            CommandKind::RenewHeartbeat => {
                sql.push(&format!("UPDATE {} SET heartbeat = ", self.messages()))
                    .arg(Arg::Heartbeat)
                    .push(" WHERE queue_id = ")
                    .arg(Arg::QueueId)
                    .push(&format!(" AND status = {} AND heartbeat = ", PROCESSING))
                    .arg(Arg::ExpectedHeartbeat);
            }
            CommandKind::FindStale => {
                sql.push(&format!(
                    "SELECT queue_id, heartbeat FROM {} WHERE status = {} AND heartbeat < ",
                    self.messages(),
                    PROCESSING
                ))
                .arg(Arg::StaleBefore)
                .push(" ORDER BY queue_id ASC");
            }
            CommandKind::DeleteExpired => {
                sql.push(&format!(
                    "DELETE FROM {} WHERE queue_id IN (SELECT queue_id FROM {} WHERE expiration_time <= ",
                    self.messages(),
                    self.messages()
                ))
                .arg(Arg::Now);
                if o.enable_status {
                    sql.push(&format!(" AND status = {}", WAITING));
                }
                sql.push(self.dialect.skip_locked());
                sql.push(") RETURNING queue_id");
            }
            CommandKind::RecordFailure {
                advance_process_time,
            } => {
                sql.push(&format!(
                    "UPDATE {} SET retry_count = retry_count + 1",
                    self.messages()
                ));
                if advance_process_time && o.enable_delayed_processing {
                    sql.push(", queue_process_time = ").arg(Arg::ProcessTime);
                }
                sql.push(&format!(
                    " WHERE queue_id IN (SELECT queue_id FROM {} WHERE queue_id = ",
                    self.messages()
                ))
                .arg(Arg::QueueId);
                sql.push(self.dialect.skip_locked());
                sql.push(")");
            }
            CommandKind::GetMessage => {
                sql.push(&format!(
                    "SELECT {} FROM {} WHERE queue_id = ",
                    self.select_list(),
                    self.messages()
                ))
                .arg(Arg::QueueId);
            }
            CommandKind::CountMessages => {
                sql.push(&format!("SELECT COUNT(*) AS cnt FROM {}", self.messages()));
            }
            CommandKind::CountByStatus(status) => {
                sql.push(&format!(
                    "SELECT COUNT(*) AS cnt FROM {} WHERE status = {}",
                    self.messages(),
                    status.code()
                ));
            }
            CommandKind::InsertError => {
                sql.push(&format!(
                    "INSERT INTO {} (queue_id, payload, headers, route, correlation_id, retry_count, enqueued_at, kind, exception, failed_at) VALUES (",
                    self.errors()
                ));
                let args = [
                    Arg::QueueId,
                    Arg::Payload,
                    Arg::Headers,
                    Arg::MessageRoute,
                    Arg::CorrelationId,
                    Arg::RetryCount,
                    Arg::EnqueuedAt,
                    Arg::ErrorKind,
                    Arg::Exception,
                    Arg::FailedAt,
                ];
                for (i, arg) in args.into_iter().enumerate() {
                    if i > 0 {
                        sql.push(", ");
                    }
                    sql.arg(arg);
                }
                sql.push(")");
            }
            CommandKind::ListErrors => {
                sql.push(&format!(
                    "SELECT {} FROM {} ORDER BY error_id ASC LIMIT ",
                    ERROR_COLUMNS,
                    self.errors()
                ))
                .arg(Arg::Limit)
                .push(" OFFSET ")
                .arg(Arg::Offset);
            }
            CommandKind::GetError => {
                sql.push(&format!(
                    "SELECT {} FROM {} WHERE error_id = ",
                    ERROR_COLUMNS,
                    self.errors()
                ))
                .arg(Arg::ErrorId);
            }
            CommandKind::CountErrors => {
                sql.push(&format!("SELECT COUNT(*) AS cnt FROM {}", self.errors()));
            }
            CommandKind::CountErrorsForMessage => {
                sql.push(&format!(
                    "SELECT COUNT(*) AS cnt FROM {} WHERE queue_id = ",
                    self.errors()
                ))
                .arg(Arg::QueueId);
            }
            CommandKind::PurgeErrors => {
                sql.push(&format!("DELETE FROM {}", self.errors()));
            }
            CommandKind::PurgeErrorsOlderThan => {
                sql.push(&format!("DELETE FROM {} WHERE failed_at < ", self.errors()))
                    .arg(Arg::OlderThan);
            }
            CommandKind::FindErrorsToDelete => {
                sql.push(&format!(
                    "SELECT error_id FROM {} WHERE failed_at < ",
                    self.errors()
                ))
                .arg(Arg::OlderThan)
                .push(" ORDER BY error_id ASC LIMIT ")
                .arg(Arg::Limit);
            }
            CommandKind::DeleteError => {
                sql.push(&format!("DELETE FROM {} WHERE error_id = ", self.errors()))
                    .arg(Arg::ErrorId);
            }
            CommandKind::Schema => {}
        }
        sql.finish(kind)
    }
}

pub(crate) const ERROR_COLUMNS: &str = "error_id, queue_id, payload, headers, route, correlation_id, retry_count, enqueued_at, kind, exception, failed_at";

/// Thread-safe memo of rendered commands, owned by one queue instance.
#[derive(Debug)]
pub struct CommandCache {
    builder: CommandBuilder,
    commands: RwLock<HashMap<CommandKind, Arc<Command>>>,
}

impl CommandCache {
    pub fn new(builder: CommandBuilder) -> Self {
        Self {
            builder,
            commands: RwLock::new(HashMap::new()),
        }
    }

    pub fn builder(&self) -> &CommandBuilder {
        &self.builder
    }

    pub fn get(&self, kind: CommandKind) -> Arc<Command> {
        if let Some(command) = self
            .commands
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&kind)
        {
            return Arc::clone(command);
        }

        let command = Arc::new(self.builder.build(kind));
        self.commands
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(kind)
            .or_insert(command)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.commands.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::ColumnDef;

    fn builder(dialect: Dialect, options: TransportOptions) -> CommandBuilder {
        CommandBuilder::new(dialect, TableNames::new("jobs"), options)
    }

    #[test]
    fn test_placeholders_follow_args() {
        let b = builder(Dialect::Postgres, TransportOptions::standard());
        let cmd = b.build(CommandKind::Claim {
            routes: 0,
            by_id: false,
        });
        for n in 1..=cmd.args.len() {
            assert!(cmd.sql.contains(&format!("${}", n)), "{}", cmd.sql);
        }
        assert!(!cmd.sql.contains(&format!("${}", cmd.args.len() + 1)));
        assert_eq!(cmd.args, vec![Arg::Heartbeat, Arg::Now, Arg::Now]);
    }

    #[test]
    fn test_claim_with_status_is_conditional_update() {
        let b = builder(Dialect::Postgres, TransportOptions::standard());
        let sql = b
            .build(CommandKind::Claim {
                routes: 0,
                by_id: false,
            })
            .sql;
        assert!(sql.starts_with("UPDATE \"jobs_messages\" SET status = 1, heartbeat = $1"));
        assert!(sql.contains("FOR UPDATE SKIP LOCKED"));
        assert!(sql.contains("ORDER BY priority ASC, queue_process_time ASC, queue_id ASC"));
        assert!(sql.contains(") AND status = 0 RETURNING"));
    }

    #[test]
    fn test_claim_without_status_deletes() {
        let b = builder(Dialect::Sqlite, TransportOptions::default());
        let cmd = b.build(CommandKind::Claim {
            routes: 0,
            by_id: false,
        });
        assert!(cmd.sql.starts_with("DELETE FROM \"jobs_messages\" WHERE queue_id = (SELECT"));
        assert!(!cmd.sql.contains("SKIP LOCKED"));
        assert!(cmd.args.is_empty());
    }

    #[test]
    fn test_claim_by_id_with_routes() {
        let options = TransportOptions {
            enable_status: true,
            enable_route: true,
            ..Default::default()
        };
        let cmd = builder(Dialect::Sqlite, options).build(CommandKind::Claim {
            routes: 2,
            by_id: true,
        });
        assert_eq!(cmd.args, vec![Arg::QueueId, Arg::Route(0), Arg::Route(1)]);
        assert!(cmd.sql.contains("WHERE queue_id = ?1 AND status = 0 AND route IN (?2, ?3)"));
    }

    #[test]
    fn test_reset_claim_variants() {
        let b = builder(Dialect::Postgres, TransportOptions::standard());
        let cmd = b.build(CommandKind::ResetClaim {
            check_heartbeat: true,
            advance_process_time: true,
            count_failure: true,
        });
        assert_eq!(
            cmd.args,
            vec![Arg::ProcessTime, Arg::QueueId, Arg::ExpectedHeartbeat]
        );
        assert!(cmd.sql.contains("retry_count = retry_count + 1"));
        assert!(cmd.sql.contains("heartbeat = NULL"));

        let monitor = b.build(CommandKind::ResetClaim {
            check_heartbeat: true,
            advance_process_time: false,
            count_failure: false,
        });
        assert_eq!(monitor.args, vec![Arg::QueueId, Arg::ExpectedHeartbeat]);
        assert!(!monitor.sql.contains("retry_count"));
    }

    #[test]
    fn test_insert_includes_only_enabled_columns() {
        let options = TransportOptions {
            enable_priority: true,
            additional_columns: vec![ColumnDef::new("tenant", ColumnType::Text)],
            ..Default::default()
        };
        let cmd = builder(Dialect::Sqlite, options).build(CommandKind::Insert);
        assert!(cmd.sql.contains("priority"));
        assert!(!cmd.sql.contains("queue_process_time"));
        assert!(cmd.sql.contains("\"tenant\""));
        assert_eq!(cmd.args.last(), Some(&Arg::Column(0)));
    }

    #[test]
    fn test_command_bind_reports_missing_values() {
        let b = builder(Dialect::Postgres, TransportOptions::standard());
        let cmd = b.build(CommandKind::RenewHeartbeat);
        let err = cmd
            .bind(|arg| match arg {
                Arg::QueueId => Some(QueryParam::I64(Some(1))),
                _ => None,
            })
            .unwrap_err();
        assert!(matches!(err, Error::Internal { .. }));
    }

    #[test]
    fn test_cache_memoises_per_instance() {
        let a = CommandCache::new(builder(Dialect::Postgres, TransportOptions::standard()));
        let b = CommandCache::new(builder(Dialect::Sqlite, TransportOptions::standard()));
        let first = a.get(CommandKind::DeleteMessage);
        let second = a.get(CommandKind::DeleteMessage);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(a.len(), 1);
        assert!(b.is_empty());
        assert!(b.get(CommandKind::DeleteMessage).sql.ends_with("?1"));
    }

    #[test]
    fn test_sweeps_skip_locked_rows_on_postgres() {
        let b = builder(Dialect::Postgres, TransportOptions::held());
        let expired = b.build(CommandKind::DeleteExpired);
        assert!(expired.sql.contains("FOR UPDATE SKIP LOCKED) RETURNING queue_id"));
        let failure = b.build(CommandKind::RecordFailure {
            advance_process_time: true,
        });
        assert_eq!(failure.args, vec![Arg::ProcessTime, Arg::QueueId]);
        assert!(failure.sql.contains("retry_count = retry_count + 1"));

        let sqlite = builder(Dialect::Sqlite, TransportOptions::standard());
        assert!(!sqlite.build(CommandKind::DeleteExpired).sql.contains("SKIP"));
    }
}

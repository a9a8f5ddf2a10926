//! DDL for a queue's tables.

use crate::store::query::{quote, Command, CommandBuilder, CommandKind};

/// Statements creating the message, status and error tables of a queue.
pub fn install(builder: &CommandBuilder) -> Vec<Command> {
    let d = builder.dialect();
    let o = builder.options();
    let t = builder.tables();
    let ts = d.timestamp_type();
    let int = d.integer_type();

    let mut columns = vec![
        format!("queue_id {}", d.id_column()),
        format!("payload {} NOT NULL", d.bytes_type()),
        "headers TEXT NOT NULL".to_string(),
    ];
    if o.enable_status {
        columns.push(format!("status {} NOT NULL DEFAULT 0", int));
    }
    if o.enable_priority {
        columns.push(format!("priority {} NOT NULL DEFAULT 0", int));
    }
    if o.enable_heartbeat {
        columns.push(format!("heartbeat {} NULL", ts));
    }
    if o.enable_delayed_processing {
        columns.push(format!("queue_process_time {} NOT NULL", ts));
    }
    if o.enable_message_expiration {
        columns.push(format!("expiration_time {} NULL", ts));
    }
    if o.enable_route {
        columns.push("route TEXT NULL".to_string());
    }
    columns.push("correlation_id TEXT NOT NULL".to_string());
    columns.push(format!("source_queue_id {} NULL", int));
    columns.push(format!("retry_count {} NOT NULL DEFAULT 0", int));
    columns.push(format!("enqueued_at {} NOT NULL", ts));
    for c in &o.additional_columns {
        columns.push(format!(
            "{} {}{}",
            quote(&c.name),
            d.column_type(c.kind),
            if c.nullable { " NULL" } else { " NOT NULL" }
        ));
    }

    let mut statements = vec![format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        quote(&t.messages),
        columns.join(", ")
    )];

    let mut claim_keys = Vec::new();
    if o.enable_status {
        claim_keys.push("status");
    }
    if o.enable_priority {
        claim_keys.push("priority");
    }
    if o.enable_delayed_processing {
        claim_keys.push("queue_process_time");
    }
    if !claim_keys.is_empty() {
        claim_keys.push("queue_id");
        statements.push(index(&t.queue, "m_claim", &t.messages, &claim_keys.join(", ")));
    }
    if o.enable_heartbeat {
        statements.push(index(&t.queue, "m_hb", &t.messages, "status, heartbeat"));
    }
    if o.enable_message_expiration {
        statements.push(index(&t.queue, "m_exp", &t.messages, "expiration_time"));
    }
    if o.enable_route {
        statements.push(index(&t.queue, "m_route", &t.messages, "route"));
    }

    if o.enable_status_table {
        statements.push(format!(
            "CREATE TABLE IF NOT EXISTS {} (queue_id {} PRIMARY KEY, status {} NOT NULL)",
            quote(&t.status),
            int,
            int
        ));
    }

    statements.push(format!(
        "CREATE TABLE IF NOT EXISTS {} (error_id {}, queue_id {} NOT NULL, payload {} NOT NULL, headers TEXT NOT NULL, route TEXT NULL, correlation_id TEXT NOT NULL, retry_count {} NOT NULL, enqueued_at {} NOT NULL, kind TEXT NOT NULL, exception TEXT NOT NULL, failed_at {} NOT NULL)",
        quote(&t.errors),
        d.id_column(),
        int,
        d.bytes_type(),
        int,
        ts,
        ts
    ));
    statements.push(index(&t.queue, "e_failed", &t.errors, "failed_at"));

    statements
        .into_iter()
        .map(|sql| Command::raw(CommandKind::Schema, sql))
        .collect()
}

/// Statements dropping every table of a queue.
pub fn uninstall(builder: &CommandBuilder) -> Vec<Command> {
    let t = builder.tables();
    [&t.messages, &t.status, &t.errors]
        .into_iter()
        .map(|table| {
            Command::raw(
                CommandKind::Schema,
                format!("DROP TABLE IF EXISTS {}", quote(table)),
            )
        })
        .collect()
}

fn index(queue: &str, suffix: &str, table: &str, columns: &str) -> String {
    format!(
        "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
        quote(&format!("{}_{}", queue, suffix)),
        quote(table),
        columns
    )
}

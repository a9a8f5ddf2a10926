//! Output formatting for the relq CLI.
//!
//! [`OutputWriter`] renders command results either as a table (via `tabled`) or as
//! pretty-printed JSON.

use serde::Serialize;
use tabled::{Table, Tabled};

pub enum OutputWriter {
    /// Display results in a human-readable table
    Table(TableOutputWriter),
    /// Display results as JSON
    Json(JsonOutputWriter),
}

impl OutputWriter {
    pub fn from_format(format: &str) -> Self {
        match format.to_lowercase().as_str() {
            "json" => OutputWriter::Json(JsonOutputWriter),
            _ => OutputWriter::Table(TableOutputWriter),
        }
    }

    pub fn write_list<T: Serialize + Tabled>(
        &self,
        items: &[T],
        out: &mut dyn std::io::Write,
    ) -> anyhow::Result<()> {
        match self {
            OutputWriter::Table(writer) => writer.write_list(items, out),
            OutputWriter::Json(writer) => writer.write_list(items, out),
        }
    }

    pub fn write_item<T: Serialize + Tabled>(
        &self,
        item: &T,
        out: &mut dyn std::io::Write,
    ) -> anyhow::Result<()> {
        match self {
            OutputWriter::Table(writer) => writer.write_list(std::slice::from_ref(item), out),
            OutputWriter::Json(writer) => writer.write_item(item, out),
        }
    }
}

/// Writer for formatting output as human-readable tables
pub struct TableOutputWriter;

impl TableOutputWriter {
    pub fn write_list<T: Tabled>(&self, items: &[T], out: &mut dyn std::io::Write) -> anyhow::Result<()> {
        writeln!(out, "{}", Table::new(items))?;
        Ok(())
    }
}

/// Writer for formatting output as JSON
pub struct JsonOutputWriter;

impl JsonOutputWriter {
    pub fn write_list<T: Serialize>(&self, items: &[T], out: &mut dyn std::io::Write) -> anyhow::Result<()> {
        writeln!(out, "{}", serde_json::to_string_pretty(items)?)?;
        Ok(())
    }

    pub fn write_item<T: Serialize>(&self, item: &T, out: &mut dyn std::io::Write) -> anyhow::Result<()> {
        writeln!(out, "{}", serde_json::to_string_pretty(item)?)?;
        Ok(())
    }
}

/// How many rows a maintenance command touched.
#[derive(Debug, Serialize, Tabled)]
pub struct ActionSummary {
    pub queue: String,
    pub action: String,
    pub count: u64,
}

impl ActionSummary {
    pub fn new(queue: &str, action: &str, count: u64) -> Self {
        Self {
            queue: queue.to_string(),
            action: action.to_string(),
            count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relq::types::QueueStats;

    fn stats() -> QueueStats {
        QueueStats {
            queue: "emails".to_string(),
            waiting: 4,
            processing: 1,
            errors: 2,
        }
    }

    #[test]
    fn test_json_writer_item() {
        let writer = OutputWriter::from_format("JSON");
        let mut cursor = std::io::Cursor::new(Vec::new());
        writer.write_item(&stats(), &mut cursor).unwrap();
        let output = String::from_utf8(cursor.into_inner()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&output).unwrap();
        assert_eq!(value["queue"], "emails");
        assert_eq!(value["waiting"], 4);
    }

    #[test]
    fn test_table_writer_list() {
        let writer = OutputWriter::from_format("table");
        let mut cursor = std::io::Cursor::new(Vec::new());
        writer
            .write_list(&[ActionSummary::new("emails", "expire", 3)], &mut cursor)
            .unwrap();
        let output = String::from_utf8(cursor.into_inner()).unwrap();
        assert!(output.contains("action"), "Should contain the action column header");
        assert!(output.contains("expire"));
        assert!(output.contains('|'), "Should contain table border characters");
    }
}

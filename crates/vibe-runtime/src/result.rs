//! Execution results.

use serde::Serialize;
use serde_json::{Map, Value};

use vibe_guard::StatementKind;

/// The outcome of one executed statement.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultSet {
    pub kind: StatementKind,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    /// Rows returned, or rows affected for writes without `RETURNING`.
    pub row_count: u64,
    /// More rows matched than the max-rows cap allowed.
    pub truncated: bool,
    /// DROP TABLE, TRUNCATE or DELETE.
    pub dangerous: bool,
    pub policies_applied: usize,
}

impl ResultSet {
    pub fn empty(kind: StatementKind) -> Self {
        Self {
            kind,
            columns: Vec::new(),
            rows: Vec::new(),
            row_count: 0,
            truncated: false,
            dangerous: kind.is_dangerous(),
            policies_applied: 0,
        }
    }

    /// Rows as `column -> value` objects.
    pub fn records(&self) -> Vec<Map<String, Value>> {
        self.rows
            .iter()
            .map(|row| {
                self.columns
                    .iter()
                    .cloned()
                    .zip(row.iter().cloned())
                    .collect()
            })
            .collect()
    }
}

//! Response size limiting, adapted from the teacher's output-budget guard.
//!
//! `get_table_data`/`export_table_csv` can be asked for an unbounded number
//! of rows; this caps both the row count and the serialized response size so
//! a single call cannot exhaust the host's context budget.

use mssql_mcp_error::{McpError, Result};

#[derive(Debug, Clone, Copy)]
pub struct OutputBudget {
    max_bytes: usize,
    max_rows: usize,
}

impl OutputBudget {
    pub fn new(max_bytes: usize, max_rows: usize) -> Self {
        Self { max_bytes, max_rows }
    }

    /// Built from the streaming-response-limit config field; row cap stays
    /// fixed independent of the streaming knobs (spec §9: streaming fields
    /// are carried but inert — this budget is the one limit that is live).
    pub fn from_config(stream_response_limit_bytes: u64) -> Self {
        Self {
            max_bytes: stream_response_limit_bytes as usize,
            max_rows: 10_000,
        }
    }

    pub fn max_rows(&self) -> usize {
        self.max_rows
    }

    pub fn check_size(&self, size: usize) -> Result<()> {
        if size > self.max_bytes {
            Err(McpError::validation(format!(
                "response size {size} bytes exceeds the configured limit of {} bytes",
                self.max_bytes
            )))
        } else {
            Ok(())
        }
    }

    /// Truncate a vector of rows to the configured cap, reporting whether it
    /// truncated so the caller can annotate the response.
    pub fn enforce_rows<T>(&self, rows: Vec<T>) -> (Vec<T>, bool) {
        if rows.len() <= self.max_rows {
            (rows, false)
        } else {
            let truncated = rows.into_iter().take(self.max_rows).collect();
            (truncated, true)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_within_budget_is_ok() {
        let budget = OutputBudget::new(1000, 100);
        assert!(budget.check_size(500).is_ok());
    }

    #[test]
    fn size_over_budget_is_validation_error() {
        let budget = OutputBudget::new(1000, 100);
        let err = budget.check_size(2000).unwrap_err();
        assert_eq!(err.rpc_code(), -32602);
    }

    #[test]
    fn row_enforcement_truncates_and_flags() {
        let budget = OutputBudget::new(1_000_000, 3);
        let (rows, truncated) = budget.enforce_rows(vec![1, 2, 3, 4, 5]);
        assert_eq!(rows, vec![1, 2, 3]);
        assert!(truncated);
    }

    #[test]
    fn row_enforcement_leaves_small_vectors_untouched() {
        let budget = OutputBudget::new(1_000_000, 10);
        let (rows, truncated) = budget.enforce_rows(vec![1, 2]);
        assert_eq!(rows, vec![1, 2]);
        assert!(!truncated);
    }
}

//! Transaction-isolated test case runner
//!
//! Executes a task's preprocess -> predicted -> (optional buggy) ->
//! cleanup sequence inside one transaction and rolls everything back, so a
//! validation run leaves the database's catalog and row counts untouched.
//! Cleanup failures are logged, not fatal; preprocess is expected to be
//! idempotent, so "already exists" failures are skipped.

use regex::Regex;
use tracing::{debug, warn};

use crate::bench::Task;
use crate::db::classify::{classify, ErrorCategory};
use crate::db::{simple_in_tx, PgSession, QueryOutput};

/// Rows retained per captured statement; beyond this the multiset is
/// truncated and marked as such
pub const ROW_CAP: usize = 10_000;

/// Captured outcome of one executed statement (or statement group)
#[derive(Clone, Debug, Default)]
pub struct StatementCapture {
    pub success: bool,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
    pub row_count: usize,
    pub truncated: bool,
    pub affected: u64,
    pub error: Option<String>,
}

impl StatementCapture {
    fn from_output(output: QueryOutput) -> Self {
        let row_count = output.rows.len();
        let truncated = row_count > ROW_CAP;
        let mut rows = output.rows;
        rows.truncate(ROW_CAP);
        Self {
            success: true,
            columns: output.columns,
            rows,
            row_count,
            truncated,
            affected: output.affected,
            error: None,
        }
    }

    fn from_error(error: String) -> Self {
        Self {
            success: false,
            error: Some(error),
            ..Default::default()
        }
    }
}

/// Result of one full test-case execution
#[derive(Clone, Debug, Default)]
pub struct TestCaseResult {
    pub passed: bool,
    /// Preprocess, predicted and cleanup all ran to completion
    pub workflow_complete: bool,
    pub error: Option<String>,
    /// Index of the preprocess statement that failed hard, if any
    pub failed_preprocess_index: Option<usize>,
    pub predicted: Option<StatementCapture>,
    /// Reference-solution capture, when one was requested
    pub reference: Option<StatementCapture>,
    /// Captures of the task's original buggy statements, when requested
    pub issue_results: Vec<StatementCapture>,
    pub cleanup_errors: Vec<String>,
    /// Types and relations created by preprocess, for later reference
    pub created_objects: Vec<String>,
}

pub struct TestCaseRunner {
    conn_str: String,
    statement_timeout_ms: u64,
}

impl TestCaseRunner {
    pub fn new(conn_str: impl Into<String>, statement_timeout_ms: u64) -> Self {
        Self {
            conn_str: conn_str.into(),
            statement_timeout_ms,
        }
    }

    /// Execute the full workflow under transaction isolation.
    ///
    /// `reference_sql` is additionally executed (after the predicted SQL,
    /// same transaction) when result-set comparison needs a ground truth.
    /// `capture_issue_sql` also runs the task's original buggy statements
    /// so a metric can look at the before state.
    pub async fn run(
        &self,
        task: &Task,
        predicted_sql: &str,
        reference_sql: Option<&str>,
        capture_issue_sql: bool,
    ) -> TestCaseResult {
        let mut result = TestCaseResult::default();

        let mut session = match PgSession::connect(&self.conn_str).await {
            Ok(s) => s,
            Err(e) => {
                result.error = Some(format!("connection failed: {e}"));
                return result;
            }
        };
        let tx = match session.transaction().await {
            Ok(tx) => tx,
            Err(e) => {
                result.error = Some(format!("transaction begin failed: {e}"));
                return result;
            }
        };

        // Per-statement timeout, scoped to this transaction
        if let Err(e) = simple_in_tx(
            &tx,
            &format!("SET LOCAL statement_timeout = {}", self.statement_timeout_ms),
        )
        .await
        {
            result.error = Some(format!("failed to set statement timeout: {e}"));
            return result;
        }

        // Step 1: preprocess, in order, stop on first hard error
        let mut preprocess_ok = true;
        for (i, sql) in task.preprocess_sql.iter().enumerate() {
            match simple_in_tx(&tx, sql).await {
                Ok(_) => {
                    result.created_objects.extend(created_object_names(sql));
                }
                Err(e) => {
                    let msg = e.to_string();
                    if classify(&msg) == ErrorCategory::AlreadyExists {
                        debug!(task = task.instance_id, "preprocess[{i}] exists, continuing");
                        result.created_objects.extend(created_object_names(sql));
                        continue;
                    }
                    warn!(task = task.instance_id, "preprocess[{i}] failed: {msg}");
                    result.failed_preprocess_index = Some(i);
                    result.error = Some(format!("preprocess[{i}] failed: {msg}"));
                    preprocess_ok = false;
                    break;
                }
            }
        }

        if !preprocess_ok {
            let _ = tx.rollback().await;
            return result;
        }

        // Step 2: predicted SQL
        let predicted = match simple_in_tx(&tx, predicted_sql).await {
            Ok(output) => StatementCapture::from_output(output),
            Err(e) => StatementCapture::from_error(e.to_string()),
        };
        let predicted_ok = predicted.success;
        if !predicted_ok {
            result.error = predicted
                .error
                .as_ref()
                .map(|e| format!("predicted SQL failed: {e}"));
        }
        result.predicted = Some(predicted);

        // Step 2b: reference solution for result comparison
        if let Some(reference) = reference_sql {
            let capture = match simple_in_tx(&tx, reference).await {
                Ok(output) => StatementCapture::from_output(output),
                Err(e) => StatementCapture::from_error(e.to_string()),
            };
            result.reference = Some(capture);
        }

        // Step 3: original buggy statements for before/after comparison
        if capture_issue_sql {
            for sql in &task.issue_sql {
                let capture = match simple_in_tx(&tx, sql).await {
                    Ok(output) => StatementCapture::from_output(output),
                    Err(e) => StatementCapture::from_error(e.to_string()),
                };
                result.issue_results.push(capture);
            }
        }

        // Step 4: cleanup; errors recorded but never fatal
        for (i, sql) in task.clean_up_sql.iter().enumerate() {
            if let Err(e) = simple_in_tx(&tx, sql).await {
                warn!(task = task.instance_id, "cleanup[{i}] failed: {e}");
                result.cleanup_errors.push(e.to_string());
            }
        }

        // Step 5: rollback for isolation
        if let Err(e) = tx.rollback().await {
            warn!(task = task.instance_id, "rollback failed: {e}");
        }

        result.workflow_complete = predicted_ok;
        result.passed = predicted_ok;
        result
    }
}

/// Names of relations and types a CREATE statement would produce
fn created_object_names(sql: &str) -> Vec<String> {
    let re = Regex::new(
        r"(?i)CREATE\s+(?:TABLE|TYPE|VIEW|INDEX|SEQUENCE|MATERIALIZED\s+VIEW)\s+(?:IF\s+NOT\s+EXISTS\s+)?([a-zA-Z_][a-zA-Z0-9_]*)",
    )
    .expect("static regex");
    re.captures_iter(sql).map(|c| c[1].to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_created_object_names() {
        assert_eq!(
            created_object_names("CREATE TABLE orders_archive (id int)"),
            vec!["orders_archive"]
        );
        assert_eq!(
            created_object_names("CREATE TYPE status_enum AS ENUM ('a','b')"),
            vec!["status_enum"]
        );
        assert_eq!(
            created_object_names("CREATE INDEX IF NOT EXISTS idx_a ON t(a)"),
            vec!["idx_a"]
        );
        assert!(created_object_names("INSERT INTO t VALUES (1)").is_empty());
    }

    #[test]
    fn capture_truncates_beyond_row_cap() {
        let output = QueryOutput {
            columns: vec!["x".to_string()],
            rows: (0..ROW_CAP + 5)
                .map(|i| vec![Some(i.to_string())])
                .collect(),
            affected: 0,
        };
        let capture = StatementCapture::from_output(output);
        assert_eq!(capture.rows.len(), ROW_CAP);
        assert_eq!(capture.row_count, ROW_CAP + 5);
        assert!(capture.truncated);
    }
}

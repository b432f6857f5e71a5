//! Benchmark task model and loading
//!
//! Tasks arrive as JSON lines. The official field set uses `issue_sql` as
//! an array of statements; the legacy single-statement `buggy_sql` alias is
//! still accepted. Unknown fields are ignored.

pub mod harness;
pub mod metrics;
pub mod runner;

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{AgentError, AgentResult};

/// Task category, which selects the evaluation metric
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Category {
    Query,
    Management,
    Personalization,
    Efficiency,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Query => "Query",
            Category::Management => "Management",
            Category::Personalization => "Personalization",
            Category::Efficiency => "Efficiency",
        }
    }
}

impl Default for Category {
    fn default() -> Self {
        Category::Query
    }
}

/// One benchmark task
#[derive(Clone, Debug, Deserialize)]
pub struct Task {
    pub instance_id: i64,

    pub db_id: String,

    /// Natural-language intent
    #[serde(default)]
    pub query: String,

    /// Buggy SQL statements to repair/optimize
    #[serde(default)]
    pub issue_sql: Vec<String>,

    /// Legacy single-statement alias; folded into `issue_sql` on load
    #[serde(default)]
    pub buggy_sql: Option<String>,

    #[serde(default)]
    pub preprocess_sql: Vec<String>,

    #[serde(default)]
    pub clean_up_sql: Vec<String>,

    #[serde(default)]
    pub category: Category,

    #[serde(default)]
    pub efficiency: bool,

    /// Reference solution, when the dataset provides one
    #[serde(default)]
    pub sol_sql: Option<String>,
}

impl Task {
    /// Normalise the legacy alias and invariants after deserialisation
    fn normalize(mut self) -> Self {
        if self.issue_sql.is_empty() {
            if let Some(buggy) = self.buggy_sql.take() {
                self.issue_sql = vec![buggy];
            }
        }
        // Efficiency category implies the efficiency flag
        if self.category == Category::Efficiency {
            self.efficiency = true;
        }
        self
    }

    pub fn first_statement(&self) -> Option<&str> {
        self.issue_sql.first().map(String::as_str)
    }
}

/// Load tasks from a JSON-lines file with optional filters.
/// `smoke` limits the run to the first 10 tasks regardless of `limit`.
pub fn load_tasks(
    path: &Path,
    limit: Option<usize>,
    category_filter: Option<&str>,
    smoke: bool,
) -> AgentResult<Vec<Task>> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| AgentError::io_with_path(e.to_string(), path.display().to_string()))?;

    let mut tasks = Vec::new();
    for (lineno, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let task: Task = serde_json::from_str(line).map_err(|e| {
            AgentError::config(format!(
                "malformed task at {}:{}: {e}",
                path.display(),
                lineno + 1
            ))
        })?;
        tasks.push(task.normalize());
    }

    if let Some(filter) = category_filter {
        tasks.retain(|t| t.category.as_str().eq_ignore_ascii_case(filter));
    }

    let cap = if smoke { Some(10) } else { limit };
    if let Some(cap) = cap {
        tasks.truncate(cap);
    }

    Ok(tasks)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_buggy_sql_becomes_single_element_array() {
        let task: Task = serde_json::from_str(
            r#"{"instance_id": 1, "db_id": "financial", "buggy_sql": "SELECT 1"}"#,
        )
        .unwrap();
        let task = task.normalize();
        assert_eq!(task.issue_sql, vec!["SELECT 1"]);
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let task: Task = serde_json::from_str(
            r#"{"instance_id": 2, "db_id": "x", "issue_sql": ["SELECT 1"], "novel_field": {"a": 1}}"#,
        )
        .unwrap();
        assert_eq!(task.instance_id, 2);
    }

    #[test]
    fn efficiency_category_implies_flag() {
        let task: Task = serde_json::from_str(
            r#"{"instance_id": 3, "db_id": "x", "issue_sql": ["SELECT 1"], "category": "Efficiency"}"#,
        )
        .unwrap();
        let task = task.normalize();
        assert!(task.efficiency);
    }
}

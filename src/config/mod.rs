/// Configuration management
///
/// All tunables for the analyzer, the agent loop and the evaluation harness
/// live here as plain serde structs with per-struct defaults.
use serde::{Deserialize, Serialize};

/// Performance constraints a query must satisfy before the translator
/// reports status=pass.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Constraints {
    /// Maximum acceptable planner cost
    pub max_cost: f64,

    /// Maximum acceptable execution time (milliseconds)
    pub max_time_ms: f64,

    /// EXPLAIN ANALYZE is only attempted when the estimated cost is at or
    /// below this threshold; above it the timed run would be too expensive
    pub analyze_cost_threshold: f64,
}

impl Default for Constraints {
    fn default() -> Self {
        Self {
            max_cost: 10_000.0,
            max_time_ms: 30_000.0,
            analyze_cost_threshold: 5_000_000.0,
        }
    }
}

/// Detection thresholds for the plan analyzer
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AnalyzerThresholds {
    /// A sequential scan over more rows than this is flagged HIGH.
    /// 1,000 is aggressive; raise towards 10,000 for quieter reports.
    pub seq_scan_min_rows: u64,

    /// A node consuming at least this fraction of the root total cost is
    /// flagged MEDIUM
    pub cost_significance_ratio: f64,

    /// Actual/estimated row ratio (either direction) beyond which the
    /// planner statistics are considered stale
    pub estimate_error_ratio: f64,

    /// Inner-side row count above which a nested loop is flagged
    pub nested_loop_max_rows: u64,

    /// Estimated sort footprint (width x rows) above this budget counts as
    /// an external sort even when the sort method is not reported
    pub work_mem_budget_bytes: u64,
}

impl Default for AnalyzerThresholds {
    fn default() -> Self {
        Self {
            seq_scan_min_rows: 1_000,
            cost_significance_ratio: 0.70,
            estimate_error_ratio: 5.0,
            nested_loop_max_rows: 1_000,
            work_mem_budget_bytes: 4 * 1024 * 1024,
        }
    }
}

/// Agent loop configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Hard ceiling on optimization iterations per task
    pub max_iterations: u32,

    /// Minimum iterations before early-stop heuristics may fire
    pub min_iterations: u32,

    /// Wall-clock budget for one task (seconds)
    pub timeout_per_task_secs: u64,

    /// Per-statement timeout for DDL and timed EXPLAIN (milliseconds)
    pub statement_timeout_ms: u64,

    /// Opaque extended-reasoning budget forwarded to the LLM planner.
    /// Zero disables the request option entirely.
    pub thinking_budget_tokens: u32,

    /// Use the deterministic rule translator instead of the LLM-backed one
    pub rule_based_feedback: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            min_iterations: 3,
            timeout_per_task_secs: 120,
            statement_timeout_ms: 30_000,
            thinking_budget_tokens: 8_000,
            rule_based_feedback: false,
        }
    }
}

/// LLM endpoint configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Base URL of the completion endpoint
    pub base_url: String,

    /// Model identifier
    pub model: String,

    /// Request timeout (seconds)
    pub request_timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            model: "llama3.2".to_string(),
            request_timeout_secs: 120,
        }
    }
}

/// Evaluation harness configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HarnessConfig {
    /// Path to the JSON-lines task file
    pub dataset_path: String,

    /// Connection template; `{db_id}` is substituted per task. A template
    /// without the placeholder is used verbatim for every task.
    pub connection_template: String,

    /// Output path for the final aggregate report
    pub output_path: String,

    /// Bounded worker pool size
    pub workers: usize,

    /// Evaluate only the first N tasks
    pub limit: Option<usize>,

    /// Evaluate only tasks of this category
    pub category_filter: Option<String>,

    /// Smoke test: first 10 tasks regardless of `limit`
    pub smoke: bool,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            dataset_path: "tasks.jsonl".to_string(),
            connection_template: "postgresql://postgres@localhost/{db_id}".to_string(),
            output_path: "results.json".to_string(),
            workers: 4,
            limit: None,
            category_filter: None,
            smoke: false,
        }
    }
}

impl HarnessConfig {
    /// Resolve the connection string for one database
    pub fn connection_for(&self, db_id: &str) -> String {
        if self.connection_template.contains("{db_id}") {
            self.connection_template.replace("{db_id}", db_id)
        } else {
            self.connection_template.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_template_substitutes_db_id() {
        let cfg = HarnessConfig {
            connection_template: "postgresql://u@h:5432/{db_id}".to_string(),
            ..Default::default()
        };
        assert_eq!(cfg.connection_for("financial"), "postgresql://u@h:5432/financial");
    }

    #[test]
    fn connection_template_without_placeholder_is_fixed() {
        let cfg = HarnessConfig {
            connection_template: "postgresql://u@h:5432/shared".to_string(),
            ..Default::default()
        };
        assert_eq!(cfg.connection_for("anything"), "postgresql://u@h:5432/shared");
    }
}

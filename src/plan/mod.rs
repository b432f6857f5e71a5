//! EXPLAIN plan model
//!
//! Deserializes PostgreSQL `EXPLAIN (FORMAT JSON)` output into a rooted
//! node tree and normalises the shapes the server can produce: the top
//! level may be a singleton array or a bare object, and parallel plans wrap
//! the interesting nodes in Gather / Gather Merge.

pub mod analyzer;
pub mod filter;

use serde::Deserialize;
use serde_json::Value;

use crate::error::{AgentError, AgentResult};

/// One node of the execution plan tree
#[derive(Clone, Debug, Default, Deserialize)]
pub struct PlanNode {
    #[serde(rename = "Node Type", default)]
    pub node_type: String,

    #[serde(rename = "Relation Name")]
    pub relation: Option<String>,

    #[serde(rename = "Alias")]
    pub alias: Option<String>,

    #[serde(rename = "Startup Cost", default)]
    pub startup_cost: f64,

    #[serde(rename = "Total Cost", default)]
    pub total_cost: f64,

    /// Estimated rows. Kept as f64: newer server versions report
    /// fractional actuals when loops > 1, and the JSON type is numeric.
    #[serde(rename = "Plan Rows", default)]
    pub plan_rows: f64,

    #[serde(rename = "Plan Width", default)]
    pub plan_width: u64,

    #[serde(rename = "Actual Rows")]
    pub actual_rows: Option<f64>,

    #[serde(rename = "Actual Loops")]
    pub actual_loops: Option<u64>,

    #[serde(rename = "Filter")]
    pub filter: Option<String>,

    #[serde(rename = "Index Cond")]
    pub index_cond: Option<String>,

    #[serde(rename = "Hash Cond")]
    pub hash_cond: Option<String>,

    #[serde(rename = "Merge Cond")]
    pub merge_cond: Option<String>,

    #[serde(rename = "Join Filter")]
    pub join_filter: Option<String>,

    #[serde(rename = "Sort Key", default)]
    pub sort_key: Vec<String>,

    #[serde(rename = "Sort Method")]
    pub sort_method: Option<String>,

    #[serde(rename = "Index Name")]
    pub index_name: Option<String>,

    #[serde(rename = "Plans", default)]
    pub plans: Vec<PlanNode>,
}

impl PlanNode {
    /// Node kind with the `Parallel ` prefix removed, so parallel scan
    /// variants are analysed as their sequential equivalents
    pub fn effective_kind(&self) -> &str {
        self.node_type
            .strip_prefix("Parallel ")
            .unwrap_or(&self.node_type)
    }

    pub fn is_gather(&self) -> bool {
        matches!(self.node_type.as_str(), "Gather" | "Gather Merge")
    }

    pub fn is_seq_scan(&self) -> bool {
        self.effective_kind() == "Seq Scan"
    }

    pub fn is_leaf(&self) -> bool {
        self.plans.is_empty()
    }

    /// Actual row count when the plan was measured, estimated otherwise
    pub fn best_rows(&self) -> u64 {
        self.actual_rows.unwrap_or(self.plan_rows).round().max(0.0) as u64
    }

    /// The join condition attached to this node, whichever form the
    /// planner reported it in
    pub fn join_condition(&self) -> Option<&str> {
        self.hash_cond
            .as_deref()
            .or(self.merge_cond.as_deref())
            .or(self.join_filter.as_deref())
    }

    /// Look through a Gather / Gather Merge wrapper to the real child
    pub fn through_gather(&self) -> &PlanNode {
        if self.is_gather() && self.plans.len() == 1 {
            self.plans[0].through_gather()
        } else {
            self
        }
    }

    /// The relation this node (or its highest-cost descendant) touches.
    /// Used to ground suggestions for relation-less nodes like Aggregate.
    pub fn dominant_relation(&self) -> Option<&str> {
        if let Some(rel) = self.relation.as_deref() {
            return Some(rel);
        }
        let mut best: Option<&PlanNode> = None;
        for child in &self.plans {
            if best.map_or(true, |b| child.total_cost > b.total_cost) {
                best = Some(child);
            }
        }
        best.and_then(|c| c.dominant_relation())
    }
}

/// Parsed top level of one EXPLAIN document
#[derive(Clone, Debug)]
pub struct ExplainTree {
    pub root: PlanNode,
    pub execution_time_ms: Option<f64>,
    pub planning_time_ms: Option<f64>,
}

/// Normalise the top level of EXPLAIN JSON output.
///
/// Accepts `[{"Plan": {...}, ...}]` and `{"Plan": {...}, ...}`.
pub fn parse_explain(value: &Value) -> AgentResult<ExplainTree> {
    let doc = match value {
        Value::Array(items) => items
            .first()
            .ok_or_else(|| AgentError::analysis("empty EXPLAIN array"))?,
        other => other,
    };

    let plan_value = doc
        .get("Plan")
        .ok_or_else(|| AgentError::analysis("EXPLAIN output has no Plan key"))?;

    let root: PlanNode = serde_json::from_value(plan_value.clone())
        .map_err(|e| AgentError::analysis(format!("malformed plan node: {e}")))?;

    Ok(ExplainTree {
        root,
        execution_time_ms: doc.get("Execution Time").and_then(Value::as_f64),
        planning_time_ms: doc.get("Planning Time").and_then(Value::as_f64),
    })
}

/// Parse EXPLAIN output delivered as raw text
pub fn parse_explain_text(text: &str) -> AgentResult<ExplainTree> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| AgentError::analysis(format!("EXPLAIN output is not JSON: {e}")))?;
    parse_explain(&value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_singleton_array_and_bare_object() {
        let arr = json!([{"Plan": {"Node Type": "Seq Scan", "Total Cost": 12.5}}]);
        let obj = json!({"Plan": {"Node Type": "Seq Scan", "Total Cost": 12.5}});

        let from_arr = parse_explain(&arr).unwrap();
        let from_obj = parse_explain(&obj).unwrap();
        assert_eq!(from_arr.root.node_type, "Seq Scan");
        assert_eq!(from_obj.root.total_cost, 12.5);
    }

    #[test]
    fn gather_wrapper_is_transparent() {
        let node: PlanNode = serde_json::from_value(json!({
            "Node Type": "Gather",
            "Plans": [{"Node Type": "Parallel Seq Scan", "Relation Name": "orders"}]
        }))
        .unwrap();
        let inner = node.through_gather();
        assert_eq!(inner.effective_kind(), "Seq Scan");
        assert_eq!(inner.relation.as_deref(), Some("orders"));
    }

    #[test]
    fn dominant_relation_walks_highest_cost_child() {
        let node: PlanNode = serde_json::from_value(json!({
            "Node Type": "Aggregate",
            "Total Cost": 100.0,
            "Plans": [
                {"Node Type": "Seq Scan", "Relation Name": "small", "Total Cost": 10.0},
                {"Node Type": "Seq Scan", "Relation Name": "big", "Total Cost": 90.0}
            ]
        }))
        .unwrap();
        assert_eq!(node.dominant_relation(), Some("big"));
    }
}

//! Deterministic EXPLAIN bottleneck analyzer
//!
//! Walks the plan tree once (post-order) and applies the detection rules:
//! sequential scans over large relations, nodes dominating total cost,
//! planner estimate errors, nested loops with large inner sides, sorts that
//! spill to disk, and joins whose inner side has no usable index. Every
//! finding carries a canonical remedy, either a CREATE INDEX statement or
//! `RUN_ANALYZE <table>`, synthesised from the plan itself so later stages
//! never have to invent identifiers.

use serde::Serialize;
use serde_json::Value;

use crate::config::AnalyzerThresholds;
use crate::plan::filter::{
    self, Connective, ExtractedPredicate,
};
use crate::plan::{parse_explain, ExplainTree, PlanNode};

/// Bottleneck severity levels
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum Severity {
    High,
    Medium,
    Low,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::High => "HIGH",
            Severity::Medium => "MEDIUM",
            Severity::Low => "LOW",
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Severity::High => 0,
            Severity::Medium => 1,
            Severity::Low => 2,
        }
    }
}

/// Kinds of bottleneck the analyzer can detect
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum BottleneckKind {
    SeqScanLargeTable,
    HighCostNode,
    EstimateError,
    NestedLoopLarge,
    ExternalSort,
    MissingJoinIndex,
    FilterOnUnindexedColumn,
}

/// A detected performance issue with its canonical remedy
#[derive(Clone, Debug, Serialize)]
pub struct Bottleneck {
    pub kind: BottleneckKind,
    pub severity: Severity,
    pub table: Option<String>,
    pub columns: Vec<String>,
    pub rows: Option<u64>,
    pub cost: Option<f64>,
    pub cost_percentage: Option<f64>,
    pub reason: String,
    pub suggestion: String,
}

/// Full analyzer output for one EXPLAIN document
#[derive(Clone, Debug, Default, Serialize)]
pub struct AnalysisReport {
    pub total_cost: f64,
    pub execution_time_ms: Option<f64>,
    pub planning_time_ms: Option<f64>,
    pub bottlenecks: Vec<Bottleneck>,
    pub summary: String,
    pub optimization_priority: &'static str,
    /// Populated instead of an error when the input could not be parsed
    pub warning: Option<String>,
}

impl AnalysisReport {
    fn malformed(warning: String) -> Self {
        Self {
            summary: "Plan analysis unavailable".to_string(),
            optimization_priority: "LOW",
            warning: Some(warning),
            ..Default::default()
        }
    }

    pub fn most_severe(&self) -> Option<&Bottleneck> {
        self.bottlenecks.first()
    }

    pub fn has_severity(&self, severity: Severity) -> bool {
        self.bottlenecks.iter().any(|b| b.severity == severity)
    }
}

/// The deterministic rule engine. Same EXPLAIN tree in, same bottleneck
/// list out, byte for byte.
pub struct ExplainAnalyzer {
    thresholds: AnalyzerThresholds,
}

impl Default for ExplainAnalyzer {
    fn default() -> Self {
        Self::new(AnalyzerThresholds::default())
    }
}

impl ExplainAnalyzer {
    pub fn new(thresholds: AnalyzerThresholds) -> Self {
        Self { thresholds }
    }

    /// Analyze a parsed EXPLAIN JSON value. Malformed input produces an
    /// empty report with a warning; this function never fails.
    pub fn analyze(&self, explain: &Value) -> AnalysisReport {
        match parse_explain(explain) {
            Ok(tree) => self.analyze_tree(&tree),
            Err(e) => AnalysisReport::malformed(e.to_string()),
        }
    }

    /// Analyze raw EXPLAIN text
    pub fn analyze_text(&self, explain: &str) -> AnalysisReport {
        match serde_json::from_str::<Value>(explain) {
            Ok(value) => self.analyze(&value),
            Err(e) => AnalysisReport::malformed(format!("EXPLAIN output is not JSON: {e}")),
        }
    }

    pub fn analyze_tree(&self, tree: &ExplainTree) -> AnalysisReport {
        let total_cost = tree.root.total_cost;
        let mut bottlenecks = Vec::new();
        // The root (and the node a Gather wrapper delegates to) trivially
        // carries ~100% of the total cost; the high-cost rule only makes
        // sense for inner nodes.
        let cost_rule_exempt = [
            &tree.root as *const PlanNode,
            tree.root.through_gather() as *const PlanNode,
        ];
        self.visit(&tree.root, total_cost, &cost_rule_exempt, &mut bottlenecks);

        bottlenecks.sort_by(|a, b| {
            a.severity
                .rank()
                .cmp(&b.severity.rank())
                .then_with(|| {
                    b.cost
                        .unwrap_or(0.0)
                        .partial_cmp(&a.cost.unwrap_or(0.0))
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
        });

        let summary = summarize(&bottlenecks, total_cost);
        let optimization_priority = rollup_priority(&bottlenecks);

        AnalysisReport {
            total_cost,
            execution_time_ms: tree.execution_time_ms,
            planning_time_ms: tree.planning_time_ms,
            bottlenecks,
            summary,
            optimization_priority,
            warning: None,
        }
    }

    /// Post-order traversal applying every rule at each node
    fn visit(
        &self,
        node: &PlanNode,
        root_cost: f64,
        cost_rule_exempt: &[*const PlanNode],
        out: &mut Vec<Bottleneck>,
    ) {
        for child in &node.plans {
            self.visit(child, root_cost, cost_rule_exempt, out);
        }

        self.check_seq_scan(node, out);
        if !cost_rule_exempt.contains(&(node as *const PlanNode)) {
            self.check_high_cost(node, root_cost, out);
        }
        self.check_estimate_error(node, out);
        self.check_nested_loop(node, out);
        self.check_sort(node, out);
        self.check_join_inner_scan(node, out);
    }

    fn check_seq_scan(&self, node: &PlanNode, out: &mut Vec<Bottleneck>) {
        if !node.is_seq_scan() || !node.is_leaf() {
            return;
        }
        let rows = node.best_rows();
        if rows <= self.thresholds.seq_scan_min_rows {
            return;
        }
        let table = match node.relation.as_deref() {
            Some(t) => t.to_string(),
            None => return,
        };

        let predicate = node
            .filter
            .as_deref()
            .map(filter::extract_predicate)
            .unwrap_or(ExtractedPredicate {
                columns: Vec::new(),
                connective: Connective::Single,
            });

        let suggestion = filter::index_suggestion(&table, &predicate)
            .unwrap_or_else(|| filter::run_analyze_suggestion(&table));

        out.push(Bottleneck {
            kind: BottleneckKind::SeqScanLargeTable,
            severity: Severity::High,
            rows: Some(rows),
            cost: Some(node.total_cost),
            cost_percentage: None,
            reason: format!("Sequential scan on {table} with {rows} rows"),
            columns: predicate.columns,
            table: Some(table),
            suggestion,
        });
    }

    fn check_high_cost(&self, node: &PlanNode, root_cost: f64, out: &mut Vec<Bottleneck>) {
        if root_cost <= 0.0 {
            return;
        }
        let fraction = node.total_cost / root_cost;
        if fraction < self.thresholds.cost_significance_ratio {
            return;
        }
        // A grounded remedy needs a relation somewhere under this node
        let table = match node.dominant_relation() {
            Some(t) => t.to_string(),
            None => return,
        };
        out.push(Bottleneck {
            kind: BottleneckKind::HighCostNode,
            severity: Severity::Medium,
            table: Some(table.clone()),
            columns: Vec::new(),
            rows: None,
            cost: Some(node.total_cost),
            cost_percentage: Some(fraction * 100.0),
            reason: format!(
                "{} node accounts for {:.1}% of total query cost",
                node.node_type,
                fraction * 100.0
            ),
            suggestion: filter::run_analyze_suggestion(&table),
        });
    }

    fn check_estimate_error(&self, node: &PlanNode, out: &mut Vec<Bottleneck>) {
        let estimated = node.plan_rows;
        let actual = match node.actual_rows {
            Some(a) => a,
            None => return,
        };
        if estimated <= 0.0 || actual <= 0.0 {
            return;
        }
        let ratio = actual / estimated;
        let (worst, direction) = if ratio >= 1.0 {
            (ratio, "underestimated")
        } else {
            (1.0 / ratio, "overestimated")
        };
        if worst <= self.thresholds.estimate_error_ratio {
            return;
        }
        let table = match node.relation.as_deref().or_else(|| node.dominant_relation()) {
            Some(t) => t.to_string(),
            None => return,
        };
        out.push(Bottleneck {
            kind: BottleneckKind::EstimateError,
            severity: Severity::Low,
            columns: Vec::new(),
            rows: Some(actual.round() as u64),
            cost: Some(node.total_cost),
            cost_percentage: None,
            reason: format!(
                "Planner {direction} rows by {worst:.1}x ({estimated} estimated vs {actual} actual) on {table}"
            ),
            suggestion: filter::run_analyze_suggestion(&table),
            table: Some(table),
        });
    }

    fn check_nested_loop(&self, node: &PlanNode, out: &mut Vec<Bottleneck>) {
        if !node.effective_kind().contains("Nested Loop") {
            return;
        }
        let inner = match node.plans.get(1) {
            Some(child) => child.through_gather(),
            None => return,
        };
        let inner_rows = inner.best_rows();
        if inner_rows <= self.thresholds.nested_loop_max_rows {
            return;
        }
        let table = match inner.relation.as_deref().or_else(|| inner.dominant_relation()) {
            Some(t) => t.to_string(),
            None => return,
        };

        let join_col = node
            .join_condition()
            .or(inner.index_cond.as_deref())
            .and_then(|cond| filter::join_column_for(cond, &table));

        let (columns, suggestion) = match join_col {
            Some(col) => {
                let columns = vec![col];
                let suggestion = filter::ordered_index(&table, &columns)
                    .unwrap_or_else(|| filter::run_analyze_suggestion(&table));
                (columns, suggestion)
            }
            None => (Vec::new(), filter::run_analyze_suggestion(&table)),
        };

        out.push(Bottleneck {
            kind: BottleneckKind::NestedLoopLarge,
            severity: Severity::High,
            columns,
            rows: Some(inner_rows),
            cost: Some(node.total_cost),
            cost_percentage: None,
            reason: format!(
                "Nested loop drives {inner_rows} inner rows on {table}; each outer row rescans the inner side"
            ),
            suggestion,
            table: Some(table),
        });
    }

    fn check_sort(&self, node: &PlanNode, out: &mut Vec<Bottleneck>) {
        if node.effective_kind() != "Sort" {
            return;
        }
        let spilled = node
            .sort_method
            .as_deref()
            .map(|m| {
                let m = m.to_lowercase();
                m.contains("external") || m.contains("disk")
            })
            .unwrap_or(false);
        let footprint = (node.plan_width as f64 * node.plan_rows).max(0.0) as u64;
        if !spilled && footprint <= self.thresholds.work_mem_budget_bytes {
            return;
        }

        let table = match node.dominant_relation() {
            Some(t) => t.to_string(),
            None => return,
        };
        let columns: Vec<String> = node
            .sort_key
            .iter()
            .filter_map(|k| filter::sort_key_column(k))
            .collect();
        let suggestion = filter::ordered_index(&table, &columns)
            .unwrap_or_else(|| filter::run_analyze_suggestion(&table));

        let reason = if spilled {
            format!("Sort on {table} spilled to disk")
        } else {
            format!(
                "Sort on {table} needs ~{footprint} bytes, above the working-memory budget"
            )
        };

        out.push(Bottleneck {
            kind: BottleneckKind::ExternalSort,
            severity: Severity::Medium,
            columns,
            rows: Some(node.best_rows()),
            cost: Some(node.total_cost),
            cost_percentage: None,
            reason,
            suggestion,
            table: Some(table),
        });
    }

    /// Hash join or nested loop whose inner child is a sequential scan with
    /// a filter or join-key reference: the inner relation is missing an
    /// index. When both a join column and filter columns are recoverable
    /// the suggestion is a composite covering both.
    fn check_join_inner_scan(&self, node: &PlanNode, out: &mut Vec<Bottleneck>) {
        let kind = node.effective_kind();
        if kind != "Hash Join" && !kind.contains("Nested Loop") {
            return;
        }
        let inner = match node.plans.get(1) {
            Some(child) => child.through_gather(),
            None => return,
        };
        // Hash joins build the inner side behind a Hash node
        let inner = if inner.effective_kind() == "Hash" && inner.plans.len() == 1 {
            inner.plans[0].through_gather()
        } else {
            inner
        };
        if !inner.is_seq_scan() {
            return;
        }
        let table = match inner.relation.as_deref() {
            Some(t) => t.to_string(),
            None => return,
        };

        let join_col = node
            .join_condition()
            .and_then(|cond| filter::join_column_for(cond, &table));
        let filter_cols = inner
            .filter
            .as_deref()
            .map(|f| filter::extract_predicate(f).columns)
            .unwrap_or_default();

        if join_col.is_none() && filter_cols.is_empty() {
            return;
        }

        let mut columns = Vec::new();
        if let Some(col) = join_col.clone() {
            columns.push(col);
        }
        for col in filter_cols {
            if !columns.contains(&col) {
                columns.push(col);
            }
        }

        let suggestion = match filter::ordered_index(&table, &columns) {
            Some(ddl) => ddl,
            None => return,
        };

        let (kind, reason) = if join_col.is_some() {
            (
                BottleneckKind::MissingJoinIndex,
                format!("{} probes {table} through a sequential scan; no index on the join key", node.node_type),
            )
        } else {
            (
                BottleneckKind::FilterOnUnindexedColumn,
                format!("{} filters {table} inside a join without an index on the filter columns", node.node_type),
            )
        };

        out.push(Bottleneck {
            kind,
            severity: Severity::High,
            columns,
            rows: Some(inner.best_rows()),
            cost: Some(node.total_cost),
            cost_percentage: None,
            reason,
            suggestion,
            table: Some(table),
        });
    }
}

fn summarize(bottlenecks: &[Bottleneck], total_cost: f64) -> String {
    if bottlenecks.is_empty() {
        return format!("No significant bottlenecks detected. Query cost: {total_cost:.2}");
    }
    let high = bottlenecks.iter().filter(|b| b.severity == Severity::High).count();
    let medium = bottlenecks.iter().filter(|b| b.severity == Severity::Medium).count();
    let mut parts = Vec::new();
    if high > 0 {
        parts.push(format!("{high} HIGH severity issue(s)"));
    }
    if medium > 0 {
        parts.push(format!("{medium} MEDIUM severity issue(s)"));
    }
    let low = bottlenecks.len() - high - medium;
    if low > 0 {
        parts.push(format!("{low} LOW severity issue(s)"));
    }
    format!(
        "Found {} bottleneck(s): {}. Total cost: {total_cost:.2}",
        bottlenecks.len(),
        parts.join(", ")
    )
}

fn rollup_priority(bottlenecks: &[Bottleneck]) -> &'static str {
    if bottlenecks.iter().any(|b| b.severity == Severity::High) {
        "HIGH"
    } else if bottlenecks.iter().any(|b| b.severity == Severity::Medium) {
        "MEDIUM"
    } else {
        "LOW"
    }
}

//! Semantic translation: technical analysis -> agent-facing feedback
//!
//! Takes the analyzer's bottleneck report plus the task's cost/time
//! constraints and produces the four-field feedback record the planner
//! consumes. Two interchangeable modes return the same schema: the
//! deterministic rule translator (no network, used in tests and for
//! development) and the LLM-backed translator. LLM output is guarded
//! against hallucination: identifiers in suggestions always come from the
//! analyzer, never from the model.

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::Constraints;
use crate::llm::LlmClient;
use crate::plan::analyzer::{AnalysisReport, Severity};

/// Overall verdict for the current query
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedbackStatus {
    Pass,
    Warning,
    Fail,
    Error,
}

/// Urgency of the suggested fix
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    High,
    Medium,
    Low,
}

/// Feedback handed to the planner on every Analyze phase
#[derive(Clone, Debug, Serialize)]
pub struct Feedback {
    pub status: FeedbackStatus,
    pub reason: String,
    pub suggestion: String,
    pub priority: Priority,
    /// Full technical report for downstream grounding
    #[serde(skip)]
    pub report: AnalysisReport,
}

impl Feedback {
    /// Feedback for an EXPLAIN that failed outright
    pub fn error(reason: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self {
            status: FeedbackStatus::Error,
            reason: reason.into(),
            suggestion: suggestion.into(),
            priority: Priority::High,
            report: AnalysisReport::default(),
        }
    }

    /// Feedback for an engine error that the planner must fix by rewriting
    pub fn critical_fail(reason: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self {
            status: FeedbackStatus::Fail,
            reason: reason.into(),
            suggestion: suggestion.into(),
            priority: Priority::High,
            report: AnalysisReport::default(),
        }
    }
}

/// Deterministic translator: pure function of report and constraints
pub struct RuleTranslator;

impl RuleTranslator {
    pub fn translate(report: &AnalysisReport, constraints: &Constraints) -> Feedback {
        if let Some(warning) = &report.warning {
            return Feedback {
                status: FeedbackStatus::Error,
                reason: format!("Plan analysis failed: {warning}"),
                suggestion: "no action".to_string(),
                priority: Priority::High,
                report: report.clone(),
            };
        }

        let over_budget = report.total_cost > constraints.max_cost;
        let has_high = report.has_severity(Severity::High);

        if over_budget || has_high {
            let (reason, suggestion, priority) = match report.most_severe() {
                Some(top) => {
                    let gap = if over_budget {
                        format!(
                            "Query cost ({:.0}) exceeds limit ({:.0}) by {:.0}. ",
                            report.total_cost,
                            constraints.max_cost,
                            report.total_cost - constraints.max_cost
                        )
                    } else {
                        format!(
                            "Query cost ({:.0}) is within limit ({:.0}) but a severe bottleneck remains. ",
                            report.total_cost, constraints.max_cost
                        )
                    };
                    (
                        format!("{gap}{}", top.reason),
                        top.suggestion.clone(),
                        severity_priority(top.severity),
                    )
                }
                None => (
                    format!(
                        "Query cost ({:.0}) exceeds limit ({:.0}) by {:.0}",
                        report.total_cost,
                        constraints.max_cost,
                        report.total_cost - constraints.max_cost
                    ),
                    "no action".to_string(),
                    Priority::High,
                ),
            };
            return Feedback {
                status: FeedbackStatus::Fail,
                reason,
                suggestion,
                priority,
                report: report.clone(),
            };
        }

        if report.bottlenecks.is_empty() {
            return Feedback {
                status: FeedbackStatus::Pass,
                reason: format!(
                    "Query cost ({:.0}) is within limit ({:.0})",
                    report.total_cost, constraints.max_cost
                ),
                suggestion: "no action".to_string(),
                priority: Priority::Low,
                report: report.clone(),
            };
        }

        // Only MEDIUM / LOW issues remain
        let top = &report.bottlenecks[0];
        Feedback {
            status: FeedbackStatus::Warning,
            reason: format!(
                "Query meets the cost limit ({:.0} of {:.0}) but has potential optimizations: {}",
                report.total_cost, constraints.max_cost, top.reason
            ),
            suggestion: top.suggestion.clone(),
            priority: severity_priority(top.severity),
            report: report.clone(),
        }
    }
}

fn severity_priority(severity: Severity) -> Priority {
    match severity {
        Severity::High => Priority::High,
        Severity::Medium => Priority::Medium,
        Severity::Low => Priority::Low,
    }
}

/// Raw LLM translation response, same schema as the rule mode
#[derive(Debug, Deserialize)]
struct RawFeedback {
    status: FeedbackStatus,
    reason: String,
    suggestion: String,
    priority: Priority,
}

/// LLM-backed translator with the hallucination guard
pub struct LlmTranslator {
    client: LlmClient,
}

impl LlmTranslator {
    pub fn new(client: LlmClient) -> Self {
        Self { client }
    }

    pub async fn translate(&self, report: &AnalysisReport, constraints: &Constraints) -> Feedback {
        if report.warning.is_some() {
            return RuleTranslator::translate(report, constraints);
        }

        let prompt = build_translation_prompt(report, constraints);
        match self.client.generate_json::<RawFeedback>(&prompt, 0).await {
            Ok(raw) => {
                let suggestion = guard_suggestion(raw.suggestion, report);
                Feedback {
                    status: raw.status,
                    reason: raw.reason,
                    suggestion,
                    priority: raw.priority,
                    report: report.clone(),
                }
            }
            Err(e) => {
                // Fall back to the deterministic mode rather than surfacing
                // a translation failure as an analysis failure
                tracing::warn!("LLM translation failed, using rule mode: {e}");
                RuleTranslator::translate(report, constraints)
            }
        }
    }
}

fn build_translation_prompt(report: &AnalysisReport, constraints: &Constraints) -> String {
    let mut bottleneck_lines = String::new();
    if report.bottlenecks.is_empty() {
        bottleneck_lines.push_str("None detected\n");
    }
    for (i, b) in report.bottlenecks.iter().enumerate() {
        bottleneck_lines.push_str(&format!(
            "{}. [{}] {:?}: {}\n   Suggested fix: {}\n",
            i + 1,
            b.severity.as_str(),
            b.kind,
            b.reason,
            b.suggestion
        ));
    }

    format!(
        r#"You are an expert PostgreSQL DBA helping an automated agent optimize queries.

TECHNICAL ANALYSIS:
Total Cost: {total_cost:.2}
Execution Time: {exec} ms
Optimization Priority: {priority}

BOTTLENECKS DETECTED:
{bottlenecks}
PERFORMANCE CONSTRAINTS:
- Maximum acceptable cost: {max_cost}
- Maximum execution time: {max_time} ms

RULES:
1. Respond ONLY with valid JSON, no markdown, no explanations.
2. The suggestion must be an executable SQL command or "no action".
3. NEVER invent or modify column names; copy the suggested fix of the most
   severe bottleneck VERBATIM when one exists.
4. status is "fail" when the cost limit is exceeded or a HIGH severity
   bottleneck exists, "warning" for lesser issues, "pass" otherwise.

RESPONSE FORMAT:
{{"status": "pass" | "fail" | "warning", "reason": "one sentence", "suggestion": "SQL or no action", "priority": "HIGH" | "MEDIUM" | "LOW"}}"#,
        total_cost = report.total_cost,
        exec = report
            .execution_time_ms
            .map(|t| format!("{t:.1}"))
            .unwrap_or_else(|| "unknown".to_string()),
        priority = report.optimization_priority,
        bottlenecks = bottleneck_lines,
        max_cost = constraints.max_cost,
        max_time = constraints.max_time_ms,
    )
}

/// Replace a hallucinated CREATE INDEX with the analyzer's canonical one.
/// The canonical suggestion of the most severe index-bearing bottleneck
/// wins whenever the model's differs in table or column list.
fn guard_suggestion(model_suggestion: String, report: &AnalysisReport) -> String {
    let canonical = report
        .bottlenecks
        .iter()
        .find(|b| b.severity == Severity::High && b.suggestion.contains("CREATE INDEX"))
        .or_else(|| {
            report
                .bottlenecks
                .iter()
                .find(|b| b.suggestion.contains("CREATE INDEX"))
        })
        .map(|b| b.suggestion.clone());

    let Some(canonical) = canonical else {
        return model_suggestion;
    };
    if !model_suggestion.contains("CREATE INDEX") {
        return model_suggestion;
    }

    let target_re = Regex::new(r"ON\s+(\w+)\s*\(([^)]+)\)").expect("static regex");
    let canon_target = target_re.captures(&canonical);
    let model_target = target_re.captures(&model_suggestion);

    match (canon_target, model_target) {
        (Some(c), Some(m)) => {
            let same_table = c[1].eq_ignore_ascii_case(&m[1]);
            let normalize =
                |s: &str| s.split(',').map(|p| p.trim().to_lowercase()).collect::<Vec<_>>();
            let same_cols = normalize(&c[2]) == normalize(&m[2]);
            if same_table && same_cols {
                model_suggestion
            } else {
                canonical
            }
        }
        _ => canonical,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::analyzer::{Bottleneck, BottleneckKind};

    fn report_with(bottlenecks: Vec<Bottleneck>, total_cost: f64) -> AnalysisReport {
        AnalysisReport {
            total_cost,
            bottlenecks,
            optimization_priority: "HIGH",
            ..Default::default()
        }
    }

    fn seq_scan_bottleneck() -> Bottleneck {
        Bottleneck {
            kind: BottleneckKind::SeqScanLargeTable,
            severity: Severity::High,
            table: Some("users".to_string()),
            columns: vec!["email".to_string()],
            rows: Some(100_000),
            cost: Some(55_072.45),
            cost_percentage: None,
            reason: "Sequential scan on users with 100000 rows".to_string(),
            suggestion: "CREATE INDEX idx_users_email ON users(email)".to_string(),
        }
    }

    #[test]
    fn fail_when_cost_exceeds_budget() {
        let report = report_with(vec![seq_scan_bottleneck()], 55_072.45);
        let fb = RuleTranslator::translate(&report, &Constraints::default());
        assert_eq!(fb.status, FeedbackStatus::Fail);
        assert_eq!(fb.priority, Priority::High);
        assert_eq!(fb.suggestion, "CREATE INDEX idx_users_email ON users(email)");
        assert!(fb.reason.contains("exceeds limit"));
    }

    #[test]
    fn fail_on_high_severity_even_under_budget() {
        let report = report_with(vec![seq_scan_bottleneck()], 100.0);
        let fb = RuleTranslator::translate(&report, &Constraints::default());
        assert_eq!(fb.status, FeedbackStatus::Fail);
    }

    #[test]
    fn pass_when_clean_and_under_budget() {
        let report = report_with(vec![], 142.0);
        let fb = RuleTranslator::translate(&report, &Constraints::default());
        assert_eq!(fb.status, FeedbackStatus::Pass);
        assert_eq!(fb.suggestion, "no action");
        assert_eq!(fb.priority, Priority::Low);
    }

    #[test]
    fn warning_for_medium_only_issues() {
        let mut b = seq_scan_bottleneck();
        b.severity = Severity::Medium;
        b.kind = BottleneckKind::HighCostNode;
        let report = report_with(vec![b], 500.0);
        let fb = RuleTranslator::translate(&report, &Constraints::default());
        assert_eq!(fb.status, FeedbackStatus::Warning);
        assert_eq!(fb.priority, Priority::Medium);
    }

    #[test]
    fn error_when_report_is_malformed() {
        let report = AnalysisReport {
            warning: Some("not JSON".to_string()),
            optimization_priority: "LOW",
            ..Default::default()
        };
        let fb = RuleTranslator::translate(&report, &Constraints::default());
        assert_eq!(fb.status, FeedbackStatus::Error);
    }

    #[test]
    fn guard_replaces_hallucinated_columns() {
        let report = report_with(vec![seq_scan_bottleneck()], 55_072.45);
        let guarded = guard_suggestion(
            "CREATE INDEX idx_users_name ON users(name)".to_string(),
            &report,
        );
        assert_eq!(guarded, "CREATE INDEX idx_users_email ON users(email)");
    }

    #[test]
    fn guard_keeps_matching_suggestion() {
        let report = report_with(vec![seq_scan_bottleneck()], 55_072.45);
        let kept = guard_suggestion(
            "CREATE INDEX idx_users_email ON users(EMAIL)".to_string(),
            &report,
        );
        assert_eq!(kept, "CREATE INDEX idx_users_email ON users(EMAIL)");
    }

    #[test]
    fn guard_leaves_non_index_suggestions_alone() {
        let report = report_with(vec![seq_scan_bottleneck()], 55_072.45);
        let kept = guard_suggestion("ANALYZE users".to_string(), &report);
        assert_eq!(kept, "ANALYZE users");
    }
}

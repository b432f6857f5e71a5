//! Analyzer -> translator flow against literal plan fixtures
//!
//! Run with: `cargo test --test feedback_flow`

use query_doctor::config::{AnalyzerThresholds, Constraints};
use query_doctor::plan::analyzer::ExplainAnalyzer;
use query_doctor::semantic::{FeedbackStatus, Priority, RuleTranslator};
use serde_json::json;

fn translate(explain: serde_json::Value, constraints: &Constraints) -> query_doctor::Feedback {
    let report = ExplainAnalyzer::new(AnalyzerThresholds::default()).analyze(&explain);
    RuleTranslator::translate(&report, constraints)
}

#[test]
fn failing_seq_scan_produces_actionable_fail_feedback() {
    // First iteration of the canonical email-lookup task: full scan over
    // 100k users, cost far beyond the default budget
    let feedback = translate(
        json!([{
            "Plan": {
                "Node Type": "Seq Scan",
                "Relation Name": "users",
                "Total Cost": 55072.45,
                "Plan Rows": 100000,
                "Actual Rows": 100000,
                "Filter": "(email = 'alice@example.com'::text)"
            },
            "Execution Time": 245.4
        }]),
        &Constraints::default(),
    );

    assert_eq!(feedback.status, FeedbackStatus::Fail);
    assert_eq!(feedback.priority, Priority::High);
    assert!(feedback.reason.contains("exceeds limit"));
    assert!(feedback.reason.contains("100000 rows"));
    assert_eq!(
        feedback.suggestion,
        "CREATE INDEX idx_users_email ON users(email)"
    );
}

#[test]
fn indexed_lookup_passes() {
    // Second iteration after the index exists: cheap index scan, no
    // bottlenecks, so the planner should be told to stop
    let feedback = translate(
        json!([{
            "Plan": {
                "Node Type": "Index Scan",
                "Relation Name": "users",
                "Index Name": "idx_users_email",
                "Total Cost": 8.44,
                "Plan Rows": 1,
                "Actual Rows": 1
            },
            "Execution Time": 0.12
        }]),
        &Constraints::default(),
    );

    assert_eq!(feedback.status, FeedbackStatus::Pass);
    assert_eq!(feedback.suggestion, "no action");
}

#[test]
fn cheap_query_with_stale_stats_warns() {
    // Under budget, but the row estimate is off by 90x: only a LOW
    // severity nudge towards ANALYZE, so status is warning, not pass.
    let feedback = translate(
        json!({
            "Plan": {
                "Node Type": "Index Scan",
                "Relation Name": "events",
                "Total Cost": 95.0,
                "Plan Rows": 10,
                "Actual Rows": 900
            }
        }),
        &Constraints::default(),
    );

    assert_eq!(feedback.status, FeedbackStatus::Warning);
    assert!(feedback.suggestion.contains("RUN_ANALYZE") || feedback.suggestion.contains("ANALYZE"));
}

#[test]
fn suggestion_is_taken_verbatim_from_the_analyzer() {
    let explain = json!({
        "Plan": {
            "Node Type": "Seq Scan",
            "Relation Name": "orders",
            "Total Cost": 42000.0,
            "Plan Rows": 50000,
            "Filter": "((o_custkey = 123) AND (o_orderstatus = 'F'::bpchar))"
        }
    });
    let report = ExplainAnalyzer::new(AnalyzerThresholds::default()).analyze(&explain);
    let canonical = report.bottlenecks[0].suggestion.clone();

    let feedback = RuleTranslator::translate(&report, &Constraints::default());
    assert_eq!(feedback.suggestion, canonical);
}

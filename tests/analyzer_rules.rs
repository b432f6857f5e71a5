//! Integration tests for the EXPLAIN bottleneck analyzer
//!
//! Run with: `cargo test --test analyzer_rules`
//!
//! Fixtures mirror real PostgreSQL EXPLAIN (FORMAT JSON) output shapes.

use query_doctor::config::AnalyzerThresholds;
use query_doctor::plan::analyzer::{BottleneckKind, ExplainAnalyzer, Severity};
use serde_json::json;

fn analyzer() -> ExplainAnalyzer {
    ExplainAnalyzer::new(AnalyzerThresholds::default())
}

#[test]
fn large_seq_scan_yields_high_bottleneck_with_index_suggestion() {
    let explain = json!([{
        "Plan": {
            "Node Type": "Seq Scan",
            "Relation Name": "users",
            "Startup Cost": 0.0,
            "Total Cost": 55072.45,
            "Plan Rows": 100000,
            "Plan Width": 244,
            "Actual Rows": 100000,
            "Actual Loops": 1,
            "Filter": "(email = 'alice@example.com'::text)",
            "Rows Removed by Filter": 99999
        },
        "Planning Time": 0.123,
        "Execution Time": 245.456
    }]);

    let report = analyzer().analyze(&explain);

    assert_eq!(report.total_cost, 55072.45);
    assert_eq!(report.execution_time_ms, Some(245.456));
    let seq = report
        .bottlenecks
        .iter()
        .find(|b| b.kind == BottleneckKind::SeqScanLargeTable)
        .expect("seq scan bottleneck");
    assert_eq!(seq.severity, Severity::High);
    assert_eq!(seq.table.as_deref(), Some("users"));
    assert!(seq.reason.contains("100000 rows"));
    assert_eq!(seq.suggestion, "CREATE INDEX idx_users_email ON users(email)");
    assert_eq!(report.optimization_priority, "HIGH");
}

#[test]
fn conjunctive_filter_yields_one_composite_index() {
    let explain = json!({
        "Plan": {
            "Node Type": "Seq Scan",
            "Relation Name": "orders",
            "Total Cost": 42000.0,
            "Plan Rows": 50000,
            "Filter": "((o_custkey = 123) AND (o_orderstatus = 'F'::bpchar))"
        }
    });

    let report = analyzer().analyze(&explain);
    let seq = &report.bottlenecks[0];
    assert_eq!(
        seq.suggestion,
        "CREATE INDEX idx_orders_composite ON orders(o_custkey, o_orderstatus)"
    );
    assert_eq!(seq.columns, vec!["o_custkey", "o_orderstatus"]);
}

#[test]
fn disjunctive_filter_yields_semicolon_joined_single_column_indexes() {
    let explain = json!({
        "Plan": {
            "Node Type": "Seq Scan",
            "Relation Name": "orders",
            "Total Cost": 42000.0,
            "Plan Rows": 50000,
            "Filter": "((o_custkey = 123) OR ((o_orderpriority)::text = '1-URGENT'::text))"
        }
    });

    let report = analyzer().analyze(&explain);
    let seq = &report.bottlenecks[0];
    assert_eq!(
        seq.suggestion,
        "CREATE INDEX idx_orders_o_custkey ON orders(o_custkey); \
         CREATE INDEX idx_orders_o_orderpriority ON orders(o_orderpriority)"
    );
}

#[test]
fn type_cast_filter_extracts_bare_column() {
    let explain = json!({
        "Plan": {
            "Node Type": "Seq Scan",
            "Relation Name": "lineitem",
            "Total Cost": 180000.0,
            "Plan Rows": 6_000_000,
            "Filter": "((lineitem.l_comment)::text = 'rare'::text)"
        }
    });

    let report = analyzer().analyze(&explain);
    let seq = &report.bottlenecks[0];
    assert_eq!(seq.columns, vec!["l_comment"]);
    assert_eq!(
        seq.suggestion,
        "CREATE INDEX idx_lineitem_l_comment ON lineitem(l_comment)"
    );
}

#[test]
fn estimate_error_suggests_run_analyze() {
    let explain = json!({
        "Plan": {
            "Node Type": "Seq Scan",
            "Relation Name": "events",
            "Total Cost": 90.0,
            "Plan Rows": 10,
            "Actual Rows": 900
        }
    });

    let report = analyzer().analyze(&explain);
    let est = report
        .bottlenecks
        .iter()
        .find(|b| b.kind == BottleneckKind::EstimateError)
        .expect("estimate error bottleneck");
    assert_eq!(est.severity, Severity::Low);
    assert_eq!(est.suggestion, "RUN_ANALYZE events");
}

#[test]
fn nested_loop_with_large_inner_recommends_join_index() {
    let explain = json!({
        "Plan": {
            "Node Type": "Nested Loop",
            "Total Cost": 250000.0,
            "Plan Rows": 8000,
            "Join Filter": "(orders.o_custkey = customers.c_custkey)",
            "Plans": [
                {
                    "Node Type": "Seq Scan",
                    "Relation Name": "orders",
                    "Total Cost": 1000.0,
                    "Plan Rows": 800
                },
                {
                    "Node Type": "Seq Scan",
                    "Relation Name": "customers",
                    "Total Cost": 2000.0,
                    "Plan Rows": 150000,
                    "Actual Rows": 150000
                }
            ]
        }
    });

    let report = analyzer().analyze(&explain);
    let nested = report
        .bottlenecks
        .iter()
        .find(|b| b.kind == BottleneckKind::NestedLoopLarge)
        .expect("nested loop bottleneck");
    assert_eq!(nested.severity, Severity::High);
    assert_eq!(nested.table.as_deref(), Some("customers"));
    assert_eq!(
        nested.suggestion,
        "CREATE INDEX idx_customers_c_custkey ON customers(c_custkey)"
    );
}

#[test]
fn disk_sort_recommends_index_on_sort_keys() {
    let explain = json!({
        "Plan": {
            "Node Type": "Sort",
            "Total Cost": 30000.0,
            "Plan Rows": 200000,
            "Plan Width": 64,
            "Sort Key": ["orders.o_orderdate DESC", "orders.o_totalprice"],
            "Sort Method": "external merge  Disk: 102400kB",
            "Plans": [{
                "Node Type": "Seq Scan",
                "Relation Name": "orders",
                "Total Cost": 9000.0,
                "Plan Rows": 200000
            }]
        }
    });

    let report = analyzer().analyze(&explain);
    let sort = report
        .bottlenecks
        .iter()
        .find(|b| b.kind == BottleneckKind::ExternalSort)
        .expect("sort bottleneck");
    assert_eq!(sort.severity, Severity::Medium);
    assert_eq!(
        sort.suggestion,
        "CREATE INDEX idx_orders_composite ON orders(o_orderdate, o_totalprice)"
    );
}

#[test]
fn hash_join_over_inner_seq_scan_composes_join_and_filter_columns() {
    let explain = json!({
        "Plan": {
            "Node Type": "Hash Join",
            "Total Cost": 80000.0,
            "Plan Rows": 5000,
            "Hash Cond": "(orders.o_custkey = customers.c_custkey)",
            "Plans": [
                {
                    "Node Type": "Seq Scan",
                    "Relation Name": "orders",
                    "Total Cost": 30000.0,
                    "Plan Rows": 1500000
                },
                {
                    "Node Type": "Hash",
                    "Total Cost": 40000.0,
                    "Plan Rows": 100000,
                    "Plans": [{
                        "Node Type": "Seq Scan",
                        "Relation Name": "customers",
                        "Total Cost": 39000.0,
                        "Plan Rows": 100000,
                        "Filter": "((c_mktsegment)::text = 'BUILDING'::text)"
                    }]
                }
            ]
        }
    });

    let report = analyzer().analyze(&explain);
    let join = report
        .bottlenecks
        .iter()
        .find(|b| b.kind == BottleneckKind::MissingJoinIndex)
        .expect("missing join index bottleneck");
    assert_eq!(join.table.as_deref(), Some("customers"));
    assert_eq!(join.columns, vec!["c_custkey", "c_mktsegment"]);
    assert_eq!(
        join.suggestion,
        "CREATE INDEX idx_customers_composite ON customers(c_custkey, c_mktsegment)"
    );
}

#[test]
fn parallel_plan_is_analyzed_as_sequential() {
    let explain = json!({
        "Plan": {
            "Node Type": "Gather",
            "Total Cost": 60000.0,
            "Plan Rows": 120000,
            "Plans": [{
                "Node Type": "Parallel Seq Scan",
                "Relation Name": "lineitem",
                "Total Cost": 58000.0,
                "Plan Rows": 120000,
                "Filter": "(l_quantity > '40'::numeric)"
            }]
        }
    });

    let report = analyzer().analyze(&explain);
    let seq = report
        .bottlenecks
        .iter()
        .find(|b| b.kind == BottleneckKind::SeqScanLargeTable)
        .expect("parallel scan treated as seq scan");
    assert_eq!(seq.table.as_deref(), Some("lineitem"));
    assert_eq!(
        seq.suggestion,
        "CREATE INDEX idx_lineitem_l_quantity ON lineitem(l_quantity)"
    );
}

#[test]
fn small_scan_below_threshold_is_quiet() {
    let explain = json!({
        "Plan": {
            "Node Type": "Seq Scan",
            "Relation Name": "tiny",
            "Total Cost": 8.0,
            "Plan Rows": 12
        }
    });

    let report = analyzer().analyze(&explain);
    assert!(report
        .bottlenecks
        .iter()
        .all(|b| b.kind != BottleneckKind::SeqScanLargeTable));
}

#[test]
fn threshold_is_tunable_up_to_ten_thousand() {
    let explain = json!({
        "Plan": {
            "Node Type": "Seq Scan",
            "Relation Name": "mid",
            "Total Cost": 900.0,
            "Plan Rows": 5000,
            "Filter": "(x = 1)"
        }
    });

    let aggressive = ExplainAnalyzer::new(AnalyzerThresholds::default());
    assert!(aggressive
        .analyze(&explain)
        .bottlenecks
        .iter()
        .any(|b| b.kind == BottleneckKind::SeqScanLargeTable));

    let relaxed = ExplainAnalyzer::new(AnalyzerThresholds {
        seq_scan_min_rows: 10_000,
        ..Default::default()
    });
    assert!(relaxed
        .analyze(&explain)
        .bottlenecks
        .iter()
        .all(|b| b.kind != BottleneckKind::SeqScanLargeTable));
}

#[test]
fn malformed_input_yields_warning_not_panic() {
    let report = analyzer().analyze(&json!({"nonsense": true}));
    assert!(report.bottlenecks.is_empty());
    assert!(report.warning.is_some());

    let report = analyzer().analyze_text("this is not json");
    assert!(report.bottlenecks.is_empty());
    assert!(report.warning.is_some());
}

#[test]
fn analysis_is_deterministic() {
    let explain = json!({
        "Plan": {
            "Node Type": "Hash Join",
            "Total Cost": 80000.0,
            "Hash Cond": "(a.id = b.a_id)",
            "Plans": [
                {"Node Type": "Seq Scan", "Relation Name": "a", "Total Cost": 30000.0, "Plan Rows": 200000, "Filter": "(x = 1)"},
                {"Node Type": "Hash", "Total Cost": 40000.0, "Plans": [
                    {"Node Type": "Seq Scan", "Relation Name": "b", "Total Cost": 39000.0, "Plan Rows": 90000, "Filter": "(y = 2)"}
                ]}
            ]
        }
    });

    let first = serde_json::to_string(&analyzer().analyze(&explain)).unwrap();
    let second = serde_json::to_string(&analyzer().analyze(&explain)).unwrap();
    assert_eq!(first, second);
}

//! Integration tests for task loading and harness persistence
//!
//! Run with: `cargo test --test harness_io`

use std::io::Write;

use query_doctor::bench::harness::{aggregate_results, intermediate_log_path};
use query_doctor::bench::{load_tasks, Category};
use query_doctor::config::HarnessConfig;
use tempfile::NamedTempFile;

fn write_task_file(lines: &[&str]) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    for line in lines {
        writeln!(file, "{line}").unwrap();
    }
    file.flush().unwrap();
    file
}

#[test]
fn loads_official_and_legacy_task_shapes() {
    let file = write_task_file(&[
        r#"{"instance_id": 0, "db_id": "financial", "query": "fix it",
            "issue_sql": ["SELECT 1", "SELECT 2"], "category": "Management",
            "preprocess_sql": ["CREATE TABLE t(x int)"], "clean_up_sql": ["DROP TABLE t"],
            "efficiency": false}"#,
        r#"{"instance_id": 1, "db_id": "shop", "query": "speed it up",
            "buggy_sql": "SELECT * FROM users", "category": "Efficiency"}"#,
    ]);

    let tasks = load_tasks(file.path(), None, None, false).unwrap();
    assert_eq!(tasks.len(), 2);

    assert_eq!(tasks[0].issue_sql.len(), 2);
    assert_eq!(tasks[0].category, Category::Management);
    assert_eq!(tasks[0].preprocess_sql, vec!["CREATE TABLE t(x int)"]);

    // Legacy alias folded into a single-element array; the Efficiency
    // category forces the flag
    assert_eq!(tasks[1].issue_sql, vec!["SELECT * FROM users"]);
    assert!(tasks[1].efficiency);
}

#[test]
fn unknown_fields_and_blank_lines_are_tolerated() {
    let file = write_task_file(&[
        r#"{"instance_id": 5, "db_id": "a", "issue_sql": ["SELECT 1"], "extra": [1,2,3]}"#,
        "",
        r#"{"instance_id": 6, "db_id": "b", "issue_sql": ["SELECT 2"], "nested": {"deep": true}}"#,
    ]);
    let tasks = load_tasks(file.path(), None, None, false).unwrap();
    assert_eq!(tasks.len(), 2);
}

#[test]
fn malformed_line_is_a_config_error() {
    let file = write_task_file(&[r#"{"instance_id": oops"#]);
    let err = load_tasks(file.path(), None, None, false).unwrap_err();
    assert!(err.to_string().contains("Configuration error"));
}

#[test]
fn category_filter_and_limit_apply() {
    let lines: Vec<String> = (0..20)
        .map(|i| {
            let category = if i % 2 == 0 { "Query" } else { "Efficiency" };
            format!(
                r#"{{"instance_id": {i}, "db_id": "d", "issue_sql": ["SELECT {i}"], "category": "{category}"}}"#
            )
        })
        .collect();
    let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
    let file = write_task_file(&refs);

    let filtered = load_tasks(file.path(), None, Some("efficiency"), false).unwrap();
    assert_eq!(filtered.len(), 10);
    assert!(filtered.iter().all(|t| t.category == Category::Efficiency));

    let limited = load_tasks(file.path(), Some(3), None, false).unwrap();
    assert_eq!(limited.len(), 3);

    // Smoke mode wins over any explicit limit
    let smoke = load_tasks(file.path(), Some(15), None, true).unwrap();
    assert_eq!(smoke.len(), 10);
}

#[test]
fn connection_template_resolution() {
    let cfg = HarnessConfig {
        connection_template: "postgresql://eval@db-host:5432/{db_id}".to_string(),
        ..Default::default()
    };
    assert_eq!(
        cfg.connection_for("card_games"),
        "postgresql://eval@db-host:5432/card_games"
    );

    let fixed = HarnessConfig {
        connection_template: "postgresql://eval@db-host:5432/bench".to_string(),
        ..Default::default()
    };
    assert_eq!(fixed.connection_for("ignored"), "postgresql://eval@db-host:5432/bench");
}

#[test]
fn intermediate_log_lives_next_to_the_report() {
    assert_eq!(
        intermediate_log_path("/tmp/run7/results.json"),
        std::path::PathBuf::from("/tmp/run7/results_intermediate.jsonl")
    );
    assert_eq!(
        intermediate_log_path("report.json"),
        std::path::PathBuf::from("report_intermediate.jsonl")
    );
}

#[test]
fn aggregate_of_empty_run_has_zero_rate() {
    let agg = aggregate_results(&[]);
    assert_eq!(agg["total_tasks"], 0);
    assert_eq!(agg["success_rate"], 0.0);
}

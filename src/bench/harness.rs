//! Evaluation harness
//!
//! Loads the task file, resolves per-task connection strings, and drives a
//! bounded worker pool over the tasks. Each finished task appends one JSON
//! line to the intermediate log (crash recovery) before the worker
//! returns; the final aggregate report is written atomically at the end.
//! A shutdown signal lets in-flight tasks finish and stops new ones from
//! starting.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{Mutex, Semaphore};
use tracing::{info, warn};

use crate::agent::OptimizationAgent;
use crate::bench::metrics::{metric_for, MetricsEvaluator};
use crate::bench::{load_tasks, Task};
use crate::config::{AgentConfig, AnalyzerThresholds, Constraints, HarnessConfig, LlmConfig};
use crate::error::{AgentError, AgentResult};
use crate::schema;

/// One line of the output report and the intermediate log
#[derive(Clone, Debug, Serialize)]
pub struct TaskResult {
    pub task_id: String,
    pub db_id: String,
    pub category: String,
    pub success: bool,
    pub metric: String,
    pub score: f64,
    pub iterations: u32,
    pub time_seconds: f64,
    pub actions_taken: Vec<String>,
    pub final_query: String,
    pub reason: String,
    pub error: Option<String>,
    pub details: Value,
}

/// Final report document
#[derive(Debug, Serialize)]
pub struct Report {
    pub dataset: String,
    pub total_tasks: usize,
    pub total_time_seconds: f64,
    pub aggregate: Value,
    pub results: Vec<TaskResult>,
}

pub struct Evaluator {
    harness: HarnessConfig,
    agent: AgentConfig,
    constraints: Constraints,
    thresholds: AnalyzerThresholds,
    llm: LlmConfig,
    /// Benchmark schema file (JSON lines keyed by instance_id), optional
    schema_path: Option<PathBuf>,
}

impl Evaluator {
    pub fn new(
        harness: HarnessConfig,
        agent: AgentConfig,
        constraints: Constraints,
        thresholds: AnalyzerThresholds,
        llm: LlmConfig,
        schema_path: Option<PathBuf>,
    ) -> Self {
        Self {
            harness,
            agent,
            constraints,
            thresholds,
            llm,
            schema_path,
        }
    }

    /// Run the full evaluation and write the report
    pub async fn run(&self) -> AgentResult<Report> {
        let started = Instant::now();
        let tasks = load_tasks(
            Path::new(&self.harness.dataset_path),
            self.harness.limit,
            self.harness.category_filter.as_deref(),
            self.harness.smoke,
        )?;
        let total = tasks.len();
        info!(total, dataset = %self.harness.dataset_path, "loaded tasks");

        let intermediate_path = intermediate_log_path(&self.harness.output_path);
        let log_file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&intermediate_path)
            .map_err(|e| {
                AgentError::io_with_path(e.to_string(), intermediate_path.display().to_string())
            })?;
        let log = Arc::new(Mutex::new(log_file));

        let semaphore = Arc::new(Semaphore::new(self.harness.workers.max(1)));
        let shutdown = Arc::new(AtomicBool::new(false));
        let agent = Arc::new(OptimizationAgent::new(
            self.agent.clone(),
            self.constraints.clone(),
            self.thresholds.clone(),
            self.llm.clone(),
        ));

        {
            let shutdown = Arc::clone(&shutdown);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("shutdown requested; letting in-flight tasks finish");
                    shutdown.store(true, Ordering::SeqCst);
                }
            });
        }

        let mut handles = Vec::with_capacity(total);
        for (index, task) in tasks.into_iter().enumerate() {
            let semaphore = Arc::clone(&semaphore);
            let shutdown = Arc::clone(&shutdown);
            let agent = Arc::clone(&agent);
            let log = Arc::clone(&log);
            let conn_str = self.harness.connection_for(&task.db_id);
            let schema_path = self.schema_path.clone();
            let statement_timeout_ms = self.agent.statement_timeout_ms;

            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok()?;
                if shutdown.load(Ordering::SeqCst) {
                    return None;
                }
                let result = evaluate_one(
                    &agent,
                    &task,
                    &conn_str,
                    schema_path.as_deref(),
                    statement_timeout_ms,
                    index + 1,
                    total,
                )
                .await;

                // Flush the intermediate record before the worker returns
                if let Ok(line) = serde_json::to_string(&result) {
                    let mut file = log.lock().await;
                    if let Err(e) = writeln!(file, "{line}").and_then(|_| file.flush()) {
                        warn!("failed to append intermediate result: {e}");
                    }
                }
                Some(result)
            }));
        }

        let mut results = Vec::new();
        for handle in handles {
            match handle.await {
                Ok(Some(result)) => results.push(result),
                Ok(None) => {}
                Err(e) => warn!("worker panicked: {e}"),
            }
        }

        let total_time_seconds = started.elapsed().as_secs_f64();
        let aggregate = aggregate_results(&results);
        let report = Report {
            dataset: self.harness.dataset_path.clone(),
            total_tasks: total,
            total_time_seconds,
            aggregate,
            results,
        };

        write_report_atomically(Path::new(&self.harness.output_path), &report)?;
        info!(
            output = %self.harness.output_path,
            seconds = format!("{total_time_seconds:.1}"),
            "evaluation complete"
        );
        Ok(report)
    }
}

async fn evaluate_one(
    agent: &OptimizationAgent,
    task: &Task,
    conn_str: &str,
    schema_path: Option<&Path>,
    statement_timeout_ms: u64,
    position: usize,
    total: usize,
) -> TaskResult {
    let started = Instant::now();
    info!(task = task.instance_id, "[{position}/{total}] starting");

    let file_schema = schema_path.and_then(|path| {
        schema::load_file_schema(path, task.instance_id)
            .map_err(|e| warn!(task = task.instance_id, "schema file load failed: {e}"))
            .ok()
            .flatten()
    });

    let solution = agent.solve_task(task, conn_str, file_schema).await;

    let metric = metric_for(task);
    let evaluation = if solution.final_query.is_empty() {
        None
    } else {
        let evaluator = MetricsEvaluator::new(conn_str, statement_timeout_ms);
        Some(evaluator.evaluate(task, &solution.final_query, None).await)
    };

    let elapsed = started.elapsed().as_secs_f64();
    let (success, score, details, error) = match evaluation {
        Some(eval) => (eval.passed, eval.score, eval.details, eval.error),
        None => (
            false,
            0.0,
            json!({}),
            Some("agent produced no final query".to_string()),
        ),
    };

    let status = if success { "pass" } else { "fail" };
    info!(
        task = task.instance_id,
        metric,
        score = format!("{score:.3}"),
        seconds = format!("{elapsed:.1}"),
        "[{position}/{total}] {status}: {}",
        solution.reason
    );

    TaskResult {
        task_id: task.instance_id.to_string(),
        db_id: task.db_id.clone(),
        category: task.category.as_str().to_string(),
        success,
        metric: metric.to_string(),
        score,
        iterations: solution.iterations,
        time_seconds: elapsed,
        actions_taken: solution.action_kinds,
        final_query: solution.final_query,
        reason: solution.reason,
        error,
        details,
    }
}

/// Aggregate statistics: totals, rates, means and breakdowns
pub fn aggregate_results(results: &[TaskResult]) -> Value {
    let total = results.len();
    if total == 0 {
        return json!({
            "total_tasks": 0,
            "successful": 0,
            "failed": 0,
            "success_rate": 0.0,
        });
    }

    let successful = results.iter().filter(|r| r.success).count();
    let mean = |f: &dyn Fn(&TaskResult) -> f64| -> f64 {
        results.iter().map(|r| f(r)).sum::<f64>() / total as f64
    };

    let mut by_category: BTreeMap<String, (usize, usize, f64)> = BTreeMap::new();
    let mut by_database: BTreeMap<String, (usize, usize)> = BTreeMap::new();
    let mut by_metric: BTreeMap<String, (usize, usize, f64)> = BTreeMap::new();
    let mut action_histogram: BTreeMap<String, usize> = BTreeMap::new();

    for result in results {
        let c = by_category.entry(result.category.clone()).or_default();
        c.0 += 1;
        c.1 += result.success as usize;
        c.2 += result.score;

        let d = by_database.entry(result.db_id.clone()).or_default();
        d.0 += 1;
        d.1 += result.success as usize;

        let m = by_metric.entry(result.metric.clone()).or_default();
        m.0 += 1;
        m.1 += result.success as usize;
        m.2 += result.score;

        for action in &result.actions_taken {
            *action_histogram.entry(action.clone()).or_default() += 1;
        }
    }

    let breakdown3 = |map: &BTreeMap<String, (usize, usize, f64)>| -> Value {
        Value::Object(
            map.iter()
                .map(|(k, (total, success, score_sum))| {
                    (
                        k.clone(),
                        json!({
                            "total": total,
                            "success": success,
                            "success_rate": *success as f64 / *total as f64,
                            "avg_score": score_sum / *total as f64,
                        }),
                    )
                })
                .collect(),
        )
    };

    json!({
        "total_tasks": total,
        "successful": successful,
        "failed": total - successful,
        "success_rate": successful as f64 / total as f64,
        "avg_score": mean(&|r| r.score),
        "avg_time_per_task": mean(&|r| r.time_seconds),
        "avg_iterations": mean(&|r| r.iterations as f64),
        "by_category": breakdown3(&by_category),
        "by_database": Value::Object(
            by_database
                .iter()
                .map(|(k, (total, success))| {
                    (k.clone(), json!({"total": total, "success": success}))
                })
                .collect(),
        ),
        "by_metric": breakdown3(&by_metric),
        "action_distribution": action_histogram,
    })
}

/// Intermediate log sits next to the report: results.json -> results_intermediate.jsonl
pub fn intermediate_log_path(output_path: &str) -> PathBuf {
    let path = Path::new(output_path);
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("results");
    path.with_file_name(format!("{stem}_intermediate.jsonl"))
}

/// Write the report through a temp file and rename, so readers never see a
/// partial document
fn write_report_atomically(path: &Path, report: &Report) -> AgentResult<()> {
    let body = serde_json::to_string_pretty(report)
        .map_err(|e| AgentError::io(format!("report serialization failed: {e}")))?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, body)
        .map_err(|e| AgentError::io_with_path(e.to_string(), tmp.display().to_string()))?;
    std::fs::rename(&tmp, path)
        .map_err(|e| AgentError::io_with_path(e.to_string(), path.display().to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(category: &str, db: &str, metric: &str, success: bool, score: f64) -> TaskResult {
        TaskResult {
            task_id: "1".to_string(),
            db_id: db.to_string(),
            category: category.to_string(),
            success,
            metric: metric.to_string(),
            score,
            iterations: 2,
            time_seconds: 1.5,
            actions_taken: vec!["CREATE_INDEX".to_string(), "DONE".to_string()],
            final_query: "SELECT 1".to_string(),
            reason: "done".to_string(),
            error: None,
            details: json!({}),
        }
    }

    #[test]
    fn aggregate_computes_rates_and_breakdowns() {
        let results = vec![
            result("Query", "db_a", "soft_ex", true, 1.0),
            result("Query", "db_a", "soft_ex", false, 0.0),
            result("Efficiency", "db_b", "qep", true, 0.6),
        ];
        let agg = aggregate_results(&results);
        assert_eq!(agg["total_tasks"], 3);
        assert_eq!(agg["successful"], 2);
        assert!((agg["success_rate"].as_f64().unwrap() - 2.0 / 3.0).abs() < 1e-9);
        assert!((agg["avg_score"].as_f64().unwrap() - (1.6 / 3.0)).abs() < 1e-9);
        assert_eq!(agg["by_category"]["Query"]["total"], 2);
        assert_eq!(agg["by_database"]["db_b"]["success"], 1);
        assert_eq!(agg["action_distribution"]["CREATE_INDEX"], 3);
    }

    #[test]
    fn empty_aggregate_is_well_formed() {
        let agg = aggregate_results(&[]);
        assert_eq!(agg["total_tasks"], 0);
        assert_eq!(agg["success_rate"], 0.0);
    }

    #[test]
    fn intermediate_path_derives_from_output() {
        assert_eq!(
            intermediate_log_path("out/results.json"),
            PathBuf::from("out/results_intermediate.jsonl")
        );
    }
}

//! ReAct agent controller
//!
//! Drives one task through Analyze -> Plan -> Act -> re-probe iterations
//! until the planner declares Done/Failed or a budget runs out. All
//! component failures are folded into feedback or iteration outcomes; the
//! loop itself never propagates an error.

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::agent::action::{self, Action};
use crate::agent::executor::{ExecOutcome, Executor};
use crate::agent::hypo;
use crate::agent::memory::{classify_delta, IterationMemory, IterationRecord, Outcome};
use crate::agent::planner::{Planner, PlannerContext};
use crate::bench::{Category, Task};
use crate::config::{AgentConfig, AnalyzerThresholds, Constraints, LlmConfig};
use crate::db::classify::{classify, missing_object_name, ErrorCategory};
use crate::db::PgSession;
use crate::llm::LlmClient;
use crate::plan::analyzer::ExplainAnalyzer;
use crate::plan::parse_explain;
use crate::schema::SchemaOracle;
use crate::semantic::{Feedback, FeedbackStatus, LlmTranslator, RuleTranslator};

/// Final outcome of one task
#[derive(Clone, Debug, Serialize)]
pub struct Solution {
    pub initial_query: String,
    pub final_query: String,
    pub success: bool,
    pub reason: String,
    /// Action kinds in the order they were taken
    pub action_kinds: Vec<String>,
    pub iterations: u32,
    pub records: Vec<IterationRecord>,
    /// Set when a Management batch executed end to end
    pub workflow_complete: bool,
    pub final_cost: Option<f64>,
}

enum AnalysisOutcome {
    Feedback(Box<Feedback>, f64),
    /// Syntax-class failure: feedback plus the DDL prohibition flag
    SyntaxBroken(Box<Feedback>),
    /// Transient engine error, worth retrying the iteration once
    Transient(String),
}

enum TranslatorMode {
    Rule,
    Llm(LlmTranslator),
}

/// The autonomous optimization agent
pub struct OptimizationAgent {
    config: AgentConfig,
    constraints: Constraints,
    thresholds: AnalyzerThresholds,
    llm: LlmConfig,
}

impl OptimizationAgent {
    pub fn new(
        config: AgentConfig,
        constraints: Constraints,
        thresholds: AnalyzerThresholds,
        llm: LlmConfig,
    ) -> Self {
        Self {
            config,
            constraints,
            thresholds,
            llm,
        }
    }

    /// Optimize one task against its database. `file_schema` is the
    /// benchmark's canonical schema text for this task, when available.
    pub async fn solve_task(
        &self,
        task: &Task,
        conn_str: &str,
        file_schema: Option<String>,
    ) -> Solution {
        let start = Instant::now();
        let deadline = Duration::from_secs(self.config.timeout_per_task_secs);

        let mut queries = task.issue_sql.clone();
        let initial_query = queries.join(";\n");
        if queries.is_empty() {
            return self.finish(task, conn_str, Solution {
                initial_query,
                final_query: String::new(),
                success: false,
                reason: "no statements provided in task".to_string(),
                action_kinds: Vec::new(),
                iterations: 0,
                records: Vec::new(),
                workflow_complete: false,
                final_cost: None,
            })
            .await;
        }

        self.run_setup(task, conn_str).await;

        // Multi-statement Management sequences are executed as one
        // transactional batch when every statement is valid; a syntax
        // error means this is a debugging task and the loop must repair
        // the SQL instead.
        if queries.len() > 1 && task.category == Category::Management {
            match self.try_batch(&queries, conn_str).await {
                BatchOutcome::Executed => {
                    info!(task = task.instance_id, "management batch executed");
                    return self
                        .finish(task, conn_str, Solution {
                            initial_query,
                            final_query: queries.join(";\n"),
                            success: true,
                            reason: format!(
                                "multi-statement batch executed successfully ({} statements)",
                                queries.len()
                            ),
                            action_kinds: Vec::new(),
                            iterations: 0,
                            records: Vec::new(),
                            workflow_complete: true,
                            final_cost: None,
                        })
                        .await;
                }
                BatchOutcome::SyntaxError(msg) => {
                    debug!(task = task.instance_id, "batch gated on syntax error: {msg}");
                    // fall through to the repair loop
                }
                BatchOutcome::OtherError(msg) => {
                    return self
                        .finish(task, conn_str, Solution {
                            initial_query,
                            final_query: queries.join(";\n"),
                            success: false,
                            reason: format!("batch execution failed: {msg}"),
                            action_kinds: Vec::new(),
                            iterations: 0,
                            records: Vec::new(),
                            workflow_complete: false,
                            final_cost: None,
                        })
                        .await;
                }
            }
        }

        let analyzer = ExplainAnalyzer::new(self.thresholds.clone());
        let llm_client = LlmClient::new(&self.llm);
        let translator = if self.config.rule_based_feedback {
            TranslatorMode::Rule
        } else {
            TranslatorMode::Llm(LlmTranslator::new(LlmClient::new(&self.llm)))
        };
        let planner = Planner::new(llm_client, self.config.thinking_budget_tokens);

        let mut oracle = SchemaOracle::new(conn_str).with_file_schema(file_schema);
        let hypo_available = hypo::is_available(conn_str).await;

        let mut memory = IterationMemory::new();
        let mut executed_ddl: BTreeSet<String> = BTreeSet::new();
        let mut action_kinds: Vec<String> = Vec::new();
        let mut final_cost: Option<f64> = None;

        let mut iteration: u32 = 0;
        let mut transient_retry_used = false;

        while iteration < self.config.max_iterations {
            if start.elapsed() > deadline {
                return self
                    .finish(task, conn_str, Solution {
                        initial_query,
                        final_query: queries.join(";\n"),
                        success: false,
                        reason: "timeout".to_string(),
                        action_kinds,
                        iterations: iteration,
                        records: memory.records().to_vec(),
                        workflow_complete: false,
                        final_cost,
                    })
                    .await;
            }

            // STEP 1: Analyze
            let (feedback, cost_before, syntax_broken) =
                match self.analyze_phase(&queries, conn_str, &analyzer, &translator).await {
                    AnalysisOutcome::Feedback(fb, cost) => (*fb, cost, false),
                    AnalysisOutcome::SyntaxBroken(fb) => (*fb, 0.0, true),
                    AnalysisOutcome::Transient(msg) => {
                        if transient_retry_used {
                            return self
                                .finish(task, conn_str, Solution {
                                    initial_query,
                                    final_query: queries.join(";\n"),
                                    success: false,
                                    reason: format!("repeated transient database error: {msg}"),
                                    action_kinds,
                                    iterations: iteration,
                                    records: memory.records().to_vec(),
                                    workflow_complete: false,
                                    final_cost,
                                })
                                .await;
                        }
                        warn!(task = task.instance_id, "transient error, retrying iteration: {msg}");
                        transient_retry_used = true;
                        continue;
                    }
                };
            transient_retry_used = false;
            if cost_before > 0.0 {
                final_cost = Some(cost_before);
            }

            // STEP 2: Plan
            let schema_text = oracle.schema_for(&queries).await.unwrap_or_default();
            let stagnation = memory.stagnation_warning();
            let planned = planner
                .plan(&PlannerContext {
                    task,
                    current_sql: &queries,
                    feedback: &feedback,
                    memory: &memory,
                    schema_text: &schema_text,
                    constraints: &self.constraints,
                    iteration,
                    max_iterations: self.config.max_iterations,
                    executed_ddl: &executed_ddl,
                    syntax_broken,
                    hypo_available,
                    stagnation_warning: stagnation.as_deref(),
                })
                .await;

            info!(
                task = task.instance_id,
                iteration = iteration + 1,
                action = planned.action.kind(),
                "planned action"
            );
            action_kinds.push(planned.action.kind().to_string());

            // STEP 3: Terminal?
            match &planned.action {
                Action::Done { reason } => {
                    return self
                        .finish(task, conn_str, Solution {
                            initial_query,
                            final_query: queries.join(";\n"),
                            success: true,
                            reason: reason.clone(),
                            action_kinds,
                            iterations: iteration + 1,
                            records: memory.records().to_vec(),
                            workflow_complete: false,
                            final_cost,
                        })
                        .await;
                }
                Action::Failed { reason } => {
                    return self
                        .finish(task, conn_str, Solution {
                            initial_query,
                            final_query: queries.join(";\n"),
                            success: false,
                            reason: reason.clone(),
                            action_kinds,
                            iterations: iteration + 1,
                            records: memory.records().to_vec(),
                            workflow_complete: false,
                            final_cost,
                        })
                        .await;
                }
                _ => {}
            }

            // STEP 4: Act
            let executor = Executor {
                conn_str,
                statement_timeout_ms: self.config.statement_timeout_ms,
                hypo_available,
            };
            let exec_outcome = executor.apply(&planned.action, &mut queries, &mut oracle).await;

            match (&planned.action, &exec_outcome) {
                (Action::CreateIndex { ddl }, ExecOutcome::Applied { .. }) => {
                    executed_ddl.insert(action::normalize_ddl(ddl));
                }
                (Action::RunAnalyze { table }, ExecOutcome::Applied { .. }) => {
                    executed_ddl.insert(format!("ANALYZE:{}", table.to_lowercase()));
                }
                (Action::CreateIndex { ddl }, ExecOutcome::Error(msg))
                    if classify(msg) == ErrorCategory::AlreadyExists =>
                {
                    // Treat as executed so the planner stops proposing it
                    executed_ddl.insert(action::normalize_ddl(ddl));
                }
                _ => {}
            }

            // STEP 5: Re-probe on a fresh connection so session-scoped
            // state from any prior hypothetical test cannot contaminate
            // the measurement
            let cost_after = self
                .reprobe_cost(&queries, conn_str)
                .await
                .unwrap_or(cost_before);
            if cost_after > 0.0 {
                final_cost = Some(cost_after);
            }

            let (delta_pct, mut outcome) = classify_delta(cost_before, cost_after);
            let mut insight = match &exec_outcome {
                ExecOutcome::Error(msg) => {
                    outcome = Outcome::Error;
                    Some(truncate(msg, 120))
                }
                ExecOutcome::Tested(report) => Some(report.verdict()),
                _ => None,
            };
            if insight.is_none() && outcome == Outcome::Unchanged {
                insight = match &planned.action {
                    Action::CreateIndex { .. } => {
                        Some("index created but not used by planner".to_string())
                    }
                    _ => Some("no measurable performance change".to_string()),
                };
            }
            if insight.is_none() && outcome == Outcome::Regressed {
                insight = Some("action increased query cost".to_string());
            }

            memory.push(IterationRecord {
                ordinal: iteration + 1,
                action_kind: planned.action.kind().to_string(),
                action_summary: planned.action.summary(),
                cost_before,
                cost_after,
                delta_pct,
                outcome,
                insight,
            });

            iteration += 1;

            // Early stop once the floor is cleared and nothing is moving;
            // a pass status would have produced Done above.
            if iteration >= self.config.min_iterations {
                if memory.ineffective_actions(2) && feedback.status != FeedbackStatus::Pass {
                    return self
                        .finish(task, conn_str, Solution {
                            initial_query,
                            final_query: queries.join(";\n"),
                            success: false,
                            reason: "no progress: last actions left query cost unchanged or worse"
                                .to_string(),
                            action_kinds,
                            iterations: iteration,
                            records: memory.records().to_vec(),
                            workflow_complete: false,
                            final_cost,
                        })
                        .await;
                }
            }
        }

        self.finish(task, conn_str, Solution {
            initial_query,
            final_query: queries.join(";\n"),
            success: false,
            reason: format!("max iterations ({}) reached", self.config.max_iterations),
            action_kinds,
            iterations: self.config.max_iterations,
            records: memory.records().to_vec(),
            workflow_complete: false,
            final_cost,
        })
        .await
    }

    /// Two-phase EXPLAIN and translation into feedback
    async fn analyze_phase(
        &self,
        queries: &[String],
        conn_str: &str,
        analyzer: &ExplainAnalyzer,
        translator: &TranslatorMode,
    ) -> AnalysisOutcome {
        let Some(current) = queries.first() else {
            return AnalysisOutcome::Feedback(
                Box::new(Feedback::error("empty query set", "no action")),
                0.0,
            );
        };

        // A timed EXPLAIN of DDL is meaningless; feedback comes from
        // static inspection only.
        if is_ddl(current) {
            return AnalysisOutcome::Feedback(
                Box::new(Feedback {
                    status: FeedbackStatus::Warning,
                    reason: "statement is DDL; plan analysis does not apply".to_string(),
                    suggestion: "no action".to_string(),
                    priority: crate::semantic::Priority::Low,
                    report: Default::default(),
                }),
                0.0,
            );
        }

        let session = match PgSession::connect(conn_str).await {
            Ok(s) => s,
            Err(e) => return AnalysisOutcome::Transient(e.to_string()),
        };

        let estimated = match session.explain_estimated(current).await {
            Ok(value) => value,
            Err(e) => return self.feedback_for_engine_error(&e.to_string()),
        };

        let est_cost = parse_explain(&estimated)
            .map(|t| t.root.total_cost)
            .unwrap_or(0.0);

        // Phase two: timed run, only when the estimate says it is cheap
        // enough to execute at all
        let explain_value = if est_cost <= self.constraints.analyze_cost_threshold {
            match session
                .explain_analyze(current, self.config.statement_timeout_ms)
                .await
            {
                Ok(value) => value,
                Err(e) => {
                    debug!("timed EXPLAIN failed, using estimate: {e}");
                    estimated
                }
            }
        } else {
            estimated
        };

        let report = analyzer.analyze(&explain_value);
        let cost = report.total_cost;
        let feedback = match translator {
            TranslatorMode::Rule => RuleTranslator::translate(&report, &self.constraints),
            TranslatorMode::Llm(t) => t.translate(&report, &self.constraints).await,
        };
        AnalysisOutcome::Feedback(Box::new(feedback), cost)
    }

    fn feedback_for_engine_error(&self, message: &str) -> AnalysisOutcome {
        match classify(message) {
            ErrorCategory::Syntax => AnalysisOutcome::SyntaxBroken(Box::new(Feedback::critical_fail(
                format!("CRITICAL: SQL syntax error - {}", truncate(message, 160)),
                "REWRITE the query to produce valid PostgreSQL syntax",
            ))),
            ErrorCategory::AggregateInWhere => {
                AnalysisOutcome::SyntaxBroken(Box::new(Feedback::critical_fail(
                    "CRITICAL: aggregate function in WHERE clause. Either the column does not \
                     exist and shadows an aggregate name, or the condition belongs in HAVING",
                    "REWRITE the query: verify the column exists in the schema, or move the \
                     aggregate condition to a HAVING clause",
                )))
            }
            ErrorCategory::MissingObject => {
                let object = missing_object_name(message).unwrap_or_else(|| "object".to_string());
                AnalysisOutcome::SyntaxBroken(Box::new(Feedback::critical_fail(
                    format!("CRITICAL: referenced {object} does not exist"),
                    "REWRITE the query using only table and column names from the schema",
                )))
            }
            category if category.is_transient() => AnalysisOutcome::Transient(message.to_string()),
            _ => AnalysisOutcome::Feedback(
                Box::new(Feedback::error(
                    format!("EXPLAIN failed: {}", truncate(message, 160)),
                    "no action",
                )),
                0.0,
            ),
        }
    }

    async fn reprobe_cost(&self, queries: &[String], conn_str: &str) -> Option<f64> {
        let current = queries.first()?;
        if is_ddl(current) {
            return None;
        }
        let session = PgSession::connect(conn_str).await.ok()?;
        let value = session.explain_estimated(current).await.ok()?;
        parse_explain(&value).ok().map(|t| t.root.total_cost)
    }

    /// Run the task's preprocess statements. Idempotence is expected:
    /// "already exists" failures are logged and skipped.
    async fn run_setup(&self, task: &Task, conn_str: &str) {
        if task.preprocess_sql.is_empty() {
            return;
        }
        let Ok(session) = PgSession::connect(conn_str).await else {
            warn!(task = task.instance_id, "setup connection failed");
            return;
        };
        for (i, sql) in task.preprocess_sql.iter().enumerate() {
            match session.simple(sql).await {
                Ok(_) => debug!(task = task.instance_id, "setup statement {} ok", i + 1),
                Err(e) => {
                    let msg = e.to_string();
                    if classify(&msg) == ErrorCategory::AlreadyExists {
                        debug!(task = task.instance_id, "setup statement {} skipped: exists", i + 1);
                    } else {
                        warn!(task = task.instance_id, "setup statement {} failed: {msg}", i + 1);
                    }
                }
            }
        }
    }

    async fn try_batch(&self, queries: &[String], conn_str: &str) -> BatchOutcome {
        let mut session = match PgSession::connect(conn_str).await {
            Ok(s) => s,
            Err(e) => return BatchOutcome::OtherError(e.to_string()),
        };
        let tx = match session.transaction().await {
            Ok(tx) => tx,
            Err(e) => return BatchOutcome::OtherError(e.to_string()),
        };

        for (i, sql) in queries.iter().enumerate() {
            if let Err(e) = crate::db::simple_in_tx(&tx, sql).await {
                let msg = e.to_string();
                // Transaction rolls back on drop
                return match classify(&msg) {
                    ErrorCategory::Syntax => BatchOutcome::SyntaxError(msg),
                    _ => BatchOutcome::OtherError(format!("statement {} failed: {msg}", i + 1)),
                };
            }
        }

        match tx.commit().await {
            Ok(()) => BatchOutcome::Executed,
            Err(e) => BatchOutcome::OtherError(e.to_string()),
        }
    }

    /// Run cleanup statements and return the finished solution
    async fn finish(&self, task: &Task, conn_str: &str, solution: Solution) -> Solution {
        if !task.clean_up_sql.is_empty() {
            if let Ok(session) = PgSession::connect(conn_str).await {
                for (i, sql) in task.clean_up_sql.iter().enumerate() {
                    if let Err(e) = session.simple(sql).await {
                        warn!(task = task.instance_id, "cleanup statement {} failed: {e}", i + 1);
                    }
                }
            }
        }
        solution
    }
}

enum BatchOutcome {
    Executed,
    SyntaxError(String),
    OtherError(String),
}

/// DDL statements cannot be EXPLAINed meaningfully
pub fn is_ddl(sql: &str) -> bool {
    let head = sql
        .trim_start()
        .split_whitespace()
        .next()
        .unwrap_or("")
        .to_uppercase();
    matches!(
        head.as_str(),
        "CREATE" | "ALTER" | "DROP" | "TRUNCATE" | "GRANT" | "REVOKE" | "COMMENT" | "VACUUM" | "ANALYZE"
    )
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let cut = s
        .char_indices()
        .take_while(|(i, _)| *i <= max)
        .last()
        .map(|(i, _)| i)
        .unwrap_or(0);
    format!("{}...", &s[..cut])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ddl_detection() {
        assert!(is_ddl("CREATE TABLE t (x int)"));
        assert!(is_ddl("  alter table t add column y int"));
        assert!(!is_ddl("SELECT * FROM t"));
        assert!(!is_ddl("UPDATE t SET x = 1"));
        assert!(!is_ddl("WITH c AS (SELECT 1) SELECT * FROM c"));
    }

    #[test]
    fn truncation_appends_ellipsis() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("0123456789abc", 10), "0123456789...");
    }
}

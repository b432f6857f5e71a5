//! LLM planner
//!
//! Builds one structured prompt per iteration from the task intent, the
//! current SQL, the latest feedback, the compressed iteration memory, the
//! schema and the category-specific rules, then asks the model for exactly
//! one JSON action.

use std::collections::BTreeSet;

use crate::agent::action::{parse_planner_response, PlannedAction};
use crate::agent::memory::IterationMemory;
use crate::bench::{Category, Task};
use crate::config::Constraints;
use crate::llm::LlmClient;
use crate::semantic::Feedback;

const SYSTEM_PREAMBLE: &str = "\
You are an expert PostgreSQL optimizer agent. You decide ONE next action per \
iteration to repair and optimize the query below. Decisions must be \
conservative, grounded in the feedback and the schema, and correctness \
always beats performance. Respond with a single JSON object and nothing else.";

/// Everything the planner needs to decide the next action
pub struct PlannerContext<'a> {
    pub task: &'a Task,
    pub current_sql: &'a [String],
    pub feedback: &'a Feedback,
    pub memory: &'a IterationMemory,
    pub schema_text: &'a str,
    pub constraints: &'a Constraints,
    pub iteration: u32,
    pub max_iterations: u32,
    /// Normalised keys of DDL already executed this task
    pub executed_ddl: &'a BTreeSet<String>,
    /// The last EXPLAIN failed with a syntax-class error; DDL is pointless
    /// until the statement parses
    pub syntax_broken: bool,
    /// The hypothetical-index extension answered the availability probe
    pub hypo_available: bool,
    pub stagnation_warning: Option<&'a str>,
}

pub struct Planner {
    client: LlmClient,
    thinking_budget: u32,
}

impl Planner {
    pub fn new(client: LlmClient, thinking_budget: u32) -> Self {
        Self {
            client,
            thinking_budget,
        }
    }

    /// One planning call. Transport or parse failures surface as a
    /// `Failed` action, never as an error.
    pub async fn plan(&self, ctx: &PlannerContext<'_>) -> PlannedAction {
        let prompt = build_prompt(ctx);
        match self.client.generate(&prompt, true, self.thinking_budget).await {
            Ok(response) => parse_planner_response(&response),
            Err(e) => PlannedAction::failed(format!("planning error: {e}")),
        }
    }
}

/// Assemble the planning prompt. Public so tests can assert on its shape
/// without a live endpoint.
pub fn build_prompt(ctx: &PlannerContext<'_>) -> String {
    let mut sections: Vec<String> = Vec::new();

    sections.push(SYSTEM_PREAMBLE.to_string());

    sections.push(format!(
        "TASK CONTEXT:\n- Task: {}\n- Database: {}\n- Intent: {}\n- Category: {}\n- Iteration: {} of {}",
        ctx.task.instance_id,
        ctx.task.db_id,
        ctx.task.query,
        ctx.task.category.as_str(),
        ctx.iteration + 1,
        ctx.max_iterations,
    ));

    let sql_block = ctx.current_sql.join(";\n");
    sections.push(format!("CURRENT SQL:\n```sql\n{sql_block}\n```"));

    sections.push(format!(
        "DATABASE SCHEMA (exact names, types, keys, indexes, sample rows):\n{}",
        if ctx.schema_text.is_empty() {
            "unavailable"
        } else {
            ctx.schema_text
        }
    ));

    sections.push(render_feedback(ctx));

    let memory = ctx.memory.render_window();
    if !memory.is_empty() {
        sections.push(memory);
    }

    if !ctx.executed_ddl.is_empty() {
        let mut lines = vec!["ALREADY EXECUTED DDL (do NOT repeat any of these):".to_string()];
        for key in ctx.executed_ddl {
            lines.push(format!("  - {key}"));
        }
        sections.push(lines.join("\n"));
    }

    if let Some(warning) = ctx.stagnation_warning {
        sections.push(warning.to_string());
    }

    sections.push(render_action_grammar(ctx));
    sections.push(render_category_rules(ctx));

    sections.push(
        "Respond with ONLY this JSON object, no markdown fences, no prose:\n\
         {\"action\": \"CREATE_INDEX\" | \"REWRITE_QUERY\" | \"RUN_ANALYZE\" | \"TEST_INDEX\" | \"DONE\" | \"FAILED\",\n \
          \"reasoning\": \"why\",\n \
          \"ddl\": \"CREATE INDEX ... / only for CREATE_INDEX and TEST_INDEX\",\n \
          \"table\": \"only for RUN_ANALYZE\",\n \
          \"new_query\": \"only for REWRITE_QUERY\",\n \
          \"confidence\": 0.0}"
            .to_string(),
    );

    sections.join("\n\n")
}

fn render_feedback(ctx: &PlannerContext<'_>) -> String {
    let fb = ctx.feedback;
    let mut out = format!(
        "PERFORMANCE FEEDBACK:\nStatus: {:?}\nReason: {}\nSuggestion: {}\nPriority: {:?}",
        fb.status, fb.reason, fb.suggestion, fb.priority
    );

    let report = &fb.report;
    if report.total_cost > 0.0 {
        out.push_str(&format!(
            "\n\nCOST: current {:.0}, budget {:.0} ({:.2}x of budget)",
            report.total_cost,
            ctx.constraints.max_cost,
            report.total_cost / ctx.constraints.max_cost
        ));
    }
    if !report.bottlenecks.is_empty() {
        out.push_str("\n\nTOP BOTTLENECKS:");
        for (i, b) in report.bottlenecks.iter().take(3).enumerate() {
            out.push_str(&format!(
                "\n  {}. [{}] {} -> fix: {}",
                i + 1,
                b.severity.as_str(),
                b.reason,
                b.suggestion
            ));
        }
    }
    out
}

fn render_action_grammar(ctx: &PlannerContext<'_>) -> String {
    let mut lines = vec!["AVAILABLE ACTIONS:".to_string()];

    if ctx.syntax_broken {
        lines.push(
            "The current SQL does not parse. DDL actions are forbidden until the \
             syntax is valid: choose REWRITE_QUERY to fix the statement, or FAILED."
                .to_string(),
        );
        lines.push("1. REWRITE_QUERY - fix the SQL so it parses and matches the intent".to_string());
        lines.push("2. FAILED - the statement cannot be repaired".to_string());
        return lines.join("\n");
    }

    lines.push("1. CREATE_INDEX - execute index DDL; use when feedback suggests an index".to_string());
    lines.push(
        "2. REWRITE_QUERY - restructure the query; use ONLY column names from the schema above"
            .to_string(),
    );
    lines.push("3. RUN_ANALYZE - refresh planner statistics when estimates are far off".to_string());
    if ctx.hypo_available {
        lines.push(
            "4. TEST_INDEX - score an index hypothetically before building it (needs ddl)"
                .to_string(),
        );
    }
    lines.push(
        "5. DONE - status is pass, or no further improvement is plausible".to_string(),
    );
    lines.push("6. FAILED - no productive action remains (explain why)".to_string());
    lines.join("\n")
}

fn render_category_rules(ctx: &PlannerContext<'_>) -> String {
    let mut rules: Vec<String> = vec!["DECISION RULES:".to_string()];

    rules.push(
        "- Correctness first: on a CRITICAL reason or logic error, REWRITE_QUERY before any DDL"
            .to_string(),
    );

    match ctx.task.category {
        Category::Management => {
            if ctx.current_sql.len() > 1 {
                rules.push(format!(
                    "- This Management task has {} statements. You may emit a single \
                     REWRITE_QUERY whose new_query contains the full semicolon-separated \
                     sequence; statements execute in order.",
                    ctx.current_sql.len()
                ));
            }
        }
        Category::Efficiency => {
            rules.push(
                "- Efficiency task: prefer CREATE_INDEX or RUN_ANALYZE over query rewrites"
                    .to_string(),
            );
        }
        Category::Query | Category::Personalization => {}
    }

    let sql_upper = ctx.current_sql.join(" ").to_uppercase();
    if sql_upper.contains("UPDATE") && sql_upper.contains("RETURNING") {
        rules.push(
            "- PostgreSQL limitation: UPDATE ... RETURNING cannot reference a table \
             joined in FROM. Rewrite with a CTE: WITH updated AS (UPDATE ... RETURNING \
             base columns) SELECT ... FROM updated JOIN other ON ..."
                .to_string(),
        );
    }

    rules.push("- Do not repeat DDL listed as already executed".to_string());
    rules.push(
        "- If an index exists but plans still show a sequential scan, RUN_ANALYZE or rewrite"
            .to_string(),
    );
    rules.push("- Choose DONE when status is pass; do not keep iterating for marginal gains".to_string());
    rules.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::semantic::Feedback;

    fn task(category: Category, issue_sql: Vec<&str>) -> Task {
        serde_json::from_str::<Task>(&format!(
            r#"{{"instance_id": 7, "db_id": "tpch", "query": "speed this up",
                "issue_sql": {}, "category": "{}"}}"#,
            serde_json::to_string(&issue_sql).unwrap(),
            category.as_str()
        ))
        .unwrap()
    }

    fn base_feedback() -> Feedback {
        Feedback::critical_fail("CRITICAL: syntax error", "rewrite")
    }

    #[test]
    fn syntax_broken_grammar_forbids_ddl() {
        let task = task(Category::Query, vec!["SELEC * FROM t"]);
        let sql = vec!["SELEC * FROM t".to_string()];
        let feedback = base_feedback();
        let memory = IterationMemory::new();
        let executed = BTreeSet::new();
        let constraints = Constraints::default();
        let ctx = PlannerContext {
            task: &task,
            current_sql: &sql,
            feedback: &feedback,
            memory: &memory,
            schema_text: "",
            constraints: &constraints,
            iteration: 0,
            max_iterations: 10,
            executed_ddl: &executed,
            syntax_broken: true,
            hypo_available: true,
            stagnation_warning: None,
        };
        let prompt = build_prompt(&ctx);
        assert!(prompt.contains("DDL actions are forbidden"));
        assert!(!prompt.contains("1. CREATE_INDEX"));
    }

    #[test]
    fn management_multi_statement_rule_is_injected() {
        let task = task(Category::Management, vec!["CREATE TABLE a(x int)", "DROP TABLE b"]);
        let sql: Vec<String> = task.issue_sql.clone();
        let feedback = base_feedback();
        let memory = IterationMemory::new();
        let executed = BTreeSet::new();
        let constraints = Constraints::default();
        let ctx = PlannerContext {
            task: &task,
            current_sql: &sql,
            feedback: &feedback,
            memory: &memory,
            schema_text: "",
            constraints: &constraints,
            iteration: 0,
            max_iterations: 10,
            executed_ddl: &executed,
            syntax_broken: false,
            hypo_available: false,
            stagnation_warning: None,
        };
        let prompt = build_prompt(&ctx);
        assert!(prompt.contains("full semicolon-separated"));
        // hypo probe failed, so the grammar must not offer TEST_INDEX
        assert!(!prompt.contains("TEST_INDEX - score an index"));
    }

    #[test]
    fn update_returning_rule_fires_on_matching_sql() {
        let task = task(
            Category::Query,
            vec!["UPDATE t SET x = 1 FROM u WHERE t.id = u.id RETURNING u.name"],
        );
        let sql: Vec<String> = task.issue_sql.clone();
        let feedback = base_feedback();
        let memory = IterationMemory::new();
        let executed = BTreeSet::new();
        let constraints = Constraints::default();
        let ctx = PlannerContext {
            task: &task,
            current_sql: &sql,
            feedback: &feedback,
            memory: &memory,
            schema_text: "",
            constraints: &constraints,
            iteration: 0,
            max_iterations: 10,
            executed_ddl: &executed,
            syntax_broken: false,
            hypo_available: false,
            stagnation_warning: None,
        };
        let prompt = build_prompt(&ctx);
        assert!(prompt.contains("WITH updated AS"));
    }
}

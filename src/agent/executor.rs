//! Action executor
//!
//! Applies one planner decision to the world: DDL and statistics refreshes
//! run on fresh connections outside any evaluation transaction, rewrites
//! replace the agent's working query set, and hypothetical tests delegate
//! to the prover. Every engine failure is captured as an outcome, never
//! propagated as a panic or error across the loop boundary.

use tracing::{debug, info};

use crate::agent::action::Action;
use crate::agent::hypo::{self, HypoIndexReport};
use crate::db::PgSession;
use crate::schema::SchemaOracle;

/// What applying one action did
#[derive(Clone, Debug)]
pub enum ExecOutcome {
    /// DDL or ANALYZE ran; `mutated` says the database changed
    Applied { mutated: bool },
    /// The working query set was replaced
    QueryReplaced,
    /// A hypothetical index was scored
    Tested(HypoIndexReport),
    /// Terminal action; the controller ends the loop
    Terminal,
    /// The action failed; the reason feeds the iteration record
    Error(String),
}

pub struct Executor<'a> {
    pub conn_str: &'a str,
    pub statement_timeout_ms: u64,
    pub hypo_available: bool,
}

impl<'a> Executor<'a> {
    /// Single dispatch on the action tag
    pub async fn apply(
        &self,
        action: &Action,
        queries: &mut Vec<String>,
        oracle: &mut SchemaOracle,
    ) -> ExecOutcome {
        match action {
            Action::CreateIndex { ddl } => match self.run_ddl(ddl).await {
                Ok(()) => {
                    // The next schema fetch must list the new index
                    oracle.invalidate_indexes();
                    ExecOutcome::Applied { mutated: true }
                }
                Err(e) => ExecOutcome::Error(e),
            },

            Action::RunAnalyze { table } => {
                match self.run_ddl(&format!("ANALYZE {table}")).await {
                    Ok(()) => ExecOutcome::Applied { mutated: true },
                    Err(e) => ExecOutcome::Error(e),
                }
            }

            Action::RewriteQuery { new_sql } => {
                let statements = split_statements(new_sql);
                if statements.is_empty() {
                    return ExecOutcome::Error("rewrite produced no statements".to_string());
                }
                debug!("query set replaced with {} statement(s)", statements.len());
                *queries = statements;
                ExecOutcome::QueryReplaced
            }

            Action::TestIndex { ddl, probe_query } => {
                if !self.hypo_available {
                    return ExecOutcome::Error(
                        "hypothetical index test unavailable: extension not installed".to_string(),
                    );
                }
                let probe = probe_query
                    .as_deref()
                    .or_else(|| queries.first().map(String::as_str));
                let Some(probe) = probe else {
                    return ExecOutcome::Error("no probe query for TEST_INDEX".to_string());
                };
                let report = hypo::test_index(self.conn_str, ddl, probe).await;
                info!("hypothetical index test: {}", report.verdict());
                ExecOutcome::Tested(report)
            }

            Action::Done { .. } | Action::Failed { .. } => ExecOutcome::Terminal,
        }
    }

    async fn run_ddl(&self, ddl: &str) -> Result<(), String> {
        let session = match PgSession::connect(self.conn_str).await {
            Ok(s) => s,
            Err(e) => return Err(format!("connection failed: {e}")),
        };
        session
            .execute_ddl(ddl, self.statement_timeout_ms)
            .await
            .map(|_| ())
            .map_err(|e| e.to_string())
    }
}

/// Split semicolon-separated SQL into an ordered statement list, ignoring
/// semicolons inside string literals and dollar-quoted bodies.
pub fn split_statements(sql: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut chars = sql.chars().peekable();
    let mut in_string = false;
    let mut in_dollar = false;

    while let Some(ch) = chars.next() {
        match ch {
            '\'' if !in_dollar => {
                in_string = !in_string;
                current.push(ch);
            }
            '$' if !in_string => {
                if chars.peek() == Some(&'$') {
                    chars.next();
                    current.push_str("$$");
                    in_dollar = !in_dollar;
                } else {
                    current.push(ch);
                }
            }
            ';' if !in_string && !in_dollar => {
                let stmt = current.trim();
                if !stmt.is_empty() {
                    statements.push(stmt.to_string());
                }
                current.clear();
            }
            _ => current.push(ch),
        }
    }
    let stmt = current.trim();
    if !stmt.is_empty() {
        statements.push(stmt.to_string());
    }
    statements
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_top_level_semicolons() {
        let stmts = split_statements("CREATE TABLE a(x int); INSERT INTO a VALUES (1);");
        assert_eq!(stmts, vec!["CREATE TABLE a(x int)", "INSERT INTO a VALUES (1)"]);
    }

    #[test]
    fn semicolon_in_literal_is_preserved() {
        let stmts = split_statements("SELECT 'a;b' FROM t; SELECT 2");
        assert_eq!(stmts, vec!["SELECT 'a;b' FROM t", "SELECT 2"]);
    }

    #[test]
    fn dollar_quoted_body_is_one_statement() {
        let stmts = split_statements("CREATE FUNCTION f() RETURNS void AS $$ BEGIN; END $$ LANGUAGE plpgsql; SELECT 1");
        assert_eq!(stmts.len(), 2);
        assert!(stmts[0].contains("BEGIN; END"));
    }

    #[test]
    fn empty_input_yields_no_statements() {
        assert!(split_statements("  ;  ;  ").is_empty());
    }
}

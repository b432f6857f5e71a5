//! Action space of the optimization loop
//!
//! The planner's decision is a tagged variant; the executor performs a
//! single dispatch on the tag. Parsing from the LLM response runs through
//! three tiers: a fenced JSON block, a bare JSON object, and finally a
//! regex that salvages just the action kind. Anything that still fails
//! becomes `Failed`, never a crash.

use regex::Regex;
use serde_json::Value;

use crate::llm::client::extract_json;

/// One action in the optimization loop
#[derive(Clone, Debug, PartialEq)]
pub enum Action {
    CreateIndex { ddl: String },
    RewriteQuery { new_sql: String },
    RunAnalyze { table: String },
    TestIndex { ddl: String, probe_query: Option<String> },
    Done { reason: String },
    Failed { reason: String },
}

impl Action {
    /// Wire name of the action kind
    pub fn kind(&self) -> &'static str {
        match self {
            Action::CreateIndex { .. } => "CREATE_INDEX",
            Action::RewriteQuery { .. } => "REWRITE_QUERY",
            Action::RunAnalyze { .. } => "RUN_ANALYZE",
            Action::TestIndex { .. } => "TEST_INDEX",
            Action::Done { .. } => "DONE",
            Action::Failed { .. } => "FAILED",
        }
    }

    /// Terminal actions end the loop; nothing may follow them
    pub fn is_terminal(&self) -> bool {
        matches!(self, Action::Done { .. } | Action::Failed { .. })
    }

    pub fn mutates_database(&self) -> bool {
        matches!(
            self,
            Action::CreateIndex { .. } | Action::RunAnalyze { .. } | Action::TestIndex { .. }
        )
    }

    /// Compact summary for iteration memory, a few tokens at most:
    /// the index name, the table, or the kind itself.
    pub fn summary(&self) -> String {
        match self {
            Action::CreateIndex { ddl } | Action::TestIndex { ddl, .. } => {
                index_name(ddl).unwrap_or_else(|| "index".to_string())
            }
            Action::RewriteQuery { .. } => "query".to_string(),
            Action::RunAnalyze { table } => table.clone(),
            Action::Done { .. } => "done".to_string(),
            Action::Failed { .. } => "failed".to_string(),
        }
    }
}

/// A planner decision: the action plus the model's stated rationale and
/// confidence
#[derive(Clone, Debug)]
pub struct PlannedAction {
    pub action: Action,
    pub rationale: String,
    pub confidence: f64,
}

impl PlannedAction {
    pub fn failed(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self {
            action: Action::Failed {
                reason: reason.clone(),
            },
            rationale: reason,
            confidence: 1.0,
        }
    }
}

/// Parse the planner's LLM response into an action.
///
/// Tier 1: fenced JSON block. Tier 2: bare JSON object. Tier 3: regex for
/// the action kind alone. Missing required fields coerce to `Failed`.
pub fn parse_planner_response(response: &str) -> PlannedAction {
    let json_str = extract_json(response);

    if let Ok(value) = serde_json::from_str::<Value>(&json_str) {
        return action_from_value(&value);
    }

    // Last resort: the model at least named an action
    let kind_re =
        Regex::new(r"(?i)\b(CREATE_INDEX|REWRITE_QUERY|RUN_ANALYZE|TEST_INDEX|DONE|FAILED)\b")
            .expect("static regex");
    if let Some(cap) = kind_re.captures(response) {
        let kind = cap[1].to_uppercase();
        return match kind.as_str() {
            "DONE" => PlannedAction {
                action: Action::Done {
                    reason: "planner reported completion".to_string(),
                },
                rationale: "salvaged from unstructured response".to_string(),
                confidence: 0.0,
            },
            "FAILED" => PlannedAction::failed("planner reported failure"),
            // Non-terminal kinds are useless without their payload
            other => PlannedAction::failed(format!(
                "planning error: {other} response carried no payload"
            )),
        };
    }

    PlannedAction::failed("planning error")
}

fn action_from_value(value: &Value) -> PlannedAction {
    let kind = value
        .get("action")
        .or_else(|| value.get("type"))
        .and_then(Value::as_str)
        .map(str::to_uppercase)
        .unwrap_or_default();

    let rationale = value
        .get("reasoning")
        .or_else(|| value.get("rationale"))
        .and_then(Value::as_str)
        .unwrap_or("no reasoning provided")
        .to_string();
    let confidence = value
        .get("confidence")
        .and_then(Value::as_f64)
        .unwrap_or(1.0)
        .clamp(0.0, 1.0);

    let str_field = |name: &str| value.get(name).and_then(Value::as_str).map(str::to_string);

    let action = match kind.as_str() {
        "CREATE_INDEX" => match str_field("ddl") {
            Some(ddl) if !ddl.trim().is_empty() => Action::CreateIndex { ddl },
            _ => {
                return PlannedAction::failed("CREATE_INDEX response missing ddl field");
            }
        },
        "REWRITE_QUERY" => match str_field("new_query").or_else(|| str_field("new_sql")) {
            Some(new_sql) if !new_sql.trim().is_empty() => Action::RewriteQuery { new_sql },
            _ => {
                return PlannedAction::failed("REWRITE_QUERY response missing new_query field");
            }
        },
        "RUN_ANALYZE" => {
            let table = str_field("table")
                .or_else(|| str_field("ddl").as_deref().and_then(analyze_table));
            match table {
                Some(table) if !table.trim().is_empty() => Action::RunAnalyze { table },
                _ => {
                    return PlannedAction::failed("RUN_ANALYZE response missing table field");
                }
            }
        }
        "TEST_INDEX" => match str_field("ddl") {
            Some(ddl) if !ddl.trim().is_empty() => Action::TestIndex {
                ddl,
                probe_query: str_field("probe_query"),
            },
            _ => {
                return PlannedAction::failed("TEST_INDEX response missing ddl field");
            }
        },
        "DONE" => Action::Done {
            reason: str_field("reason").unwrap_or_else(|| rationale.clone()),
        },
        "FAILED" => Action::Failed {
            reason: str_field("reason").unwrap_or_else(|| rationale.clone()),
        },
        other => {
            return PlannedAction::failed(format!("planning error: unknown action kind {other:?}"));
        }
    };

    PlannedAction {
        action,
        rationale,
        confidence,
    }
}

/// `CREATE INDEX <name>` -> name
pub fn index_name(ddl: &str) -> Option<String> {
    let re = Regex::new(r"(?i)CREATE\s+INDEX\s+(?:CONCURRENTLY\s+)?(?:IF\s+NOT\s+EXISTS\s+)?(\w+)")
        .expect("static regex");
    re.captures(ddl).map(|c| c[1].to_string())
}

/// `ANALYZE <table>` -> table
pub fn analyze_table(ddl: &str) -> Option<String> {
    let re = Regex::new(r"(?i)ANALYZE\s+(\w+)").expect("static regex");
    re.captures(ddl).map(|c| c[1].to_string())
}

/// Normalised key for duplicate detection: the index name or the analyzed
/// table, independent of DDL formatting
pub fn normalize_ddl(ddl: &str) -> String {
    if let Some(name) = index_name(ddl) {
        return format!("INDEX:{}", name.to_lowercase());
    }
    if let Some(table) = analyze_table(ddl) {
        return format!("ANALYZE:{}", table.to_lowercase());
    }
    ddl.chars().take(100).collect::<String>().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fenced_create_index() {
        let response = "```json\n{\"action\": \"CREATE_INDEX\", \"reasoning\": \"seq scan\", \
                        \"ddl\": \"CREATE INDEX idx_users_email ON users(email)\", \"confidence\": 0.9}\n```";
        let planned = parse_planner_response(response);
        assert_eq!(
            planned.action,
            Action::CreateIndex {
                ddl: "CREATE INDEX idx_users_email ON users(email)".to_string()
            }
        );
        assert!((planned.confidence - 0.9).abs() < f64::EPSILON);
    }

    #[test]
    fn parses_bare_json_with_prose() {
        let response = "I'll finish here. {\"action\": \"DONE\", \"reasoning\": \"status pass\"}";
        let planned = parse_planner_response(response);
        assert!(matches!(planned.action, Action::Done { .. }));
    }

    #[test]
    fn salvages_kind_from_unstructured_text() {
        let planned = parse_planner_response("The best course of action is DONE now.");
        assert!(matches!(planned.action, Action::Done { .. }));
        assert_eq!(planned.confidence, 0.0);
    }

    #[test]
    fn unparseable_response_becomes_failed() {
        let planned = parse_planner_response("no structure at all");
        assert_eq!(
            planned.action,
            Action::Failed {
                reason: "planning error".to_string()
            }
        );
    }

    #[test]
    fn create_index_without_ddl_is_coerced_to_failed() {
        let planned = parse_planner_response("{\"action\": \"CREATE_INDEX\"}");
        assert!(matches!(planned.action, Action::Failed { .. }));
    }

    #[test]
    fn rewrite_without_query_is_coerced_to_failed() {
        let planned = parse_planner_response("{\"action\": \"REWRITE_QUERY\", \"reasoning\": \"x\"}");
        assert!(matches!(planned.action, Action::Failed { .. }));
    }

    #[test]
    fn run_analyze_accepts_ddl_form() {
        let planned =
            parse_planner_response("{\"action\": \"RUN_ANALYZE\", \"ddl\": \"ANALYZE users;\"}");
        assert_eq!(
            planned.action,
            Action::RunAnalyze {
                table: "users".to_string()
            }
        );
    }

    #[test]
    fn ddl_normalisation_keys() {
        assert_eq!(
            normalize_ddl("CREATE INDEX Idx_Users_Email ON users(email)"),
            "INDEX:idx_users_email"
        );
        assert_eq!(normalize_ddl("ANALYZE Orders;"), "ANALYZE:orders");
    }

    #[test]
    fn summaries_are_compact() {
        let action = Action::CreateIndex {
            ddl: "CREATE INDEX idx_users_email ON users(email)".to_string(),
        };
        assert_eq!(action.summary(), "idx_users_email");
        let action = Action::RunAnalyze {
            table: "users".to_string(),
        };
        assert_eq!(action.summary(), "users");
    }
}

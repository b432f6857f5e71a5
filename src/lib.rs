//! # Query Doctor
//!
//! An autonomous PostgreSQL query-optimization and repair agent with an
//! evaluation harness for benchmark task files.
//!
//! Given a failing or slow query plus its natural-language intent, the
//! agent iterates an Analyze -> Plan -> Act -> Validate loop: it parses
//! EXPLAIN plans into a bottleneck report, asks an LLM planner for one
//! corrective action (index DDL, statistics refresh, or query rewrite),
//! applies it, and re-measures, stopping when the query passes its cost
//! constraints or a budget runs out. The harness runs benchmark tasks in
//! parallel, validates outcomes under transaction isolation, and scores
//! them with the three official metrics (result equivalence, workflow
//! validation, plan-cost comparison).
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use query_doctor::agent::OptimizationAgent;
//! use query_doctor::config::{AgentConfig, AnalyzerThresholds, Constraints, LlmConfig};
//!
//! # async fn run() {
//! let agent = OptimizationAgent::new(
//!     AgentConfig::default(),
//!     Constraints::default(),
//!     AnalyzerThresholds::default(),
//!     LlmConfig::default(),
//! );
//! let task = serde_json::from_str(
//!     r#"{"instance_id": 1, "db_id": "shop",
//!         "query": "find a user by email",
//!         "issue_sql": ["SELECT * FROM users WHERE email = 'a@example.com'"],
//!         "category": "Efficiency", "efficiency": true}"#,
//! ).unwrap();
//! let solution = agent
//!     .solve_task(&task, "postgresql://postgres@localhost/shop", None)
//!     .await;
//! println!("success={} in {} iterations", solution.success, solution.iterations);
//! # }
//! ```

pub mod agent;
pub mod bench;
pub mod config;
pub mod db;
pub mod error;
pub mod llm;
pub mod plan;
pub mod schema;
pub mod semantic;

// Public API - main types users need
pub use agent::{Action, OptimizationAgent, Solution};
pub use bench::harness::Evaluator;
pub use bench::{Category, Task};
pub use config::{AgentConfig, AnalyzerThresholds, Constraints, HarnessConfig, LlmConfig};
pub use error::{AgentError, AgentResult};
pub use plan::analyzer::{AnalysisReport, Bottleneck, ExplainAnalyzer, Severity};
pub use semantic::{Feedback, FeedbackStatus};

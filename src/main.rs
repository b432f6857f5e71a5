use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use tracing_subscriber::EnvFilter;

use query_doctor::bench::harness::Evaluator;
use query_doctor::config::{
    AgentConfig, AnalyzerThresholds, Constraints, HarnessConfig, LlmConfig,
};

fn usage() -> &'static str {
    "query_doctor - autonomous PostgreSQL query optimization evaluation

USAGE:
  query_doctor --dataset <tasks.jsonl> --db-connection <template> [options]

OPTIONS:
  --dataset <path>          JSON-lines task file (required)
  --db-connection <str>     Connection template; {db_id} is substituted per task
  --output <path>           Report path (default: results.json)
  --schema-file <path>      Benchmark schema file keyed by instance_id
  --limit <n>               Evaluate only the first n tasks
  --category <name>         Only tasks of this category
  --workers <n>             Worker pool size (default: 4)
  --max-iterations <n>      Iteration ceiling per task (default: 10)
  --min-iterations <n>      Iteration floor before early stopping (default: 3)
  --task-timeout <secs>     Wall-clock budget per task (default: 120)
  --llm-url <url>           LLM endpoint base URL
  --llm-model <name>        LLM model identifier
  --rule-feedback           Use the deterministic translator (no LLM feedback)
  --smoke                   Smoke test: first 10 tasks only
"
}

fn parse_args(args: &[String]) -> Result<(HarnessConfig, AgentConfig, LlmConfig, Option<PathBuf>)> {
    let mut harness = HarnessConfig::default();
    let mut agent = AgentConfig::default();
    let mut llm = LlmConfig::default();
    let mut schema_path = None;
    let mut dataset_seen = false;

    let mut iter = args.iter();
    while let Some(flag) = iter.next() {
        let mut value = |name: &str| -> Result<String> {
            iter.next()
                .cloned()
                .with_context(|| format!("missing value for {name}"))
        };
        match flag.as_str() {
            "--dataset" => {
                harness.dataset_path = value("--dataset")?;
                dataset_seen = true;
            }
            "--db-connection" => harness.connection_template = value("--db-connection")?,
            "--output" => harness.output_path = value("--output")?,
            "--schema-file" => schema_path = Some(PathBuf::from(value("--schema-file")?)),
            "--limit" => harness.limit = Some(value("--limit")?.parse().context("--limit")?),
            "--category" => harness.category_filter = Some(value("--category")?),
            "--workers" => harness.workers = value("--workers")?.parse().context("--workers")?,
            "--max-iterations" => {
                agent.max_iterations = value("--max-iterations")?.parse().context("--max-iterations")?
            }
            "--min-iterations" => {
                agent.min_iterations = value("--min-iterations")?.parse().context("--min-iterations")?
            }
            "--task-timeout" => {
                agent.timeout_per_task_secs =
                    value("--task-timeout")?.parse().context("--task-timeout")?
            }
            "--llm-url" => llm.base_url = value("--llm-url")?,
            "--llm-model" => llm.model = value("--llm-model")?,
            "--rule-feedback" => agent.rule_based_feedback = true,
            "--smoke" => harness.smoke = true,
            "--help" | "-h" => bail!("{}", usage()),
            other => bail!("unknown flag: {other}\n\n{}", usage()),
        }
    }

    if !dataset_seen {
        bail!("--dataset is required\n\n{}", usage());
    }
    Ok((harness, agent, llm, schema_path))
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.iter().any(|a| a == "--help" || a == "-h") {
        println!("{}", usage());
        return ExitCode::SUCCESS;
    }
    let (harness, agent, llm, schema_path) = match parse_args(&args) {
        Ok(parsed) => parsed,
        Err(e) => {
            eprintln!("{e}");
            // Non-zero exit only on unrecoverable configuration errors
            return ExitCode::FAILURE;
        }
    };

    let evaluator = Evaluator::new(
        harness,
        agent,
        Constraints::default(),
        AnalyzerThresholds::default(),
        llm,
        schema_path,
    );

    match evaluator.run().await {
        Ok(report) => {
            println!(
                "{} tasks, success rate {:.1}%, report written",
                report.total_tasks,
                report.aggregate["success_rate"].as_f64().unwrap_or(0.0) * 100.0
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("evaluation failed to start: {e}");
            ExitCode::FAILURE
        }
    }
}

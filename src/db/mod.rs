//! Low-level PostgreSQL driver
//!
//! Thin wrapper over tokio-postgres: one spawned connection driver per
//! session, text-protocol query execution, EXPLAIN retrieval in both
//! estimated and timed forms, and DDL with a scoped statement timeout.
//!
//! Everything rides on the simple-query (text) protocol. Result values come
//! back as strings, which is exactly what the result-equivalence metric and
//! the EXPLAIN JSON parser want, and it keeps multi-statement batches and
//! `SET LOCAL` scoping trivial.

pub mod classify;

use serde_json::Value;
use tokio_postgres::{Client, NoTls, SimpleQueryMessage, Transaction};
use tracing::{debug, warn};

use crate::error::{AgentError, AgentResult};

/// Rows and metadata captured from one statement
#[derive(Clone, Debug, Default)]
pub struct QueryOutput {
    pub columns: Vec<String>,
    /// Text-protocol values; `None` is SQL NULL
    pub rows: Vec<Vec<Option<String>>>,
    /// Affected-row count reported by the command tag
    pub affected: u64,
}

impl QueryOutput {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}

/// One database session: a client plus its spawned connection driver
pub struct PgSession {
    client: Client,
}

impl PgSession {
    /// Connect and spawn the connection driver task
    pub async fn connect(conn_str: &str) -> AgentResult<Self> {
        let (client, connection) = tokio_postgres::connect(conn_str, NoTls)
            .await
            .map_err(|e| AgentError::database(format!("connection failed: {e}")))?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!("postgres connection closed: {e}");
            }
        });

        Ok(Self { client })
    }

    /// Run one statement through the text protocol
    pub async fn simple(&self, sql: &str) -> AgentResult<QueryOutput> {
        let messages = self
            .client
            .simple_query(sql)
            .await
            .map_err(|e| AgentError::database_with_statement(e.to_string(), sql))?;
        Ok(collect_output(messages))
    }

    /// Run several statements as one implicit-transaction batch
    pub async fn batch(&self, sql: &str) -> AgentResult<()> {
        self.client
            .batch_execute(sql)
            .await
            .map_err(|e| AgentError::database_with_statement(e.to_string(), sql))
    }

    /// Estimated EXPLAIN: plain cost model, never executes the statement
    pub async fn explain_estimated(&self, sql: &str) -> AgentResult<Value> {
        let output = self.simple(&format!("EXPLAIN (FORMAT JSON) {sql}")).await?;
        explain_json(&output)
    }

    /// Timed EXPLAIN ANALYZE with a statement timeout scoped to this call.
    ///
    /// The whole thing runs inside a rolled-back transaction: `SET LOCAL`
    /// keeps the timeout from leaking to later statements on this
    /// connection, and the rollback undoes any writes a DML statement would
    /// have performed while being measured.
    pub async fn explain_analyze(&self, sql: &str, timeout_ms: u64) -> AgentResult<Value> {
        self.client
            .batch_execute(&format!("BEGIN; SET LOCAL statement_timeout = {timeout_ms}"))
            .await
            .map_err(|e| AgentError::database(e.to_string()))?;

        let result = self
            .simple(&format!(
                "EXPLAIN (ANALYZE true, COSTS true, VERBOSE false, FORMAT JSON) {sql}"
            ))
            .await;

        // Roll back regardless of outcome so neither the timeout setting
        // nor measured side effects survive.
        if let Err(e) = self.client.batch_execute("ROLLBACK").await {
            warn!("rollback after timed EXPLAIN failed: {e}");
        }

        explain_json(&result?)
    }

    /// Execute DDL (CREATE INDEX, ANALYZE) under a statement timeout.
    /// Runs in an explicit transaction so the `SET LOCAL` timeout cannot
    /// leak; the transaction commits on success.
    pub async fn execute_ddl(&self, ddl: &str, timeout_ms: u64) -> AgentResult<u64> {
        // CREATE INDEX CONCURRENTLY refuses to run inside a transaction
        // block; scope the timeout with an explicit set/reset instead.
        if ddl.to_uppercase().contains("CONCURRENTLY") {
            self.client
                .batch_execute(&format!("SET statement_timeout = {timeout_ms}"))
                .await
                .map_err(|e| AgentError::database(e.to_string()))?;
            let result = self.simple(ddl).await;
            if let Err(e) = self.client.batch_execute("RESET statement_timeout").await {
                warn!("failed to reset statement timeout: {e}");
            }
            return result.map(|output| output.affected);
        }

        self.client
            .batch_execute(&format!("BEGIN; SET LOCAL statement_timeout = {timeout_ms}"))
            .await
            .map_err(|e| AgentError::database(e.to_string()))?;

        let result = self.simple(ddl).await;

        match result {
            Ok(output) => {
                self.client
                    .batch_execute("COMMIT")
                    .await
                    .map_err(|e| AgentError::database(e.to_string()))?;
                debug!("executed DDL: {}", first_line(ddl));
                Ok(output.affected)
            }
            Err(e) => {
                if let Err(rb) = self.client.batch_execute("ROLLBACK").await {
                    warn!("rollback after failed DDL failed: {rb}");
                }
                Err(e)
            }
        }
    }

    /// Begin an explicit transaction (test-case isolation)
    pub async fn transaction(&mut self) -> AgentResult<Transaction<'_>> {
        self.client
            .transaction()
            .await
            .map_err(|e| AgentError::database(e.to_string()))
    }
}

/// Run one statement inside an open transaction
pub async fn simple_in_tx(tx: &Transaction<'_>, sql: &str) -> AgentResult<QueryOutput> {
    let messages = tx
        .simple_query(sql)
        .await
        .map_err(|e| AgentError::database_with_statement(e.to_string(), sql))?;
    Ok(collect_output(messages))
}

fn collect_output(messages: Vec<SimpleQueryMessage>) -> QueryOutput {
    let mut output = QueryOutput::default();
    for message in messages {
        match message {
            SimpleQueryMessage::Row(row) => {
                if output.columns.is_empty() {
                    output.columns = row
                        .columns()
                        .iter()
                        .map(|c| c.name().to_string())
                        .collect();
                }
                let values = (0..row.len())
                    .map(|i| row.get(i).map(str::to_string))
                    .collect();
                output.rows.push(values);
            }
            SimpleQueryMessage::CommandComplete(count) => {
                output.affected = count;
            }
            _ => {}
        }
    }
    output
}

/// EXPLAIN (FORMAT JSON) returns a single row with the whole document
fn explain_json(output: &QueryOutput) -> AgentResult<Value> {
    let text = output
        .rows
        .iter()
        .filter_map(|r| r.first().and_then(|v| v.as_deref()))
        .collect::<Vec<_>>()
        .join("\n");
    if text.is_empty() {
        return Err(AgentError::analysis("EXPLAIN returned no rows"));
    }
    serde_json::from_str(&text)
        .map_err(|e| AgentError::analysis(format!("EXPLAIN output is not JSON: {e}")))
}

fn first_line(s: &str) -> &str {
    s.lines().next().unwrap_or(s)
}

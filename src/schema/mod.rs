//! Schema oracle
//!
//! Supplies the planner with a grounded picture of the task's database:
//! tables with columns and types, primary and foreign keys, existing
//! indexes, and a few sample rows. Two sources feed it, in priority order:
//! the benchmark's schema file (canonical CREATE TABLE text with sample
//! rows) and live pg_catalog introspection. The result is cached for the
//! lifetime of one task; only the index catalog is re-fetched after the
//! agent creates an index.

use std::path::Path;

use serde_json::Value;
use tracing::debug;

use crate::db::PgSession;
use crate::error::{AgentError, AgentResult};

/// One column of a table
#[derive(Clone, Debug)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    pub not_null: bool,
    pub default: Option<String>,
}

/// One index on a table
#[derive(Clone, Debug)]
pub struct IndexInfo {
    pub name: String,
    pub definition: String,
}

/// Everything the oracle knows about one table
#[derive(Clone, Debug, Default)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnInfo>,
    pub primary_key: Vec<String>,
    pub foreign_keys: Vec<String>,
    pub indexes: Vec<IndexInfo>,
    pub row_estimate: Option<i64>,
    pub sample_rows: Vec<String>,
}

/// Canonical schema for one database
#[derive(Clone, Debug, Default)]
pub struct DatabaseSchema {
    pub tables: Vec<TableSchema>,
}

impl DatabaseSchema {
    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        self.tables.iter().find(|t| t.name == name)
    }

    /// Render for the planner prompt
    pub fn render(&self) -> String {
        let mut out = String::new();
        for table in &self.tables {
            out.push_str(&format!("TABLE: {}\n", table.name));
            out.push_str("Columns:\n");
            for col in &table.columns {
                let not_null = if col.not_null { " NOT NULL" } else { "" };
                let default = col
                    .default
                    .as_deref()
                    .map(|d| format!(" DEFAULT {d}"))
                    .unwrap_or_default();
                out.push_str(&format!("  - {}: {}{}{}\n", col.name, col.data_type, not_null, default));
            }
            if !table.primary_key.is_empty() {
                out.push_str(&format!("Primary Key: ({})\n", table.primary_key.join(", ")));
            }
            if !table.foreign_keys.is_empty() {
                out.push_str("Foreign Keys:\n");
                for fk in &table.foreign_keys {
                    out.push_str(&format!("  - {fk}\n"));
                }
            }
            if !table.indexes.is_empty() {
                out.push_str("Indexes:\n");
                for idx in &table.indexes {
                    out.push_str(&format!("  - {}: {}\n", idx.name, idx.definition));
                }
            }
            if let Some(rows) = table.row_estimate {
                out.push_str(&format!("Estimated Rows: ~{rows}\n"));
            }
            if !table.sample_rows.is_empty() {
                out.push_str("Sample Data:\n");
                for (i, row) in table.sample_rows.iter().enumerate() {
                    out.push_str(&format!("  Row {}: {}\n", i + 1, row));
                }
            }
            out.push('\n');
        }
        out
    }
}

/// Per-task schema cache with index-catalog invalidation
pub struct SchemaOracle {
    conn_str: String,
    /// Pre-rendered schema text from the benchmark schema file, preferred
    /// over live introspection when available
    file_schema: Option<String>,
    cached: Option<DatabaseSchema>,
    indexes_dirty: bool,
}

impl SchemaOracle {
    pub fn new(conn_str: impl Into<String>) -> Self {
        Self {
            conn_str: conn_str.into(),
            file_schema: None,
            cached: None,
            indexes_dirty: false,
        }
    }

    pub fn with_file_schema(mut self, schema_text: Option<String>) -> Self {
        self.file_schema = schema_text;
        self
    }

    /// The next schema fetch re-reads the index catalog
    pub fn invalidate_indexes(&mut self) {
        self.indexes_dirty = true;
    }

    /// Schema text for the planner prompt, covering every table referenced
    /// by the given statements. Introspection runs once per task; later
    /// calls serve the cache, refreshing indexes when marked dirty.
    pub async fn schema_for(&mut self, statements: &[String]) -> AgentResult<String> {
        let tables = referenced_tables(statements);

        if self.cached.is_none() {
            self.cached = Some(self.introspect(&tables).await?);
        } else if self.indexes_dirty {
            self.refresh_indexes().await?;
        }
        self.indexes_dirty = false;

        let live = self.cached.as_ref().map(|s| s.render()).unwrap_or_default();

        Ok(match &self.file_schema {
            // The file schema carries sample data and comments the live
            // catalog cannot reproduce; live indexes are appended so the
            // planner still sees DDL the agent has run.
            Some(text) => {
                let index_section = self.render_index_catalog();
                if index_section.is_empty() {
                    text.clone()
                } else {
                    format!("{text}\n\nCURRENT INDEXES:\n{index_section}")
                }
            }
            None => live,
        })
    }

    fn render_index_catalog(&self) -> String {
        let mut out = String::new();
        if let Some(schema) = &self.cached {
            for table in &schema.tables {
                for idx in &table.indexes {
                    out.push_str(&format!("  - {}: {}\n", table.name, idx.definition));
                }
            }
        }
        out
    }

    async fn introspect(&self, tables: &[String]) -> AgentResult<DatabaseSchema> {
        let session = PgSession::connect(&self.conn_str).await?;
        let mut schema = DatabaseSchema::default();

        for table in tables {
            match introspect_table(&session, table).await {
                Ok(Some(ts)) => schema.tables.push(ts),
                Ok(None) => debug!("table {table} not found during introspection"),
                Err(e) => debug!("introspection failed for {table}: {e}"),
            }
        }
        Ok(schema)
    }

    async fn refresh_indexes(&mut self) -> AgentResult<()> {
        let Some(schema) = self.cached.as_mut() else {
            return Ok(());
        };
        let session = PgSession::connect(&self.conn_str).await?;
        for table in &mut schema.tables {
            table.indexes = fetch_indexes(&session, &table.name).await?;
        }
        Ok(())
    }
}

/// Tables referenced by FROM / JOIN / UPDATE / INSERT INTO clauses
pub fn referenced_tables(statements: &[String]) -> Vec<String> {
    let re = regex::Regex::new(r"(?i)\b(?:FROM|JOIN|UPDATE|INTO)\s+([a-zA-Z_][a-zA-Z0-9_]*)")
        .expect("static regex");
    let mut tables = Vec::new();
    for sql in statements {
        for cap in re.captures_iter(sql) {
            let name = cap[1].to_lowercase();
            if !tables.contains(&name) && !is_sql_keyword(&name) {
                tables.push(name);
            }
        }
    }
    tables
}

fn is_sql_keyword(word: &str) -> bool {
    matches!(
        word,
        "select" | "where" | "only" | "lateral" | "unnest" | "values" | "generate_series"
    )
}

async fn introspect_table(session: &PgSession, table: &str) -> AgentResult<Option<TableSchema>> {
    let columns_sql = format!(
        "SELECT a.attname, format_type(a.atttypid, a.atttypmod), a.attnotnull, \
                COALESCE(pg_get_expr(d.adbin, d.adrelid), '') \
         FROM pg_attribute a \
         LEFT JOIN pg_attrdef d ON (a.attrelid, a.attnum) = (d.adrelid, d.adnum) \
         WHERE a.attrelid = '{table}'::regclass AND a.attnum > 0 AND NOT a.attisdropped \
         ORDER BY a.attnum"
    );
    let columns = match session.simple(&columns_sql).await {
        Ok(out) => out,
        // Unknown relation: regclass cast fails
        Err(_) => return Ok(None),
    };
    if columns.rows.is_empty() {
        return Ok(None);
    }

    let mut ts = TableSchema {
        name: table.to_string(),
        ..Default::default()
    };
    for row in &columns.rows {
        ts.columns.push(ColumnInfo {
            name: row.first().cloned().flatten().unwrap_or_default(),
            data_type: row.get(1).cloned().flatten().unwrap_or_default(),
            not_null: row.get(2).cloned().flatten().as_deref() == Some("t"),
            default: row.get(3).cloned().flatten().filter(|d| !d.is_empty()),
        });
    }

    let pk_sql = format!(
        "SELECT a.attname FROM pg_index i \
         JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey) \
         WHERE i.indrelid = '{table}'::regclass AND i.indisprimary \
         ORDER BY array_position(i.indkey, a.attnum)"
    );
    if let Ok(pk) = session.simple(&pk_sql).await {
        ts.primary_key = pk
            .rows
            .iter()
            .filter_map(|r| r.first().cloned().flatten())
            .collect();
    }

    let fk_sql = format!(
        "SELECT pg_get_constraintdef(c.oid) FROM pg_constraint c \
         WHERE c.conrelid = '{table}'::regclass AND c.contype = 'f'"
    );
    if let Ok(fk) = session.simple(&fk_sql).await {
        ts.foreign_keys = fk
            .rows
            .iter()
            .filter_map(|r| r.first().cloned().flatten())
            .collect();
    }

    ts.indexes = fetch_indexes(session, table).await?;

    let stats_sql = format!(
        "SELECT n_live_tup FROM pg_stat_user_tables WHERE relname = '{table}'"
    );
    if let Ok(stats) = session.simple(&stats_sql).await {
        ts.row_estimate = stats
            .rows
            .first()
            .and_then(|r| r.first().cloned().flatten())
            .and_then(|v| v.parse().ok());
    }

    if let Ok(sample) = session.simple(&format!("SELECT * FROM {table} LIMIT 3")).await {
        for row in &sample.rows {
            let rendered = sample
                .columns
                .iter()
                .zip(row.iter())
                .map(|(col, val)| {
                    format!("{col}={}", val.as_deref().unwrap_or("NULL"))
                })
                .collect::<Vec<_>>()
                .join(", ");
            ts.sample_rows.push(rendered);
        }
    }

    Ok(Some(ts))
}

async fn fetch_indexes(session: &PgSession, table: &str) -> AgentResult<Vec<IndexInfo>> {
    let sql = format!(
        "SELECT i.relname, pg_get_indexdef(idx.indexrelid) \
         FROM pg_index idx JOIN pg_class i ON i.oid = idx.indexrelid \
         WHERE idx.indrelid = '{table}'::regclass AND NOT idx.indisprimary \
         ORDER BY i.relname"
    );
    let output = match session.simple(&sql).await {
        Ok(out) => out,
        Err(_) => return Ok(Vec::new()),
    };
    Ok(output
        .rows
        .iter()
        .map(|r| IndexInfo {
            name: r.first().cloned().flatten().unwrap_or_default(),
            definition: r.get(1).cloned().flatten().unwrap_or_default(),
        })
        .collect())
}

/// Load the canonical schema text for one task from the benchmark's schema
/// file: JSON lines keyed by `instance_id` carrying `preprocess_schema`
/// (preferred, has sample rows) or `original_schema`.
pub fn load_file_schema(schema_path: &Path, instance_id: i64) -> AgentResult<Option<String>> {
    let content = std::fs::read_to_string(schema_path)
        .map_err(|e| AgentError::io_with_path(e.to_string(), schema_path.display().to_string()))?;

    for line in content.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let entry: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(_) => continue,
        };
        if entry.get("instance_id").and_then(Value::as_i64) == Some(instance_id) {
            let schema = entry
                .get("preprocess_schema")
                .or_else(|| entry.get("original_schema"))
                .and_then(Value::as_str);
            return Ok(schema.map(str::to_string));
        }
    }
    Ok(None)
}

/// Resolve an instance id to its database name through the benchmark's
/// mapping file (`{"<instance_id>": "<db_id>", ...}`).
pub fn instance_db_mapping(mapping_path: &Path, instance_id: i64) -> AgentResult<Option<String>> {
    let content = std::fs::read_to_string(mapping_path)
        .map_err(|e| AgentError::io_with_path(e.to_string(), mapping_path.display().to_string()))?;
    let mapping: Value = serde_json::from_str(&content)
        .map_err(|e| AgentError::config(format!("mapping file is not JSON: {e}")))?;
    Ok(mapping
        .get(instance_id.to_string())
        .and_then(Value::as_str)
        .map(str::to_string))
}

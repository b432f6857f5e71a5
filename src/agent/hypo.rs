//! Hypothetical-index prover
//!
//! Scores a candidate index without building it, through the host's
//! hypopg extension: create the hypothetical index in a short-lived
//! session, re-plan the probe query, compare estimated costs, and reset.
//! Hypothetical indexes are session-scoped, so the dedicated session also
//! guarantees nothing leaks into other measurements.

use serde_json::Value;
use tracing::debug;

use crate::db::PgSession;
use crate::plan::parse_explain;

/// Cost improvement below this is reported as not beneficial
pub const MIN_IMPROVEMENT_PCT: f64 = 10.0;

/// Result of scoring one hypothetical index
#[derive(Clone, Debug)]
pub struct HypoIndexReport {
    pub index_def: String,
    pub would_be_used: bool,
    pub cost_before: f64,
    pub cost_after: f64,
    pub improvement_pct: f64,
    pub error: Option<String>,
}

impl HypoIndexReport {
    fn errored(index_def: &str, error: String) -> Self {
        Self {
            index_def: index_def.to_string(),
            would_be_used: false,
            cost_before: 0.0,
            cost_after: 0.0,
            improvement_pct: 0.0,
            error: Some(error),
        }
    }

    /// Worth building for real: the planner would use it and the saving
    /// clears the threshold
    pub fn is_beneficial(&self) -> bool {
        self.error.is_none() && self.would_be_used && self.improvement_pct >= MIN_IMPROVEMENT_PCT
    }

    pub fn verdict(&self) -> String {
        if let Some(error) = &self.error {
            format!("hypothetical index test unavailable: {error}")
        } else if self.is_beneficial() {
            format!(
                "beneficial: estimated cost {:.0} -> {:.0} ({:.1}% improvement)",
                self.cost_before, self.cost_after, self.improvement_pct
            )
        } else {
            format!(
                "not beneficial: {:.1}% improvement is below the {MIN_IMPROVEMENT_PCT}% threshold",
                self.improvement_pct
            )
        }
    }
}

/// Probe whether the hypopg extension is installed. Run once per worker;
/// when this says no, the planner never offers TEST_INDEX.
pub async fn is_available(conn_str: &str) -> bool {
    let Ok(session) = PgSession::connect(conn_str).await else {
        return false;
    };
    match session
        .simple("SELECT 1 FROM pg_extension WHERE extname = 'hypopg'")
        .await
    {
        Ok(output) => !output.rows.is_empty(),
        Err(_) => false,
    }
}

/// Score an index definition against a probe query
pub async fn test_index(conn_str: &str, index_def: &str, probe_query: &str) -> HypoIndexReport {
    let session = match PgSession::connect(conn_str).await {
        Ok(s) => s,
        Err(e) => return HypoIndexReport::errored(index_def, format!("connection failed: {e}")),
    };

    let cost_before = match estimated_cost(&session, probe_query).await {
        Ok(c) => c,
        Err(e) => return HypoIndexReport::errored(index_def, e),
    };

    let create = format!("SELECT * FROM hypopg_create_index($${index_def}$$)");
    if let Err(e) = session.simple(&create).await {
        return HypoIndexReport::errored(index_def, format!("hypopg_create_index failed: {e}"));
    }

    let explained = session
        .explain_estimated(probe_query)
        .await
        .map_err(|e| e.to_string());

    // Always drop the hypothetical catalog before reporting
    if let Err(e) = session.simple("SELECT hypopg_reset()").await {
        debug!("hypopg_reset failed: {e}");
    }

    let explain_value: Value = match explained {
        Ok(v) => v,
        Err(e) => return HypoIndexReport::errored(index_def, e),
    };

    let cost_after = match parse_explain(&explain_value) {
        Ok(tree) => tree.root.total_cost,
        Err(e) => return HypoIndexReport::errored(index_def, e.to_string()),
    };

    let would_be_used = explain_value.to_string().to_lowercase().contains("hypo");
    let improvement_pct = if cost_before > 0.0 {
        (cost_before - cost_after) / cost_before * 100.0
    } else {
        0.0
    };

    HypoIndexReport {
        index_def: index_def.to_string(),
        would_be_used,
        cost_before,
        cost_after,
        improvement_pct,
        error: None,
    }
}

async fn estimated_cost(session: &PgSession, query: &str) -> Result<f64, String> {
    let value = session
        .explain_estimated(query)
        .await
        .map_err(|e| e.to_string())?;
    parse_explain(&value)
        .map(|tree| tree.root.total_cost)
        .map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(improvement: f64, used: bool) -> HypoIndexReport {
        HypoIndexReport {
            index_def: "CREATE INDEX idx ON t(c)".to_string(),
            would_be_used: used,
            cost_before: 100.0,
            cost_after: 100.0 - improvement,
            improvement_pct: improvement,
            error: None,
        }
    }

    #[test]
    fn ten_percent_is_the_benefit_threshold() {
        assert!(report(10.0, true).is_beneficial());
        assert!(report(35.0, true).is_beneficial());
        assert!(!report(9.9, true).is_beneficial());
    }

    #[test]
    fn unused_index_is_never_beneficial() {
        assert!(!report(50.0, false).is_beneficial());
    }

    #[test]
    fn errored_report_is_not_beneficial() {
        let r = HypoIndexReport::errored("CREATE INDEX idx ON t(c)", "no extension".to_string());
        assert!(!r.is_beneficial());
        assert!(r.verdict().contains("unavailable"));
    }
}

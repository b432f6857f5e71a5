//! Iteration memory
//!
//! A compressed log of what the loop has already tried: one record per
//! iteration with the action summary, the cost movement and a one-line
//! insight when something went sideways. The planner prompt only ever sees
//! the last `MEMORY_WINDOW` records; older history influences nothing but
//! the stagnation heuristics.

use serde::Serialize;

/// How many past iterations the planner prompt may reference
pub const MEMORY_WINDOW: usize = 2;

/// Cost-delta band treated as noise rather than movement
const SIGNIFICANT_DELTA_PCT: f64 = 5.0;

/// What one action did to the query cost
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Improved,
    Regressed,
    Unchanged,
    Error,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Improved => "improved",
            Outcome::Regressed => "regressed",
            Outcome::Unchanged => "unchanged",
            Outcome::Error => "error",
        }
    }

    fn symbol(&self) -> &'static str {
        match self {
            Outcome::Improved => "+",
            Outcome::Regressed => "-",
            Outcome::Unchanged => "=",
            Outcome::Error => "!",
        }
    }
}

/// One iteration, compressed
#[derive(Clone, Debug, Serialize)]
pub struct IterationRecord {
    pub ordinal: u32,
    pub action_kind: String,
    /// A few tokens: index name, table, or "query"
    pub action_summary: String,
    pub cost_before: f64,
    pub cost_after: f64,
    pub delta_pct: f64,
    pub outcome: Outcome,
    pub insight: Option<String>,
}

impl IterationRecord {
    fn render(&self) -> String {
        let mut line = format!(
            "{} Iter {}: {}({}) -> cost {:+.1}%, {}",
            self.outcome.symbol(),
            self.ordinal,
            self.action_kind,
            self.action_summary,
            self.delta_pct,
            self.outcome.as_str(),
        );
        if let Some(insight) = &self.insight {
            if matches!(self.outcome, Outcome::Regressed | Outcome::Unchanged | Outcome::Error) {
                line.push_str(&format!("\n  note: {insight}"));
            }
        }
        line
    }
}

/// Classify a cost movement: below -5% improved, above +5% regressed,
/// anything between is noise
pub fn classify_delta(cost_before: f64, cost_after: f64) -> (f64, Outcome) {
    let delta_pct = if cost_before > f64::EPSILON {
        (cost_after - cost_before) / cost_before * 100.0
    } else {
        0.0
    };
    let outcome = if delta_pct < -SIGNIFICANT_DELTA_PCT {
        Outcome::Improved
    } else if delta_pct > SIGNIFICANT_DELTA_PCT {
        Outcome::Regressed
    } else {
        Outcome::Unchanged
    };
    (delta_pct, outcome)
}

/// The loop's whole history, window-rendered for prompts
#[derive(Debug, Default)]
pub struct IterationMemory {
    records: Vec<IterationRecord>,
}

impl IterationMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, record: IterationRecord) {
        self.records.push(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[IterationRecord] {
        &self.records
    }

    /// Prompt section with the last `MEMORY_WINDOW` records and the
    /// learning directives. Empty string when there is no history yet.
    pub fn render_window(&self) -> String {
        if self.records.is_empty() {
            return String::new();
        }
        let start = self.records.len().saturating_sub(MEMORY_WINDOW);
        let recent = &self.records[start..];

        let mut lines = vec![format!("ITERATION HISTORY (last {} actions):", recent.len())];
        for record in recent {
            lines.push(record.render());
        }
        lines.push(String::new());
        lines.push("LEARNING FROM HISTORY:".to_string());
        lines.push("- Do NOT repeat an action that regressed (-) or left cost unchanged (=)".to_string());
        lines.push("- If an index was created but the planner ignores it, try RUN_ANALYZE or a rewrite".to_string());
        lines.push("- If status is pass, choose DONE".to_string());
        lines.push("- If no productive action remains, choose FAILED".to_string());
        lines.join("\n")
    }

    /// Less than 1% average cost movement over the last `n` records
    pub fn cost_stagnating(&self, n: usize) -> bool {
        if self.records.len() < n || n == 0 {
            return false;
        }
        let recent = &self.records[self.records.len() - n..];
        let avg: f64 = recent.iter().map(|r| r.delta_pct).sum::<f64>() / n as f64;
        let all_tiny = recent.iter().all(|r| r.delta_pct.abs() < 1.0);
        avg > -0.5 || all_tiny
    }

    /// The last `n` actions all regressed, changed nothing, or errored
    pub fn ineffective_actions(&self, n: usize) -> bool {
        if self.records.len() < n || n == 0 {
            return false;
        }
        self.records[self.records.len() - n..]
            .iter()
            .all(|r| matches!(r.outcome, Outcome::Regressed | Outcome::Unchanged | Outcome::Error))
    }

    /// Warning text for the planner prompt when progress has stalled
    pub fn stagnation_warning(&self) -> Option<String> {
        if self.records.len() >= 3 && self.cost_stagnating(3) {
            Some(
                "STAGNATION: cost has not moved meaningfully in the last iterations. \
                 Choose DONE if optimization ideas are exhausted."
                    .to_string(),
            )
        } else if self.records.len() >= 2 && self.ineffective_actions(2) {
            Some(
                "INEFFECTIVE ACTIONS: the last two actions did not improve cost. \
                 Choose DONE or try a fundamentally different approach."
                    .to_string(),
            )
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(ordinal: u32, delta_pct: f64, outcome: Outcome) -> IterationRecord {
        IterationRecord {
            ordinal,
            action_kind: "CREATE_INDEX".to_string(),
            action_summary: format!("idx_{ordinal}"),
            cost_before: 100.0,
            cost_after: 100.0 * (1.0 + delta_pct / 100.0),
            delta_pct,
            outcome,
            insight: None,
        }
    }

    #[test]
    fn delta_classification_uses_five_percent_band() {
        assert_eq!(classify_delta(100.0, 80.0).1, Outcome::Improved);
        assert_eq!(classify_delta(100.0, 120.0).1, Outcome::Regressed);
        assert_eq!(classify_delta(100.0, 103.0).1, Outcome::Unchanged);
        assert_eq!(classify_delta(100.0, 97.0).1, Outcome::Unchanged);
    }

    #[test]
    fn zero_baseline_is_unchanged() {
        let (delta, outcome) = classify_delta(0.0, 50.0);
        assert_eq!(delta, 0.0);
        assert_eq!(outcome, Outcome::Unchanged);
    }

    #[test]
    fn window_renders_at_most_two_records() {
        let mut memory = IterationMemory::new();
        for i in 1..=5 {
            memory.push(record(i, -10.0, Outcome::Improved));
        }
        let window = memory.render_window();
        assert!(window.contains("Iter 4"));
        assert!(window.contains("Iter 5"));
        assert!(!window.contains("Iter 3"));
        assert!(!window.contains("Iter 1"));
    }

    #[test]
    fn empty_memory_renders_nothing() {
        assert_eq!(IterationMemory::new().render_window(), "");
    }

    #[test]
    fn stagnation_detected_on_tiny_deltas() {
        let mut memory = IterationMemory::new();
        for i in 1..=3 {
            memory.push(record(i, -0.3, Outcome::Unchanged));
        }
        assert!(memory.cost_stagnating(3));
        assert!(memory.stagnation_warning().is_some());
    }

    #[test]
    fn strong_improvement_is_not_stagnation() {
        let mut memory = IterationMemory::new();
        for i in 1..=3 {
            memory.push(record(i, -40.0, Outcome::Improved));
        }
        assert!(!memory.cost_stagnating(3));
        assert!(memory.stagnation_warning().is_none());
    }

    #[test]
    fn ineffective_actions_need_full_run() {
        let mut memory = IterationMemory::new();
        memory.push(record(1, -30.0, Outcome::Improved));
        memory.push(record(2, 0.0, Outcome::Unchanged));
        assert!(!memory.ineffective_actions(2));
        memory.push(record(3, 1.0, Outcome::Unchanged));
        assert!(memory.ineffective_actions(2));
    }
}

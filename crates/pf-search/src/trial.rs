//! Trial records and lifecycle.

use chrono::{DateTime, Utc};
use pf_types::{Assignment, Direction};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state of a single trial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrialState {
    Running,
    Complete,
    Pruned,
    Failed,
}

impl TrialState {
    /// Terminal trials are never mutated again.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// One proposed-and-evaluated unit of work: a single backtest of a sampled
/// parameter assignment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trial {
    pub id: Uuid,
    /// 0-based sequence number, unique and monotonically increasing per study.
    pub number: usize,
    pub assignment: Assignment,
    pub state: TrialState,
    /// Final objective score. `None` until the trial completes; pruned and
    /// failed trials never carry one.
    pub value: Option<f64>,
    /// `(step, value)` pairs reported through the pruning hook.
    pub intermediate: Vec<(u64, f64)>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_secs: Option<f64>,
    pub error: Option<String>,
}

impl Trial {
    pub fn new(number: usize, assignment: Assignment) -> Self {
        Self {
            id: Uuid::new_v4(),
            number,
            assignment,
            state: TrialState::Running,
            value: None,
            intermediate: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
            duration_secs: None,
            error: None,
        }
    }

    pub fn mark_complete(&mut self, value: f64, duration_secs: f64) {
        self.state = TrialState::Complete;
        self.value = Some(value);
        self.finish(duration_secs);
    }

    pub fn mark_pruned(&mut self, duration_secs: f64) {
        self.state = TrialState::Pruned;
        self.finish(duration_secs);
    }

    pub fn mark_failed(&mut self, error: String, duration_secs: f64) {
        self.state = TrialState::Failed;
        self.error = Some(error);
        self.finish(duration_secs);
    }

    fn finish(&mut self, duration_secs: f64) {
        self.finished_at = Some(Utc::now());
        self.duration_secs = Some(duration_secs);
    }

    /// Direction-aware ranking score. Completed trials rank by their actual
    /// value; failed and pruned trials report the worst representable score
    /// so they can never rank first (JSON cannot persist infinities, so the
    /// sentinel lives here rather than in `value`).
    pub fn score(&self, direction: Direction) -> f64 {
        match (self.state, self.value) {
            (TrialState::Complete, Some(v)) => v,
            _ => direction.worst(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.state == TrialState::Complete
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pf_types::ParamValue;
    use std::collections::HashMap;

    fn assignment() -> Assignment {
        let mut map = HashMap::new();
        map.insert("short_period".to_string(), ParamValue::Int(10));
        map
    }

    #[test]
    fn lifecycle_complete() {
        let mut trial = Trial::new(0, assignment());
        assert_eq!(trial.state, TrialState::Running);
        assert!(!trial.state.is_terminal());

        trial.mark_complete(1.8, 0.25);
        assert_eq!(trial.state, TrialState::Complete);
        assert!(trial.state.is_terminal());
        assert_eq!(trial.value, Some(1.8));
        assert!(trial.finished_at.is_some());
        assert_eq!(trial.duration_secs, Some(0.25));
    }

    #[test]
    fn lifecycle_failed() {
        let mut trial = Trial::new(3, assignment());
        trial.mark_failed("backtest panicked".to_string(), 0.1);
        assert_eq!(trial.state, TrialState::Failed);
        assert_eq!(trial.error.as_deref(), Some("backtest panicked"));
        assert_eq!(trial.value, None);
    }

    #[test]
    fn failed_trials_score_worst() {
        let mut trial = Trial::new(0, assignment());
        trial.mark_failed("boom".to_string(), 0.0);
        assert_eq!(trial.score(Direction::Maximize), f64::NEG_INFINITY);
        assert_eq!(trial.score(Direction::Minimize), f64::INFINITY);
    }

    #[test]
    fn record_round_trips_through_json() {
        let mut trial = Trial::new(7, assignment());
        trial.intermediate.push((1, 0.4));
        trial.intermediate.push((2, 0.6));
        trial.mark_complete(0.9, 1.5);

        let line = serde_json::to_string(&trial).unwrap();
        let back: Trial = serde_json::from_str(&line).unwrap();
        assert_eq!(trial, back);
    }

    #[test]
    fn failed_record_round_trips_losslessly() {
        let mut trial = Trial::new(2, assignment());
        trial.mark_failed("division by zero".to_string(), 0.0);

        let line = serde_json::to_string(&trial).unwrap();
        let back: Trial = serde_json::from_str(&line).unwrap();
        assert_eq!(trial, back);
        assert_eq!(back.value, None);
    }
}

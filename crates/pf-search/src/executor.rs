//! Objective invocation with error containment.
//!
//! The [`TrialExecutor`] owns the lifecycle of exactly one trial at a time:
//! it requests an assignment from the sampler, invokes the opaque objective,
//! and converts whatever happens (a score, a pruning signal, an error, a
//! panic) into a terminal [`Trial`] record. A failing trial never aborts
//! the study; it is logged, reported to the optional diagnostic sink, and
//! recorded as FAILED.

use parking_lot::{Mutex, RwLock};
use pf_types::{Assignment, ObjectiveError};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tracing::{debug, warn};

use crate::pruner::Pruner;
use crate::sampler::Sampler;
use crate::space::ParameterSpace;
use crate::trial::Trial;

/// The black-box scoring function: a backtest run over one assignment.
///
/// Implemented for any `Fn(&Assignment, &TrialHandle) -> Result<f64,
/// ObjectiveError> + Send + Sync` closure.
pub trait Objective: Send + Sync {
    fn evaluate(
        &self,
        assignment: &Assignment,
        trial: &TrialHandle<'_>,
    ) -> Result<f64, ObjectiveError>;
}

impl<F> Objective for F
where
    F: Fn(&Assignment, &TrialHandle<'_>) -> Result<f64, ObjectiveError> + Send + Sync,
{
    fn evaluate(
        &self,
        assignment: &Assignment,
        trial: &TrialHandle<'_>,
    ) -> Result<f64, ObjectiveError> {
        self(assignment, trial)
    }
}

/// Handed to the objective for the duration of one trial.
///
/// The only side channel back into the engine: an optional
/// intermediate-value hook for pruning plus a cooperative cancellation
/// check.
pub struct TrialHandle<'a> {
    number: usize,
    pruner: &'a dyn Pruner,
    history: &'a RwLock<Vec<Trial>>,
    cancelled: &'a AtomicBool,
    intermediate: Mutex<Vec<(u64, f64)>>,
}

impl TrialHandle<'_> {
    pub fn number(&self) -> usize {
        self.number
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Report an intermediate value at `step`.
    ///
    /// Returns `true` when the trial should stop early: either the pruner
    /// judged it unpromising against its peers, or the study is being
    /// cancelled. The conventional reaction is
    /// `return Err(trial.pruned(step))`.
    pub fn report(&self, step: u64, value: f64) -> bool {
        let mut reported = self.intermediate.lock();
        reported.push((step, value));
        if self.is_cancelled() {
            return true;
        }
        let history = self.history.read();
        self.pruner
            .should_prune(self.number, step, &reported, &history)
    }

    /// The error an objective returns after a positive [`report`](Self::report).
    pub fn pruned(&self, step: u64) -> ObjectiveError {
        ObjectiveError::Pruned { step }
    }
}

/// Injected diagnostic sink for per-trial failures.
pub type TrialErrorSink = dyn Fn(usize, &str) + Send + Sync;

/// Runs single trials against the objective with full error containment.
pub(crate) struct TrialExecutor<'a> {
    pub sampler: &'a dyn Sampler,
    pub pruner: &'a dyn Pruner,
    pub space: &'a ParameterSpace,
    pub history: &'a RwLock<Vec<Trial>>,
    pub cancelled: &'a AtomicBool,
    pub error_sink: Option<&'a (dyn Fn(usize, &str) + Send + Sync + 'a)>,
}

impl TrialExecutor<'_> {
    /// Sample an assignment, run the objective, return the terminal trial.
    pub fn execute(&self, number: usize, objective: &dyn Objective) -> Trial {
        let assignment = {
            let history = self.history.read();
            self.sampler.suggest(self.space, &history)
        };
        let mut trial = Trial::new(number, assignment);
        let handle = TrialHandle {
            number,
            pruner: self.pruner,
            history: self.history,
            cancelled: self.cancelled,
            intermediate: Mutex::new(Vec::new()),
        };

        let start = Instant::now();
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            objective.evaluate(&trial.assignment, &handle)
        }));
        let elapsed = start.elapsed().as_secs_f64();
        trial.intermediate = handle.intermediate.into_inner();

        match outcome {
            Ok(Ok(value)) if value.is_nan() => {
                self.fail(&mut trial, "objective returned NaN".to_string(), elapsed);
            }
            Ok(Ok(value)) => trial.mark_complete(value, elapsed),
            Ok(Err(ObjectiveError::Pruned { step })) => {
                debug!(trial = number, step, "trial pruned");
                trial.mark_pruned(elapsed);
            }
            Ok(Err(ObjectiveError::Failed(message))) => self.fail(&mut trial, message, elapsed),
            Err(payload) => self.fail(&mut trial, panic_message(&payload), elapsed),
        }
        trial
    }

    fn fail(&self, trial: &mut Trial, message: String, elapsed: f64) {
        warn!(trial = trial.number, error = %message, "trial failed");
        if let Some(sink) = self.error_sink {
            sink(trial.number, &message);
        }
        trial.mark_failed(message, elapsed);
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("objective panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("objective panicked: {s}")
    } else {
        "objective panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pruner::{MedianPruner, NopPruner};
    use crate::sampler::RandomSampler;
    use crate::trial::TrialState;
    use pf_types::{Direction, ParamValue};
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;

    fn space() -> ParameterSpace {
        ParameterSpace::new().add_int("x", 0, 10)
    }

    fn executor<'a>(
        sampler: &'a dyn Sampler,
        pruner: &'a dyn Pruner,
        space: &'a ParameterSpace,
        history: &'a RwLock<Vec<Trial>>,
        cancelled: &'a AtomicBool,
    ) -> TrialExecutor<'a> {
        TrialExecutor {
            sampler,
            pruner,
            space,
            history,
            cancelled,
            error_sink: None,
        }
    }

    #[test]
    fn successful_objective_completes() {
        let sampler = RandomSampler::with_seed(42);
        let space = space();
        let history = RwLock::new(Vec::new());
        let cancelled = AtomicBool::new(false);
        let exec = executor(&sampler, &NopPruner, &space, &history, &cancelled);

        let objective = |a: &Assignment, _: &TrialHandle<'_>| -> Result<f64, ObjectiveError> {
            Ok(a["x"].as_f64().unwrap() * 2.0)
        };
        let trial = exec.execute(0, &objective);
        assert_eq!(trial.state, TrialState::Complete);
        assert!(trial.value.is_some());
        assert!(trial.duration_secs.is_some());
    }

    #[test]
    fn objective_error_becomes_failed_trial() {
        let sampler = RandomSampler::with_seed(42);
        let space = space();
        let history = RwLock::new(Vec::new());
        let cancelled = AtomicBool::new(false);
        let exec = executor(&sampler, &NopPruner, &space, &history, &cancelled);

        let objective = |_: &Assignment, _: &TrialHandle<'_>| -> Result<f64, ObjectiveError> {
            Err(ObjectiveError::failed("no data for symbol"))
        };
        let trial = exec.execute(0, &objective);
        assert_eq!(trial.state, TrialState::Failed);
        assert_eq!(trial.error.as_deref(), Some("no data for symbol"));
        assert_eq!(trial.value, None);
        assert_eq!(trial.score(Direction::Maximize), f64::NEG_INFINITY);
    }

    #[test]
    fn panicking_objective_is_contained() {
        let sampler = RandomSampler::with_seed(42);
        let space = space();
        let history = RwLock::new(Vec::new());
        let cancelled = AtomicBool::new(false);
        let exec = executor(&sampler, &NopPruner, &space, &history, &cancelled);

        let objective = |_: &Assignment, _: &TrialHandle<'_>| -> Result<f64, ObjectiveError> {
            panic!("index out of range")
        };
        let trial = exec.execute(0, &objective);
        assert_eq!(trial.state, TrialState::Failed);
        assert!(trial.error.as_deref().unwrap().contains("index out of range"));
    }

    #[test]
    fn nan_score_becomes_failed_trial() {
        let sampler = RandomSampler::with_seed(42);
        let space = space();
        let history = RwLock::new(Vec::new());
        let cancelled = AtomicBool::new(false);
        let exec = executor(&sampler, &NopPruner, &space, &history, &cancelled);

        let objective =
            |_: &Assignment, _: &TrialHandle<'_>| -> Result<f64, ObjectiveError> { Ok(f64::NAN) };
        let trial = exec.execute(0, &objective);
        assert_eq!(trial.state, TrialState::Failed);
    }

    #[test]
    fn error_sink_receives_failures() {
        let sampler = RandomSampler::with_seed(42);
        let space = space();
        let history = RwLock::new(Vec::new());
        let cancelled = AtomicBool::new(false);
        let seen = AtomicUsize::new(0);
        let sink = |_number: usize, _message: &str| {
            seen.fetch_add(1, Ordering::SeqCst);
        };
        let exec = TrialExecutor {
            sampler: &sampler,
            pruner: &NopPruner,
            space: &space,
            history: &history,
            cancelled: &cancelled,
            error_sink: Some(&sink),
        };

        let objective = |_: &Assignment, _: &TrialHandle<'_>| -> Result<f64, ObjectiveError> {
            Err(ObjectiveError::failed("boom"))
        };
        exec.execute(0, &objective);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn reporting_objective_gets_pruned_against_peers() {
        let sampler = RandomSampler::with_seed(42);
        let space = space();

        // One completed peer that scored 0.9 at step 1.
        let mut peer_assignment = HashMap::new();
        peer_assignment.insert("x".to_string(), ParamValue::Int(5));
        let mut peer = Trial::new(0, peer_assignment);
        peer.intermediate.push((1, 0.9));
        peer.mark_complete(1.0, 0.01);
        let history = RwLock::new(vec![peer]);

        let pruner = MedianPruner::new(Direction::Maximize);
        let cancelled = AtomicBool::new(false);
        let exec = executor(&sampler, &pruner, &space, &history, &cancelled);

        let objective = |_: &Assignment, t: &TrialHandle<'_>| -> Result<f64, ObjectiveError> {
            if t.report(1, 0.1) {
                return Err(t.pruned(1));
            }
            Ok(1.0)
        };
        let trial = exec.execute(1, &objective);
        assert_eq!(trial.state, TrialState::Pruned);
        assert_eq!(trial.intermediate, vec![(1, 0.1)]);
    }

    #[test]
    fn cancelled_study_stops_reporting_objectives() {
        let sampler = RandomSampler::with_seed(42);
        let space = space();
        let history = RwLock::new(Vec::new());
        let cancelled = AtomicBool::new(true);
        let exec = executor(&sampler, &NopPruner, &space, &history, &cancelled);

        let objective = |_: &Assignment, t: &TrialHandle<'_>| -> Result<f64, ObjectiveError> {
            if t.report(1, 0.5) {
                return Err(t.pruned(1));
            }
            Ok(1.0)
        };
        let trial = exec.execute(0, &objective);
        assert_eq!(trial.state, TrialState::Pruned);
    }
}

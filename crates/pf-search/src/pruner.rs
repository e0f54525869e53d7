//! Early-termination policies for in-progress trials.
//!
//! Pruners are consulted whenever an objective reports an intermediate value
//! through its [`TrialHandle`](crate::TrialHandle). Objectives that never
//! report run to completion and the pruner is never consulted.

use pf_types::Direction;

use crate::trial::Trial;

/// Trait for pluggable trial pruning strategies.
pub trait Pruner: Send + Sync {
    /// Decide whether the trial should be aborted at `step`.
    ///
    /// * `trial_number` - the in-progress trial's number.
    /// * `step` - the step the latest intermediate value was reported at.
    /// * `intermediate` - all `(step, value)` pairs reported so far for this trial.
    /// * `history` - peer trial history for comparison.
    fn should_prune(
        &self,
        trial_number: usize,
        step: u64,
        intermediate: &[(u64, f64)],
        history: &[Trial],
    ) -> bool;
}

/// Never prunes; every trial runs to completion.
pub struct NopPruner;

impl Pruner for NopPruner {
    fn should_prune(&self, _: usize, _: u64, _: &[(u64, f64)], _: &[Trial]) -> bool {
        false
    }
}

/// Prune trials performing worse than the median of completed peers at the
/// same step (direction-aware).
pub struct MedianPruner {
    direction: Direction,
    /// Don't prune before this step (let the trial warm up).
    warmup_steps: u64,
    /// Require at least this many completed peers with a value at the step.
    min_trials: usize,
}

impl MedianPruner {
    /// Defaults: no warm-up steps, a single completed peer suffices.
    pub fn new(direction: Direction) -> Self {
        Self {
            direction,
            warmup_steps: 0,
            min_trials: 1,
        }
    }

    pub fn warmup_steps(mut self, n: u64) -> Self {
        self.warmup_steps = n;
        self
    }

    pub fn min_trials(mut self, n: usize) -> Self {
        self.min_trials = n.max(1);
        self
    }
}

impl Pruner for MedianPruner {
    fn should_prune(
        &self,
        _trial_number: usize,
        step: u64,
        intermediate: &[(u64, f64)],
        history: &[Trial],
    ) -> bool {
        if step < self.warmup_steps {
            return false;
        }
        let Some(&(_, current)) = intermediate.last() else {
            return false;
        };

        let mut peer_values: Vec<f64> = history
            .iter()
            .filter(|t| t.is_complete())
            .filter_map(|t| {
                t.intermediate
                    .iter()
                    .find(|(s, _)| *s == step)
                    .map(|(_, v)| *v)
            })
            .collect();

        if peer_values.len() < self.min_trials {
            return false;
        }

        let median = median_of(&mut peer_values);
        self.direction.is_better(median, current)
    }
}

/// Successive-halving: geometrically spaced rungs, keeping only the top
/// `1/reduction_factor` fraction of peer values at each rung.
pub struct SuccessiveHalvingPruner {
    direction: Direction,
    min_resource: u64,
    max_resource: u64,
    reduction_factor: u64,
}

impl SuccessiveHalvingPruner {
    /// Defaults: rungs at steps 1, 3, 9, 27, 81 with a reduction factor of 3.
    pub fn new(direction: Direction) -> Self {
        Self {
            direction,
            min_resource: 1,
            max_resource: 81,
            reduction_factor: 3,
        }
    }

    pub fn min_resource(mut self, r: u64) -> Self {
        self.min_resource = r.max(1);
        self
    }

    pub fn max_resource(mut self, r: u64) -> Self {
        self.max_resource = r.max(1);
        self
    }

    pub fn reduction_factor(mut self, eta: u64) -> Self {
        self.reduction_factor = eta.max(2);
        self
    }

    /// Rung steps: `min_resource * eta^r`, capped at `max_resource`.
    fn rung_steps(&self) -> Vec<u64> {
        let mut steps = Vec::new();
        let mut rung: u32 = 0;
        while let Some(power) = self.reduction_factor.checked_pow(rung) {
            let step = self.min_resource.saturating_mul(power);
            if step > self.max_resource {
                break;
            }
            steps.push(step);
            rung += 1;
        }
        steps
    }
}

impl Pruner for SuccessiveHalvingPruner {
    fn should_prune(
        &self,
        _trial_number: usize,
        step: u64,
        intermediate: &[(u64, f64)],
        history: &[Trial],
    ) -> bool {
        // Only act exactly at rung boundaries.
        if !self.rung_steps().contains(&step) {
            return false;
        }
        let Some(&(_, current)) = intermediate.last() else {
            return false;
        };

        let peer_values: Vec<f64> = history
            .iter()
            .filter(|t| t.is_complete())
            .filter_map(|t| {
                t.intermediate
                    .iter()
                    .find(|(s, _)| *s == step)
                    .map(|(_, v)| *v)
            })
            .collect();

        // Too few peers at this rung to rank against.
        if peer_values.len() + 1 < self.reduction_factor as usize {
            return false;
        }

        let mut pool = peer_values;
        pool.push(current);
        let survivors = (pool.len() / self.reduction_factor as usize).max(1);
        pool.sort_by(|a, b| {
            if self.direction.is_better(*a, *b) {
                std::cmp::Ordering::Less
            } else if self.direction.is_better(*b, *a) {
                std::cmp::Ordering::Greater
            } else {
                std::cmp::Ordering::Equal
            }
        });

        // Prune unless the current value ranks among the survivors.
        !pool
            .iter()
            .take(survivors)
            .any(|v| v.to_bits() == current.to_bits())
    }
}

/// Median of a non-empty slice; sorts in place.
fn median_of(values: &mut [f64]) -> f64 {
    values.sort_unstable_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let len = values.len();
    if len % 2 == 1 {
        values[len / 2]
    } else {
        (values[len / 2 - 1] + values[len / 2]) / 2.0
    }
}

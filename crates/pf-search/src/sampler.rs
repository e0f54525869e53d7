//! Sampling strategies: how the next parameter assignment is proposed.
//!
//! Two strategies ship with the engine. [`RandomSampler`] draws every
//! parameter independently from its declared distribution and ignores
//! history. [`TpeSampler`] (the default) fits two density estimates over the
//! completed history, one for the top-performing fraction of trials and one
//! for the rest, and proposes assignments that score well under the "good"
//! density relative to the "bad" one.

use parking_lot::Mutex;
use pf_types::{Assignment, Direction, ParamValue};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::space::{param_from_choice, ParameterKind, ParameterSpace};
use crate::trial::Trial;

/// Trait for pluggable parameter sampling strategies.
///
/// Samplers see the full trial history (read-only, append-only) when
/// proposing; the study is agnostic to which strategy is installed.
pub trait Sampler: Send + Sync {
    /// Propose a full assignment for the next trial.
    fn suggest(&self, space: &ParameterSpace, history: &[Trial]) -> Assignment;

    /// Human-readable strategy name.
    fn name(&self) -> &'static str;
}

// ---- Random search ----

/// Independent uniform sampling across the search space.
///
/// Respects log scale and step grids. Also serves as the warm-up phase of
/// [`TpeSampler`].
pub struct RandomSampler {
    rng: Mutex<StdRng>,
}

impl RandomSampler {
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_os_rng()),
        }
    }

    /// Fixed seed for reproducible runs.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl Default for RandomSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl Sampler for RandomSampler {
    fn suggest(&self, space: &ParameterSpace, _history: &[Trial]) -> Assignment {
        let mut rng = self.rng.lock();
        space
            .parameters()
            .iter()
            .map(|def| (def.name.clone(), def.kind.sample_uniform(&mut *rng)))
            .collect()
    }

    fn name(&self) -> &'static str {
        "random"
    }
}

// ---- Tree-structured Parzen estimator ----

/// Sequential model-based sampler.
///
/// Completed trials are sorted best-first (direction-aware) and split at the
/// `gamma` quantile. For numeric parameters, candidates are drawn from a
/// Gaussian kernel density over the good set and scored by the good/bad
/// density ratio; the best of `candidates` draws wins. Categorical
/// parameters use Laplace-smoothed count ratios. Until `startup_trials`
/// trials have completed, proposals are purely random so the density
/// estimates never fit degenerate data.
pub struct TpeSampler {
    direction: Direction,
    gamma: f64,
    startup_trials: usize,
    candidates: usize,
    /// KDE bandwidth as a fraction of the (linearized) range.
    bandwidth: f64,
    rng: Mutex<StdRng>,
}

impl TpeSampler {
    pub fn new(direction: Direction) -> Self {
        Self {
            direction,
            gamma: 0.25,
            startup_trials: 10,
            candidates: 24,
            bandwidth: 0.1,
            rng: Mutex::new(StdRng::from_os_rng()),
        }
    }

    /// Fraction of trials considered "good" when splitting the history.
    pub fn gamma(mut self, gamma: f64) -> Self {
        self.gamma = gamma.clamp(0.01, 0.99);
        self
    }

    /// Number of purely random trials before model-based proposals begin.
    pub fn startup_trials(mut self, n: usize) -> Self {
        self.startup_trials = n;
        self
    }

    /// Number of candidate draws evaluated per numeric parameter.
    pub fn candidates(mut self, n: usize) -> Self {
        self.candidates = n.max(1);
        self
    }

    /// Fixed seed for reproducible runs.
    pub fn seed(self, seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            ..self
        }
    }

    fn sample_numeric(
        &self,
        kind: &ParameterKind,
        name: &str,
        good: &[&Trial],
        bad: &[&Trial],
        rng: &mut StdRng,
    ) -> ParamValue {
        let (low, high, log) = match kind {
            ParameterKind::Float { low, high, log, .. } => (*low, *high, *log),
            ParameterKind::Int { low, high, log, .. } => (*low as f64, *high as f64, *log),
            ParameterKind::Choice { .. } => unreachable!("numeric kinds only"),
        };
        let linearize = |v: f64| if log { v.ln() } else { v };

        let good_values: Vec<f64> = numeric_values(good, name, log);
        if good_values.is_empty() {
            return kind.sample_uniform(rng);
        }
        let bad_values: Vec<f64> = numeric_values(bad, name, log);

        let lo = linearize(low);
        let hi = linearize(high);
        let bandwidth = (self.bandwidth * (hi - lo)).max(1e-12);

        let mut best_x = good_values[0];
        let mut best_ratio = f64::NEG_INFINITY;
        for _ in 0..self.candidates {
            let base = good_values[rng.random_range(0..good_values.len())];
            let candidate = (base + gaussian(rng) * bandwidth).clamp(lo, hi);
            let l = kde_score(candidate, &good_values, bandwidth);
            let g = kde_score(candidate, &bad_values, bandwidth);
            let ratio = l / (g + 1e-12);
            if ratio > best_ratio {
                best_ratio = ratio;
                best_x = candidate;
            }
        }

        let x = if log { best_x.exp() } else { best_x };
        kind.snap(x)
    }

    fn sample_choice(
        &self,
        kind: &ParameterKind,
        name: &str,
        good: &[&Trial],
        bad: &[&Trial],
        rng: &mut StdRng,
    ) -> ParamValue {
        let ParameterKind::Choice { values } = kind else {
            unreachable!("categorical kinds only");
        };

        let good_counts = choice_counts(kind, name, good, values.len());
        let bad_counts = choice_counts(kind, name, bad, values.len());

        // Laplace smoothing keeps unseen choices alive.
        let mut weights: Vec<f64> = good_counts
            .iter()
            .zip(&bad_counts)
            .map(|(l, g)| (l + 1) as f64 / (g + 1) as f64)
            .collect();
        let total: f64 = weights.iter().sum();
        for w in &mut weights {
            *w /= total;
        }

        let r: f64 = rng.random();
        let mut cumulative = 0.0;
        for (i, w) in weights.iter().enumerate() {
            cumulative += w;
            if r < cumulative {
                return param_from_choice(&values[i]);
            }
        }
        param_from_choice(values.last().expect("choice list is non-empty"))
    }
}

impl Sampler for TpeSampler {
    fn suggest(&self, space: &ParameterSpace, history: &[Trial]) -> Assignment {
        let mut rng = self.rng.lock();

        let mut completed: Vec<&Trial> = history
            .iter()
            .filter(|t| t.is_complete() && t.value.is_some())
            .collect();

        if completed.len() < self.startup_trials.max(2) {
            return space
                .parameters()
                .iter()
                .map(|def| (def.name.clone(), def.kind.sample_uniform(&mut *rng)))
                .collect();
        }

        // Best first, so the gamma split keeps the top performers.
        completed.sort_by(|a, b| {
            let (a, b) = (a.score(self.direction), b.score(self.direction));
            if self.direction.is_better(a, b) {
                std::cmp::Ordering::Less
            } else if self.direction.is_better(b, a) {
                std::cmp::Ordering::Greater
            } else {
                std::cmp::Ordering::Equal
            }
        });
        let n_good = ((completed.len() as f64 * self.gamma).ceil() as usize)
            .clamp(1, completed.len() - 1);
        let (good, bad) = completed.split_at(n_good);

        space
            .parameters()
            .iter()
            .map(|def| {
                let value = match &def.kind {
                    ParameterKind::Choice { .. } => {
                        self.sample_choice(&def.kind, &def.name, good, bad, &mut rng)
                    }
                    _ => self.sample_numeric(&def.kind, &def.name, good, bad, &mut rng),
                };
                (def.name.clone(), value)
            })
            .collect()
    }

    fn name(&self) -> &'static str {
        "tpe"
    }
}

fn numeric_values(trials: &[&Trial], name: &str, log: bool) -> Vec<f64> {
    trials
        .iter()
        .filter_map(|t| t.assignment.get(name)?.as_f64())
        .map(|v| if log { v.ln() } else { v })
        .collect()
}

fn choice_counts(kind: &ParameterKind, name: &str, trials: &[&Trial], n: usize) -> Vec<usize> {
    let mut counts = vec![0usize; n];
    for trial in trials {
        if let Some(idx) = trial
            .assignment
            .get(name)
            .and_then(|v| kind.choice_index(v))
        {
            counts[idx] += 1;
        }
    }
    counts
}

/// Gaussian kernel density at `x`.
fn kde_score(x: f64, values: &[f64], bandwidth: f64) -> f64 {
    if values.is_empty() {
        return 1.0;
    }
    values
        .iter()
        .map(|v| (-(x - v).powi(2) / (2.0 * bandwidth * bandwidth)).exp())
        .sum::<f64>()
        / values.len() as f64
}

/// Standard normal draw via the Box-Muller transform.
fn gaussian<R: Rng>(rng: &mut R) -> f64 {
    let u1: f64 = rng.random::<f64>().max(1e-12);
    let u2: f64 = rng.random::<f64>();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}

//! Post-hoc parameter importance.
//!
//! Fits a small random forest of regression trees over the completed
//! history (parameters unit-normalized, log-aware) and attributes to each
//! parameter the variance reduction achieved by splits on it, averaged over
//! the forest. Importance is diagnostic only: a degenerate history yields an
//! empty report, never an error.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use std::collections::HashMap;

use crate::space::ParameterSpace;
use crate::trial::Trial;

/// Forest configuration. The defaults are sized for the few hundred trials
/// a typical study accumulates.
#[derive(Debug, Clone)]
pub struct ImportanceConfig {
    pub n_trees: usize,
    pub max_depth: usize,
    pub min_samples_split: usize,
    pub seed: u64,
}

impl Default for ImportanceConfig {
    fn default() -> Self {
        Self {
            n_trees: 32,
            max_depth: 8,
            min_samples_split: 2,
            seed: 42,
        }
    }
}

/// Estimate per-parameter importance over the COMPLETE trials of `history`.
///
/// Scores are non-negative and normalized over the forest (they sum to 1
/// when any splits were found). Parameters with fewer than two distinct
/// observed values score 0.0. Fewer than two completed trials, or a history
/// with zero score variance, yields an empty map.
pub fn estimate_importance(space: &ParameterSpace, history: &[Trial]) -> HashMap<String, f64> {
    estimate_with_config(space, history, &ImportanceConfig::default())
}

pub fn estimate_with_config(
    space: &ParameterSpace,
    history: &[Trial],
    config: &ImportanceConfig,
) -> HashMap<String, f64> {
    let defs = space.parameters();
    if defs.is_empty() {
        return HashMap::new();
    }

    // Feature matrix: one unit-normalized row per completed trial. Trials
    // whose assignment does not cover the space (e.g. resumed under an older
    // space) are skipped.
    let mut rows: Vec<Vec<f64>> = Vec::new();
    let mut targets: Vec<f64> = Vec::new();
    for trial in history.iter().filter(|t| t.is_complete()) {
        let Some(value) = trial.value else { continue };
        let features: Option<Vec<f64>> = defs
            .iter()
            .map(|def| {
                trial
                    .assignment
                    .get(&def.name)
                    .and_then(|v| def.kind.normalized(v))
            })
            .collect();
        if let Some(features) = features {
            rows.push(features);
            targets.push(value);
        }
    }

    if rows.len() < 2 || variance(&targets) == 0.0 {
        return HashMap::new();
    }

    let n_features = defs.len();
    let n_samples = rows.len();
    let summed: Vec<f64> = (0..config.n_trees)
        .into_par_iter()
        .map(|tree| {
            let mut rng = StdRng::seed_from_u64(config.seed.wrapping_add(tree as u64));
            let indices: Vec<usize> = (0..n_samples)
                .map(|_| rng.random_range(0..n_samples))
                .collect();
            let mut gains = vec![0.0; n_features];
            grow_tree(&rows, &targets, &indices, 0, config, &mut rng, &mut gains);
            let total: f64 = gains.iter().sum();
            if total > 0.0 {
                for g in &mut gains {
                    *g /= total;
                }
            }
            gains
        })
        .reduce(
            || vec![0.0; n_features],
            |mut acc, gains| {
                for (a, g) in acc.iter_mut().zip(gains) {
                    *a += g;
                }
                acc
            },
        );

    defs.iter()
        .enumerate()
        .map(|(i, def)| (def.name.clone(), summed[i] / config.n_trees as f64))
        .collect()
}

/// Recursively grow one regression tree, accumulating per-feature variance
/// reduction into `gains`.
fn grow_tree(
    rows: &[Vec<f64>],
    targets: &[f64],
    indices: &[usize],
    depth: usize,
    config: &ImportanceConfig,
    rng: &mut StdRng,
    gains: &mut [f64],
) {
    let n = indices.len();
    if n < config.min_samples_split || depth >= config.max_depth {
        return;
    }
    let first = targets[indices[0]];
    if indices.iter().all(|&i| targets[i] == first) {
        return;
    }

    let n_features = rows[0].len();
    let max_features = ((n_features as f64).sqrt().ceil() as usize).clamp(1, n_features);
    let candidates = partial_shuffle(n_features, max_features, rng);

    let mean = indices.iter().map(|&i| targets[i]).sum::<f64>() / n as f64;
    let total_var: f64 = indices.iter().map(|&i| (targets[i] - mean).powi(2)).sum();
    if total_var == 0.0 {
        return;
    }

    let mut best_score = 0.0;
    let mut best_feature = None;
    let mut best_threshold = 0.0;

    for &feature in &candidates {
        let mut values: Vec<f64> = indices.iter().map(|&i| rows[i][feature]).collect();
        values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        values.dedup();
        if values.len() < 2 {
            continue;
        }

        for window in values.windows(2) {
            let threshold = (window[0] + window[1]) / 2.0;
            let (l_sum, l_sq, l_n, r_sum, r_sq, r_n) =
                split_stats(rows, targets, indices, feature, threshold);
            if l_n == 0 || r_n == 0 {
                continue;
            }
            let l_var = l_sq - l_sum * l_sum / l_n as f64;
            let r_var = r_sq - r_sum * r_sum / r_n as f64;
            let score = total_var - l_var - r_var;
            if score > best_score {
                best_score = score;
                best_feature = Some(feature);
                best_threshold = threshold;
            }
        }
    }

    let Some(feature) = best_feature else { return };
    gains[feature] += best_score;

    let (left, right): (Vec<usize>, Vec<usize>) = indices
        .iter()
        .partition(|&&i| rows[i][feature] <= best_threshold);
    if left.is_empty() || right.is_empty() {
        return;
    }
    grow_tree(rows, targets, &left, depth + 1, config, rng, gains);
    grow_tree(rows, targets, &right, depth + 1, config, rng, gains);
}

/// Select `k` random indices from `0..n` via partial Fisher-Yates shuffle.
fn partial_shuffle(n: usize, k: usize, rng: &mut StdRng) -> Vec<usize> {
    let mut indices: Vec<usize> = (0..n).collect();
    let k = k.min(n);
    for i in 0..k {
        let j = rng.random_range(i..n);
        indices.swap(i, j);
    }
    indices.truncate(k);
    indices
}

/// Left/right split statistics for variance reduction.
fn split_stats(
    rows: &[Vec<f64>],
    targets: &[f64],
    indices: &[usize],
    feature: usize,
    threshold: f64,
) -> (f64, f64, usize, f64, f64, usize) {
    let (mut l_sum, mut l_sq, mut l_n) = (0.0, 0.0, 0usize);
    let (mut r_sum, mut r_sq, mut r_n) = (0.0, 0.0, 0usize);
    for &i in indices {
        let y = targets[i];
        if rows[i][feature] <= threshold {
            l_sum += y;
            l_sq += y * y;
            l_n += 1;
        } else {
            r_sum += y;
            r_sq += y * y;
            r_n += 1;
        }
    }
    (l_sum, l_sq, l_n, r_sum, r_sq, r_n)
}

/// Population variance of a slice.
fn variance(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::space::ParameterSpace;
    use pf_types::ParamValue;
    use std::collections::HashMap as Map;

    fn trial_with(number: usize, x1: i64, x2: i64, value: f64) -> Trial {
        let mut assignment = Map::new();
        assignment.insert("x1".to_string(), ParamValue::Int(x1));
        assignment.insert("x2".to_string(), ParamValue::Int(x2));
        let mut trial = Trial::new(number, assignment);
        trial.mark_complete(value, 0.01);
        trial
    }

    fn space() -> ParameterSpace {
        ParameterSpace::new().add_int("x1", 0, 10).add_int("x2", 0, 10)
    }

    #[test]
    fn dominant_parameter_scores_highest() {
        let history: Vec<Trial> = (0..60)
            .map(|i| {
                let x1 = (i % 11) as i64;
                let x2 = ((i * 7) % 11) as i64;
                // x1 drives the score, x2 barely matters
                let value = 10.0 * x1 as f64 + 0.1 * x2 as f64;
                trial_with(i, x1, x2, value)
            })
            .collect();

        let report = estimate_importance(&space(), &history);
        assert!(report["x1"] > report["x2"]);
        assert!(report.values().all(|v| *v >= 0.0));
    }

    #[test]
    fn constant_parameter_scores_zero() {
        let history: Vec<Trial> = (0..40)
            .map(|i| {
                let x1 = (i % 11) as i64;
                trial_with(i, x1, 5, x1 as f64)
            })
            .collect();

        let report = estimate_importance(&space(), &history);
        assert_eq!(report["x2"], 0.0);
        assert!(report["x1"] > 0.0);
    }

    #[test]
    fn too_few_trials_yield_empty_report() {
        let history = vec![trial_with(0, 1, 2, 1.0)];
        assert!(estimate_importance(&space(), &history).is_empty());
    }

    #[test]
    fn zero_variance_history_yields_empty_report() {
        let history: Vec<Trial> = (0..20)
            .map(|i| trial_with(i, (i % 11) as i64, ((i * 3) % 11) as i64, 1.0))
            .collect();
        assert!(estimate_importance(&space(), &history).is_empty());
    }

    #[test]
    fn non_complete_trials_are_ignored() {
        let mut history: Vec<Trial> = (0..30)
            .map(|i| trial_with(i, (i % 11) as i64, 0, (i % 11) as f64))
            .collect();
        let mut failed = Trial::new(30, Map::new());
        failed.mark_failed("boom".to_string(), 0.0);
        history.push(failed);

        let report = estimate_importance(&space(), &history);
        assert!(report.contains_key("x1"));
    }
}

//! End-to-end study scenarios: convergence, failure containment, resume,
//! cancellation, timeout, concurrency, pruning and progress reporting.

use pf_search::{
    JournalStore, MedianPruner, ParameterSpace, RandomSampler, RunOptions, Study, TpeSampler,
    TrialHandle, TrialState,
};
use pf_types::{Assignment, Direction, ObjectiveError};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn xy_space() -> ParameterSpace {
    ParameterSpace::new().add_int("x", 0, 10).add_int("y", 0, 10)
}

fn x_space() -> ParameterSpace {
    ParameterSpace::new().add_int("x", 0, 10)
}

fn score_x(a: &Assignment, _: &TrialHandle<'_>) -> Result<f64, ObjectiveError> {
    Ok(a["x"].as_f64().unwrap())
}

fn scratch_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("pf-it-{tag}-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

#[test]
fn tpe_converges_toward_known_optimum() {
    let study = Study::builder("convergence", xy_space())
        .sampler(
            TpeSampler::new(Direction::Maximize)
                .seed(42)
                .startup_trials(10),
        )
        .build()
        .unwrap();

    let objective = |a: &Assignment, _: &TrialHandle<'_>| -> Result<f64, ObjectiveError> {
        let x = a["x"].as_f64().unwrap();
        let y = a["y"].as_f64().unwrap();
        Ok(-(x - 5.0).powi(2) - (y - 3.0).powi(2))
    };
    let result = study.run(objective, RunOptions::new(80)).unwrap();

    let best = result.best_assignment.unwrap();
    let x = best["x"].as_i64().unwrap();
    let y = best["y"].as_i64().unwrap();
    assert!((x - 5).abs() <= 1, "best x={x} not within 1 of 5");
    assert!((y - 3).abs() <= 1, "best y={y} not within 1 of 3");
}

#[test]
fn all_failing_objective_never_escapes_run() {
    let study = Study::builder("all_failed", x_space())
        .sampler(RandomSampler::with_seed(42))
        .build()
        .unwrap();

    let objective = |_: &Assignment, _: &TrialHandle<'_>| -> Result<f64, ObjectiveError> {
        Err(ObjectiveError::failed("exchange unreachable"))
    };
    let result = study.run(objective, RunOptions::new(5)).unwrap();

    assert_eq!(result.trial_count, 5);
    assert_eq!(result.history.len(), 5);
    assert!(result
        .history
        .iter()
        .all(|t| t.state == TrialState::Failed));
    assert!(result.best_value.is_none());
    assert!(result.best_assignment.is_none());
}

#[test]
fn resumed_study_accumulates_trials() {
    let dir = scratch_dir("resume");
    {
        let study = Study::builder("accumulate", x_space())
            .sampler(RandomSampler::with_seed(1))
            .store(JournalStore::new(&dir).unwrap())
            .build()
            .unwrap();
        let result = study.run(score_x, RunOptions::new(10)).unwrap();
        assert_eq!(result.history.len(), 10);
    }

    // Same study name, fresh process-equivalent: history is loaded, not reset.
    let study = Study::builder("accumulate", x_space())
        .sampler(RandomSampler::with_seed(2))
        .store(JournalStore::new(&dir).unwrap())
        .build()
        .unwrap();
    assert_eq!(study.n_trials(), 10);

    let result = study.run(score_x, RunOptions::new(10)).unwrap();
    assert_eq!(result.trial_count, 10);
    assert_eq!(result.history.len(), 20);

    let mut numbers: Vec<usize> = result.history.iter().map(|t| t.number).collect();
    numbers.sort_unstable();
    assert_eq!(numbers, (0..20).collect::<Vec<_>>());

    std::fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn cancelling_mid_run_returns_partial_result() {
    let study = Study::builder("cancelled", x_space())
        .sampler(RandomSampler::with_seed(42))
        .build()
        .unwrap();
    let token = study.cancel_token();

    let calls = AtomicUsize::new(0);
    let objective = |_: &Assignment, _: &TrialHandle<'_>| -> Result<f64, ObjectiveError> {
        if calls.fetch_add(1, Ordering::SeqCst) + 1 == 3 {
            token.cancel();
        }
        Ok(1.0)
    };
    let result = study.run(objective, RunOptions::new(10)).unwrap();

    assert!(result.interrupted);
    assert_eq!(result.trial_count, 3);
    assert_eq!(result.history.len(), result.trial_count);
    assert!(result.trial_count <= 10);
    // The best found so far is still reported.
    assert_eq!(result.best_value, Some(1.0));
}

#[test]
fn timeout_stops_scheduling_new_trials() {
    let study = Study::builder("timed_out", x_space())
        .sampler(RandomSampler::with_seed(42))
        .build()
        .unwrap();

    let objective = |a: &Assignment, _: &TrialHandle<'_>| -> Result<f64, ObjectiveError> {
        std::thread::sleep(Duration::from_millis(20));
        Ok(a["x"].as_f64().unwrap())
    };
    let result = study
        .run(
            objective,
            RunOptions::new(50).timeout(Duration::from_millis(70)),
        )
        .unwrap();

    assert!(result.trial_count >= 1);
    assert!(result.trial_count < 50, "timeout did not stop the run");
    // A timeout is a normal stop, not an interruption.
    assert!(!result.interrupted);
}

#[test]
fn zero_timeout_means_unbounded() {
    let study = Study::builder("unbounded", x_space())
        .sampler(RandomSampler::with_seed(42))
        .build()
        .unwrap();
    let result = study
        .run(score_x, RunOptions::new(3).timeout(Duration::ZERO))
        .unwrap();
    assert_eq!(result.trial_count, 3);
}

#[test]
fn concurrent_workers_fill_the_budget() {
    let study = Study::builder("parallel", x_space())
        .sampler(RandomSampler::with_seed(42))
        .build()
        .unwrap();

    let result = study
        .run(score_x, RunOptions::new(20).concurrency(4))
        .unwrap();

    assert_eq!(result.trial_count, 20);
    assert_eq!(result.history.len(), 20);
    assert!(result.history.iter().all(|t| t.state.is_terminal()));

    let mut numbers: Vec<usize> = result.history.iter().map(|t| t.number).collect();
    numbers.sort_unstable();
    assert_eq!(numbers, (0..20).collect::<Vec<_>>());

    // Best is extremal over completed trials even under concurrent updates.
    let max = result
        .history
        .iter()
        .filter_map(|t| t.value)
        .fold(f64::NEG_INFINITY, f64::max);
    assert_eq!(result.best_value, Some(max));
}

#[test]
fn median_pruner_cuts_unpromising_trials() {
    let study = Study::builder("pruned_sweep", x_space())
        .sampler(RandomSampler::with_seed(7))
        .pruner(MedianPruner::new(Direction::Maximize).min_trials(3))
        .build()
        .unwrap();

    // The partial score at each step is proportional to the final score, so
    // the median rule has real signal to act on.
    let objective = |a: &Assignment, t: &TrialHandle<'_>| -> Result<f64, ObjectiveError> {
        let x = a["x"].as_f64().unwrap();
        for step in 1..=3u64 {
            if t.report(step, x * step as f64) {
                return Err(t.pruned(step));
            }
        }
        Ok(x * 3.0)
    };
    let result = study.run(objective, RunOptions::new(30)).unwrap();

    let pruned = result
        .history
        .iter()
        .filter(|t| t.state == TrialState::Pruned)
        .count();
    let completed = result.completed();
    assert!(pruned > 0, "expected at least one pruned trial");
    assert!(completed >= 3);
    assert_eq!(pruned + completed, 30);

    // Pruning never affects best-trial bookkeeping.
    let best_value = result.best_value.unwrap();
    let max_completed = result
        .history
        .iter()
        .filter(|t| t.is_complete())
        .filter_map(|t| t.value)
        .fold(f64::NEG_INFINITY, f64::max);
    assert_eq!(best_value, max_completed);
}

#[test]
fn progress_callback_reports_fraction_and_eta() {
    let study = Study::builder("progress", x_space())
        .sampler(RandomSampler::with_seed(42))
        .build()
        .unwrap();

    let seen: Arc<Mutex<Vec<(f64, Option<u64>)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let result = study
        .run(
            score_x,
            RunOptions::new(5).on_progress(move |fraction, eta| {
                sink.lock().unwrap().push((fraction, eta));
            }),
        )
        .unwrap();
    assert_eq!(result.trial_count, 5);

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 5);
    for window in seen.windows(2) {
        assert!(window[0].0 <= window[1].0, "fraction went backwards");
    }
    for (fraction, eta) in seen.iter() {
        assert!((0.0..=1.0).contains(fraction));
        // A trial has always completed by the time a callback fires here.
        assert!(eta.is_some());
    }
    assert_eq!(seen.last().unwrap().0, 1.0);
}

#[test]
fn importance_reflects_the_driving_parameter() {
    let study = Study::builder("importance", xy_space())
        .sampler(RandomSampler::with_seed(42))
        .build()
        .unwrap();

    // x drives the score; y is sampled but ignored.
    let result = study.run(score_x, RunOptions::new(40)).unwrap();
    assert_eq!(result.trial_count, 40);

    let report = study.importance();
    assert!(report["x"] > report["y"], "importance: {report:?}");
}

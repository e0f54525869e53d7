//! Study orchestration: the bounded, resumable search session.
//!
//! A [`Study`] owns the parameter space, the sampler/pruner strategies, the
//! append-only trial history and its persistence. [`Study::run`] executes a
//! budget of trials across a bounded worker pool, keeps the best-so-far
//! reference current, reports progress, and honors timeouts and cooperative
//! cancellation.

use crossbeam_channel::Sender;
use parking_lot::{Mutex, RwLock};
use pf_types::{Assignment, Direction, PfError, PfResult, StoreError};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::executor::{Objective, TrialErrorSink, TrialExecutor};
use crate::importance;
use crate::pruner::{NopPruner, Pruner};
use crate::sampler::{Sampler, TpeSampler};
use crate::space::ParameterSpace;
use crate::storage::{MemoryStore, StudyMeta, StudyStore};
use crate::trial::Trial;

/// Cooperative cancellation handle.
///
/// Cloneable and cheap; `cancel` stops the owning study from scheduling new
/// trials. In-flight trials finish (or abandon at their next pruning
/// checkpoint) and the run returns a partial result.
#[derive(Clone)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Progress callback: `(fraction_done, eta_seconds)`.
pub type ProgressCallback = dyn Fn(f64, Option<u64>) + Send + Sync;

/// Options for one [`Study::run`] invocation.
pub struct RunOptions {
    n_trials: usize,
    timeout: Option<Duration>,
    concurrency: usize,
    progress: Option<Box<ProgressCallback>>,
}

impl RunOptions {
    /// Run `n_trials` additional trials, sequentially, without a timeout.
    pub fn new(n_trials: usize) -> Self {
        Self {
            n_trials,
            timeout: None,
            concurrency: 1,
            progress: None,
        }
    }

    /// Wall-clock budget measured from run start. Zero means unbounded.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Maximum number of trials in flight at once.
    pub fn concurrency(mut self, n: usize) -> Self {
        self.concurrency = n.max(1);
        self
    }

    /// Invoked after every terminal trial with the fraction of this run's
    /// budget finished and an ETA (mean completed-trial duration times the
    /// remaining budget; `None` until the first trial completes).
    pub fn on_progress(
        mut self,
        callback: impl Fn(f64, Option<u64>) + Send + Sync + 'static,
    ) -> Self {
        self.progress = Some(Box::new(callback));
        self
    }
}

/// Outcome of one [`Study::run`] invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudyResult {
    pub best_assignment: Option<Assignment>,
    pub best_value: Option<f64>,
    /// Trials that reached a terminal state during this run.
    pub trial_count: usize,
    /// The full accumulated study history, including resumed trials.
    pub history: Vec<Trial>,
    /// True when the run was cut short by cooperative cancellation.
    pub interrupted: bool,
}

impl StudyResult {
    pub fn completed(&self) -> usize {
        self.history.iter().filter(|t| t.is_complete()).count()
    }
}

/// Builder for [`Study`]. Validates the space and loads or creates the
/// persisted study before any trial can run.
pub struct StudyBuilder {
    name: String,
    space: ParameterSpace,
    direction: Direction,
    sampler: Option<Box<dyn Sampler>>,
    pruner: Option<Box<dyn Pruner>>,
    store: Option<Box<dyn StudyStore>>,
    seed: Option<u64>,
    on_trial_error: Option<Box<TrialErrorSink>>,
}

impl StudyBuilder {
    pub fn new(name: impl Into<String>, space: ParameterSpace) -> Self {
        Self {
            name: name.into(),
            space,
            direction: Direction::Maximize,
            sampler: None,
            pruner: None,
            store: None,
            seed: None,
            on_trial_error: None,
        }
    }

    pub fn direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    pub fn sampler(mut self, sampler: impl Sampler + 'static) -> Self {
        self.sampler = Some(Box::new(sampler));
        self
    }

    pub fn pruner(mut self, pruner: impl Pruner + 'static) -> Self {
        self.pruner = Some(Box::new(pruner));
        self
    }

    pub fn store(mut self, store: impl StudyStore + 'static) -> Self {
        self.store = Some(Box::new(store));
        self
    }

    /// Seed for the default TPE sampler; ignored when an explicit sampler is
    /// installed (seed that one directly).
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Diagnostic sink invoked with `(trial_number, error)` for every failed
    /// trial, in addition to the log line.
    pub fn on_trial_error(
        mut self,
        sink: impl Fn(usize, &str) + Send + Sync + 'static,
    ) -> Self {
        self.on_trial_error = Some(Box::new(sink));
        self
    }

    /// Validate the space and load-or-create the persisted study.
    ///
    /// Fails fast with `InvalidParameterSpec` on a malformed space and with
    /// a store error when the study exists under a different direction or
    /// the backend is unavailable.
    pub fn build(self) -> PfResult<Study> {
        self.space.validate()?;

        let store = self
            .store
            .unwrap_or_else(|| Box::new(MemoryStore::new()));

        let (meta, trials) = match store.load(&self.name)? {
            Some(snapshot) => {
                if snapshot.meta.direction != self.direction {
                    return Err(StoreError::DirectionMismatch {
                        name: self.name.clone(),
                        stored: snapshot.meta.direction.to_string(),
                        requested: self.direction.to_string(),
                    }
                    .into());
                }
                info!(
                    study = %self.name,
                    trials = snapshot.trials.len(),
                    "resuming existing study"
                );
                (snapshot.meta, snapshot.trials)
            }
            None => {
                let meta = StudyMeta::new(self.name.clone(), self.direction);
                store.create(&meta)?;
                (meta, Vec::new())
            }
        };

        let next_number = trials.iter().map(|t| t.number + 1).max().unwrap_or(0);
        let best = best_of(&trials, self.direction);
        let sampler = self.sampler.unwrap_or_else(|| {
            let mut tpe = TpeSampler::new(self.direction);
            if let Some(seed) = self.seed {
                tpe = tpe.seed(seed);
            }
            Box::new(tpe)
        });
        let pruner = self.pruner.unwrap_or_else(|| Box::new(NopPruner));

        Ok(Study {
            meta,
            space: self.space,
            sampler,
            pruner,
            store,
            history: RwLock::new(trials),
            best: Mutex::new(best),
            cancel: Arc::new(AtomicBool::new(false)),
            next_number: AtomicUsize::new(next_number),
            on_trial_error: self.on_trial_error,
        })
    }
}

/// The search session: a bounded sequence of trials sharing one parameter
/// space, sampler, pruner and persisted history.
pub struct Study {
    meta: StudyMeta,
    space: ParameterSpace,
    sampler: Box<dyn Sampler>,
    pruner: Box<dyn Pruner>,
    store: Box<dyn StudyStore>,
    history: RwLock<Vec<Trial>>,
    /// `(number, value)` of the best COMPLETE trial, maintained under the
    /// history write lock: extremal by value, earliest number on ties.
    best: Mutex<Option<(usize, f64)>>,
    cancel: Arc<AtomicBool>,
    next_number: AtomicUsize,
    on_trial_error: Option<Box<TrialErrorSink>>,
}

impl std::fmt::Debug for Study {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Study")
            .field("meta", &self.meta)
            .field("space", &self.space)
            .field("best", &*self.best.lock())
            .field("next_number", &self.next_number)
            .finish_non_exhaustive()
    }
}

impl Study {
    pub fn builder(name: impl Into<String>, space: ParameterSpace) -> StudyBuilder {
        StudyBuilder::new(name, space)
    }

    pub fn name(&self) -> &str {
        &self.meta.name
    }

    pub fn direction(&self) -> Direction {
        self.meta.direction
    }

    /// Total number of trials in the study history, resumed ones included.
    pub fn n_trials(&self) -> usize {
        self.history.read().len()
    }

    pub fn trials(&self) -> Vec<Trial> {
        self.history.read().clone()
    }

    pub fn best_trial(&self) -> Option<Trial> {
        let best = *self.best.lock();
        best.and_then(|(number, _)| {
            self.history
                .read()
                .iter()
                .find(|t| t.number == number)
                .cloned()
        })
    }

    pub fn best_value(&self) -> Option<f64> {
        (*self.best.lock()).map(|(_, value)| value)
    }

    /// Handle for cancelling an in-progress run from another thread (or from
    /// inside the objective).
    pub fn cancel_token(&self) -> CancelToken {
        CancelToken {
            flag: Arc::clone(&self.cancel),
        }
    }

    /// Post-hoc parameter importance over the completed history.
    pub fn importance(&self) -> std::collections::HashMap<String, f64> {
        let history = self.history.read();
        importance::estimate_importance(&self.space, &history)
    }

    /// Execute up to `n_trials` additional trials.
    ///
    /// Stops when the budget is exhausted, the timeout fires, cancellation
    /// is requested, or persistence fails beyond retry. A failing objective
    /// never aborts the run; cancellation yields `interrupted = true` rather
    /// than an error.
    pub fn run(&self, objective: impl Objective, options: RunOptions) -> PfResult<StudyResult> {
        self.cancel.store(false, Ordering::SeqCst);

        let n_trials = options.n_trials;
        if n_trials == 0 {
            return Ok(self.snapshot_result(false, 0));
        }

        let deadline = options
            .timeout
            .filter(|t| !t.is_zero())
            .map(|t| Instant::now() + t);
        let workers = options.concurrency.min(n_trials).max(1);
        let claimed = AtomicUsize::new(0);
        let run_terminal = AtomicUsize::new(0);
        let store_failure: Mutex<Option<PfError>> = Mutex::new(None);
        let progress = options.progress;
        let (event_tx, event_rx) = crossbeam_channel::unbounded::<()>();

        info!(
            study = %self.meta.name,
            n_trials,
            workers,
            sampler = self.sampler.name(),
            "starting run"
        );

        std::thread::scope(|scope| {
            let objective = &objective;
            let claimed = &claimed;
            let run_terminal = &run_terminal;
            let store_failure = &store_failure;
            let progress = progress.as_deref();

            // Progress consumer: serializes callbacks, one per terminal trial.
            scope.spawn(move || {
                for () in event_rx.iter() {
                    let done = run_terminal.load(Ordering::SeqCst);
                    let eta = self.estimate_eta(n_trials, done);
                    if let Some(callback) = progress {
                        callback(done as f64 / n_trials as f64, eta);
                    }
                }
            });

            for _ in 0..workers {
                let events = event_tx.clone();
                scope.spawn(move || {
                    self.worker(
                        objective,
                        n_trials,
                        deadline,
                        claimed,
                        run_terminal,
                        store_failure,
                        &events,
                    );
                });
            }
            drop(event_tx);
        });

        if let Some(error) = store_failure.into_inner() {
            return Err(error);
        }

        let interrupted = self.cancel.load(Ordering::SeqCst);
        let result = self.snapshot_result(interrupted, run_terminal.into_inner());
        info!(
            study = %self.meta.name,
            finished = result.trial_count,
            best = ?result.best_value,
            interrupted,
            "run finished"
        );
        Ok(result)
    }

    #[allow(clippy::too_many_arguments)]
    fn worker(
        &self,
        objective: &dyn Objective,
        n_trials: usize,
        deadline: Option<Instant>,
        claimed: &AtomicUsize,
        run_terminal: &AtomicUsize,
        store_failure: &Mutex<Option<PfError>>,
        events: &Sender<()>,
    ) {
        loop {
            if self.cancel.load(Ordering::SeqCst) {
                return;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                debug!(study = %self.meta.name, "timeout reached, not scheduling further trials");
                return;
            }
            if store_failure.lock().is_some() {
                return;
            }
            let slot = claimed.fetch_add(1, Ordering::SeqCst);
            if slot >= n_trials {
                return;
            }

            let number = self.next_number.fetch_add(1, Ordering::SeqCst);
            let executor = TrialExecutor {
                sampler: self.sampler.as_ref(),
                pruner: self.pruner.as_ref(),
                space: &self.space,
                history: &self.history,
                cancelled: &self.cancel,
                error_sink: self.on_trial_error.as_deref(),
            };
            let trial = executor.execute(number, objective);

            self.record(&trial);
            if let Err(error) = self.persist(&trial) {
                *store_failure.lock() = Some(error);
            }
            run_terminal.fetch_add(1, Ordering::SeqCst);
            let _ = events.send(());
        }
    }

    /// Append a terminal trial and refresh the best reference atomically
    /// with respect to concurrent readers of the history.
    fn record(&self, trial: &Trial) {
        let mut history = self.history.write();
        if let (true, Some(value)) = (trial.is_complete(), trial.value) {
            let mut best = self.best.lock();
            let replace = match *best {
                None => true,
                Some((incumbent_number, incumbent_value)) => {
                    self.meta.direction.is_better(value, incumbent_value)
                        || (value == incumbent_value && trial.number < incumbent_number)
                }
            };
            if replace {
                *best = Some((trial.number, value));
                info!(study = %self.meta.name, trial = trial.number, value, "new best trial");
            }
        }
        history.push(trial.clone());
    }

    /// Durable append with one retry; persistent failure surfaces to `run`.
    fn persist(&self, trial: &Trial) -> PfResult<()> {
        match self.store.append(&self.meta.name, trial) {
            Ok(()) => Ok(()),
            Err(first) => {
                warn!(
                    study = %self.meta.name,
                    trial = trial.number,
                    error = %first,
                    "trial append failed, retrying"
                );
                self.store.append(&self.meta.name, trial)
            }
        }
    }

    fn estimate_eta(&self, n_trials: usize, done: usize) -> Option<u64> {
        let history = self.history.read();
        let mut count = 0usize;
        let mut total = 0.0;
        for trial in history.iter().filter(|t| t.is_complete()) {
            if let Some(duration) = trial.duration_secs {
                count += 1;
                total += duration;
            }
        }
        if count == 0 {
            return None;
        }
        let mean = total / count as f64;
        let remaining = n_trials.saturating_sub(done);
        Some((mean * remaining as f64).round() as u64)
    }

    fn snapshot_result(&self, interrupted: bool, trial_count: usize) -> StudyResult {
        let history = self.history.read().clone();
        let best = *self.best.lock();
        let (best_assignment, best_value) = match best {
            Some((number, value)) => (
                history
                    .iter()
                    .find(|t| t.number == number)
                    .map(|t| t.assignment.clone()),
                Some(value),
            ),
            None => (None, None),
        };
        StudyResult {
            best_assignment,
            best_value,
            trial_count,
            history,
            interrupted,
        }
    }
}

/// Best COMPLETE trial of a loaded history: extremal value, earliest number
/// on ties.
fn best_of(trials: &[Trial], direction: Direction) -> Option<(usize, f64)> {
    let mut best: Option<(usize, f64)> = None;
    for trial in trials.iter().filter(|t| t.is_complete()) {
        let Some(value) = trial.value else { continue };
        let replace = match best {
            None => true,
            Some((incumbent_number, incumbent_value)) => {
                direction.is_better(value, incumbent_value)
                    || (value == incumbent_value && trial.number < incumbent_number)
            }
        };
        if replace {
            best = Some((trial.number, value));
        }
    }
    best
}

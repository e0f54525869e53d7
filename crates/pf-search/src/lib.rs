//! # pf-search
//!
//! Parameter search and trial orchestration for ParamForge.
//!
//! Finds near-optimal inputs to an expensive, noisy, black-box scoring
//! function (a trading-strategy backtest) without exhausting the grid:
//! a declarative parameter space, pluggable samplers (random and TPE),
//! optional pruning of unpromising trials, a bounded worker pool with
//! persisted, resumable trial history, and post-hoc parameter importance.
//!
//! ```no_run
//! use pf_search::{ParameterSpace, RunOptions, Study};
//! use pf_types::{Assignment, ObjectiveError};
//!
//! let space = ParameterSpace::new()
//!     .add_int("short_period", 5, 15)
//!     .add_int("long_period", 20, 50)
//!     .add_float("position_size", 0.5, 1.0);
//!
//! let study = Study::builder("ma_crossover_sweep", space).build()?;
//! let result = study.run(
//!     |params: &Assignment, _trial: &pf_search::TrialHandle<'_>| -> Result<f64, ObjectiveError> {
//!         // run the backtest with `params` and return e.g. the Sharpe ratio
//!         Ok(1.0)
//!     },
//!     RunOptions::new(100).concurrency(4),
//! )?;
//! println!("best: {:?} = {:?}", result.best_assignment, result.best_value);
//! # Ok::<(), pf_types::PfError>(())
//! ```

mod executor;
mod importance;
mod pruner;
mod sampler;
mod space;
mod storage;
mod study;
mod trial;

pub use executor::{Objective, TrialErrorSink, TrialHandle};
pub use importance::{estimate_importance, estimate_with_config, ImportanceConfig};
pub use pruner::{MedianPruner, NopPruner, Pruner, SuccessiveHalvingPruner};
pub use sampler::{RandomSampler, Sampler, TpeSampler};
pub use space::{ParameterDef, ParameterKind, ParameterSpace};
pub use storage::{JournalStore, MemoryStore, StudyMeta, StudySnapshot, StudyStore};
pub use study::{CancelToken, ProgressCallback, RunOptions, Study, StudyBuilder, StudyResult};
pub use trial::{Trial, TrialState};

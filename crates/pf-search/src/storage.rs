//! Persistence backends for study history.
//!
//! A store is addressed by study name and supports load-if-exists /
//! create-else semantics, so re-running a named study resumes where it left
//! off. Two backends ship: [`MemoryStore`] for ephemeral studies and tests,
//! and [`JournalStore`], which keeps one JSONL file per study: a metadata
//! line followed by one line per terminal trial, appended as trials finish.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use pf_types::{Direction, PfResult, StoreError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::trial::Trial;

/// Identity and configuration of a persisted study.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudyMeta {
    pub id: Uuid,
    pub name: String,
    pub direction: Direction,
    pub created_at: DateTime<Utc>,
}

impl StudyMeta {
    pub fn new(name: impl Into<String>, direction: Direction) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            direction,
            created_at: Utc::now(),
        }
    }
}

/// A loaded study: metadata plus the full ordered trial history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudySnapshot {
    pub meta: StudyMeta,
    pub trials: Vec<Trial>,
}

/// Trait for pluggable study persistence.
pub trait StudyStore: Send + Sync {
    /// Load a study by name; `Ok(None)` when it does not exist yet.
    fn load(&self, name: &str) -> PfResult<Option<StudySnapshot>>;

    /// Register a new study.
    fn create(&self, meta: &StudyMeta) -> PfResult<()>;

    /// Durably append one terminal trial to the named study.
    fn append(&self, name: &str, trial: &Trial) -> PfResult<()>;
}

impl<S: StudyStore + ?Sized> StudyStore for std::sync::Arc<S> {
    fn load(&self, name: &str) -> PfResult<Option<StudySnapshot>> {
        (**self).load(name)
    }

    fn create(&self, meta: &StudyMeta) -> PfResult<()> {
        (**self).create(meta)
    }

    fn append(&self, name: &str, trial: &Trial) -> PfResult<()> {
        (**self).append(name, trial)
    }
}

// ---- In-memory store ----

/// Keeps studies in process memory. History survives repeated `run` calls
/// on the same `Study`, but not process restarts.
pub struct MemoryStore {
    studies: RwLock<HashMap<String, StudySnapshot>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            studies: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StudyStore for MemoryStore {
    fn load(&self, name: &str) -> PfResult<Option<StudySnapshot>> {
        Ok(self.studies.read().get(name).cloned())
    }

    fn create(&self, meta: &StudyMeta) -> PfResult<()> {
        self.studies.write().insert(
            meta.name.clone(),
            StudySnapshot {
                meta: meta.clone(),
                trials: Vec::new(),
            },
        );
        Ok(())
    }

    fn append(&self, name: &str, trial: &Trial) -> PfResult<()> {
        let mut studies = self.studies.write();
        let snapshot = studies.get_mut(name).ok_or_else(|| StoreError::UnknownStudy {
            name: name.to_string(),
        })?;
        snapshot.trials.push(trial.clone());
        Ok(())
    }
}

// ---- JSONL journal store ----

/// One JSONL file per study under a root directory.
///
/// The first line holds the [`StudyMeta`], every following line one terminal
/// [`Trial`]. Appends are serialized through a mutex and flushed so a crash
/// loses at most the trial being written.
pub struct JournalStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl JournalStore {
    /// Create a journal store rooted at `root` (created if absent).
    pub fn new(root: impl AsRef<Path>) -> PfResult<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    fn path_for(&self, name: &str) -> PathBuf {
        // Study names become file names; anything unfriendly is replaced.
        let sanitized: String = name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.root.join(format!("{sanitized}.jsonl"))
    }
}

impl StudyStore for JournalStore {
    fn load(&self, name: &str) -> PfResult<Option<StudySnapshot>> {
        let path = self.path_for(name);
        let file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(StoreError::Io {
                    message: format!("{}: {e}", path.display()),
                }
                .into())
            }
        };

        let mut lines = BufReader::new(file).lines();
        let meta_line = lines
            .next()
            .transpose()
            .map_err(|e| StoreError::Io {
                message: e.to_string(),
            })?
            .ok_or_else(|| StoreError::Corrupt {
                message: format!("{}: missing metadata line", path.display()),
            })?;
        let meta: StudyMeta = serde_json::from_str(&meta_line).map_err(|e| StoreError::Corrupt {
            message: format!("{}: bad metadata: {e}", path.display()),
        })?;

        let mut trials = Vec::new();
        for line in lines {
            let line = line.map_err(|e| StoreError::Io {
                message: e.to_string(),
            })?;
            if line.trim().is_empty() {
                continue;
            }
            let trial: Trial = serde_json::from_str(&line).map_err(|e| StoreError::Corrupt {
                message: format!("{}: bad trial record: {e}", path.display()),
            })?;
            trials.push(trial);
        }

        Ok(Some(StudySnapshot { meta, trials }))
    }

    fn create(&self, meta: &StudyMeta) -> PfResult<()> {
        let _guard = self.write_lock.lock();
        let path = self.path_for(&meta.name);
        let mut file = File::create(&path).map_err(|e| StoreError::Io {
            message: format!("{}: {e}", path.display()),
        })?;
        let line = serde_json::to_string(meta).map_err(|e| StoreError::Serialization {
            message: e.to_string(),
        })?;
        writeln!(file, "{line}").map_err(|e| StoreError::Io {
            message: e.to_string(),
        })?;
        file.flush().map_err(|e| StoreError::Io {
            message: e.to_string(),
        })?;
        Ok(())
    }

    fn append(&self, name: &str, trial: &Trial) -> PfResult<()> {
        let _guard = self.write_lock.lock();
        let path = self.path_for(name);
        let mut file = OpenOptions::new()
            .append(true)
            .open(&path)
            .map_err(|e| StoreError::Io {
                message: format!("{}: {e}", path.display()),
            })?;
        let line = serde_json::to_string(trial).map_err(|e| StoreError::Serialization {
            message: e.to_string(),
        })?;
        writeln!(file, "{line}").map_err(|e| StoreError::Io {
            message: e.to_string(),
        })?;
        file.flush().map_err(|e| StoreError::Io {
            message: e.to_string(),
        })?;
        Ok(())
    }
}

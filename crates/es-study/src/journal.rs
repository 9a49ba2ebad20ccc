//! Append-only journal storage shared by every worker of a study.
//!
//! Each line of the journal file is one JSON-encoded [`JournalRecord`]. The
//! in-memory view is rebuilt by replaying lines in file order, so every
//! process that reads the same file agrees on study ids, trial ids and trial
//! numbers. Writers serialize through a lock file that sits next to the
//! journal and is created exclusively.
//!
//! The API is synchronous. Async callers on a current-thread runtime should
//! go through `spawn_blocking`; on a multi-threaded runtime a handle may be
//! used directly, since lock waits move off the worker thread.

use chrono::{DateTime, Utc};
use es_types::{StudyError, SweepResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::distribution::{Distribution, ParamValue};
use crate::trial::{FrozenTrial, StudyDirection, TrialState};

pub type StudyId = usize;
pub type TrialId = usize;

/// Default age after which a leftover lock file is considered abandoned.
pub const DEFAULT_LOCK_GRACE: Duration = Duration::from_secs(30);

/// One mutation of the shared study state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum JournalOp {
    CreateStudy {
        study_name: String,
        direction: StudyDirection,
    },
    CreateTrial {
        study_id: StudyId,
        datetime_start: DateTime<Utc>,
    },
    SetTrialParam {
        trial_id: TrialId,
        name: String,
        value: ParamValue,
        distribution: Distribution,
    },
    SetTrialState {
        trial_id: TrialId,
        state: TrialState,
        value: Option<f64>,
        fail_reason: Option<String>,
        datetime_complete: DateTime<Utc>,
    },
}

/// A journal line: the operation plus the worker that wrote it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalRecord {
    pub worker_id: String,
    #[serde(flatten)]
    pub op: JournalOp,
}

#[derive(Debug, Clone)]
struct StudyRecord {
    name: String,
    direction: StudyDirection,
    trial_ids: Vec<TrialId>,
}

/// State rebuilt from the journal.
#[derive(Debug, Default)]
struct ReplayState {
    studies: Vec<StudyRecord>,
    study_index: HashMap<String, StudyId>,
    trials: Vec<FrozenTrial>,
    /// Byte offset just past the last applied line.
    offset: u64,
    lines_applied: usize,
}

impl ReplayState {
    fn running_trial(&self, trial_id: TrialId) -> SweepResult<&FrozenTrial> {
        let trial = self
            .trials
            .get(trial_id)
            .ok_or(StudyError::TrialNotFound { trial_id })?;
        if trial.state.is_finished() {
            return Err(StudyError::TrialFinished { trial_id }.into());
        }
        Ok(trial)
    }

    /// Validate `op` against the current state without applying it.
    fn check(&self, op: &JournalOp) -> SweepResult<()> {
        match op {
            JournalOp::CreateStudy { study_name, .. } => {
                if self.study_index.contains_key(study_name) {
                    return Err(StudyError::DuplicatedStudy {
                        name: study_name.clone(),
                    }
                    .into());
                }
            }
            JournalOp::CreateTrial { study_id, .. } => {
                if *study_id >= self.studies.len() {
                    return Err(StudyError::StudyNotFound {
                        name: format!("#{study_id}"),
                    }
                    .into());
                }
            }
            JournalOp::SetTrialParam {
                trial_id,
                name,
                value,
                distribution,
            } => {
                let trial = self.running_trial(*trial_id)?;
                distribution.validate(name)?;
                if !distribution.contains(value) {
                    return Err(StudyError::InvalidDistribution {
                        name: name.clone(),
                        message: format!("value {value} is outside the distribution"),
                    }
                    .into());
                }
                if let Some(existing) = trial.distributions.get(name) {
                    if existing != distribution {
                        return Err(StudyError::IncompatibleDistribution { name: name.clone() }.into());
                    }
                }
            }
            JournalOp::SetTrialState { trial_id, state, .. } => {
                self.running_trial(*trial_id)?;
                if !state.is_finished() {
                    return Err(es_types::validation_error!(
                        "trial {trial_id} can only move to a finished state"
                    ));
                }
            }
        }
        Ok(())
    }

    /// Apply a record that already passed [`ReplayState::check`].
    fn apply(&mut self, record: JournalRecord) {
        match record.op {
            JournalOp::CreateStudy {
                study_name,
                direction,
            } => {
                let study_id = self.studies.len();
                self.study_index.insert(study_name.clone(), study_id);
                self.studies.push(StudyRecord {
                    name: study_name,
                    direction,
                    trial_ids: Vec::new(),
                });
            }
            JournalOp::CreateTrial {
                study_id,
                datetime_start,
            } => {
                let trial_id = self.trials.len();
                let study = &mut self.studies[study_id];
                let number = study.trial_ids.len();
                study.trial_ids.push(trial_id);
                self.trials.push(FrozenTrial {
                    trial_id,
                    study_id,
                    number,
                    state: TrialState::Running,
                    params: BTreeMap::new(),
                    distributions: BTreeMap::new(),
                    value: None,
                    worker_id: record.worker_id,
                    datetime_start,
                    datetime_complete: None,
                    fail_reason: None,
                });
            }
            JournalOp::SetTrialParam {
                trial_id,
                name,
                value,
                distribution,
            } => {
                let trial = &mut self.trials[trial_id];
                trial.params.insert(name.clone(), value);
                trial.distributions.insert(name, distribution);
            }
            JournalOp::SetTrialState {
                trial_id,
                state,
                value,
                fail_reason,
                datetime_complete,
            } => {
                let trial = &mut self.trials[trial_id];
                trial.state = state;
                trial.value = value;
                trial.fail_reason = fail_reason;
                trial.datetime_complete = Some(datetime_complete);
            }
        }
    }
}

/// Exclusive lock held while appending to the journal.
#[derive(Debug)]
struct FileLock {
    path: PathBuf,
}

impl FileLock {
    fn acquire(path: &Path, grace: Duration) -> SweepResult<Self> {
        let mut backoff = Duration::from_millis(1);
        loop {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(_) => {
                    return Ok(Self {
                        path: path.to_path_buf(),
                    })
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if lock_age(path).is_some_and(|age| age > grace) {
                        warn!("Breaking stale journal lock {}", path.display());
                        // Another waiter may have broken it first.
                        let _ = fs::remove_file(path);
                        continue;
                    }
                    pause(backoff);
                    backoff = (backoff * 2).min(Duration::from_millis(50));
                }
                Err(e) => {
                    return Err(StudyError::LockFailed {
                        path: path.display().to_string(),
                        message: e.to_string(),
                    }
                    .into())
                }
            }
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("Failed to release journal lock {}: {}", self.path.display(), e);
        }
    }
}

/// Sleep between lock attempts. On a multi-threaded tokio worker the thread
/// is handed off first so other tasks keep running while we wait.
fn pause(backoff: Duration) {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(|| std::thread::sleep(backoff))
        }
        _ => std::thread::sleep(backoff),
    }
}

/// Decode one journal line without its newline; blank lines yield `None`.
fn parse_line(bytes: &[u8]) -> Result<Option<JournalRecord>, String> {
    let text = std::str::from_utf8(bytes).map_err(|e| e.to_string())?;
    if text.trim().is_empty() {
        return Ok(None);
    }
    serde_json::from_str(text).map(Some).map_err(|e| e.to_string())
}

fn lock_age(path: &Path) -> Option<Duration> {
    fs::metadata(path).ok()?.modified().ok()?.elapsed().ok()
}

/// Journal-file storage backend for studies.
///
/// Open one handle per worker; handles on the same file may live in
/// different threads or processes.
#[derive(Debug)]
pub struct JournalStorage {
    path: PathBuf,
    lock_path: PathBuf,
    worker_id: String,
    lock_grace: Duration,
    state: Mutex<ReplayState>,
}

impl JournalStorage {
    /// Open (creating if needed) the journal at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> SweepResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        OpenOptions::new().create(true).append(true).open(&path)?;

        let mut lock_name = path.file_name().unwrap_or_default().to_os_string();
        lock_name.push(".lock");
        let lock_path = path.with_file_name(lock_name);

        let storage = Self {
            path,
            lock_path,
            worker_id: format!("{}-{}", std::process::id(), Uuid::new_v4()),
            lock_grace: DEFAULT_LOCK_GRACE,
            state: Mutex::new(ReplayState::default()),
        };
        storage.sync(&mut storage.state.lock())?;
        Ok(storage)
    }

    pub fn with_lock_grace(mut self, grace: Duration) -> Self {
        self.lock_grace = grace;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Create a study. Fails with `DuplicatedStudy` without writing anything
    /// if the name is taken.
    pub fn create_new_study(&self, name: &str, direction: StudyDirection) -> SweepResult<StudyId> {
        let op = JournalOp::CreateStudy {
            study_name: name.to_string(),
            direction,
        };
        self.append(op, |state| state.studies.len() - 1)
    }

    pub fn study_id(&self, name: &str) -> SweepResult<StudyId> {
        let mut state = self.state.lock();
        self.sync(&mut state)?;
        state.study_index.get(name).copied().ok_or_else(|| {
            StudyError::StudyNotFound {
                name: name.to_string(),
            }
            .into()
        })
    }

    pub fn study_direction(&self, study_id: StudyId) -> SweepResult<StudyDirection> {
        let mut state = self.state.lock();
        self.sync(&mut state)?;
        state
            .studies
            .get(study_id)
            .map(|s| s.direction)
            .ok_or_else(|| {
                StudyError::StudyNotFound {
                    name: format!("#{study_id}"),
                }
                .into()
            })
    }

    pub fn study_names(&self) -> SweepResult<Vec<String>> {
        let mut state = self.state.lock();
        self.sync(&mut state)?;
        Ok(state.studies.iter().map(|s| s.name.clone()).collect())
    }

    /// Start a new running trial; the journal assigns its id and number.
    pub fn create_trial(&self, study_id: StudyId) -> SweepResult<FrozenTrial> {
        let op = JournalOp::CreateTrial {
            study_id,
            datetime_start: Utc::now(),
        };
        self.append(op, |state| state.trials[state.trials.len() - 1].clone())
    }

    pub fn set_trial_param(
        &self,
        trial_id: TrialId,
        name: &str,
        value: ParamValue,
        distribution: Distribution,
    ) -> SweepResult<()> {
        let op = JournalOp::SetTrialParam {
            trial_id,
            name: name.to_string(),
            value,
            distribution,
        };
        self.append(op, |_| ())
    }

    /// Move a running trial into a finished state.
    pub fn finish_trial(
        &self,
        trial_id: TrialId,
        state: TrialState,
        value: Option<f64>,
        fail_reason: Option<String>,
    ) -> SweepResult<FrozenTrial> {
        let op = JournalOp::SetTrialState {
            trial_id,
            state,
            value,
            fail_reason,
            datetime_complete: Utc::now(),
        };
        self.append(op, |state| state.trials[trial_id].clone())
    }

    pub fn trial(&self, trial_id: TrialId) -> SweepResult<FrozenTrial> {
        let mut state = self.state.lock();
        self.sync(&mut state)?;
        state
            .trials
            .get(trial_id)
            .cloned()
            .ok_or_else(|| StudyError::TrialNotFound { trial_id }.into())
    }

    /// All trials of a study, ordered by trial number.
    pub fn trials(&self, study_id: StudyId) -> SweepResult<Vec<FrozenTrial>> {
        let mut state = self.state.lock();
        self.sync(&mut state)?;
        let study = state.studies.get(study_id).ok_or_else(|| StudyError::StudyNotFound {
            name: format!("#{study_id}"),
        })?;
        Ok(study
            .trial_ids
            .iter()
            .map(|id| state.trials[*id].clone())
            .collect())
    }

    /// Lock, catch up, validate, append, and apply our own line.
    fn append<T>(&self, op: JournalOp, extract: impl FnOnce(&ReplayState) -> T) -> SweepResult<T> {
        let mut state = self.state.lock();
        let _lock = FileLock::acquire(&self.lock_path, self.lock_grace)?;
        self.sync(&mut state)?;
        state.check(&op)?;

        let record = JournalRecord {
            worker_id: self.worker_id.clone(),
            op,
        };
        let line = serde_json::to_string(&record)?;

        let mut file = OpenOptions::new().append(true).open(&self.path)?;
        // Bytes past the last complete line while we hold the lock belong to
        // a writer that died mid-line. Terminate them so our line stands
        // alone; readers skip the sealed fragment.
        let torn = file.metadata()?.len().saturating_sub(state.offset);
        let mut buf = String::with_capacity(line.len() + 2);
        if torn > 0 {
            warn!(
                "Sealing {} bytes of torn journal line {} in {}",
                torn,
                state.lines_applied + 1,
                self.path.display()
            );
            buf.push('\n');
        }
        buf.push_str(&line);
        buf.push('\n');
        file.write_all(buf.as_bytes())?;
        file.sync_data()?;

        // Nobody else can write while we hold the lock, so the file now ends
        // with exactly our line; apply it without re-reading.
        if torn > 0 {
            state.lines_applied += 1;
        }
        state.offset += torn + buf.len() as u64;
        state.lines_applied += 1;
        state.apply(record);
        Ok(extract(&*state))
    }

    /// Replay every complete line written since the last sync.
    fn sync(&self, state: &mut ReplayState) -> SweepResult<()> {
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        file.seek(SeekFrom::Start(state.offset))?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;

        // A line without its newline is still being written.
        let complete: Vec<&[u8]> = buf
            .split_inclusive(|b| *b == b'\n')
            .take_while(|chunk| chunk.last() == Some(&b'\n'))
            .collect();

        for (i, chunk) in complete.iter().enumerate() {
            let line_no = state.lines_applied + 1;
            match parse_line(&chunk[..chunk.len() - 1]) {
                Ok(Some(record)) => match state.check(&record.op) {
                    Ok(()) => state.apply(record),
                    Err(e) => warn!(
                        "Skipping journal line {} from worker {}: {}",
                        line_no, record.worker_id, e
                    ),
                },
                Ok(None) => {}
                // Only a sealed torn write is followed by more lines.
                Err(message) if i + 1 < complete.len() => {
                    warn!("Skipping unreadable journal line {}: {}", line_no, message)
                }
                Err(message) => {
                    return Err(StudyError::JournalCorrupted {
                        line: line_no,
                        message,
                    }
                    .into())
                }
            }

            state.offset += chunk.len() as u64;
            state.lines_applied = line_no;
        }

        debug!(
            "Journal {} synced: {} lines, {} trials",
            self.path.display(),
            state.lines_applied,
            state.trials.len()
        );
        Ok(())
    }
}

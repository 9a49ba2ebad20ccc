//! Studies: create, load, and optimize against an objective.

use async_trait::async_trait;
use es_types::{SweepError, SweepResult};
use std::sync::Arc;
use tracing::{info, warn};

use crate::journal::{JournalStorage, StudyId};
use crate::sampler::Sampler;
use crate::trial::{FrozenTrial, StudyDirection, Trial, TrialState};

/// Function being optimized. Returns the score of one trial.
#[async_trait]
pub trait Objective: Send + Sync {
    async fn evaluate(&self, trial: &mut Trial) -> SweepResult<f64>;
}

/// Knobs for [`Study::optimize`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OptimizeOptions {
    /// Record a failing objective and keep going instead of returning its
    /// error.
    pub catch_failures: bool,
}

/// A handle on a named study inside a journal.
pub struct Study {
    name: String,
    study_id: StudyId,
    direction: StudyDirection,
    storage: Arc<JournalStorage>,
    sampler: Arc<dyn Sampler>,
}

impl std::fmt::Debug for Study {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Study")
            .field("name", &self.name)
            .field("study_id", &self.study_id)
            .field("direction", &self.direction)
            .field("sampler", &self.sampler.name())
            .finish()
    }
}

impl Study {
    /// Create a new study; fails if the name already exists in the journal.
    pub fn create(
        storage: Arc<JournalStorage>,
        name: &str,
        direction: StudyDirection,
        sampler: Arc<dyn Sampler>,
    ) -> SweepResult<Self> {
        let study_id = storage.create_new_study(name, direction)?;
        info!("Created study '{}' ({:?})", name, direction);
        Ok(Self {
            name: name.to_string(),
            study_id,
            direction,
            storage,
            sampler,
        })
    }

    /// Load an existing study by name.
    pub fn load(storage: Arc<JournalStorage>, name: &str, sampler: Arc<dyn Sampler>) -> SweepResult<Self> {
        let study_id = storage.study_id(name)?;
        let direction = storage.study_direction(study_id)?;
        Ok(Self {
            name: name.to_string(),
            study_id,
            direction,
            storage,
            sampler,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn study_id(&self) -> StudyId {
        self.study_id
    }

    pub fn direction(&self) -> StudyDirection {
        self.direction
    }

    pub fn storage(&self) -> &Arc<JournalStorage> {
        &self.storage
    }

    /// Start a new trial.
    pub fn ask(&self) -> SweepResult<Trial> {
        let history = self.storage.trials(self.study_id)?;
        let record = self.storage.create_trial(self.study_id)?;
        Ok(Trial::new(
            Arc::clone(&self.storage),
            Arc::clone(&self.sampler),
            self.direction,
            history,
            record,
        ))
    }

    /// Finish a trial with its score. A non-finite score fails the trial.
    pub fn tell(&self, trial: Trial, value: f64) -> SweepResult<FrozenTrial> {
        if !value.is_finite() {
            warn!(
                "Trial {} returned {}; marking it failed",
                trial.number(),
                value
            );
            return self.tell_failed(trial, format!("objective returned non-finite value {value}"));
        }
        let finished = self
            .storage
            .finish_trial(trial.trial_id(), TrialState::Complete, Some(value), None)?;
        info!("{}", finished);
        Ok(finished)
    }

    pub fn tell_failed(&self, trial: Trial, reason: impl Into<String>) -> SweepResult<FrozenTrial> {
        let finished =
            self.storage
                .finish_trial(trial.trial_id(), TrialState::Fail, None, Some(reason.into()))?;
        warn!("{}", finished);
        Ok(finished)
    }

    /// Run `n_trials` trials one after another.
    ///
    /// A failing objective marks its trial `Fail`. The error is then returned
    /// unless `options.catch_failures` is set.
    pub async fn optimize(
        &self,
        objective: &dyn Objective,
        n_trials: usize,
        options: OptimizeOptions,
    ) -> SweepResult<Vec<FrozenTrial>> {
        let mut finished = Vec::with_capacity(n_trials);
        for _ in 0..n_trials {
            let mut trial = self.ask()?;
            match objective.evaluate(&mut trial).await {
                Ok(value) => finished.push(self.tell(trial, value)?),
                Err(e) => {
                    finished.push(self.tell_failed(trial, e.to_string())?);
                    if !options.catch_failures {
                        return Err(e);
                    }
                }
            }
        }
        Ok(finished)
    }

    /// Every trial of the study, ordered by number.
    pub fn trials(&self) -> SweepResult<Vec<FrozenTrial>> {
        self.storage.trials(self.study_id)
    }

    pub fn best_trial(&self) -> SweepResult<Option<FrozenTrial>> {
        let trials = self.trials()?;
        Ok(self.direction.best(&trials).cloned())
    }
}

/// Create a study without keeping a handle, as the initializer does.
pub fn create_new_study(storage: &JournalStorage, name: &str, direction: StudyDirection) -> SweepResult<StudyId> {
    storage.create_new_study(name, direction).map_err(|e| {
        if let SweepError::Study(es_types::StudyError::DuplicatedStudy { .. }) = &e {
            warn!("Study '{}' already exists in {}", name, storage.path().display());
        }
        e
    })
}

//! Trial records and the live trial handle used by objectives.

use chrono::{DateTime, Utc};
use es_types::{StudyError, SweepResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::distribution::{Distribution, ParamValue};
use crate::journal::{JournalStorage, StudyId, TrialId};
use crate::sampler::{SampleContext, Sampler};

/// Whether we are maximizing or minimizing the objective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StudyDirection {
    Maximize,
    Minimize,
}

impl Default for StudyDirection {
    fn default() -> Self {
        Self::Maximize
    }
}

impl StudyDirection {
    /// True if `candidate` improves on `current`.
    pub fn is_better(self, candidate: f64, current: f64) -> bool {
        match self {
            Self::Maximize => candidate > current,
            Self::Minimize => candidate < current,
        }
    }

    /// Best completed trial; ties keep the earliest.
    pub fn best<'a, I>(self, trials: I) -> Option<&'a FrozenTrial>
    where
        I: IntoIterator<Item = &'a FrozenTrial>,
    {
        let mut best: Option<(&FrozenTrial, f64)> = None;
        for trial in trials {
            let Some(value) = trial.completed_value() else {
                continue;
            };
            let improves = match best {
                None => true,
                Some((_, current)) => self.is_better(value, current),
            };
            if improves {
                best = Some((trial, value));
            }
        }
        best.map(|(trial, _)| trial)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialState {
    Running,
    Complete,
    Fail,
}

impl TrialState {
    pub fn is_finished(self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Snapshot of a trial as recorded in the journal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrozenTrial {
    pub trial_id: TrialId,
    pub study_id: StudyId,
    /// Per-study number, assigned in journal order.
    pub number: usize,
    pub state: TrialState,
    pub params: BTreeMap<String, ParamValue>,
    pub distributions: BTreeMap<String, Distribution>,
    pub value: Option<f64>,
    pub worker_id: String,
    pub datetime_start: DateTime<Utc>,
    pub datetime_complete: Option<DateTime<Utc>>,
    pub fail_reason: Option<String>,
}

impl FrozenTrial {
    pub fn completed_value(&self) -> Option<f64> {
        match self.state {
            TrialState::Complete => self.value,
            _ => None,
        }
    }
}

impl fmt::Display for FrozenTrial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "trial {} [{:?}]", self.number, self.state)?;
        match (self.value, &self.fail_reason) {
            (Some(value), _) => write!(f, " value={value:.6}")?,
            (None, Some(reason)) => write!(f, " failed: {reason}")?,
            (None, None) => {}
        }
        let params: Vec<String> = self
            .params
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect();
        write!(f, " params={{{}}}", params.join(", "))
    }
}

/// A running trial handed to the objective.
///
/// Every suggestion is sampled, validated and written to the journal before
/// it is returned, so a crash mid-objective still leaves the sampled
/// parameters on record.
pub struct Trial {
    storage: Arc<JournalStorage>,
    sampler: Arc<dyn Sampler>,
    direction: StudyDirection,
    /// Study trials known when this trial was created.
    history: Vec<FrozenTrial>,
    record: FrozenTrial,
}

impl fmt::Debug for Trial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Trial")
            .field("record", &self.record)
            .field("sampler", &self.sampler.name())
            .finish()
    }
}

impl Trial {
    pub(crate) fn new(
        storage: Arc<JournalStorage>,
        sampler: Arc<dyn Sampler>,
        direction: StudyDirection,
        history: Vec<FrozenTrial>,
        record: FrozenTrial,
    ) -> Self {
        Self {
            storage,
            sampler,
            direction,
            history,
            record,
        }
    }

    pub fn number(&self) -> usize {
        self.record.number
    }

    pub fn trial_id(&self) -> TrialId {
        self.record.trial_id
    }

    pub fn params(&self) -> &BTreeMap<String, ParamValue> {
        &self.record.params
    }

    pub fn suggest_int(&mut self, name: &str, low: i64, high: i64) -> SweepResult<i64> {
        self.suggest_int_scaled(name, low, high, false)
    }

    /// Integer sampled on a log scale; `low` must be at least 1.
    pub fn suggest_int_log(&mut self, name: &str, low: i64, high: i64) -> SweepResult<i64> {
        self.suggest_int_scaled(name, low, high, true)
    }

    fn suggest_int_scaled(&mut self, name: &str, low: i64, high: i64, log: bool) -> SweepResult<i64> {
        let value = self.suggest(name, Distribution::int(low, high, log))?;
        value
            .as_int()
            .ok_or_else(|| es_types::internal_error!("{name} produced a non-integer value {value}"))
    }

    pub fn suggest_float(&mut self, name: &str, low: f64, high: f64, log: bool) -> SweepResult<f64> {
        let value = self.suggest(name, Distribution::float(low, high, log))?;
        value
            .as_float()
            .ok_or_else(|| es_types::internal_error!("{name} produced a non-float value {value}"))
    }

    pub fn suggest_categorical<S: AsRef<str>>(&mut self, name: &str, choices: &[S]) -> SweepResult<String> {
        let distribution = Distribution::categorical(choices.iter().map(|c| c.as_ref().to_string()));
        let value = self.suggest(name, distribution)?;
        value
            .as_choice()
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| es_types::internal_error!("{name} produced a non-string choice {value}"))
    }

    fn suggest(&mut self, name: &str, distribution: Distribution) -> SweepResult<ParamValue> {
        distribution.validate(name)?;

        if let Some(existing) = self.record.params.get(name) {
            return if self.record.distributions.get(name) == Some(&distribution) {
                Ok(existing.clone())
            } else {
                Err(StudyError::IncompatibleDistribution {
                    name: name.to_string(),
                }
                .into())
            };
        }

        let context = SampleContext {
            direction: self.direction,
            history: &self.history,
        };
        let value = self.sampler.sample(&context, name, &distribution);
        self.storage
            .set_trial_param(self.record.trial_id, name, value.clone(), distribution.clone())?;

        self.record.params.insert(name.to_string(), value.clone());
        self.record.distributions.insert(name.to_string(), distribution);
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frozen(number: usize, state: TrialState, value: Option<f64>) -> FrozenTrial {
        FrozenTrial {
            trial_id: number,
            study_id: 0,
            number,
            state,
            params: BTreeMap::new(),
            distributions: BTreeMap::new(),
            value,
            worker_id: "w".into(),
            datetime_start: Utc::now(),
            datetime_complete: None,
            fail_reason: None,
        }
    }

    #[test]
    fn best_trial_tracking_maximize() {
        let trials = vec![
            frozen(0, TrialState::Complete, Some(1.5)),
            frozen(1, TrialState::Complete, Some(2.0)),
            // Worse result should not replace
            frozen(2, TrialState::Complete, Some(1.0)),
            frozen(3, TrialState::Fail, None),
        ];
        let best = StudyDirection::Maximize.best(&trials).unwrap();
        assert_eq!(best.number, 1);
    }

    #[test]
    fn best_trial_tracking_minimize() {
        let trials = vec![
            frozen(0, TrialState::Complete, Some(0.15)),
            frozen(1, TrialState::Complete, Some(0.05)),
            frozen(2, TrialState::Running, None),
        ];
        let best = StudyDirection::Minimize.best(&trials).unwrap();
        assert_eq!(best.value, Some(0.05));
    }

    #[test]
    fn ties_keep_earliest() {
        let trials = vec![
            frozen(0, TrialState::Complete, Some(1.0)),
            frozen(1, TrialState::Complete, Some(1.0)),
        ];
        assert_eq!(StudyDirection::Maximize.best(&trials).unwrap().number, 0);
    }

    #[test]
    fn no_completed_trials_means_no_best() {
        let trials = vec![frozen(0, TrialState::Fail, None)];
        assert!(StudyDirection::Maximize.best(&trials).is_none());
    }

    #[test]
    fn display_lists_params() {
        let mut trial = frozen(4, TrialState::Complete, Some(0.5));
        trial.params.insert("epochs".into(), ParamValue::Int(9));
        trial
            .params
            .insert("activation".into(), ParamValue::Choice(serde_json::json!("Tanh")));
        let text = trial.to_string();
        assert_eq!(
            text,
            "trial 4 [Complete] value=0.500000 params={activation=Tanh, epochs=9}"
        );
    }

    #[test]
    fn failed_trial_display_shows_reason() {
        let mut trial = frozen(2, TrialState::Fail, None);
        trial.fail_reason = Some("trainer exited".into());
        assert!(trial.to_string().contains("failed: trainer exited"));
    }
}

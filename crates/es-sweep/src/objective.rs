//! The trial objective: suggest, fine-tune, score.

use async_trait::async_trait;
use es_finetune::{FineTuneRequest, FineTuner, TrialRecord};
use es_study::{Objective, Trial};
use es_types::{Activation, HyperparameterSuggestion, IntRange, SearchSpaceConfig, SweepConfig, SweepResult};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Fine-tunes the embedding model with the trial's hyperparameters and
/// returns the trainer's score unchanged.
pub struct EmbeddingObjective {
    tuner: Arc<dyn FineTuner>,
    model_id: String,
    search: SearchSpaceConfig,
    dataset_fraction: u32,
    epochs_override: Option<u32>,
    /// Host directory backing the artifact volume.
    volume_root: PathBuf,
}

impl EmbeddingObjective {
    pub fn new(config: &SweepConfig, tuner: Arc<dyn FineTuner>, volume_root: PathBuf) -> Self {
        Self {
            tuner,
            model_id: config.model_id.clone(),
            search: config.search.clone(),
            dataset_fraction: config.dataset_fraction,
            epochs_override: config.epochs_override,
            volume_root,
        }
    }

    pub fn volume_root(&self) -> &Path {
        &self.volume_root
    }

    pub fn save_path(&self, trial_number: usize) -> PathBuf {
        self.volume_root.join(format!("trial-{trial_number}"))
    }

    /// Draw the three hyperparameters for `trial`.
    pub fn suggest(&self, trial: &mut Trial) -> SweepResult<HyperparameterSuggestion> {
        let dense_out_features = suggest_in(trial, "dense_out_features", &self.search.dense_out_features)?;

        let names: Vec<&str> = self.search.activations.iter().map(|a| a.as_str()).collect();
        let activation: Activation = trial.suggest_categorical("activation", &names)?.parse()?;

        // Always suggested so the journal shows the sampled value.
        let epochs = suggest_in(trial, "epochs", &self.search.epochs)?;

        Ok(HyperparameterSuggestion {
            dense_out_features,
            activation,
            epochs: self.epochs_override.unwrap_or(epochs),
        })
    }
}

fn suggest_in(trial: &mut Trial, name: &str, range: &IntRange) -> SweepResult<u32> {
    let value = if range.log {
        trial.suggest_int_log(name, range.low, range.high)?
    } else {
        trial.suggest_int(name, range.low, range.high)?
    };
    u32::try_from(value).map_err(|_| es_types::validation_error!("{name}={value} does not fit in u32"))
}

#[async_trait]
impl Objective for EmbeddingObjective {
    async fn evaluate(&self, trial: &mut Trial) -> SweepResult<f64> {
        let suggestion = self.suggest(trial)?;
        let request = FineTuneRequest::new(
            self.model_id.clone(),
            self.save_path(trial.number()),
            suggestion,
            self.dataset_fraction,
        );
        info!(
            "Trial {}: dense_out_features={} activation={} epochs={}",
            trial.number(),
            request.dense_out_features,
            request.activation,
            request.epochs
        );

        let score = self.tuner.finetune(&request).await?;
        if score.is_finite() {
            TrialRecord::new(trial.number(), request, score).write()?;
        }
        Ok(score)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use es_finetune::TRIAL_RECORD_FILE;
    use es_study::{JournalStorage, RandomSampler, Study, StudyDirection};
    use es_types::FineTuneError;
    use tempfile::tempdir;

    struct FixedScore(f64);

    #[async_trait]
    impl FineTuner for FixedScore {
        async fn finetune(&self, request: &FineTuneRequest) -> Result<f64, FineTuneError> {
            std::fs::create_dir_all(&request.save_path).map_err(|e| FineTuneError::ArtifactWrite {
                path: request.save_path.display().to_string(),
                message: e.to_string(),
            })?;
            Ok(self.0)
        }
    }

    fn study(dir: &Path) -> Study {
        let storage = Arc::new(JournalStorage::open(dir.join("journal.log")).unwrap());
        Study::create(
            storage,
            "objective",
            StudyDirection::Maximize,
            Arc::new(RandomSampler::new(Some(3))),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn suggestions_stay_in_bounds_and_artifacts_are_written() {
        let dir = tempdir().unwrap();
        let config = SweepConfig::default();
        let volume_root = dir.path().join("vol");
        let objective = EmbeddingObjective::new(&config, Arc::new(FixedScore(0.5)), volume_root.clone());
        let study = study(dir.path());

        for _ in 0..10 {
            let mut trial = study.ask().unwrap();
            let number = trial.number();
            let score = objective.evaluate(&mut trial).await.unwrap();
            assert_eq!(score, 0.5);

            let s = objective.suggest(&mut trial).unwrap();
            assert!((200..=800).contains(&s.dense_out_features));
            assert!((7..=12).contains(&s.epochs));
            assert!(Activation::ALL.contains(&s.activation));

            let record = TrialRecord::read(volume_root.join(format!("trial-{number}"))).unwrap();
            assert_eq!(record.request.suggestion(), s);
            study.tell(trial, score).unwrap();
        }
        assert!(volume_root.join("trial-0").join(TRIAL_RECORD_FILE).exists());
    }

    #[tokio::test]
    async fn epochs_override_pins_epochs() {
        let dir = tempdir().unwrap();
        let config = SweepConfig {
            epochs_override: Some(8),
            ..SweepConfig::default()
        };
        let objective = EmbeddingObjective::new(&config, Arc::new(FixedScore(0.1)), dir.path().join("vol"));
        let study = study(dir.path());

        let mut trial = study.ask().unwrap();
        let suggestion = objective.suggest(&mut trial).unwrap();
        assert_eq!(suggestion.epochs, 8);
        // The sampled value is still on record.
        assert!(trial.params().contains_key("epochs"));
    }

    #[tokio::test]
    async fn non_finite_score_skips_trial_record() {
        let dir = tempdir().unwrap();
        let volume_root = dir.path().join("vol");
        let objective = EmbeddingObjective::new(
            &SweepConfig::default(),
            Arc::new(FixedScore(f64::NAN)),
            volume_root.clone(),
        );
        let study = study(dir.path());

        let mut trial = study.ask().unwrap();
        let score = objective.evaluate(&mut trial).await.unwrap();
        assert!(score.is_nan());
        assert!(!volume_root.join("trial-0").join(TRIAL_RECORD_FILE).exists());
    }

    #[test]
    fn save_path_uses_trial_number() {
        let objective = EmbeddingObjective::new(
            &SweepConfig::default(),
            Arc::new(FixedScore(0.0)),
            PathBuf::from("/data/vol"),
        );
        assert_eq!(objective.save_path(11), PathBuf::from("/data/vol/trial-11"));
    }
}

//! What a single fine-tuning run is asked to do, and what it leaves behind.

use chrono::{DateTime, Utc};
use es_types::{Activation, FineTuneError, HyperparameterSuggestion};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// File written next to each trial's model artifact.
pub const TRIAL_RECORD_FILE: &str = "trial.json";

/// Inputs for one fine-tuning run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FineTuneRequest {
    /// Base model to start from.
    pub model_id: String,
    /// Where the fine-tuned model is written. Host path.
    pub save_path: PathBuf,
    pub dense_out_features: u32,
    pub epochs: u32,
    /// Fixed dataset-size knob passed through to the trainer.
    pub dataset_fraction: u32,
    pub activation: Activation,
}

impl FineTuneRequest {
    pub fn new(
        model_id: impl Into<String>,
        save_path: impl Into<PathBuf>,
        suggestion: HyperparameterSuggestion,
        dataset_fraction: u32,
    ) -> Self {
        Self {
            model_id: model_id.into(),
            save_path: save_path.into(),
            dense_out_features: suggestion.dense_out_features,
            epochs: suggestion.epochs,
            dataset_fraction,
            activation: suggestion.activation,
        }
    }

    pub fn suggestion(&self) -> HyperparameterSuggestion {
        HyperparameterSuggestion {
            dense_out_features: self.dense_out_features,
            activation: self.activation,
            epochs: self.epochs,
        }
    }

    /// Command-line flags understood by the trainer script.
    pub fn cli_args(&self) -> Vec<String> {
        vec![
            "--model-id".to_string(),
            self.model_id.clone(),
            "--save-path".to_string(),
            self.save_path.display().to_string(),
            "--dense-out-features".to_string(),
            self.dense_out_features.to_string(),
            "--epochs".to_string(),
            self.epochs.to_string(),
            "--dataset-fraction".to_string(),
            self.dataset_fraction.to_string(),
            "--activation".to_string(),
            self.activation.as_str().to_string(),
        ]
    }
}

/// Summary of a finished trial stored beside its model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialRecord {
    pub trial_number: usize,
    pub request: FineTuneRequest,
    pub score: f64,
    pub finished_at: DateTime<Utc>,
}

impl TrialRecord {
    pub fn new(trial_number: usize, request: FineTuneRequest, score: f64) -> Self {
        Self {
            trial_number,
            request,
            score,
            finished_at: Utc::now(),
        }
    }

    /// Write `trial.json` into the request's save path, creating it if needed.
    pub fn write(&self) -> Result<PathBuf, FineTuneError> {
        let dir = &self.request.save_path;
        let path = dir.join(TRIAL_RECORD_FILE);
        let artifact_err = |message: String| FineTuneError::ArtifactWrite {
            path: path.display().to_string(),
            message,
        };

        std::fs::create_dir_all(dir).map_err(|e| artifact_err(e.to_string()))?;
        let json = serde_json::to_vec_pretty(self).map_err(|e| artifact_err(e.to_string()))?;
        std::fs::write(&path, json).map_err(|e| artifact_err(e.to_string()))?;
        Ok(path)
    }

    pub fn read<P: AsRef<Path>>(save_path: P) -> Result<Self, FineTuneError> {
        let path = save_path.as_ref().join(TRIAL_RECORD_FILE);
        let artifact_err = |message: String| FineTuneError::ArtifactRead {
            path: path.display().to_string(),
            message,
        };
        let raw = std::fs::read(&path).map_err(|e| artifact_err(e.to_string()))?;
        serde_json::from_slice(&raw).map_err(|e| artifact_err(e.to_string()))
    }
}

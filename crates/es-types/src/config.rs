//! Run configuration for a fine-tuning sweep.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::config_error;
use crate::errors::SweepResult;
use crate::hyperparams::{Activation, IntRange};

/// GPU kind requested for worker containers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GpuKind {
    T4,
    L4,
    A10g,
    A100,
    H100,
    Any,
}

impl std::fmt::Display for GpuKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::T4 => "t4",
            Self::L4 => "l4",
            Self::A10g => "a10g",
            Self::A100 => "a100",
            Self::H100 => "h100",
            Self::Any => "any",
        };
        f.write_str(name)
    }
}

/// Which sampler drives hyperparameter suggestions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SamplerKind {
    Random,
    Perturbation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    pub kind: SamplerKind,
    pub seed: Option<u64>,
    /// Probability of a pure random draw once enough trials are complete.
    pub exploration_weight: f64,
    /// Completed trials required before the sampler starts exploiting.
    pub n_startup: usize,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            kind: SamplerKind::Perturbation,
            seed: None,
            exploration_weight: 0.3,
            n_startup: 4,
        }
    }
}

/// Search ranges for the three tuned hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchSpaceConfig {
    pub dense_out_features: IntRange,
    pub epochs: IntRange,
    pub activations: Vec<Activation>,
}

impl Default for SearchSpaceConfig {
    fn default() -> Self {
        Self {
            dense_out_features: IntRange::new(200, 800, true),
            epochs: IntRange::new(7, 12, true),
            activations: Activation::ALL.to_vec(),
        }
    }
}

/// External trainer command invoked once per trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    pub program: String,
    pub args: Vec<String>,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            program: "python".to_string(),
            args: vec!["finetune.py".to_string()],
        }
    }
}

/// Top-level configuration for a sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    pub app_name: String,
    pub model_id: String,
    pub dataset_id: String,

    pub gpu: GpuKind,
    /// Number of GPU workers, which is also the concurrency ceiling.
    pub n_gpu: usize,
    /// Trials run by each worker. Total trials = n_gpu * n_trials_per_gpu.
    pub n_trials_per_gpu: usize,
    /// Prefetch the base model and dataset into the image.
    pub use_cached_image: bool,
    pub worker_timeout_secs: u64,
    pub allow_background_volume_commits: bool,
    /// Period of background volume commits during a worker call.
    pub volume_commit_interval_secs: u64,

    pub study_name: String,
    /// Container path of the journal; must live under `nfs_mount`.
    pub journal_path: PathBuf,
    pub nfs_mount: PathBuf,
    pub volume_mount: PathBuf,
    /// Persisted volume name prefix; a unix timestamp is appended per run.
    pub volume_prefix: String,
    /// Host directory backing file systems and volumes.
    pub data_root: PathBuf,

    pub search: SearchSpaceConfig,
    pub dataset_fraction: u32,
    /// Pin the epoch count instead of using the suggested value.
    pub epochs_override: Option<u32>,
    pub sampler: SamplerConfig,
    /// Keep a worker going after its objective fails.
    pub catch_trial_failures: bool,
    pub trainer: TrainerConfig,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            app_name: "finetune-embeddings-optuna".to_string(),
            model_id: "BAAI/bge-small-en-v1.5".to_string(),
            dataset_id: "quora".to_string(),
            gpu: GpuKind::A10g,
            n_gpu: 4,
            n_trials_per_gpu: 3,
            use_cached_image: true,
            worker_timeout_secs: 15000,
            allow_background_volume_commits: true,
            volume_commit_interval_secs: 30,
            study_name: "sentence-transformers-ft study".to_string(),
            journal_path: PathBuf::from("/root/cache/journal.log"),
            nfs_mount: PathBuf::from("/root/cache"),
            volume_mount: PathBuf::from("/vol"),
            volume_prefix: "sentence-transformers-ft-optuna".to_string(),
            data_root: PathBuf::from(".embedsweep"),
            search: SearchSpaceConfig::default(),
            dataset_fraction: 2,
            epochs_override: None,
            sampler: SamplerConfig::default(),
            catch_trial_failures: false,
            trainer: TrainerConfig::default(),
        }
    }
}

impl SweepConfig {
    /// Read a JSON config file; missing fields fall back to defaults.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> SweepResult<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Like [`SweepConfig::from_json_file`], but a missing file means defaults.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> SweepResult<Self> {
        if path.as_ref().exists() {
            Self::from_json_file(path)
        } else {
            let config = Self::default();
            config.validate()?;
            Ok(config)
        }
    }

    pub fn with_workers(mut self, n_gpu: usize, n_trials_per_gpu: usize) -> Self {
        self.n_gpu = n_gpu;
        self.n_trials_per_gpu = n_trials_per_gpu;
        self
    }

    pub fn with_data_root<P: Into<PathBuf>>(mut self, data_root: P) -> Self {
        self.data_root = data_root.into();
        self
    }

    pub fn with_sampler_seed(mut self, seed: u64) -> Self {
        self.sampler.seed = Some(seed);
        self
    }

    pub fn total_trials(&self) -> usize {
        self.n_gpu * self.n_trials_per_gpu
    }

    pub fn validate(&self) -> SweepResult<()> {
        if self.n_gpu == 0 {
            return Err(config_error!("n_gpu must be at least 1"));
        }
        if self.n_trials_per_gpu == 0 {
            return Err(config_error!("n_trials_per_gpu must be at least 1"));
        }
        if self.worker_timeout_secs == 0 {
            return Err(config_error!("worker_timeout_secs must be positive"));
        }
        if self.volume_commit_interval_secs == 0 {
            return Err(config_error!("volume_commit_interval_secs must be positive"));
        }
        if self.study_name.trim().is_empty() {
            return Err(config_error!("study_name must not be empty"));
        }
        if self.dataset_fraction == 0 {
            return Err(config_error!("dataset_fraction must be positive"));
        }
        if !(0.0..=1.0).contains(&self.sampler.exploration_weight) {
            return Err(config_error!(
                "sampler.exploration_weight must be within [0, 1], got {}",
                self.sampler.exploration_weight
            ));
        }

        check_range("dense_out_features", &self.search.dense_out_features)?;
        check_range("epochs", &self.search.epochs)?;

        if self.search.activations.is_empty() {
            return Err(config_error!("at least one activation is required"));
        }
        let unique: HashSet<_> = self.search.activations.iter().collect();
        if unique.len() != self.search.activations.len() {
            return Err(config_error!("activations must not repeat"));
        }

        for (field, path) in [
            ("journal_path", &self.journal_path),
            ("nfs_mount", &self.nfs_mount),
            ("volume_mount", &self.volume_mount),
        ] {
            if !path.is_absolute() {
                return Err(config_error!(
                    "{field} must be an absolute container path, got {}",
                    path.display()
                ));
            }
        }
        if !self.journal_path.starts_with(&self.nfs_mount) {
            return Err(config_error!(
                "journal_path {} is not under nfs_mount {}",
                self.journal_path.display(),
                self.nfs_mount.display()
            ));
        }
        if self.trainer.program.trim().is_empty() {
            return Err(config_error!("trainer.program must not be empty"));
        }

        Ok(())
    }
}

fn check_range(name: &str, range: &IntRange) -> SweepResult<()> {
    if range.low > range.high {
        return Err(config_error!(
            "{name} range is inverted: [{}, {}]",
            range.low,
            range.high
        ));
    }
    // Layer widths and epoch counts are counts; zero or less is never valid.
    if range.low < 1 {
        return Err(config_error!(
            "{name} range must start at 1 or above, got {}",
            range.low
        ));
    }
    Ok(())
}

//! Sweep entrypoint: initialize, fan out workers, conclude.

use chrono::Utc;
use crossbeam_channel::Sender;
use es_finetune::FineTuner;
use es_platform::{FunctionSpec, ImageSpec, LocalExecutor, NetworkFileSystem, Volume};
use es_study::{FrozenTrial, StudyDirection};
use es_types::{SweepConfig, SweepError, SweepResult};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::stages::{conclude_study, initialize_study, run_worker};

/// Python packages installed into the worker image.
pub const IMAGE_PACKAGES: [&str; 3] = ["sentence-transformers", "torch", "datasets"];

/// Progress notifications emitted by [`Sweep::run`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SweepEvent {
    StudyInitialized { study_name: String },
    WorkerFinished { index: usize },
    Concluded { n_trials: usize },
}

/// Outcome of a completed sweep.
#[derive(Debug, Clone)]
pub struct SweepReport {
    pub run_id: String,
    /// Name of the volume holding the trial artifacts.
    pub volume: String,
    /// Worker indices in completion order.
    pub workers: Vec<usize>,
    /// Every trial, ordered by number.
    pub trials: Vec<FrozenTrial>,
}

impl SweepReport {
    pub fn best_trial(&self) -> Option<&FrozenTrial> {
        StudyDirection::Maximize.best(&self.trials)
    }
}

/// One hyperparameter sweep over a fixed pool of GPU workers.
pub struct Sweep {
    config: Arc<SweepConfig>,
    tuner: Arc<dyn FineTuner>,
    executor: LocalExecutor,
    run_id: String,
    nfs: NetworkFileSystem,
    volume: Volume,
    initializer: FunctionSpec,
    worker: FunctionSpec,
    concluder: FunctionSpec,
    events: Option<Sender<SweepEvent>>,
}

impl Sweep {
    pub fn new(config: SweepConfig, tuner: Arc<dyn FineTuner>) -> SweepResult<Self> {
        config.validate()?;

        let mut run_id = Uuid::new_v4().simple().to_string();
        run_id.truncate(12);

        let nfs = NetworkFileSystem::ephemeral(&config.data_root, &run_id)?;
        let volume = Volume::persisted(&config.data_root, &config.volume_prefix, Utc::now())?;

        let initializer = FunctionSpec::new("initialize_study").with_mount(nfs.mount_at(&config.nfs_mount));
        let concluder = FunctionSpec::new("conclude_study").with_mount(nfs.mount_at(&config.nfs_mount));
        let worker = FunctionSpec::new("run_worker")
            .with_gpu(config.gpu)
            .with_timeout_secs(config.worker_timeout_secs)
            .with_background_commits(config.allow_background_volume_commits)
            .with_concurrency_limit(config.n_gpu)
            .with_mount(nfs.mount_at(&config.nfs_mount))
            .with_mount(volume.mount_at(&config.volume_mount));

        let executor = LocalExecutor::new(config.app_name.clone(), build_image(&config))
            .with_commit_interval(Duration::from_secs(config.volume_commit_interval_secs));
        info!(
            "Sweep {} of {}: {} workers x {} trials on {}, artifacts in volume {}",
            run_id,
            config.model_id,
            config.n_gpu,
            config.n_trials_per_gpu,
            config.gpu,
            volume.name()
        );

        Ok(Self {
            config: Arc::new(config),
            tuner,
            executor,
            run_id,
            nfs,
            volume,
            initializer,
            worker,
            concluder,
            events: None,
        })
    }

    /// Send progress events to `sender` as the sweep runs.
    pub fn with_events(mut self, sender: Sender<SweepEvent>) -> Self {
        self.events = Some(sender);
        self
    }

    pub fn config(&self) -> &SweepConfig {
        &self.config
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn nfs(&self) -> &NetworkFileSystem {
        &self.nfs
    }

    pub fn volume(&self) -> &Volume {
        &self.volume
    }

    pub fn image(&self) -> &ImageSpec {
        self.executor.image()
    }

    pub fn worker_spec(&self) -> &FunctionSpec {
        &self.worker
    }

    fn emit(&self, event: SweepEvent) {
        if let Some(sender) = &self.events {
            if sender.send(event).is_err() {
                debug!("Sweep event receiver dropped");
            }
        }
    }

    /// Initialize, run every worker, then conclude.
    pub async fn run(&self) -> SweepResult<SweepReport> {
        self.initialize().await?;
        let workers = self.run_workers().await?;
        let trials = self.conclude().await?;
        Ok(SweepReport {
            run_id: self.run_id.clone(),
            volume: self.volume.name().to_string(),
            workers,
            trials,
        })
    }

    /// Create the study. Runs to completion before anything else.
    pub async fn initialize(&self) -> SweepResult<()> {
        let config = Arc::clone(&self.config);
        self.executor
            .remote(&self.initializer, move |ctx| async move {
                initialize_study(&ctx, &config).map(|_| ())
            })
            .await?;
        self.emit(SweepEvent::StudyInitialized {
            study_name: self.config.study_name.clone(),
        });
        Ok(())
    }

    /// Start workers `1..=n_gpu` and wait for all of them.
    ///
    /// A failing worker does not stop the others; the first failure is
    /// returned once every worker has returned.
    pub async fn run_workers(&self) -> SweepResult<Vec<usize>> {
        let config = Arc::clone(&self.config);
        let tuner = Arc::clone(&self.tuner);
        let mut calls = self.executor.map(&self.worker, 1..=self.config.n_gpu, move |ctx, index| {
            run_worker(ctx, index, Arc::clone(&config), Arc::clone(&tuner))
        })?;

        let mut finished = Vec::with_capacity(self.config.n_gpu);
        let mut first_error: Option<SweepError> = None;
        while let Some(result) = calls.next().await {
            match result {
                Ok(index) => {
                    info!("Worker {} finished", index);
                    self.emit(SweepEvent::WorkerFinished { index });
                    finished.push(index);
                }
                Err(e) => {
                    error!("Worker failed: {}", e);
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(finished),
        }
    }

    /// Read back every trial of the study.
    pub async fn conclude(&self) -> SweepResult<Vec<FrozenTrial>> {
        let config = Arc::clone(&self.config);
        let trials = self
            .executor
            .remote(&self.concluder, move |ctx| async move { conclude_study(&ctx, &config) })
            .await?;
        self.emit(SweepEvent::Concluded {
            n_trials: trials.len(),
        });
        Ok(trials)
    }
}

/// Worker image; base model and dataset are baked in when caching is on.
pub fn build_image(config: &SweepConfig) -> ImageSpec {
    let image = ImageSpec::debian_slim().pip_install(IMAGE_PACKAGES);
    if config.use_cached_image {
        image
            .download_model(config.model_id.clone())
            .download_dataset(config.dataset_id.clone(), "train")
    } else {
        image
    }
}

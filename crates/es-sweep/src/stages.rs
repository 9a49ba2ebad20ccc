//! Bodies of the three sweep functions, run inside executor calls.

use es_finetune::FineTuner;
use es_platform::FunctionContext;
use es_study::{
    create_new_study, sampler_from_config, FrozenTrial, JournalStorage, OptimizeOptions, RandomSampler,
    Study, StudyDirection, StudyId,
};
use es_types::{SweepConfig, SweepResult};
use std::sync::Arc;
use tracing::info;

use crate::objective::EmbeddingObjective;

fn open_journal(ctx: &FunctionContext, config: &SweepConfig) -> SweepResult<JournalStorage> {
    JournalStorage::open(ctx.resolve(&config.journal_path)?)
}

/// Create the study on the shared journal. Fails if it already exists.
pub fn initialize_study(ctx: &FunctionContext, config: &SweepConfig) -> SweepResult<StudyId> {
    let storage = open_journal(ctx, config)?;
    let study_id = create_new_study(&storage, &config.study_name, StudyDirection::Maximize)?;
    info!(
        "Initialized study '{}' in {}",
        config.study_name,
        config.journal_path.display()
    );
    Ok(study_id)
}

/// Run this worker's share of trials against the shared study and return
/// its index.
pub async fn run_worker(
    ctx: FunctionContext,
    index: usize,
    config: Arc<SweepConfig>,
    tuner: Arc<dyn FineTuner>,
) -> SweepResult<usize> {
    let storage = Arc::new(open_journal(&ctx, &config)?);

    // Seeded workers must not replay each other's draws.
    let mut sampler_config = config.sampler.clone();
    sampler_config.seed = sampler_config.seed.map(|seed| seed.wrapping_add(index as u64));
    let study = Study::load(storage, &config.study_name, sampler_from_config(&sampler_config))?;

    let objective = EmbeddingObjective::new(&config, tuner, ctx.resolve(&config.volume_mount)?);
    info!(
        "Worker {} (gpu {:?}) running {} trials as {}",
        index,
        ctx.gpu,
        config.n_trials_per_gpu,
        study.storage().worker_id()
    );

    let options = OptimizeOptions {
        catch_failures: config.catch_trial_failures,
    };
    study
        .optimize(&objective, config.n_trials_per_gpu, options)
        .await?;
    Ok(index)
}

/// Every trial of the study, ordered by number.
pub fn conclude_study(ctx: &FunctionContext, config: &SweepConfig) -> SweepResult<Vec<FrozenTrial>> {
    let storage = Arc::new(open_journal(ctx, config)?);
    let study = Study::load(storage, &config.study_name, Arc::new(RandomSampler::new(None)))?;

    let trials = study.trials()?;
    for trial in &trials {
        info!("{}", trial);
    }
    if let Some(best) = study.direction().best(&trials) {
        info!("Best trial: {}", best);
    }
    Ok(trials)
}

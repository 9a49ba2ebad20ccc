//! Run a sweep with `embedsweep.json` from the working directory, or the
//! built-in defaults when it is absent.

use anyhow::{anyhow, Context};
use es_finetune::CommandFineTuner;
use es_sweep::{Sweep, SweepEvent};
use es_types::SweepConfig;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

const CONFIG_FILE: &str = "embedsweep.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = SweepConfig::load_or_default(CONFIG_FILE).with_context(|| format!("loading {CONFIG_FILE}"))?;
    let tuner = Arc::new(CommandFineTuner::from_config(&config.trainer));

    let (tx, rx) = crossbeam_channel::unbounded();
    let printer = std::thread::spawn(move || {
        for event in rx {
            if let SweepEvent::WorkerFinished { index } = event {
                println!("Finished training on gpu container {index}.");
            }
        }
    });

    let sweep = Sweep::new(config, tuner)?.with_events(tx);
    let result = sweep.run().await;
    drop(sweep);
    printer.join().map_err(|_| anyhow!("event printer panicked"))?;

    let report = result?;
    for trial in &report.trials {
        println!("{trial}");
    }
    if let Some(best) = report.best_trial() {
        info!("Best trial {} scored {:?}; artifacts in volume {}", best.number, best.value, report.volume);
    }
    Ok(())
}

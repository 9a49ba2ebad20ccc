//! # es-sweep
//!
//! Hyperparameter sweep for fine-tuning a sentence-embedding model.
//!
//! A sweep creates one study on a shared journal, starts one worker per GPU
//! that each run a fixed number of trials against that study, and finally
//! reads every trial back. Workers only coordinate through the journal.

mod objective;
mod stages;
mod sweep;

pub use objective::EmbeddingObjective;
pub use stages::{conclude_study, initialize_study, run_worker};
pub use sweep::{build_image, Sweep, SweepEvent, SweepReport, IMAGE_PACKAGES};

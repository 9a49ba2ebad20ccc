//! # es-study
//!
//! Optimization studies for EmbedSweep.
//!
//! A study lives in an append-only journal file that every worker opens
//! independently. Workers ask the study for trials, suggest hyperparameters
//! through the trial handle, and report scores back; the journal assigns trial
//! numbers so all workers agree on them.

mod distribution;
mod journal;
mod sampler;
mod study;
mod trial;

pub use distribution::{Distribution, ParamValue};
pub use journal::{JournalOp, JournalRecord, JournalStorage, StudyId, TrialId, DEFAULT_LOCK_GRACE};
pub use sampler::{sampler_from_config, PerturbationSampler, RandomSampler, SampleContext, Sampler};
pub use study::{create_new_study, Objective, OptimizeOptions, Study};
pub use trial::{FrozenTrial, StudyDirection, Trial, TrialState};

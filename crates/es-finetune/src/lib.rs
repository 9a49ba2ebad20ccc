//! # es-finetune
//!
//! The boundary between a sweep and the model trainer. A sweep only ever
//! sees [`FineTuner`]; the shipped [`CommandFineTuner`] runs a trainer
//! program per trial and reads the score from its output.

mod request;
mod tuner;

pub use request::{FineTuneRequest, TrialRecord, TRIAL_RECORD_FILE};
pub use tuner::{parse_score, CommandFineTuner, FineTuner};

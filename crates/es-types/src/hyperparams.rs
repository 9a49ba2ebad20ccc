//! Hyperparameter domain types for embedding fine-tuning trials.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::{SweepError, SweepResult};

/// Activation applied after the dense projection layer.
///
/// This is the single place an activation name is turned into a variant;
/// nothing else looks activations up by string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Activation {
    Tanh,
    ReLU,
    Sigmoid,
}

impl Activation {
    pub const ALL: [Activation; 3] = [Activation::Tanh, Activation::ReLU, Activation::Sigmoid];

    /// Name understood by the trainer.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tanh => "Tanh",
            Self::ReLU => "ReLU",
            Self::Sigmoid => "Sigmoid",
        }
    }
}

impl fmt::Display for Activation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Activation {
    type Err = SweepError;

    fn from_str(s: &str) -> SweepResult<Self> {
        Self::ALL
            .into_iter()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| crate::validation_error!("unsupported activation: {s}"))
    }
}

/// Inclusive integer range searched for a hyperparameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntRange {
    pub low: i64,
    pub high: i64,
    /// Sample in log space.
    #[serde(default)]
    pub log: bool,
}

impl IntRange {
    pub const fn new(low: i64, high: i64, log: bool) -> Self {
        Self { low, high, log }
    }

    pub fn contains(&self, value: i64) -> bool {
        value >= self.low && value <= self.high
    }
}

/// One sampled configuration handed to the fine-tuning routine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HyperparameterSuggestion {
    pub dense_out_features: u32,
    pub activation: Activation,
    pub epochs: u32,
}

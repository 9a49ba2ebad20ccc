//! Samplers that pick parameter values for new trials.

use es_types::{SamplerConfig, SamplerKind};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;

use crate::distribution::{Distribution, ParamValue};
use crate::trial::{FrozenTrial, StudyDirection};

/// What a sampler may look at when drawing a value.
#[derive(Debug, Clone, Copy)]
pub struct SampleContext<'a> {
    pub direction: StudyDirection,
    /// Trials of the study known at the time the trial was created.
    pub history: &'a [FrozenTrial],
}

impl SampleContext<'_> {
    pub fn completed(&self) -> impl Iterator<Item = &FrozenTrial> {
        self.history.iter().filter(|t| t.completed_value().is_some())
    }
}

/// Common trait for all samplers.
pub trait Sampler: Send + Sync {
    /// Draw a value for `name` from `distribution`.
    fn sample(&self, context: &SampleContext<'_>, name: &str, distribution: &Distribution) -> ParamValue;

    /// Human-readable sampler name.
    fn name(&self) -> &str;
}

/// Build the sampler described by the run configuration.
pub fn sampler_from_config(config: &SamplerConfig) -> Arc<dyn Sampler> {
    match config.kind {
        SamplerKind::Random => Arc::new(RandomSampler::new(config.seed)),
        SamplerKind::Perturbation => Arc::new(
            PerturbationSampler::new(config.seed, config.exploration_weight)
                .with_startup(config.n_startup),
        ),
    }
}

fn make_rng(seed: Option<u64>) -> Mutex<StdRng> {
    Mutex::new(match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    })
}

// ---- Random ----

/// Independent random sampling across the search space.
#[derive(Debug)]
pub struct RandomSampler {
    rng: Mutex<StdRng>,
}

impl RandomSampler {
    pub fn new(seed: Option<u64>) -> Self {
        Self { rng: make_rng(seed) }
    }
}

impl Sampler for RandomSampler {
    fn sample(&self, _context: &SampleContext<'_>, _name: &str, distribution: &Distribution) -> ParamValue {
        distribution.sample(&mut *self.rng.lock())
    }

    fn name(&self) -> &str {
        "random"
    }
}

// ---- Perturbation ----

/// Explore at random, otherwise perturb the best completed trial.
///
/// Until `n_startup` trials have completed every draw is random. After that a
/// draw is random with probability `exploration_weight` and a local
/// perturbation of the current best value otherwise.
#[derive(Debug)]
pub struct PerturbationSampler {
    rng: Mutex<StdRng>,
    exploration_weight: f64,
    n_startup: usize,
}

impl PerturbationSampler {
    pub fn new(seed: Option<u64>, exploration_weight: f64) -> Self {
        Self {
            rng: make_rng(seed),
            exploration_weight: exploration_weight.clamp(0.0, 1.0),
            n_startup: 1,
        }
    }

    pub fn with_startup(mut self, n_startup: usize) -> Self {
        self.n_startup = n_startup;
        self
    }

    fn perturb<R: Rng>(distribution: &Distribution, base: &ParamValue, rng: &mut R) -> ParamValue {
        match (distribution, base) {
            (Distribution::Int { low, high, log: false }, ParamValue::Int(v)) => {
                let delta: i64 = rng.random_range(-2..=2);
                ParamValue::Int((v + delta).clamp(*low, *high))
            }
            (Distribution::Int { low, high, log: true }, ParamValue::Int(v)) => {
                let log_range = (*high as f64).ln() - (*low as f64).ln();
                let noise = rng.random_range(-0.1..0.1_f64) * log_range;
                let moved = ((*v as f64).ln() + noise).exp().round() as i64;
                ParamValue::Int(moved.clamp(*low, *high))
            }
            (Distribution::Float { low, high, log: false }, ParamValue::Float(v)) => {
                let noise = rng.random_range(-0.1..0.1_f64) * (high - low);
                ParamValue::Float((v + noise).clamp(*low, *high))
            }
            (Distribution::Float { low, high, log: true }, ParamValue::Float(v)) => {
                let log_range = high.ln() - low.ln();
                let noise = rng.random_range(-0.1..0.1_f64) * log_range;
                ParamValue::Float((v.ln() + noise).exp().clamp(*low, *high))
            }
            // Choices have no neighbourhood; draw again.
            _ => distribution.sample(rng),
        }
    }
}

impl Sampler for PerturbationSampler {
    fn sample(&self, context: &SampleContext<'_>, name: &str, distribution: &Distribution) -> ParamValue {
        let mut rng = self.rng.lock();

        let completed = context.completed().count();
        if completed < self.n_startup || rng.random::<f64>() < self.exploration_weight {
            return distribution.sample(&mut *rng);
        }

        let base = context
            .direction
            .best(context.completed())
            .filter(|best| best.distributions.get(name) == Some(distribution))
            .and_then(|best| best.params.get(name));

        match base {
            Some(base) => Self::perturb(distribution, base, &mut *rng),
            None => distribution.sample(&mut *rng),
        }
    }

    fn name(&self) -> &str {
        "perturbation"
    }
}

//! Parameter distributions and the values drawn from them.

use es_types::{StudyError, SweepResult};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Describes how a parameter is sampled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Distribution {
    /// Integer range [low, high] inclusive.
    Int { low: i64, high: i64, log: bool },
    /// Continuous range [low, high].
    Float { low: f64, high: f64, log: bool },
    /// Categorical choices.
    Categorical { choices: Vec<serde_json::Value> },
}

/// A concrete parameter value produced by a sampler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamValue {
    Int(i64),
    Float(f64),
    Choice(serde_json::Value),
}

impl ParamValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Int(v) => Some(*v as f64),
            Self::Choice(_) => None,
        }
    }

    pub fn as_choice(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Choice(v) => Some(v),
            _ => None,
        }
    }
}

impl std::fmt::Display for ParamValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Float(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Choice(serde_json::Value::String(s)) => write!(f, "{s}"),
            Self::Choice(v) => write!(f, "{v}"),
        }
    }
}

impl Distribution {
    pub fn int(low: i64, high: i64, log: bool) -> Self {
        Self::Int { low, high, log }
    }

    pub fn float(low: f64, high: f64, log: bool) -> Self {
        Self::Float { low, high, log }
    }

    pub fn categorical<I, V>(choices: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<serde_json::Value>,
    {
        Self::Categorical {
            choices: choices.into_iter().map(Into::into).collect(),
        }
    }

    /// Reject empty or inverted ranges before anything is recorded.
    pub fn validate(&self, name: &str) -> SweepResult<()> {
        let invalid = |message: String| StudyError::InvalidDistribution {
            name: name.to_string(),
            message,
        };

        match self {
            Self::Int { low, high, log } => {
                if low > high {
                    return Err(invalid(format!("low {low} exceeds high {high}")).into());
                }
                if *log && *low < 1 {
                    return Err(invalid(format!("log scale needs low >= 1, got {low}")).into());
                }
            }
            Self::Float { low, high, log } => {
                if !low.is_finite() || !high.is_finite() {
                    return Err(invalid("bounds must be finite".to_string()).into());
                }
                if low > high {
                    return Err(invalid(format!("low {low} exceeds high {high}")).into());
                }
                if *log && *low <= 0.0 {
                    return Err(invalid(format!("log scale needs low > 0, got {low}")).into());
                }
            }
            Self::Categorical { choices } => {
                if choices.is_empty() {
                    return Err(invalid("no choices given".to_string()).into());
                }
            }
        }
        Ok(())
    }

    /// Whether `value` could have been drawn from this distribution.
    pub fn contains(&self, value: &ParamValue) -> bool {
        match (self, value) {
            (Self::Int { low, high, .. }, ParamValue::Int(v)) => v >= low && v <= high,
            (Self::Float { low, high, .. }, ParamValue::Float(v)) => v >= low && v <= high,
            (Self::Categorical { choices }, ParamValue::Choice(v)) => choices.contains(v),
            _ => false,
        }
    }

    /// Independent draw: uniform, log-uniform or categorical.
    pub fn sample<R: Rng>(&self, rng: &mut R) -> ParamValue {
        match self {
            Self::Int { low, high, log: false } => ParamValue::Int(rng.random_range(*low..=*high)),
            Self::Int { low, high, log: true } => {
                // Widen by half a step so both endpoints keep their share of mass.
                let log_low = (*low as f64 - 0.5).ln();
                let log_high = (*high as f64 + 0.5).ln();
                let v = rng.random_range(log_low..=log_high).exp().round() as i64;
                ParamValue::Int(v.clamp(*low, *high))
            }
            Self::Float { low, high, log: false } => {
                ParamValue::Float(rng.random_range(*low..=*high))
            }
            Self::Float { low, high, log: true } => {
                let log_val: f64 = rng.random_range(low.ln()..=high.ln());
                ParamValue::Float(log_val.exp().clamp(*low, *high))
            }
            Self::Categorical { choices } => {
                let idx = rng.random_range(0..choices.len());
                ParamValue::Choice(choices[idx].clone())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn log_int_stays_in_bounds() {
        let dist = Distribution::int(200, 800, true);
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..500 {
            let value = dist.sample(&mut rng);
            assert!(dist.contains(&value), "out of bounds: {value:?}");
        }
    }

    #[test]
    fn log_int_reaches_both_ends_of_small_range() {
        let dist = Distribution::int(7, 12, true);
        let mut rng = StdRng::seed_from_u64(11);
        let seen: std::collections::HashSet<i64> = (0..2000)
            .filter_map(|_| dist.sample(&mut rng).as_int())
            .collect();
        assert!(seen.contains(&7));
        assert!(seen.contains(&12));
        assert!(seen.iter().all(|v| (7..=12).contains(v)));
    }

    #[test]
    fn categorical_draws_are_members() {
        let dist = Distribution::categorical(["Tanh", "ReLU", "Sigmoid"]);
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..100 {
            let value = dist.sample(&mut rng);
            assert!(dist.contains(&value));
        }
    }

    #[test]
    fn float_log_stays_in_bounds() {
        let dist = Distribution::float(1e-5, 1e-1, true);
        let mut rng = StdRng::seed_from_u64(5);
        for _ in 0..200 {
            match dist.sample(&mut rng) {
                ParamValue::Float(v) => assert!((1e-5..=1e-1).contains(&v), "lr out of bounds: {v}"),
                other => panic!("unexpected value: {other:?}"),
            }
        }
    }

    #[test]
    fn invalid_distributions_rejected() {
        assert!(Distribution::int(10, 1, false).validate("x").is_err());
        assert!(Distribution::int(0, 10, true).validate("x").is_err());
        assert!(Distribution::float(0.0, 1.0, true).validate("x").is_err());
        assert!(Distribution::Categorical { choices: vec![] }.validate("x").is_err());
        assert!(Distribution::int(200, 800, true).validate("x").is_ok());
    }

    #[test]
    fn contains_checks_value_kind() {
        let dist = Distribution::int(1, 3, false);
        assert!(!dist.contains(&ParamValue::Float(2.0)));
        assert!(!dist.contains(&ParamValue::Int(4)));
    }

    #[test]
    fn journal_encoding_keeps_value_kind() {
        let value = ParamValue::Int(412);
        let json = serde_json::to_string(&value).unwrap();
        assert_eq!(json, r#"{"int":412}"#);
        let dist = Distribution::int(200, 800, true);
        let json = serde_json::to_value(&dist).unwrap();
        assert_eq!(json["type"], "int");
    }
}

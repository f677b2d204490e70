use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Display;
use std::path::PathBuf;

pub const LEARNING_RATE: &str = "learning_rate";
pub const BATCH_SIZE: &str = "batch_size";
pub const DISPLAY_STEP: &str = "display_step";
pub const MODEL_PATH: &str = "model_path";
pub const N_HIDDEN_1: &str = "n_hidden_1";
pub const N_HIDDEN_2: &str = "n_hidden_2";
pub const N_INPUT: &str = "n_input";
pub const N_CLASSES: &str = "n_classes";

/// A single hyperparameter value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Int(i64),
    Float(f64),
    Text(String),
}

impl Display for ParamValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Int(value) => write!(f, "{value}"),
            Self::Float(value) => write!(f, "{value}"),
            Self::Text(value) => write!(f, "\"{value}\""),
        }
    }
}

impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<usize> for ParamValue {
    fn from(value: usize) -> Self {
        Self::Int(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

impl From<f64> for ParamValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<PathBuf> for ParamValue {
    fn from(value: PathBuf) -> Self {
        Self::Text(value.to_string_lossy().into_owned())
    }
}

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum ParameterError {
    #[error("Parameter '{0}' is not set")]
    Missing(String),

    #[error("Parameter '{name}' should be {expected}, found {found}")]
    WrongKind {
        name: String,
        expected: &'static str,
        found: ParamValue,
    },

    #[error("Parameter '{name}' should be strictly positive, found {found}")]
    NotPositive { name: String, found: ParamValue },
}

/// Flat store of named hyperparameters.
///
/// Values are not validated when they are set: a malformed entry is only reported when one of
/// the typed accessors reads it while building the model or the training settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Parameters {
    values: BTreeMap<String, ParamValue>,
}

impl Default for Parameters {
    fn default() -> Self {
        let mut params = Self::empty();

        params.set(LEARNING_RATE, 0.001);
        params.set(BATCH_SIZE, 100usize);
        params.set(DISPLAY_STEP, 1usize);
        params.set(MODEL_PATH, std::env::temp_dir().join("model.ckpt"));

        // Network parameters
        params.set(N_HIDDEN_1, 256usize);
        params.set(N_HIDDEN_2, 256usize);
        params.set(N_INPUT, 784usize);
        params.set(N_CLASSES, 10usize);

        params
    }
}

impl Parameters {
    /// A store without any entry.
    pub fn empty() -> Self {
        Self {
            values: BTreeMap::new(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.values.get(name)
    }

    /// Set a parameter, returning the value it replaced.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<ParamValue>) -> Option<ParamValue> {
        self.values.insert(name.into(), value.into())
    }

    /// Overwrite entries with the ones of `other`.
    ///
    /// # Returns
    ///
    /// The names whose value changed.
    pub fn merge(&mut self, other: Parameters) -> Vec<String> {
        let mut changed = Vec::new();

        for (name, value) in other.values {
            if self.values.get(&name) != Some(&value) {
                changed.push(name.clone());
            }
            self.values.insert(name, value);
        }

        changed
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
        self.values.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Read a non-negative integer parameter.
    pub fn usize(&self, name: &str) -> Result<usize, ParameterError> {
        match self.require(name)? {
            ParamValue::Int(value) => {
                usize::try_from(*value).map_err(|_| ParameterError::WrongKind {
                    name: name.to_string(),
                    expected: "a non-negative integer",
                    found: ParamValue::Int(*value),
                })
            }
            other => Err(wrong_kind(name, "a non-negative integer", other)),
        }
    }

    /// Read a strictly positive integer parameter, used for divisors such as the batch size.
    pub fn positive_usize(&self, name: &str) -> Result<usize, ParameterError> {
        match self.usize(name)? {
            0 => Err(ParameterError::NotPositive {
                name: name.to_string(),
                found: ParamValue::Int(0),
            }),
            value => Ok(value),
        }
    }

    /// Read a numeric parameter. Integers are widened.
    pub fn float(&self, name: &str) -> Result<f64, ParameterError> {
        match self.require(name)? {
            ParamValue::Float(value) => Ok(*value),
            ParamValue::Int(value) => Ok(*value as f64),
            other => Err(wrong_kind(name, "a number", other)),
        }
    }

    pub fn path(&self, name: &str) -> Result<PathBuf, ParameterError> {
        match self.require(name)? {
            ParamValue::Text(value) => Ok(PathBuf::from(value)),
            other => Err(wrong_kind(name, "a path", other)),
        }
    }

    fn require(&self, name: &str) -> Result<&ParamValue, ParameterError> {
        self.values
            .get(name)
            .ok_or_else(|| ParameterError::Missing(name.to_string()))
    }
}

fn wrong_kind(name: &str, expected: &'static str, found: &ParamValue) -> ParameterError {
    ParameterError::WrongKind {
        name: name.to_string(),
        expected,
        found: found.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_describe_the_reference_network() {
        let params = Parameters::default();

        assert_eq!(params.float(LEARNING_RATE).unwrap(), 0.001);
        assert_eq!(params.usize(BATCH_SIZE).unwrap(), 100);
        assert_eq!(params.usize(DISPLAY_STEP).unwrap(), 1);
        assert_eq!(params.usize(N_HIDDEN_1).unwrap(), 256);
        assert_eq!(params.usize(N_HIDDEN_2).unwrap(), 256);
        assert_eq!(params.usize(N_INPUT).unwrap(), 784);
        assert_eq!(params.usize(N_CLASSES).unwrap(), 10);
        assert!(params.path(MODEL_PATH).unwrap().ends_with("model.ckpt"));
        assert_eq!(params.len(), 8);
    }

    #[test]
    fn set_returns_the_replaced_value() {
        let mut params = Parameters::empty();

        assert_eq!(params.set(BATCH_SIZE, 10usize), None);
        assert_eq!(params.set(BATCH_SIZE, 20usize), Some(ParamValue::Int(10)));
        assert_eq!(params.get(BATCH_SIZE), Some(&ParamValue::Int(20)));
    }

    #[test]
    fn merge_reports_only_changed_entries() {
        let mut params = Parameters::default();
        let mut overrides = Parameters::empty();
        overrides.set(BATCH_SIZE, 100usize);
        overrides.set(LEARNING_RATE, 0.01);
        overrides.set("momentum", 0.9);

        let mut changed = params.merge(overrides);
        changed.sort();

        assert_eq!(changed, vec![LEARNING_RATE.to_string(), "momentum".to_string()]);
        assert_eq!(params.float(LEARNING_RATE).unwrap(), 0.01);
        assert_eq!(params.float("momentum").unwrap(), 0.9);
    }

    #[test]
    fn malformed_values_fail_when_read() {
        let mut params = Parameters::default();
        params.set(N_HIDDEN_1, "wide");
        params.set(N_HIDDEN_2, -3i64);
        params.set(MODEL_PATH, 1usize);

        assert!(matches!(
            params.usize(N_HIDDEN_1),
            Err(ParameterError::WrongKind { .. })
        ));
        assert!(matches!(
            params.usize(N_HIDDEN_2),
            Err(ParameterError::WrongKind { .. })
        ));
        assert!(matches!(
            params.path(MODEL_PATH),
            Err(ParameterError::WrongKind { .. })
        ));
        assert_eq!(
            params.usize("missing"),
            Err(ParameterError::Missing("missing".to_string()))
        );
    }

    #[test]
    fn zero_divisors_are_rejected() {
        let mut params = Parameters::default();
        params.set(DISPLAY_STEP, 0usize);

        assert_eq!(
            params.positive_usize(DISPLAY_STEP),
            Err(ParameterError::NotPositive {
                name: DISPLAY_STEP.to_string(),
                found: ParamValue::Int(0),
            })
        );
    }

    #[test]
    fn json_round_trip_keeps_numeric_kinds() {
        let params = Parameters::default();

        let json = serde_json::to_string(&params).unwrap();
        let parsed: Parameters = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.get(BATCH_SIZE), Some(&ParamValue::Int(100)));
        assert_eq!(parsed.get(LEARNING_RATE), Some(&ParamValue::Float(0.001)));
        assert_eq!(parsed, params);
    }
}

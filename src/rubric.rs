//! Rubrics and test scenarios.
//!
//! A rubric file bundles the scoring weights with the fixed set of test
//! inputs a candidate is evaluated against. Files may be YAML, TOML, or JSON;
//! the format is picked from the extension.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Tolerance used when checking that weights sum to 1.0.
pub const WEIGHT_EPSILON: f64 = 1e-6;

#[derive(Error, Debug)]
pub enum RubricError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{0}")]
    Invalid(String),
}

/// Weights for the per-test quality dimensions. Must sum to 1.0.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RubricWeights {
    pub accuracy: f64,
    pub completeness: f64,
    pub clarity: f64,
}

impl Default for RubricWeights {
    fn default() -> Self {
        Self {
            accuracy: 0.5,
            completeness: 0.3,
            clarity: 0.2,
        }
    }
}

impl RubricWeights {
    pub fn sum(&self) -> f64 {
        self.accuracy + self.completeness + self.clarity
    }

    /// Check that every weight is finite and non-negative and that they sum
    /// to 1.0 within `WEIGHT_EPSILON`.
    pub fn validate(&self) -> Result<(), String> {
        for (name, w) in [
            ("accuracy", self.accuracy),
            ("completeness", self.completeness),
            ("clarity", self.clarity),
        ] {
            if !w.is_finite() || w < 0.0 {
                return Err(format!("rubric weight '{}' must be a non-negative number, got {}", name, w));
            }
        }
        let sum = self.sum();
        if (sum - 1.0).abs() > WEIGHT_EPSILON {
            return Err(format!("rubric weights must sum to 1.0, got {:.6}", sum));
        }
        Ok(())
    }

    pub fn combine(&self, accuracy: f64, completeness: f64, clarity: f64) -> f64 {
        self.accuracy * accuracy + self.completeness * completeness + self.clarity * clarity
    }
}

/// The fixed weighting of the final composite score.
///
/// `quality` is the rubric-weighted accuracy/completeness/clarity average.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CompositeWeights {
    pub quality: f64,
    pub robustness: f64,
    pub latency: f64,
    pub tokens: f64,
}

impl Default for CompositeWeights {
    fn default() -> Self {
        Self {
            quality: 0.5,
            robustness: 0.3,
            latency: 0.1,
            tokens: 0.1,
        }
    }
}

impl CompositeWeights {
    pub fn validate(&self) -> Result<(), String> {
        let parts = [self.quality, self.robustness, self.latency, self.tokens];
        if parts.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err("composite weights must be non-negative numbers".to_string());
        }
        let sum: f64 = parts.iter().sum();
        if (sum - 1.0).abs() > WEIGHT_EPSILON {
            return Err(format!("composite weights must sum to 1.0, got {:.6}", sum));
        }
        Ok(())
    }
}

/// Scoring rubric: weights, thresholds, and ceilings for the informational
/// latency/token sub-scores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rubric {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub weights: RubricWeights,
    #[serde(default)]
    pub composite: CompositeWeights,
    /// Composite score at or above which a report passes.
    #[serde(default = "default_pass_threshold")]
    pub pass_threshold: f64,
    /// Token count at which the token sub-score reaches 0.
    #[serde(default = "default_token_ceiling")]
    pub token_ceiling: u64,
    /// Latency (ms) at which the latency sub-score reaches 0.
    #[serde(default = "default_latency_ceiling_ms")]
    pub latency_ceiling_ms: u64,
    /// Robustness points lost per forbidden concept found in the output.
    #[serde(default = "default_forbidden_penalty")]
    pub forbidden_penalty: f64,
}

fn default_version() -> String {
    "v1".to_string()
}

fn default_pass_threshold() -> f64 {
    80.0
}

fn default_token_ceiling() -> u64 {
    2500
}

fn default_latency_ceiling_ms() -> u64 {
    30_000
}

fn default_forbidden_penalty() -> f64 {
    25.0
}

impl Default for Rubric {
    fn default() -> Self {
        Self {
            version: default_version(),
            weights: RubricWeights::default(),
            composite: CompositeWeights::default(),
            pass_threshold: default_pass_threshold(),
            token_ceiling: default_token_ceiling(),
            latency_ceiling_ms: default_latency_ceiling_ms(),
            forbidden_penalty: default_forbidden_penalty(),
        }
    }
}

impl Rubric {
    pub fn validate(&self) -> Result<(), String> {
        self.weights.validate()?;
        self.composite.validate()?;
        if !(0.0..=100.0).contains(&self.pass_threshold) {
            return Err(format!(
                "pass_threshold must be within 0..=100, got {}",
                self.pass_threshold
            ));
        }
        if self.token_ceiling == 0 {
            return Err("token_ceiling must be greater than 0".to_string());
        }
        if self.latency_ceiling_ms == 0 {
            return Err("latency_ceiling_ms must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// One fixed test scenario.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestInput {
    pub name: String,
    /// Scenario text given to the candidate when outputs are simulated.
    #[serde(default)]
    pub scenario: String,
    /// Concepts the output should mention. Alternatives may be separated
    /// with `|` (e.g. `"retry|backoff"`).
    #[serde(default)]
    pub expected_concepts: Vec<String>,
    /// Concepts that must not appear; each hit lowers robustness.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub forbidden_concepts: Vec<String>,
    /// Per-test weight profile overriding the rubric weights.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weights: Option<RubricWeights>,
}

impl TestInput {
    pub fn new(name: impl Into<String>, expected_concepts: Vec<&str>) -> Self {
        Self {
            name: name.into(),
            scenario: String::new(),
            expected_concepts: expected_concepts.into_iter().map(String::from).collect(),
            forbidden_concepts: Vec::new(),
            weights: None,
        }
    }
}

/// Validate the test set: non-empty, and every weight profile well-formed.
pub fn validate_test_inputs(inputs: &[TestInput]) -> Result<(), String> {
    if inputs.is_empty() {
        return Err("test inputs must not be empty".to_string());
    }
    for input in inputs {
        if let Some(ref w) = input.weights {
            w.validate()
                .map_err(|e| format!("test input '{}': {}", input.name, e))?;
        }
    }
    Ok(())
}

/// Stable fingerprint of a test set, used in evaluation cache keys.
pub fn fingerprint_test_inputs(inputs: &[TestInput]) -> String {
    let json = serde_json::to_string(inputs).expect("serialization of test inputs cannot fail");
    let digest = Sha256::digest(json.as_bytes());
    format!("{:x}", digest)
}

/// On-disk rubric file: the rubric plus its test inputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RubricFile {
    #[serde(default)]
    pub rubric: Rubric,
    #[serde(default)]
    pub tests: Vec<TestInput>,
}

impl RubricFile {
    /// Load a rubric file, choosing the parser from the extension
    /// (`.yaml`/`.yml`, `.toml`, otherwise JSON).
    pub fn load(path: &Path) -> Result<Self, RubricError> {
        let content = fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_ascii_lowercase();
        let file: RubricFile = match ext.as_str() {
            "yaml" | "yml" => serde_yaml::from_str(&content)?,
            "toml" => toml::from_str(&content)?,
            _ => serde_json::from_str(&content)?,
        };
        file.rubric.validate().map_err(RubricError::Invalid)?;
        validate_test_inputs(&file.tests).map_err(RubricError::Invalid)?;
        Ok(file)
    }
}

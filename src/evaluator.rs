//! Candidate scoring.
//!
//! The reference evaluator is [`KeywordEvaluator`]: per test input it checks
//! which expected concepts appear in the candidate's output, screens the
//! output with [`HeuristicValidator`], and folds everything into a 0-100
//! composite. [`LlmJudgeEvaluator`] is an alternative behind the same trait.
//! Both are deterministic for identical inputs; anything model-backed caches
//! its outputs.
//!
//! Composite = `quality*wq + robustness*wr + latency_score*wl + token_score*wt`
//! with the rubric's [`CompositeWeights`] (default 0.5/0.3/0.1/0.1), where
//! quality is the rubric-weighted accuracy/completeness/clarity averaged
//! across test inputs.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

use crate::candidate::{Candidate, estimate_tokens};
use crate::heuristics::HeuristicValidator;
use crate::provider::{Completion, RetryPolicy, TextGenerator, retry};
use crate::rubric::{CompositeWeights, Rubric, TestInput, fingerprint_test_inputs, validate_test_inputs};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvaluationError {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("evaluation failed: {0}")]
    Internal(String),
}

/// Sub-scores for one test input, each 0-100.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestScore {
    pub name: String,
    pub accuracy: f64,
    pub completeness: f64,
    pub clarity: f64,
    pub robustness: f64,
    /// Rubric-weighted combination of accuracy, completeness, and clarity.
    pub quality: f64,
    /// Expected concepts the output did not mention.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing_concepts: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub violations: Vec<String>,
}

/// Result of evaluating one candidate. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreReport {
    pub candidate_id: String,
    /// Final 0-100 score.
    pub composite: f64,
    pub accuracy: f64,
    pub completeness: f64,
    pub clarity: f64,
    pub robustness: f64,
    pub quality: f64,
    /// Provider latency of the measured output, in ms.
    pub latency_ms: u64,
    pub token_count: u64,
    pub latency_score: f64,
    pub token_score: f64,
    /// Novelty in [0,1] relative to the run history at evaluation time.
    pub novelty: f64,
    pub passed: bool,
    pub rubric_version: String,
    #[serde(default)]
    pub tests: Vec<TestScore>,
}

impl ScoreReport {
    pub fn with_novelty(mut self, novelty: f64) -> Self {
        self.novelty = novelty.clamp(0.0, 1.0);
        self
    }

    /// Distinct missing concepts across all test inputs, sorted.
    pub fn missing_concepts(&self) -> Vec<String> {
        let set: BTreeSet<&String> = self.tests.iter().flat_map(|t| &t.missing_concepts).collect();
        set.into_iter().cloned().collect()
    }
}

/// Fixed weighted composite of the four top-level sub-scores.
pub fn composite_score(
    weights: &CompositeWeights,
    quality: f64,
    robustness: f64,
    latency_score: f64,
    token_score: f64,
) -> f64 {
    weights.quality * quality
        + weights.robustness * robustness
        + weights.latency * latency_score
        + weights.tokens * token_score
}

/// 100 at zero, falling linearly to 0 at `ceiling`.
pub fn ceiling_score(value: u64, ceiling: u64) -> f64 {
    if ceiling == 0 {
        return 0.0;
    }
    100.0 * (1.0 - value as f64 / ceiling as f64).clamp(0.0, 1.0)
}

/// Reject configurations that cannot be scored.
pub fn validate_inputs(tests: &[TestInput], rubric: &Rubric) -> Result<(), EvaluationError> {
    validate_test_inputs(tests).map_err(EvaluationError::InvalidConfiguration)?;
    rubric.validate().map_err(EvaluationError::InvalidConfiguration)
}

/// Score a candidate against a fixed test set.
pub trait Evaluator: Send + Sync {
    fn evaluate(
        &self,
        candidate: &Candidate,
        tests: &[TestInput],
        rubric: &Rubric,
    ) -> Result<ScoreReport, EvaluationError>;

    /// Cumulative provider tokens spent by this evaluator so far.
    fn tokens_consumed(&self) -> u64 {
        0
    }
}

impl<T: Evaluator + ?Sized> Evaluator for Arc<T> {
    fn evaluate(
        &self,
        candidate: &Candidate,
        tests: &[TestInput],
        rubric: &Rubric,
    ) -> Result<ScoreReport, EvaluationError> {
        (**self).evaluate(candidate, tests, rubric)
    }

    fn tokens_consumed(&self) -> u64 {
        (**self).tokens_consumed()
    }
}

/// Aggregate per-test scores into a report.
pub fn assemble_report(
    candidate: &Candidate,
    rubric: &Rubric,
    tests: Vec<TestScore>,
    latency_ms: u64,
    token_count: u64,
) -> Result<ScoreReport, EvaluationError> {
    if tests.is_empty() {
        return Err(EvaluationError::InvalidConfiguration(
            "test inputs must not be empty".to_string(),
        ));
    }
    let n = tests.len() as f64;
    let mean = |f: fn(&TestScore) -> f64| tests.iter().map(f).sum::<f64>() / n;
    let accuracy = mean(|t| t.accuracy);
    let completeness = mean(|t| t.completeness);
    let clarity = mean(|t| t.clarity);
    let robustness = mean(|t| t.robustness);
    let quality = mean(|t| t.quality);

    let latency_score = ceiling_score(latency_ms, rubric.latency_ceiling_ms);
    let token_score = ceiling_score(token_count, rubric.token_ceiling);
    let composite = composite_score(&rubric.composite, quality, robustness, latency_score, token_score);
    if !composite.is_finite() {
        return Err(EvaluationError::Internal(format!(
            "composite for candidate {} is not finite",
            candidate.id
        )));
    }
    let composite = composite.clamp(0.0, 100.0);

    Ok(ScoreReport {
        candidate_id: candidate.id.clone(),
        composite,
        accuracy,
        completeness,
        clarity,
        robustness,
        quality,
        latency_ms,
        token_count,
        latency_score,
        token_score,
        novelty: 1.0,
        passed: composite >= rubric.pass_threshold,
        rubric_version: rubric.version.clone(),
        tests,
    })
}

// ---------------------------------------------------------------------------
// Concept matching
// ---------------------------------------------------------------------------

fn alternatives(concept: &str) -> impl Iterator<Item = String> + '_ {
    concept
        .split('|')
        .map(|a| a.trim().to_lowercase())
        .filter(|a| !a.is_empty())
}

fn words(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect()
}

/// True if any alternative of `concept` appears in the lowercased output.
pub fn concept_present(concept: &str, output_lower: &str) -> bool {
    alternatives(concept).any(|a| output_lower.contains(&a))
}

/// Fraction of the concept's words present in the output, best alternative.
fn concept_coverage(concept: &str, output_lower: &str, output_words: &BTreeSet<String>) -> f64 {
    alternatives(concept)
        .map(|alt| {
            if output_lower.contains(&alt) {
                return 1.0;
            }
            let alt_words = words(&alt);
            if alt_words.is_empty() {
                return 0.0;
            }
            let hits = alt_words.iter().filter(|w| output_words.contains(*w)).count();
            hits as f64 / alt_words.len() as f64
        })
        .fold(0.0, f64::max)
}

/// Score one output against one test input.
pub fn score_output(
    validator: &HeuristicValidator,
    output: &str,
    test: &TestInput,
    rubric: &Rubric,
) -> TestScore {
    let lower = output.to_lowercase();
    let output_words = words(output);

    let (accuracy, completeness, missing) = if test.expected_concepts.is_empty() {
        (100.0, 100.0, Vec::new())
    } else {
        let total = test.expected_concepts.len() as f64;
        let mut found = 0usize;
        let mut coverage = 0.0;
        let mut missing = Vec::new();
        for concept in &test.expected_concepts {
            if concept_present(concept, &lower) {
                found += 1;
            } else {
                missing.push(concept.clone());
            }
            coverage += concept_coverage(concept, &lower, &output_words);
        }
        (100.0 * found as f64 / total, 100.0 * coverage / total, missing)
    };

    let screening = validator.screen(output);
    let clarity = screening.clarity();
    let robustness = if screening.is_unsafe() {
        0.0
    } else {
        let hits = test
            .forbidden_concepts
            .iter()
            .filter(|c| concept_present(c, &lower))
            .count();
        (100.0 - rubric.forbidden_penalty * hits as f64).max(0.0)
    };

    let weights = test.weights.unwrap_or(rubric.weights);
    TestScore {
        name: test.name.clone(),
        accuracy,
        completeness,
        clarity,
        robustness,
        quality: weights.combine(accuracy, completeness, clarity),
        missing_concepts: missing,
        violations: screening.violations,
    }
}

fn cache_key(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    format!("{:x}", hasher.finalize())
}

// ---------------------------------------------------------------------------
// Keyword evaluator
// ---------------------------------------------------------------------------

/// Runs a candidate against test scenarios through a provider. Outputs are
/// cached per (candidate content, test) so repeated evaluations see the same
/// text.
struct OutputSimulator {
    generator: Arc<dyn TextGenerator>,
    max_tokens: u32,
    timeout: Duration,
    retry: RetryPolicy,
    cache: Mutex<HashMap<String, Completion>>,
    tokens: AtomicU64,
}

impl OutputSimulator {
    fn output(&self, candidate: &Candidate, test: &TestInput) -> Completion {
        let key = cache_key(&[&candidate.content, &test.name, &test.scenario]);
        if let Some(hit) = self.cache.lock().ok().and_then(|c| c.get(&key).cloned()) {
            return hit;
        }
        let prompt = if test.scenario.is_empty() {
            candidate.content.clone()
        } else {
            format!("{}\n\n{}", candidate.content, test.scenario)
        };
        let completion = match retry(&self.retry, "simulate output", || {
            self.generator.generate(&prompt, self.max_tokens, self.timeout)
        }) {
            Ok(c) => {
                self.tokens.fetch_add(c.tokens_used, Ordering::Relaxed);
                c
            }
            Err(e) => {
                warn!(test = %test.name, error = %e, "output simulation failed; scoring candidate text");
                Completion {
                    text: candidate.content.clone(),
                    tokens_used: estimate_tokens(&candidate.content),
                    latency_ms: 0,
                }
            }
        };
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(key, completion.clone());
        }
        completion
    }
}

/// Deterministic concept-matching evaluator.
///
/// Without a simulator the candidate text itself is the output, with zero
/// latency and its estimated token count.
pub struct KeywordEvaluator {
    validator: HeuristicValidator,
    simulator: Option<OutputSimulator>,
}

impl std::fmt::Debug for KeywordEvaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeywordEvaluator")
            .field("simulated", &self.simulator.is_some())
            .finish()
    }
}

impl Default for KeywordEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

impl KeywordEvaluator {
    pub fn new() -> Self {
        Self {
            validator: HeuristicValidator::new(),
            simulator: None,
        }
    }

    /// Score provider outputs for each scenario instead of the candidate text.
    pub fn with_simulation(
        mut self,
        generator: Arc<dyn TextGenerator>,
        max_tokens: u32,
        timeout: Duration,
        retry: RetryPolicy,
    ) -> Self {
        self.simulator = Some(OutputSimulator {
            generator,
            max_tokens,
            timeout,
            retry,
            cache: Mutex::new(HashMap::new()),
            tokens: AtomicU64::new(0),
        });
        self
    }
}

impl Evaluator for KeywordEvaluator {
    fn evaluate(
        &self,
        candidate: &Candidate,
        tests: &[TestInput],
        rubric: &Rubric,
    ) -> Result<ScoreReport, EvaluationError> {
        validate_inputs(tests, rubric)?;

        let mut scores = Vec::with_capacity(tests.len());
        let mut latency_total = 0u64;
        let mut token_total = 0u64;
        for test in tests {
            let (text, tokens, latency) = match self.simulator {
                Some(ref sim) => {
                    let c = sim.output(candidate, test);
                    let tokens = estimate_tokens(&c.text);
                    (c.text, tokens, c.latency_ms)
                }
                None => (candidate.content.clone(), candidate.estimated_tokens(), 0),
            };
            latency_total += latency;
            token_total += tokens;
            scores.push(score_output(&self.validator, &text, test, rubric));
        }
        let n = tests.len() as u64;
        assemble_report(candidate, rubric, scores, latency_total / n, token_total / n)
    }

    fn tokens_consumed(&self) -> u64 {
        self.simulator
            .as_ref()
            .map(|s| s.tokens.load(Ordering::Relaxed))
            .unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// Cache wrapper
// ---------------------------------------------------------------------------

/// Default cap on memoised reports.
pub const DEFAULT_CACHE_ENTRIES: usize = 1000;

#[derive(Default)]
struct Memo {
    reports: HashMap<String, ScoreReport>,
    order: VecDeque<String>,
}

/// Memoises reports by (content, rubric, test set). A hit for a different
/// candidate with the same content is re-labelled with the caller's id.
/// Holds at most `max_entries` reports; the oldest is evicted first.
pub struct CachedEvaluator<E> {
    inner: E,
    cache: Mutex<Memo>,
    max_entries: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<E: Evaluator> CachedEvaluator<E> {
    pub fn new(inner: E) -> Self {
        Self {
            inner,
            cache: Mutex::new(Memo::default()),
            max_entries: DEFAULT_CACHE_ENTRIES,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Cap the number of memoised reports. Zero disables memoisation.
    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries;
        self
    }

    pub fn len(&self) -> usize {
        self.cache.lock().map(|c| c.reports.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn inner(&self) -> &E {
        &self.inner
    }
}

impl<E: Evaluator> Evaluator for CachedEvaluator<E> {
    fn evaluate(
        &self,
        candidate: &Candidate,
        tests: &[TestInput],
        rubric: &Rubric,
    ) -> Result<ScoreReport, EvaluationError> {
        let rubric_json = serde_json::to_string(rubric)
            .map_err(|e| EvaluationError::Internal(format!("rubric serialization: {}", e)))?;
        let key = cache_key(&[&candidate.content, &rubric_json, &fingerprint_test_inputs(tests)]);
        if let Some(mut hit) = self.cache.lock().ok().and_then(|c| c.reports.get(&key).cloned()) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            hit.candidate_id = candidate.id.clone();
            return Ok(hit);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        let report = self.inner.evaluate(candidate, tests, rubric)?;
        if self.max_entries > 0
            && let Ok(mut cache) = self.cache.lock()
            && !cache.reports.contains_key(&key)
        {
            while cache.reports.len() >= self.max_entries {
                match cache.order.pop_front() {
                    Some(oldest) => {
                        cache.reports.remove(&oldest);
                    }
                    None => break,
                }
            }
            cache.order.push_back(key.clone());
            cache.reports.insert(key, report.clone());
        }
        Ok(report)
    }

    fn tokens_consumed(&self) -> u64 {
        self.inner.tokens_consumed()
    }
}

// ---------------------------------------------------------------------------
// LLM judge
// ---------------------------------------------------------------------------

const NEUTRAL_SCORE: f64 = 50.0;

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
struct JudgeVerdict {
    accuracy: f64,
    completeness: f64,
    clarity: f64,
}

impl JudgeVerdict {
    fn neutral() -> Self {
        Self {
            accuracy: NEUTRAL_SCORE,
            completeness: NEUTRAL_SCORE,
            clarity: NEUTRAL_SCORE,
        }
    }

    fn clamped(self) -> Self {
        let c = |v: f64| if v.is_finite() { v.clamp(0.0, 100.0) } else { NEUTRAL_SCORE };
        Self {
            accuracy: c(self.accuracy),
            completeness: c(self.completeness),
            clarity: c(self.clarity),
        }
    }
}

/// Find a JSON object in possibly noisy model output (bare, fenced, or
/// surrounded by commentary).
pub fn extract_json(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if serde_json::from_str::<serde_json::Value>(trimmed).is_ok() {
        return Some(trimmed.to_string());
    }
    let stripped = if trimmed.starts_with("```") {
        let inner = trimmed
            .trim_start_matches("```json")
            .trim_start_matches("```")
            .trim_end_matches("```")
            .trim();
        if serde_json::from_str::<serde_json::Value>(inner).is_ok() {
            return Some(inner.to_string());
        }
        inner
    } else {
        trimmed
    };
    if let (Some(start), Some(end)) = (stripped.find('{'), stripped.rfind('}'))
        && start < end
    {
        let candidate = &stripped[start..=end];
        if serde_json::from_str::<serde_json::Value>(candidate).is_ok() {
            return Some(candidate.to_string());
        }
    }
    None
}

fn judge_prompt(candidate: &Candidate, test: &TestInput) -> String {
    format!(
        "You are grading a prompt against a test scenario.\n\n\
         ## Prompt\n{}\n\n## Scenario\n{}\n\n## Expected concepts\n{}\n\n\
         Score accuracy, completeness, and clarity from 0 to 100.\n\
         Respond with only a JSON object: \
         {{\"accuracy\": <n>, \"completeness\": <n>, \"clarity\": <n>}}",
        candidate.content,
        if test.scenario.is_empty() { "(none)" } else { &test.scenario },
        test.expected_concepts.join(", "),
    )
}

/// Model-graded evaluator. Robustness still comes from heuristic screening of
/// the candidate text. Verdicts are cached per (content, test), and
/// unparsable or failed verdicts fall back to neutral scores.
pub struct LlmJudgeEvaluator {
    generator: Arc<dyn TextGenerator>,
    validator: HeuristicValidator,
    max_tokens: u32,
    timeout: Duration,
    retry: RetryPolicy,
    verdicts: Mutex<HashMap<String, JudgeVerdict>>,
    tokens: AtomicU64,
}

impl LlmJudgeEvaluator {
    pub fn new(generator: Arc<dyn TextGenerator>, timeout: Duration, retry: RetryPolicy) -> Self {
        Self {
            generator,
            validator: HeuristicValidator::new(),
            max_tokens: 256,
            timeout,
            retry,
            verdicts: Mutex::new(HashMap::new()),
            tokens: AtomicU64::new(0),
        }
    }

    fn verdict(&self, candidate: &Candidate, test: &TestInput) -> JudgeVerdict {
        let test_json = serde_json::to_string(test).unwrap_or_default();
        let key = cache_key(&[&candidate.content, &test_json]);
        if let Some(v) = self.verdicts.lock().ok().and_then(|c| c.get(&key).copied()) {
            return v;
        }
        let prompt = judge_prompt(candidate, test);
        let verdict = match retry(&self.retry, "judge", || {
            self.generator.generate(&prompt, self.max_tokens, self.timeout)
        }) {
            Ok(c) => {
                self.tokens.fetch_add(c.tokens_used, Ordering::Relaxed);
                extract_json(&c.text)
                    .and_then(|j| serde_json::from_str::<JudgeVerdict>(&j).ok())
                    .map(JudgeVerdict::clamped)
                    .unwrap_or_else(|| {
                        warn!(test = %test.name, "unparsable judge verdict; using neutral scores");
                        JudgeVerdict::neutral()
                    })
            }
            Err(e) => {
                warn!(test = %test.name, error = %e, "judge unavailable; using neutral scores");
                JudgeVerdict::neutral()
            }
        };
        if let Ok(mut cache) = self.verdicts.lock() {
            cache.insert(key, verdict);
        }
        verdict
    }
}

impl Evaluator for LlmJudgeEvaluator {
    fn evaluate(
        &self,
        candidate: &Candidate,
        tests: &[TestInput],
        rubric: &Rubric,
    ) -> Result<ScoreReport, EvaluationError> {
        validate_inputs(tests, rubric)?;
        let mut scores = Vec::with_capacity(tests.len());
        for test in tests {
            let heuristic = score_output(&self.validator, &candidate.content, test, rubric);
            let v = self.verdict(candidate, test);
            let weights = test.weights.unwrap_or(rubric.weights);
            scores.push(TestScore {
                accuracy: v.accuracy,
                completeness: v.completeness,
                clarity: v.clarity,
                quality: weights.combine(v.accuracy, v.completeness, v.clarity),
                ..heuristic
            });
        }
        assemble_report(candidate, rubric, scores, 0, candidate.estimated_tokens())
    }

    fn tokens_consumed(&self) -> u64 {
        self.tokens.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

/// Append-only record of every report produced in a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvaluationHistory {
    reports: Vec<ScoreReport>,
}

impl EvaluationHistory {
    pub fn push(&mut self, report: ScoreReport) {
        self.reports.push(report);
    }

    /// Every report for `candidate_id`, oldest first.
    pub fn for_candidate<'a>(&'a self, candidate_id: &'a str) -> impl Iterator<Item = &'a ScoreReport> + 'a {
        self.reports.iter().filter(move |r| r.candidate_id == candidate_id)
    }

    pub fn len(&self) -> usize {
        self.reports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reports.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ScoreReport> {
        self.reports.iter()
    }
}

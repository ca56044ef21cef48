//! Doubles for providers and evaluators, shared by unit and integration tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::candidate::Candidate;
use crate::evaluator::{EvaluationError, Evaluator, ScoreReport};
use crate::provider::{Completion, ProviderError, TextGenerator};
use crate::rubric::{Rubric, TestInput};

/// A report whose sub-scores all equal `composite`.
pub fn score_report(candidate: &Candidate, composite: f64) -> ScoreReport {
    ScoreReport {
        candidate_id: candidate.id.clone(),
        composite,
        accuracy: composite,
        completeness: composite,
        clarity: composite,
        robustness: composite,
        quality: composite,
        latency_ms: 0,
        token_count: 0,
        latency_score: 100.0,
        token_score: 100.0,
        novelty: 1.0,
        passed: composite >= Rubric::default().pass_threshold,
        rubric_version: Rubric::default().version,
        tests: Vec::new(),
    }
}

/// Replies with canned responses in order, then reports itself unavailable.
pub struct ScriptedGenerator {
    responses: Mutex<VecDeque<String>>,
    tokens_per_call: u64,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedGenerator {
    pub fn new(responses: Vec<&str>, tokens_per_call: u64) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().map(String::from).collect()),
            tokens_per_call,
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Prompts received so far.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

impl TextGenerator for ScriptedGenerator {
    fn generate(&self, prompt: &str, _max_tokens: u32, _timeout: Duration) -> Result<Completion, ProviderError> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        match self.responses.lock().unwrap().pop_front() {
            Some(text) => Ok(Completion {
                text,
                tokens_used: self.tokens_per_call,
                latency_ms: 1,
            }),
            None => Err(ProviderError::Unavailable("script exhausted".to_string())),
        }
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// Never runs dry: call `n` returns `"{prefix} {n}"`.
pub struct SequenceGenerator {
    prefix: String,
    tokens_per_call: u64,
    calls: AtomicU64,
}

impl SequenceGenerator {
    pub fn new(prefix: &str, tokens_per_call: u64) -> Self {
        Self {
            prefix: prefix.to_string(),
            tokens_per_call,
            calls: AtomicU64::new(0),
        }
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl TextGenerator for SequenceGenerator {
    fn generate(&self, _prompt: &str, _max_tokens: u32, _timeout: Duration) -> Result<Completion, ProviderError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Completion {
            text: format!("{} {}", self.prefix, n),
            tokens_used: self.tokens_per_call,
            latency_ms: 1,
        })
    }
}

/// Always fails with the configured error.
pub struct FailingGenerator {
    error: ProviderError,
    calls: AtomicU64,
}

impl FailingGenerator {
    pub fn unavailable() -> Self {
        Self {
            error: ProviderError::Unavailable("connection refused".to_string()),
            calls: AtomicU64::new(0),
        }
    }

    pub fn timeout() -> Self {
        Self {
            error: ProviderError::Timeout(Duration::from_millis(10)),
            calls: AtomicU64::new(0),
        }
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl TextGenerator for FailingGenerator {
    fn generate(&self, _prompt: &str, _max_tokens: u32, _timeout: Duration) -> Result<Completion, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(self.error.clone())
    }
}

/// Scores candidates by exact content lookup.
pub struct TableEvaluator {
    scores: HashMap<String, f64>,
    default_score: f64,
    fail_on: Option<String>,
    tokens_per_eval: u64,
    tokens: AtomicU64,
    calls: AtomicU64,
}

impl TableEvaluator {
    pub fn new(scores: &[(&str, f64)], default_score: f64) -> Self {
        Self {
            scores: scores.iter().map(|(c, s)| (c.to_string(), *s)).collect(),
            default_score,
            fail_on: None,
            tokens_per_eval: 0,
            tokens: AtomicU64::new(0),
            calls: AtomicU64::new(0),
        }
    }

    /// Return an internal error when asked to score `content`.
    pub fn failing_on(mut self, content: &str) -> Self {
        self.fail_on = Some(content.to_string());
        self
    }

    /// Report this many provider tokens per evaluation.
    pub fn with_tokens_per_eval(mut self, tokens: u64) -> Self {
        self.tokens_per_eval = tokens;
        self
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Evaluator for TableEvaluator {
    fn evaluate(
        &self,
        candidate: &Candidate,
        _tests: &[TestInput],
        _rubric: &Rubric,
    ) -> Result<ScoreReport, EvaluationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_on.as_deref() == Some(candidate.content.as_str()) {
            return Err(EvaluationError::Internal(format!(
                "scoring blew up on {}",
                candidate.id
            )));
        }
        self.tokens.fetch_add(self.tokens_per_eval, Ordering::SeqCst);
        let score = self
            .scores
            .get(&candidate.content)
            .copied()
            .unwrap_or(self.default_score);
        Ok(score_report(candidate, score))
    }

    fn tokens_consumed(&self) -> u64 {
        self.tokens.load(Ordering::SeqCst)
    }
}

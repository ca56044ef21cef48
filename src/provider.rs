//! Text generation providers.
//!
//! Mutation strategies and the LLM-judge evaluator talk to models only through
//! [`TextGenerator`]. Two backends ship with the crate:
//! - [`CommandGenerator`]: runs a local CLI (prompt on stdin, text on stdout).
//! - [`HttpGenerator`] (feature `http`): OpenAI-compatible chat completions,
//!   which covers Ollama, LiteLLM, and hosted gateways.
//!
//! Both failure modes are retryable; callers that exhaust retries skip the
//! work instead of failing the run.

use std::io::{ErrorKind, Read, Write};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::warn;

use crate::candidate::estimate_tokens;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    #[error("provider unavailable: {0}")]
    Unavailable(String),
    #[error("provider timed out after {0:?}")]
    Timeout(Duration),
}

/// What a provider returns for one prompt.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub text: String,
    pub tokens_used: u64,
    pub latency_ms: u64,
}

/// Generate text for a prompt, with token and latency accounting.
pub trait TextGenerator: Send + Sync {
    fn generate(
        &self,
        prompt: &str,
        max_tokens: u32,
        timeout: Duration,
    ) -> Result<Completion, ProviderError>;

    /// Short label for logs and telemetry.
    fn name(&self) -> &str {
        "generator"
    }
}

impl<T: TextGenerator + ?Sized> TextGenerator for std::sync::Arc<T> {
    fn generate(
        &self,
        prompt: &str,
        max_tokens: u32,
        timeout: Duration,
    ) -> Result<Completion, ProviderError> {
        (**self).generate(prompt, max_tokens, timeout)
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

/// Exponential backoff policy for provider calls.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub multiplier: f64,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            multiplier: 2.0,
            max_backoff: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// A policy that tries exactly once.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Backoff to sleep after failed attempt number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let secs = self.initial_backoff.as_secs_f64() * factor;
        Duration::from_secs_f64(secs.min(self.max_backoff.as_secs_f64()))
    }
}

/// Run `op` until it succeeds or the policy is exhausted. Returns the last
/// error on exhaustion.
pub fn retry<T, F>(policy: &RetryPolicy, what: &str, mut op: F) -> Result<T, ProviderError>
where
    F: FnMut() -> Result<T, ProviderError>,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op() {
            Ok(v) => return Ok(v),
            Err(e) if attempt >= attempts => return Err(e),
            Err(e) => {
                let delay = policy.backoff(attempt);
                warn!(what, attempt, error = %e, ?delay, "provider call failed, retrying");
                thread::sleep(delay);
                attempt += 1;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Command generator
// ---------------------------------------------------------------------------

/// Runs an external command per prompt.
///
/// The command template is split on whitespace; `{model}` and `{max_tokens}`
/// are substituted per argument. The prompt is written to stdin and stdout is
/// the completion. The CLI does not report usage, so tokens are estimated
/// from prompt and output length.
#[derive(Debug, Clone)]
pub struct CommandGenerator {
    template: String,
    model: String,
}

impl CommandGenerator {
    pub fn new(template: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            template: template.into(),
            model: model.into(),
        }
    }

    fn argv(&self, max_tokens: u32) -> Vec<String> {
        self.template
            .split_whitespace()
            .map(|part| {
                part.replace("{model}", &self.model)
                    .replace("{max_tokens}", &max_tokens.to_string())
            })
            .collect()
    }
}

impl TextGenerator for CommandGenerator {
    fn generate(
        &self,
        prompt: &str,
        max_tokens: u32,
        timeout: Duration,
    ) -> Result<Completion, ProviderError> {
        let argv = self.argv(max_tokens);
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| ProviderError::Unavailable("empty command template".to_string()))?;

        let start = Instant::now();
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| ProviderError::Unavailable(format!("failed to spawn '{}': {}", program, e)))?;

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| ProviderError::Unavailable("child stdout unavailable".to_string()))?;
        let reader = thread::spawn(move || {
            let mut buf = String::new();
            stdout.read_to_string(&mut buf).map(|_| buf)
        });

        let writer = child.stdin.take().map(|mut stdin| {
            let input = prompt.to_string();
            thread::spawn(move || stdin.write_all(input.as_bytes()))
        });

        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) if start.elapsed() >= timeout => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(ProviderError::Timeout(timeout));
                }
                Ok(None) => thread::sleep(Duration::from_millis(10)),
                Err(e) => return Err(ProviderError::Unavailable(format!("wait failed: {}", e))),
            }
        };

        if let Some(writer) = writer {
            match writer.join() {
                Ok(Ok(())) => {}
                // The child may exit without reading all of its input.
                Ok(Err(e)) if e.kind() == ErrorKind::BrokenPipe => {}
                Ok(Err(e)) => {
                    return Err(ProviderError::Unavailable(format!(
                        "failed to write prompt: {}",
                        e
                    )));
                }
                Err(_) => {
                    return Err(ProviderError::Unavailable("stdin writer panicked".to_string()));
                }
            }
        }

        let text = reader
            .join()
            .map_err(|_| ProviderError::Unavailable("stdout reader panicked".to_string()))?
            .map_err(|e| ProviderError::Unavailable(format!("failed to read output: {}", e)))?;

        if !status.success() {
            return Err(ProviderError::Unavailable(format!(
                "'{}' exited with {}",
                program, status
            )));
        }

        let text = text.trim().to_string();
        if text.is_empty() {
            return Err(ProviderError::Unavailable(format!("'{}' produced no output", program)));
        }
        Ok(Completion {
            tokens_used: estimate_tokens(prompt) + estimate_tokens(&text),
            latency_ms: start.elapsed().as_millis() as u64,
            text,
        })
    }

    fn name(&self) -> &str {
        "command"
    }
}

// ---------------------------------------------------------------------------
// HTTP generator
// ---------------------------------------------------------------------------

#[cfg(feature = "http")]
pub use http::HttpGenerator;

#[cfg(feature = "http")]
mod http {
    use super::*;
    use serde::{Deserialize, Serialize};

    /// OpenAI-compatible `/chat/completions` client.
    #[derive(Debug, Clone)]
    pub struct HttpGenerator {
        endpoint: String,
        model: String,
        api_key: Option<String>,
        temperature: f64,
        client: reqwest::blocking::Client,
    }

    #[derive(Serialize)]
    struct ChatRequest<'a> {
        model: &'a str,
        messages: Vec<ChatMessage<'a>>,
        max_tokens: u32,
        temperature: f64,
    }

    #[derive(Serialize)]
    struct ChatMessage<'a> {
        role: &'a str,
        content: &'a str,
    }

    #[derive(Deserialize)]
    struct ChatResponse {
        choices: Vec<ChatChoice>,
        #[serde(default)]
        usage: Option<Usage>,
    }

    #[derive(Deserialize)]
    struct ChatChoice {
        message: ChatReply,
    }

    #[derive(Deserialize)]
    struct ChatReply {
        #[serde(default)]
        content: Option<String>,
    }

    #[derive(Deserialize)]
    struct Usage {
        #[serde(default)]
        total_tokens: Option<u64>,
    }

    impl HttpGenerator {
        /// `endpoint` is the API base, e.g. `http://localhost:11434/v1`.
        pub fn new(endpoint: impl Into<String>, model: impl Into<String>) -> Self {
            Self {
                endpoint: endpoint.into(),
                model: model.into(),
                api_key: None,
                temperature: 0.0,
                client: reqwest::blocking::Client::new(),
            }
        }

        pub fn with_api_key(mut self, key: Option<String>) -> Self {
            self.api_key = key;
            self
        }

        pub fn with_temperature(mut self, temperature: f64) -> Self {
            self.temperature = temperature;
            self
        }

        fn url(&self) -> String {
            format!("{}/chat/completions", self.endpoint.trim_end_matches('/'))
        }
    }

    impl TextGenerator for HttpGenerator {
        fn generate(
            &self,
            prompt: &str,
            max_tokens: u32,
            timeout: Duration,
        ) -> Result<Completion, ProviderError> {
            let body = ChatRequest {
                model: &self.model,
                messages: vec![ChatMessage {
                    role: "user",
                    content: prompt,
                }],
                max_tokens,
                temperature: self.temperature,
            };

            let start = Instant::now();
            let mut req = self.client.post(self.url()).timeout(timeout).json(&body);
            if let Some(ref key) = self.api_key {
                req = req.bearer_auth(key);
            }
            let resp = req.send().map_err(|e| classify(e, timeout))?;

            if !resp.status().is_success() {
                let status = resp.status();
                let text = resp
                    .text()
                    .unwrap_or_else(|_| "<failed to read error body>".to_string());
                return Err(ProviderError::Unavailable(format!(
                    "HTTP {} from {}: {}",
                    status,
                    self.url(),
                    text
                )));
            }

            let parsed: ChatResponse = resp.json().map_err(|e| classify(e, timeout))?;
            let text = parsed
                .choices
                .into_iter()
                .next()
                .and_then(|c| c.message.content)
                .ok_or_else(|| ProviderError::Unavailable("response contained no choices".to_string()))?;
            let tokens_used = parsed
                .usage
                .and_then(|u| u.total_tokens)
                .unwrap_or_else(|| estimate_tokens(prompt) + estimate_tokens(&text));

            Ok(Completion {
                text: text.trim().to_string(),
                tokens_used,
                latency_ms: start.elapsed().as_millis() as u64,
            })
        }

        fn name(&self) -> &str {
            "http"
        }
    }

    pub(crate) fn classify(e: reqwest::Error, timeout: Duration) -> ProviderError {
        if e.is_timeout() {
            ProviderError::Timeout(timeout)
        } else {
            ProviderError::Unavailable(e.to_string())
        }
    }
}

#[cfg(feature = "http")]
pub(crate) use http::classify as classify_http_error;

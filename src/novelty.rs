//! Embedding-based novelty detection.
//!
//! Novelty of a candidate is `1 - max cosine similarity` against every
//! previously seen candidate, clamped to [0,1]. An empty history is maximally
//! novel.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::candidate::Candidate;
use crate::provider::ProviderError;

/// Turns text into a fixed-size vector.
pub trait Embedder: Send + Sync {
    fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError>;

    fn dimensions(&self) -> usize;
}

impl<T: Embedder + ?Sized> Embedder for Arc<T> {
    fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        (**self).embed(text)
    }

    fn dimensions(&self) -> usize {
        (**self).dimensions()
    }
}

/// Cosine similarity; 0.0 when either vector has zero norm or the lengths
/// differ.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (*x as f64, *y as f64);
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    // sqrt of the product so identical vectors give exactly 1.0
    (dot / (norm_a * norm_b).sqrt()).clamp(-1.0, 1.0)
}

/// Novelty of `embedding` against `history`, in [0,1].
pub fn novelty_of(embedding: &[f32], history: &[Vec<f32>]) -> f64 {
    let max_sim = history
        .iter()
        .map(|h| cosine_similarity(embedding, h))
        .fold(f64::NEG_INFINITY, f64::max);
    if max_sim == f64::NEG_INFINITY {
        return 1.0;
    }
    (1.0 - max_sim).clamp(0.0, 1.0)
}

// ---------------------------------------------------------------------------
// Hashing embedder
// ---------------------------------------------------------------------------

/// Offline embedder using feature hashing over lowercase word unigrams and
/// bigrams. Deterministic, needs no model, and gives texts sharing
/// vocabulary a high similarity.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dims: usize,
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(256)
    }
}

impl HashingEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(1) }
    }

    fn bucket(&self, feature: &str) -> (usize, f32) {
        let digest = Sha256::digest(feature.as_bytes());
        let idx = u64::from_le_bytes([
            digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6], digest[7],
        ]);
        let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
        ((idx % self.dims as u64) as usize, sign)
    }
}

impl Embedder for HashingEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        let mut v = vec![0.0f32; self.dims];
        let words: Vec<String> = text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .map(|w| w.to_lowercase())
            .collect();
        for w in &words {
            let (i, s) = self.bucket(w);
            v[i] += s;
        }
        for pair in words.windows(2) {
            let (i, s) = self.bucket(&format!("{} {}", pair[0], pair[1]));
            v[i] += 0.5 * s;
        }
        Ok(v)
    }

    fn dimensions(&self) -> usize {
        self.dims
    }
}

// ---------------------------------------------------------------------------
// HTTP embedder
// ---------------------------------------------------------------------------

#[cfg(feature = "http")]
pub use http::HttpEmbedder;

#[cfg(feature = "http")]
mod http {
    use super::*;
    use serde::{Deserialize, Serialize};
    use std::time::Duration;

    /// OpenAI-compatible `/embeddings` client.
    #[derive(Debug, Clone)]
    pub struct HttpEmbedder {
        endpoint: String,
        model: String,
        api_key: Option<String>,
        dims: usize,
        timeout: Duration,
        client: reqwest::blocking::Client,
    }

    #[derive(Serialize)]
    struct EmbeddingRequest<'a> {
        model: &'a str,
        input: &'a str,
    }

    #[derive(Deserialize)]
    struct EmbeddingResponse {
        data: Vec<EmbeddingData>,
    }

    #[derive(Deserialize)]
    struct EmbeddingData {
        embedding: Vec<f32>,
    }

    impl HttpEmbedder {
        pub fn new(endpoint: impl Into<String>, model: impl Into<String>, dims: usize) -> Self {
            Self {
                endpoint: endpoint.into(),
                model: model.into(),
                api_key: None,
                dims,
                timeout: Duration::from_secs(30),
                client: reqwest::blocking::Client::new(),
            }
        }

        pub fn with_api_key(mut self, key: Option<String>) -> Self {
            self.api_key = key;
            self
        }

        pub fn with_timeout(mut self, timeout: Duration) -> Self {
            self.timeout = timeout;
            self
        }
    }

    impl Embedder for HttpEmbedder {
        fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
            let url = format!("{}/embeddings", self.endpoint.trim_end_matches('/'));
            let body = EmbeddingRequest {
                model: &self.model,
                input: text,
            };
            let mut req = self.client.post(&url).timeout(self.timeout).json(&body);
            if let Some(ref key) = self.api_key {
                req = req.bearer_auth(key);
            }
            let resp = req
                .send()
                .map_err(|e| crate::provider::classify_http_error(e, self.timeout))?;
            if !resp.status().is_success() {
                return Err(ProviderError::Unavailable(format!(
                    "embeddings request failed: HTTP {}",
                    resp.status()
                )));
            }
            let parsed: EmbeddingResponse = resp
                .json()
                .map_err(|e| crate::provider::classify_http_error(e, self.timeout))?;
            let embedding = parsed
                .data
                .into_iter()
                .next()
                .map(|d| d.embedding)
                .ok_or_else(|| ProviderError::Unavailable("embeddings response contained no data".to_string()))?;
            if embedding.len() != self.dims {
                return Err(ProviderError::Unavailable(format!(
                    "expected {} dimensions, got {}",
                    self.dims,
                    embedding.len()
                )));
            }
            Ok(embedding)
        }

        fn dimensions(&self) -> usize {
            self.dims
        }
    }
}

// ---------------------------------------------------------------------------
// Detector
// ---------------------------------------------------------------------------

/// Scores candidates against a history of seen candidates.
///
/// Embeddings are cached per candidate id, so each candidate is embedded
/// once per detector no matter how often it appears in a history.
pub struct NoveltyDetector {
    embedder: Arc<dyn Embedder>,
    cache: Mutex<HashMap<String, Vec<f32>>>,
}

impl std::fmt::Debug for NoveltyDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NoveltyDetector")
            .field("dimensions", &self.embedder.dimensions())
            .finish()
    }
}

impl NoveltyDetector {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self {
            embedder,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn embedding(&self, candidate: &Candidate) -> Result<Vec<f32>, ProviderError> {
        if let Some(v) = self.cache.lock().ok().and_then(|c| c.get(&candidate.id).cloned()) {
            return Ok(v);
        }
        let v = self.embedder.embed(&candidate.content)?;
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(candidate.id.clone(), v.clone());
        }
        Ok(v)
    }

    /// Novelty of `candidate` against `history`, in [0,1]. Pure with respect
    /// to the history; the caller decides whether to append the candidate.
    pub fn novelty(&self, candidate: &Candidate, history: &[&Candidate]) -> Result<f64, ProviderError> {
        if history.is_empty() {
            return Ok(1.0);
        }
        let target = self.embedding(candidate)?;
        let mut past = Vec::with_capacity(history.len());
        for h in history {
            past.push(self.embedding(h)?);
        }
        Ok(novelty_of(&target, &past))
    }
}

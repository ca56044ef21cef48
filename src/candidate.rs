//! Candidates under optimization and the archive that keeps their lineage.
//!
//! A candidate is an immutable, versioned text artifact (a prompt template or a
//! small workflow description). The core never interprets the content; it only
//! hashes, stores, mutates, and scores it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};

/// Default number of hex characters for short display of candidate ids.
pub const SHORT_ID_LEN: usize = 8;

/// Return the first `SHORT_ID_LEN` characters of an id for display.
pub fn short_id(id: &str) -> &str {
    &id[..id.len().min(SHORT_ID_LEN)]
}

/// An immutable artifact under optimization.
///
/// `parent_id` and `strategy` are `None` only for the seed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub generation: u32,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Candidate {
    /// Create the seed (baseline) candidate for a run.
    pub fn seed(content: impl Into<String>) -> Self {
        let content = content.into();
        let id = content_hash_candidate(None, 0, None, &content);
        Candidate {
            id,
            parent_id: None,
            generation: 0,
            content,
            strategy: None,
            created_at: Utc::now(),
        }
    }

    /// Create a variant of `parent` produced by `strategy` during `generation`.
    pub fn derive(
        parent: &Candidate,
        generation: u32,
        strategy: &str,
        content: impl Into<String>,
    ) -> Self {
        let content = content.into();
        let id = content_hash_candidate(Some(&parent.id), generation, Some(strategy), &content);
        Candidate {
            id,
            parent_id: Some(parent.id.clone()),
            generation,
            content,
            strategy: Some(strategy.to_string()),
            created_at: Utc::now(),
        }
    }

    pub fn is_seed(&self) -> bool {
        self.parent_id.is_none()
    }

    /// Rough token estimate (~4 chars per token).
    pub fn estimated_tokens(&self) -> u64 {
        estimate_tokens(&self.content)
    }
}

/// Rough token estimate for arbitrary text (~4 chars per token, rounded up).
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}

/// Compute the SHA-256 content hash for a candidate from its identity fields:
/// parent id + generation + strategy + content (canonical JSON).
///
/// The creation timestamp is excluded so the same derivation always produces
/// the same id.
pub fn content_hash_candidate(
    parent_id: Option<&str>,
    generation: u32,
    strategy: Option<&str>,
    content: &str,
) -> String {
    #[derive(Serialize)]
    struct CandidateHashInput<'a> {
        parent_id: Option<&'a str>,
        generation: u32,
        strategy: Option<&'a str>,
        content: &'a str,
    }
    let input = CandidateHashInput {
        parent_id,
        generation,
        strategy,
        content,
    };
    let json = serde_json::to_string(&input).expect("serialization of hash input cannot fail");
    let digest = Sha256::digest(json.as_bytes());
    format!("{:x}", digest)
}

/// Append-only store of every candidate seen in a run.
///
/// Candidates are never deleted. Pruning only removes a candidate from
/// active consideration; lineage queries still see it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CandidateArchive {
    candidates: BTreeMap<String, Candidate>,
    /// Insertion order, used for deterministic history iteration.
    order: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pruned: BTreeSet<String>,
}

impl CandidateArchive {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a candidate. Returns `false` if a candidate with the same id was
    /// already archived (the existing one is kept).
    pub fn insert(&mut self, candidate: Candidate) -> bool {
        if self.candidates.contains_key(&candidate.id) {
            return false;
        }
        self.order.push(candidate.id.clone());
        self.candidates.insert(candidate.id.clone(), candidate);
        true
    }

    pub fn get(&self, id: &str) -> Option<&Candidate> {
        self.candidates.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.candidates.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// All candidates in insertion order, pruned ones included.
    pub fn iter(&self) -> impl Iterator<Item = &Candidate> {
        self.order.iter().filter_map(|id| self.candidates.get(id))
    }

    /// Candidates still under active consideration, in insertion order.
    pub fn active(&self) -> impl Iterator<Item = &Candidate> {
        self.iter().filter(|c| !self.pruned.contains(&c.id))
    }

    /// Remove a candidate from active consideration. Returns `false` when the
    /// id is unknown or already pruned.
    pub fn prune(&mut self, id: &str) -> bool {
        if !self.candidates.contains_key(id) {
            return false;
        }
        self.pruned.insert(id.to_string())
    }

    pub fn is_pruned(&self, id: &str) -> bool {
        self.pruned.contains(id)
    }

    /// Walk parent links from `id` back to the seed.
    ///
    /// Returns candidates ordered from `id` (first) to its oldest ancestor.
    /// Unknown parents end the walk.
    pub fn lineage(&self, id: &str) -> Vec<&Candidate> {
        let mut chain = Vec::new();
        let mut visited = BTreeSet::new();
        let mut next = Some(id);
        while let Some(current) = next {
            if !visited.insert(current) {
                break;
            }
            match self.candidates.get(current) {
                Some(c) => {
                    chain.push(c);
                    next = c.parent_id.as_deref();
                }
                None => break,
            }
        }
        chain
    }
}

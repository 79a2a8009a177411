//! Deterministic collaborators for driving the pipeline without a model.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::decision::{DecisionProtocol, EvaluationCandidate, MutationIntent};
use crate::embed::Embedder;
use crate::error::{MemoryError, Result};
use crate::extract::{CandidateFact, ExtractedFacts, FactExtractor, FactMetadata};

/// Bag-of-words embedding: every lowercase word hashes into one bucket.
///
/// Identical texts embed identically (similarity 1.0); texts sharing some
/// words land in between, disjoint texts near 0.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    pub dims: usize,
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self { dims: 256 }
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let dims = self.dims.max(1);
        let mut v = vec![0.0f32; dims];
        for word in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            let digest = Sha256::digest(word.to_lowercase().as_bytes());
            let mut bucket = [0u8; 8];
            bucket.copy_from_slice(&digest[..8]);
            v[(u64::from_le_bytes(bucket) % dims as u64) as usize] += 1.0;
        }
        Ok(v)
    }
}

/// Returns a fixed extraction for every input.
#[derive(Debug, Clone, Default)]
pub struct StaticFactExtractor {
    pub result: ExtractedFacts,
}

impl StaticFactExtractor {
    pub fn facts<I, S>(facts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            result: ExtractedFacts {
                facts: facts.into_iter().map(Into::into).collect(),
                metadata: FactMetadata::default(),
            },
        }
    }

    pub fn with_metadata(mut self, metadata: FactMetadata) -> Self {
        self.result.metadata = metadata;
        self
    }
}

#[async_trait]
impl FactExtractor for StaticFactExtractor {
    async fn extract(&self, _text: &str) -> Result<ExtractedFacts> {
        Ok(self.result.clone())
    }
}

/// Treats the whole input as one fact.
#[derive(Debug, Clone, Default)]
pub struct EchoFactExtractor {
    pub metadata: FactMetadata,
}

#[async_trait]
impl FactExtractor for EchoFactExtractor {
    async fn extract(&self, text: &str) -> Result<ExtractedFacts> {
        let text = text.trim();
        Ok(ExtractedFacts {
            facts: if text.is_empty() { Vec::new() } else { vec![text.to_string()] },
            metadata: self.metadata.clone(),
        })
    }
}

/// What a [`ScriptedDecisionProtocol`] was shown on one call.
#[derive(Debug, Clone, PartialEq)]
pub struct DecisionCall {
    pub candidates: Vec<EvaluationCandidate>,
    pub facts: Vec<CandidateFact>,
}

/// Plays back scripted intent batches, one per `decide` call, and records
/// what it was shown.
///
/// When the script runs out, every fact is answered with an ADD of its
/// text.
#[derive(Debug, Default)]
pub struct ScriptedDecisionProtocol {
    script: Mutex<VecDeque<Vec<MutationIntent>>>,
    calls: Mutex<Vec<DecisionCall>>,
}

impl ScriptedDecisionProtocol {
    pub fn new<I>(batches: I) -> Self
    where
        I: IntoIterator<Item = Vec<MutationIntent>>,
    {
        Self {
            script: Mutex::new(batches.into_iter().collect()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Answers every call by adding each fact verbatim.
    pub fn add_everything() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<DecisionCall> {
        self.calls
            .lock()
            .map(|c| c.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }
}

#[async_trait]
impl DecisionProtocol for ScriptedDecisionProtocol {
    async fn decide(
        &self,
        candidates: &[EvaluationCandidate],
        facts: &[CandidateFact],
    ) -> Result<Vec<MutationIntent>> {
        self.calls
            .lock()
            .map_err(|e| MemoryError::Decision(e.to_string()))?
            .push(DecisionCall {
                candidates: candidates.to_vec(),
                facts: facts.to_vec(),
            });
        let next = self
            .script
            .lock()
            .map_err(|e| MemoryError::Decision(e.to_string()))?
            .pop_front();
        Ok(next.unwrap_or_else(|| {
            facts
                .iter()
                .map(|f| MutationIntent::add(f.text.clone()))
                .collect()
        }))
    }
}

//! Candidate accumulation: embed each fact, fetch its nearest existing
//! memories, and build the ordered evaluation list the decision step
//! addresses by position.
//!
//! No mutation happens here, so any embedding or search failure aborts the
//! whole request without leaving the store half-written.

use std::collections::HashMap;

use futures::future::try_join_all;
use tracing::debug;

use crate::decision::EvaluationCandidate;
use crate::embed::Embedder;
use crate::error::Result;
use crate::extract::CandidateFact;
use crate::filter::Filters;
use crate::progress::{ProgressEvent, ProgressSink};
use crate::schema::{KEY_DATA, KEY_HASH, MemoryItem, ScoredRecord};
use crate::store::VectorStore;

/// Result of accumulating one batch of facts.
#[derive(Debug, Default)]
pub struct Accumulation {
    /// Position in this list is the local ordinal.
    pub candidates: Vec<EvaluationCandidate>,
    /// Fact text -> embedding, reused when an ADD stores a fact verbatim.
    pub embeddings: HashMap<String, Vec<f32>>,
    /// Ordinals of facts that found no neighbour above the threshold.
    pub unmatched: Vec<usize>,
}

pub struct Accumulator<'a> {
    pub embedder: &'a dyn Embedder,
    pub store: &'a dyn VectorStore,
    pub search_limit: usize,
    pub parallel: bool,
}

impl Accumulator<'_> {
    pub async fn accumulate(
        &self,
        facts: &[CandidateFact],
        filters: &Filters,
        progress: &dyn ProgressSink,
    ) -> Result<Accumulation> {
        let searched: Vec<(Vec<f32>, Vec<ScoredRecord>)> = if self.parallel {
            try_join_all(facts.iter().map(|fact| self.search_one(fact, filters))).await?
        } else {
            let mut out = Vec::with_capacity(facts.len());
            for fact in facts {
                out.push(self.search_one(fact, filters).await?);
            }
            out
        };

        let mut acc = Accumulation::default();
        for (fact, (vector, hits)) in facts.iter().zip(searched) {
            progress.emit(ProgressEvent::FactSearched {
                ordinal: fact.ordinal,
                neighbours: hits.len(),
            });
            acc.embeddings.insert(fact.text.clone(), vector);
            if hits.is_empty() {
                // Net-new facts are not inserted here; the decision step
                // owns every ADD.
                debug!(fact = fact.ordinal, "no neighbours; deferring to decision");
                acc.unmatched.push(fact.ordinal);
                continue;
            }
            for hit in hits {
                acc.candidates.push(to_candidate(fact.ordinal, hit));
            }
        }
        debug!(
            facts = facts.len(),
            candidates = acc.candidates.len(),
            unmatched = acc.unmatched.len(),
            "accumulated evaluation candidates"
        );
        Ok(acc)
    }

    async fn search_one(
        &self,
        fact: &CandidateFact,
        filters: &Filters,
    ) -> Result<(Vec<f32>, Vec<ScoredRecord>)> {
        let vector = self.embedder.embed(&fact.text).await?;
        let hits = self.store.search(&vector, self.search_limit, filters).await?;
        Ok((vector, hits))
    }
}

fn to_candidate(fact_ordinal: usize, hit: ScoredRecord) -> EvaluationCandidate {
    let item = MemoryItem::from_scored(&hit);
    let mut metadata = hit.payload;
    metadata.remove(KEY_DATA);
    metadata.remove(KEY_HASH);
    EvaluationCandidate {
        fact_ordinal,
        memory_id: hit.id,
        score: hit.score,
        memory_text: item.memory,
        metadata,
        content_hash: item.hash,
    }
}

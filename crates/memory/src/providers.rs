//! LLM-backed collaborators over [`recollect_llm::LlmRouter`].

use std::sync::Arc;

use async_trait::async_trait;
use recollect_config::LlmConfig;
use recollect_llm::{LlmRouter, Provider, extract_json_output};
use serde_json::Value as Json;
use tracing::{debug, warn};

use crate::decision::{DecisionProtocol, EvaluationCandidate, MutationIntent, parse_intents};
use crate::embed::Embedder;
use crate::error::{MemoryError, Result};
use crate::extract::{CandidateFact, ExtractedFacts, FactExtractor, parse_extraction};
use crate::prompts::{decision_prompt, fact_extraction_prompt};

/// Provider and model choices resolved from [`LlmConfig`].
#[derive(Debug, Clone, PartialEq)]
pub struct ModelChoice {
    pub chat_provider: Provider,
    pub chat_model: String,
    pub embedding_provider: Provider,
    pub embedding_model: String,
}

impl ModelChoice {
    pub fn from_config(cfg: &LlmConfig) -> Result<Self> {
        let parse = |label: &str| {
            Provider::from_label(label)
                .ok_or_else(|| MemoryError::Validation(format!("unsupported llm provider: {label}")))
        };
        let chat_provider = parse(&cfg.provider)?;
        let chat_model = match chat_provider {
            Provider::Ollama => cfg.ollama_model.clone(),
            Provider::OpenRouter => cfg.openrouter_model.clone(),
        };
        Ok(Self {
            chat_provider,
            chat_model,
            embedding_provider: parse(&cfg.embedding_provider)?,
            embedding_model: cfg.embedding_model.clone(),
        })
    }
}

pub struct RouterEmbedder {
    router: Arc<LlmRouter>,
    provider: Provider,
    model: String,
}

impl RouterEmbedder {
    pub fn new(router: Arc<LlmRouter>, provider: Provider, model: impl Into<String>) -> Self {
        Self {
            router,
            provider,
            model: model.into(),
        }
    }
}

#[async_trait]
impl Embedder for RouterEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.router
            .embed(self.provider, &self.model, text)
            .await
            .map_err(|e| MemoryError::Embedding(format!("{e:#}")))
    }
}

pub struct LlmFactExtractor {
    router: Arc<LlmRouter>,
    provider: Provider,
    model: String,
}

impl LlmFactExtractor {
    pub fn new(router: Arc<LlmRouter>, provider: Provider, model: impl Into<String>) -> Self {
        Self {
            router,
            provider,
            model: model.into(),
        }
    }
}

#[async_trait]
impl FactExtractor for LlmFactExtractor {
    async fn extract(&self, text: &str) -> Result<ExtractedFacts> {
        let reply = self
            .router
            .chat(self.provider, &self.model, &fact_extraction_prompt(text), true)
            .await
            .map_err(|e| MemoryError::Extraction(format!("{e:#}")))?;
        let value: Json = extract_json_output(&reply)
            .ok_or_else(|| MemoryError::Extraction("extractor reply contained no JSON object".to_string()))?;
        let facts = parse_extraction(&value)?;
        debug!(facts = facts.facts.len(), "facts extracted");
        Ok(facts)
    }
}

pub struct LlmDecisionProtocol {
    router: Arc<LlmRouter>,
    provider: Provider,
    model: String,
}

impl LlmDecisionProtocol {
    pub fn new(router: Arc<LlmRouter>, provider: Provider, model: impl Into<String>) -> Self {
        Self {
            router,
            provider,
            model: model.into(),
        }
    }
}

#[async_trait]
impl DecisionProtocol for LlmDecisionProtocol {
    async fn decide(
        &self,
        candidates: &[EvaluationCandidate],
        facts: &[CandidateFact],
    ) -> Result<Vec<MutationIntent>> {
        if facts.is_empty() {
            return Ok(Vec::new());
        }
        let reply = self
            .router
            .chat(
                self.provider,
                &self.model,
                &decision_prompt(candidates, facts),
                true,
            )
            .await
            .map_err(|e| MemoryError::Decision(format!("{e:#}")))?;
        match extract_json_output::<Json>(&reply) {
            Some(value) => Ok(parse_intents(&value)),
            None => {
                warn!(reply_len = reply.len(), "decision reply contained no JSON; no intents applied");
                Ok(Vec::new())
            }
        }
    }
}

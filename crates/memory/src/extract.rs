//! Fact extraction contract and the tolerant reader for extractor replies.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::warn;

use crate::error::{MemoryError, Result};
use crate::schema::{Payload, PayloadValue};

/// Free-form metadata an extractor attaches to one batch of facts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FactMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sentiment: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub related_entities: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub related_events: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl FactMetadata {
    pub fn is_empty(&self) -> bool {
        self.to_payload().is_empty()
    }

    /// Payload entries for every field that carries something.
    pub fn to_payload(&self) -> Payload {
        let mut payload = Payload::new();
        for (key, value) in [("scope", &self.scope), ("sentiment", &self.sentiment)] {
            if let Some(v) = value.as_deref().map(str::trim).filter(|v| !v.is_empty()) {
                payload.insert(key.to_string(), PayloadValue::from(v));
            }
        }
        for (key, list) in [
            ("related_entities", &self.related_entities),
            ("related_events", &self.related_events),
            ("tags", &self.tags),
        ] {
            if !list.is_empty() {
                payload.insert(key.to_string(), PayloadValue::StringList(list.clone()));
            }
        }
        payload
    }
}

/// Extractor output.  Empty `facts` means "nothing to remember".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractedFacts {
    pub facts: Vec<String>,
    #[serde(default)]
    pub metadata: FactMetadata,
}

impl ExtractedFacts {
    /// Facts tagged with their position in the extraction output.
    pub fn candidates(&self) -> Vec<CandidateFact> {
        self.facts
            .iter()
            .enumerate()
            .map(|(ordinal, text)| CandidateFact {
                ordinal,
                text: text.clone(),
            })
            .collect()
    }
}

/// One extracted fact, alive for a single `add` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateFact {
    pub ordinal: usize,
    pub text: String,
}

#[async_trait]
pub trait FactExtractor: Send + Sync {
    async fn extract(&self, text: &str) -> Result<ExtractedFacts>;
}

/// Read an extractor reply.
///
/// Facts are taken from `relevant_facts` (or `facts`), which must be a list;
/// blank and non-string items are dropped.  Metadata list fields are read
/// either directly or from a nested `associations` object.
pub fn parse_extraction(reply: &Json) -> Result<ExtractedFacts> {
    let facts_value = reply
        .get("relevant_facts")
        .or_else(|| reply.get("facts"))
        .ok_or_else(|| MemoryError::Extraction("reply has no `relevant_facts` list".to_string()))?;
    let items = facts_value.as_array().ok_or_else(|| {
        MemoryError::Extraction(format!("`relevant_facts` is not a list: {facts_value}"))
    })?;

    let mut facts = Vec::with_capacity(items.len());
    for item in items {
        match item.as_str().map(str::trim) {
            Some(text) if !text.is_empty() => facts.push(text.to_string()),
            Some(_) => {}
            None => warn!(item = %item, "ignoring non-string extracted fact"),
        }
    }

    let metadata = reply
        .get("metadata")
        .filter(|m| m.is_object())
        .map(parse_metadata)
        .unwrap_or_default();
    Ok(ExtractedFacts { facts, metadata })
}

fn parse_metadata(meta: &Json) -> FactMetadata {
    let text = |key: &str| meta.get(key).and_then(Json::as_str).map(str::to_string);
    let list = |key: &str| {
        meta.get(key)
            .or_else(|| meta.get("associations").and_then(|a| a.get(key)))
            .and_then(Json::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Json::as_str)
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default()
    };
    FactMetadata {
        scope: text("scope"),
        sentiment: text("sentiment"),
        related_entities: list("related_entities"),
        related_events: list("related_events"),
        tags: list("tags"),
    }
}

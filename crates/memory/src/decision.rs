//! Reconciliation decision contract.
//!
//! The decision-maker sees the evaluation candidates only by their position
//! in the accumulated list (the local ordinal) and answers with typed
//! intents addressed by that position.  Resolving ordinals back to storage
//! ids happens in the executor and nowhere else.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::warn;

use crate::error::Result;
use crate::extract::CandidateFact;
use crate::schema::Payload;

/// An existing memory matched against one new fact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationCandidate {
    pub fact_ordinal: usize,
    pub memory_id: String,
    pub score: f32,
    pub memory_text: String,
    #[serde(default)]
    pub metadata: Payload,
    #[serde(default)]
    pub content_hash: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum IntentKind {
    Add,
    Update,
    Delete,
    None,
    Conflict,
}

impl IntentKind {
    /// Accepts the canonical labels plus the tool-style names decision
    /// models tend to produce.
    pub fn from_label(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().replace(['-', ' '], "_").as_str() {
            "ADD" | "ADD_MEMORY" => Some(Self::Add),
            "UPDATE" | "UPDATE_MEMORY" => Some(Self::Update),
            "DELETE" | "DELETE_MEMORY" => Some(Self::Delete),
            "NONE" | "NOOP" | "NO_OP" => Some(Self::None),
            "CONFLICT" | "RESOLVE_CONFLICT" => Some(Self::Conflict),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Add => "ADD",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
            Self::None => "NONE",
            Self::Conflict => "CONFLICT",
        }
    }

    /// `true` for kinds that never touch storage.
    pub fn is_informational(self) -> bool {
        matches!(self, Self::None | Self::Conflict)
    }
}

impl fmt::Display for IntentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One typed decision.  `local_ref` indexes the evaluation candidate list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationIntent {
    pub kind: IntentKind,
    #[serde(default)]
    pub local_ref: Option<usize>,
    #[serde(default)]
    pub data: Option<String>,
}

impl MutationIntent {
    pub fn add(data: impl Into<String>) -> Self {
        Self {
            kind: IntentKind::Add,
            local_ref: None,
            data: Some(data.into()),
        }
    }

    pub fn update(local_ref: usize, data: impl Into<String>) -> Self {
        Self {
            kind: IntentKind::Update,
            local_ref: Some(local_ref),
            data: Some(data.into()),
        }
    }

    pub fn delete(local_ref: usize) -> Self {
        Self {
            kind: IntentKind::Delete,
            local_ref: Some(local_ref),
            data: None,
        }
    }

    pub fn none(local_ref: Option<usize>) -> Self {
        Self {
            kind: IntentKind::None,
            local_ref,
            data: None,
        }
    }

    /// Non-blank payload text, if any.
    pub fn text(&self) -> Option<&str> {
        self.data.as_deref().map(str::trim).filter(|s| !s.is_empty())
    }

    /// Shape check independent of the candidate list: UPDATE and DELETE
    /// need a local reference, ADD and UPDATE need payload text.
    pub fn check_shape(&self) -> std::result::Result<(), String> {
        match self.kind {
            IntentKind::Add if self.text().is_none() => Err("ADD without text".to_string()),
            IntentKind::Update if self.local_ref.is_none() => {
                Err("UPDATE without a local reference".to_string())
            }
            IntentKind::Update if self.text().is_none() => Err("UPDATE without text".to_string()),
            IntentKind::Delete if self.local_ref.is_none() => {
                Err("DELETE without a local reference".to_string())
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
pub trait DecisionProtocol: Send + Sync {
    async fn decide(
        &self,
        candidates: &[EvaluationCandidate],
        facts: &[CandidateFact],
    ) -> Result<Vec<MutationIntent>>;
}

/// Read a decision reply of the form
/// `{"memory": [{"event": "...", "id": "<ordinal>", "text": "..."}]}` (a
/// bare list is accepted too).
///
/// Entries with an unknown event or a non-numeric id are dropped with a
/// warning; the rest of the batch is kept.
pub fn parse_intents(reply: &Json) -> Vec<MutationIntent> {
    let entries = match reply {
        Json::Array(items) => items.as_slice(),
        other => match other.get("memory").and_then(Json::as_array) {
            Some(items) => items.as_slice(),
            None => {
                warn!(reply = %other, "decision reply has no `memory` list");
                return Vec::new();
            }
        },
    };

    entries
        .iter()
        .enumerate()
        .filter_map(|(position, entry)| match parse_entry(entry) {
            Ok(intent) => Some(intent),
            Err(reason) => {
                warn!(position, %reason, entry = %entry, "dropping malformed decision entry");
                None
            }
        })
        .collect()
}

fn parse_entry(entry: &Json) -> std::result::Result<MutationIntent, String> {
    let label = entry
        .get("event")
        .and_then(Json::as_str)
        .ok_or_else(|| "missing `event`".to_string())?;
    let kind = IntentKind::from_label(label).ok_or_else(|| format!("unknown event `{label}`"))?;
    let local_ref = match entry.get("id").or_else(|| entry.get("memory_id")) {
        None | Some(Json::Null) => None,
        Some(Json::Number(n)) => Some(
            n.as_u64()
                .and_then(|v| usize::try_from(v).ok())
                .ok_or_else(|| format!("id {n} is not an ordinal"))?,
        ),
        Some(Json::String(s)) if s.trim().is_empty() => None,
        Some(Json::String(s)) => Some(
            s.trim()
                .parse::<usize>()
                .map_err(|_| format!("id `{s}` is not an ordinal"))?,
        ),
        Some(other) => return Err(format!("id {other} is not an ordinal")),
    };
    let data = match entry.get("text").or_else(|| entry.get("data")) {
        None | Some(Json::Null) => None,
        Some(Json::String(s)) => Some(s.clone()),
        Some(other) => return Err(format!("text {other} is not a string")),
    };
    Ok(MutationIntent {
        kind,
        local_ref,
        data,
    })
}

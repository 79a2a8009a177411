//! Applies mutation intents to the vector store and the history journal.
//!
//! Each intent stands alone: a failed intent is recorded as skipped and
//! never rolls back intents applied before it.  Journal failures are logged
//! and never undo the mutation that triggered them.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::codec::check_payload;
use crate::decision::{EvaluationCandidate, IntentKind, MutationIntent};
use crate::embed::Embedder;
use crate::error::{MemoryError, Result};
use crate::history::{HistoryEntry, HistoryLog};
use crate::locks::KeyedLocks;
use crate::progress::{ProgressEvent, ProgressSink};
use crate::schema::{
    Clock, HistoryEvent, KEY_CREATED_AT, KEY_DATA, KEY_HASH, KEY_UPDATED_AT, Payload,
    PayloadValue, ScopeIds, content_hash,
};
use crate::store::VectorStore;

/// One mutation that reached storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedMutation {
    pub id: String,
    pub event: HistoryEvent,
    pub data: String,
    /// Text the record held before an UPDATE or DELETE.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous: Option<String>,
}

/// An intent that was not applied, and why.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedIntent {
    /// Position of the intent in the decision output.
    pub index: usize,
    pub kind: IntentKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_ref: Option<usize>,
    pub reason: String,
}

/// A NONE or CONFLICT outcome, surfaced for audit only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotedIntent {
    pub kind: IntentKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub applied: Vec<AppliedMutation>,
    pub skipped: Vec<SkippedIntent>,
    pub noted: Vec<NotedIntent>,
}

/// Scope and metadata stamped onto every record written by one request.
#[derive(Debug, Clone, Default)]
pub struct WriteContext {
    pub scope: ScopeIds,
    pub metadata: Payload,
}

pub struct MutationExecutor<'a> {
    pub store: &'a dyn VectorStore,
    pub journal: &'a dyn HistoryLog,
    pub embedder: &'a dyn Embedder,
    pub locks: &'a KeyedLocks,
    pub clock: Clock,
}

impl MutationExecutor<'_> {
    /// Apply `intents` in order against the `candidates` arena.
    pub async fn execute(
        &self,
        intents: &[MutationIntent],
        candidates: &[EvaluationCandidate],
        ctx: &WriteContext,
        embeddings: &HashMap<String, Vec<f32>>,
        progress: &dyn ProgressSink,
    ) -> ExecutionReport {
        let mut report = ExecutionReport::default();
        for (index, intent) in intents.iter().enumerate() {
            match self
                .apply_one(intent, candidates, ctx, embeddings, &mut report)
                .await
            {
                Ok(Some(applied)) => {
                    progress.emit(ProgressEvent::MutationApplied {
                        memory_id: applied.id.clone(),
                        event: applied.event,
                    });
                    report.applied.push(applied);
                }
                Ok(None) => {}
                Err(err) => {
                    if err.is_skippable() {
                        warn!(index, kind = %intent.kind, error = %err, "skipping mutation intent");
                    } else {
                        error!(index, kind = %intent.kind, error = %err, "mutation intent failed");
                    }
                    progress.emit(ProgressEvent::IntentSkipped {
                        index,
                        kind: intent.kind,
                        reason: err.to_string(),
                    });
                    report.skipped.push(SkippedIntent {
                        index,
                        kind: intent.kind,
                        local_ref: intent.local_ref,
                        reason: err.to_string(),
                    });
                }
            }
        }
        report
    }

    async fn apply_one(
        &self,
        intent: &MutationIntent,
        candidates: &[EvaluationCandidate],
        ctx: &WriteContext,
        embeddings: &HashMap<String, Vec<f32>>,
        report: &mut ExecutionReport,
    ) -> Result<Option<AppliedMutation>> {
        if intent.kind.is_informational() {
            let memory_id = intent
                .local_ref
                .and_then(|i| candidates.get(i))
                .map(|c| c.memory_id.clone());
            report.noted.push(NotedIntent {
                kind: intent.kind,
                memory_id,
                data: intent.data.clone(),
            });
            return Ok(None);
        }
        intent.check_shape().map_err(MemoryError::MalformedIntent)?;

        let text = intent.text().unwrap_or_default();
        match intent.kind {
            IntentKind::Add => {
                let cached = embeddings.get(text).cloned();
                self.add_memory(text, ctx, cached).await.map(Some)
            }
            IntentKind::Update => {
                let id = resolve(intent.local_ref, candidates)?;
                self.update_memory(id, text, &ctx.metadata).await.map(Some)
            }
            IntentKind::Delete => {
                let id = resolve(intent.local_ref, candidates)?;
                self.delete_memory(id).await.map(Some)
            }
            IntentKind::None | IntentKind::Conflict => Ok(None),
        }
    }

    /// Embed and insert a new record under a fresh id.
    pub async fn add_memory(
        &self,
        data: &str,
        ctx: &WriteContext,
        vector: Option<Vec<f32>>,
    ) -> Result<AppliedMutation> {
        check_payload(&ctx.metadata)?;
        let vector = match vector {
            Some(v) => v,
            None => self.embedder.embed(data).await?,
        };
        let id = Uuid::new_v4().to_string();
        let created_at = self.clock.stamp();

        let mut payload = ctx.metadata.clone();
        ctx.scope.apply_to(&mut payload);
        payload.insert(KEY_DATA.to_string(), PayloadValue::from(data));
        payload.insert(KEY_HASH.to_string(), PayloadValue::from(content_hash(data)));
        payload.insert(KEY_CREATED_AT.to_string(), PayloadValue::from(created_at.as_str()));

        self.store
            .insert(vec![vector], vec![id.clone()], vec![payload])
            .await?;
        info!(memory_id = %id, "memory added");

        self.journal_append(HistoryEntry::new(
            id.as_str(),
            HistoryEvent::Add,
            None,
            Some(data.to_string()),
            created_at.as_str(),
            created_at.as_str(),
        ));
        Ok(AppliedMutation {
            id,
            event: HistoryEvent::Add,
            data: data.to_string(),
            previous: None,
        })
    }

    /// Overwrite the text of an existing record.  `created_at` and the
    /// scope ids are kept; `hash` follows the new text; `updated_at` moves
    /// strictly forward.
    pub async fn update_memory(
        &self,
        id: &str,
        data: &str,
        extra_metadata: &Payload,
    ) -> Result<AppliedMutation> {
        check_payload(extra_metadata)?;
        let _guard = self.locks.lock(id).await;
        let existing = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| MemoryError::NotFound(id.to_string()))?;
        let previous = existing.data().map(str::to_string);
        let created_at = existing.created_at().map(str::to_string);
        let updated_at = self
            .clock
            .stamp_after(existing.updated_at().or(existing.created_at()));

        let mut payload = existing.payload.clone();
        for (k, v) in extra_metadata {
            payload.insert(k.clone(), v.clone());
        }
        payload.insert(KEY_DATA.to_string(), PayloadValue::from(data));
        payload.insert(KEY_HASH.to_string(), PayloadValue::from(content_hash(data)));
        payload.insert(KEY_UPDATED_AT.to_string(), PayloadValue::from(updated_at.as_str()));

        let vector = self.embedder.embed(data).await?;
        self.store.update(id, Some(vector), Some(payload)).await?;
        info!(memory_id = %id, "memory updated");

        self.journal_append(HistoryEntry::new(
            id,
            HistoryEvent::Update,
            previous.clone(),
            Some(data.to_string()),
            created_at.unwrap_or_else(|| updated_at.clone()),
            updated_at,
        ));
        Ok(AppliedMutation {
            id: id.to_string(),
            event: HistoryEvent::Update,
            data: data.to_string(),
            previous,
        })
    }

    pub async fn delete_memory(&self, id: &str) -> Result<AppliedMutation> {
        let _guard = self.locks.lock(id).await;
        let existing = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| MemoryError::NotFound(id.to_string()))?;
        let previous = existing.data().map(str::to_string);
        self.store.delete(id).await?;
        info!(memory_id = %id, "memory deleted");

        let now = self.clock.stamp_after(existing.updated_at().or(existing.created_at()));
        self.journal_append(HistoryEntry::new(
            id,
            HistoryEvent::Delete,
            previous.clone(),
            None,
            existing.created_at().unwrap_or(now.as_str()),
            now.as_str(),
        ));
        Ok(AppliedMutation {
            id: id.to_string(),
            event: HistoryEvent::Delete,
            data: previous.clone().unwrap_or_default(),
            previous,
        })
    }

    fn journal_append(&self, entry: HistoryEntry) {
        if let Err(err) = self.journal.append(&entry) {
            warn!(
                memory_id = %entry.memory_id,
                event = %entry.event,
                error = %err,
                "history write failed; mutation kept"
            );
        }
    }
}

/// Map a local ordinal to the storage id it stands for.
pub fn resolve(local_ref: Option<usize>, candidates: &[EvaluationCandidate]) -> Result<&str> {
    let index = local_ref
        .ok_or_else(|| MemoryError::MalformedIntent("missing local reference".to_string()))?;
    candidates
        .get(index)
        .map(|c| c.memory_id.as_str())
        .ok_or(MemoryError::Reference {
            index,
            len: candidates.len(),
        })
}

//! The memory service: the reconciliation pipeline plus direct record
//! operations over one vector store and one history journal.
//!
//! `add` runs extract -> accumulate -> decide -> execute.  Everything up to
//! the decision is read-only, so failures there leave storage untouched.
//! After that, each intent is applied on its own.

use std::sync::Arc;
use std::time::Duration;

use recollect_config::{AppConfig, MemoryConfig};
use recollect_llm::LlmRouter;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::accumulate::Accumulator;
use crate::codec::check_payload;
use crate::decision::DecisionProtocol;
use crate::embed::Embedder;
use crate::error::{MemoryError, Result};
use crate::executor::{
    AppliedMutation, MutationExecutor, NotedIntent, SkippedIntent, WriteContext,
};
use crate::extract::FactExtractor;
use crate::filter::{Filters, scope_filters};
use crate::history::{HistoryEntry, HistoryJournal};
use crate::locks::KeyedLocks;
use crate::progress::{ProgressEvent, ProgressSink};
use crate::providers::{LlmDecisionProtocol, LlmFactExtractor, ModelChoice, RouterEmbedder};
use crate::schema::{Clock, MemoryItem, Payload, RESERVED_KEYS, ScopeIds, truncate_str};
use crate::store::{VectorStore, open_vector_store};

pub const MESSAGE_OK: &str = "ok";
pub const MESSAGE_NOTHING_ADDED: &str = "No memory added";

/// Pipeline tuning taken from `[memory]`.
#[derive(Debug, Clone, Copy)]
pub struct ServiceSettings {
    pub search_limit: usize,
    pub parallel_fact_search: bool,
    pub clock: Clock,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self::from(&MemoryConfig::default())
    }
}

impl From<&MemoryConfig> for ServiceSettings {
    fn from(cfg: &MemoryConfig) -> Self {
        Self {
            search_limit: cfg.search_limit.max(1),
            parallel_fact_search: cfg.parallel_fact_search,
            clock: Clock::with_offset_minutes(cfg.timezone_offset_minutes),
        }
    }
}

/// Input to [`MemoryService::add`].
#[derive(Debug, Clone, Default)]
pub struct AddRequest {
    pub text: String,
    pub scope: ScopeIds,
    /// Stored on every record this call writes.  Reserved keys are ignored.
    pub metadata: Payload,
    /// Narrows the neighbour search beyond the scope ids.
    pub filters: Filters,
}

impl AddRequest {
    pub fn new(text: impl Into<String>, scope: ScopeIds) -> Self {
        Self {
            text: text.into(),
            scope,
            ..Self::default()
        }
    }
}

/// Summary of one `add` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddOutcome {
    pub message: String,
    pub details: Vec<AppliedMutation>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skipped: Vec<SkippedIntent>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub noted: Vec<NotedIntent>,
}

impl AddOutcome {
    fn nothing_added() -> Self {
        Self {
            message: MESSAGE_NOTHING_ADDED.to_string(),
            details: Vec::new(),
            skipped: Vec::new(),
            noted: Vec::new(),
        }
    }
}

pub struct MemoryService {
    store: Arc<dyn VectorStore>,
    journal: Arc<HistoryJournal>,
    embedder: Arc<dyn Embedder>,
    extractor: Arc<dyn FactExtractor>,
    decision: Arc<dyn DecisionProtocol>,
    settings: ServiceSettings,
    id_locks: KeyedLocks,
    scope_locks: KeyedLocks,
}

impl MemoryService {
    pub fn new(
        store: Arc<dyn VectorStore>,
        journal: Arc<HistoryJournal>,
        embedder: Arc<dyn Embedder>,
        extractor: Arc<dyn FactExtractor>,
        decision: Arc<dyn DecisionProtocol>,
        settings: ServiceSettings,
    ) -> Self {
        Self {
            store,
            journal,
            embedder,
            extractor,
            decision,
            settings,
            id_locks: KeyedLocks::new(),
            scope_locks: KeyedLocks::new(),
        }
    }

    /// Wire the service from configuration: LLM-backed collaborators, the
    /// configured vector store and the journal.
    pub async fn from_config(cfg: &AppConfig) -> Result<Self> {
        let choice = ModelChoice::from_config(&cfg.llm)?;
        let router = LlmRouter::new(
            &cfg.llm.ollama_base_url,
            Duration::from_secs(cfg.llm.request_timeout_secs),
        )
        .map_err(|e| MemoryError::Validation(format!("{e:#}")))?;
        let router = Arc::new(router);

        let store = open_vector_store(&cfg.vector_store).await?;
        let journal = if cfg.history.path.trim().is_empty() {
            HistoryJournal::in_memory()?
        } else {
            HistoryJournal::open(&cfg.history.path)?
        };
        info!(
            store = store.name(),
            chat_model = %choice.chat_model,
            embedding_model = %choice.embedding_model,
            "memory service ready"
        );

        Ok(Self::new(
            store,
            Arc::new(journal),
            Arc::new(RouterEmbedder::new(
                router.clone(),
                choice.embedding_provider,
                choice.embedding_model.clone(),
            )),
            Arc::new(LlmFactExtractor::new(
                router.clone(),
                choice.chat_provider,
                choice.chat_model.clone(),
            )),
            Arc::new(LlmDecisionProtocol::new(
                router,
                choice.chat_provider,
                choice.chat_model,
            )),
            ServiceSettings::from(&cfg.memory),
        ))
    }

    pub fn store(&self) -> &dyn VectorStore {
        self.store.as_ref()
    }

    pub fn journal(&self) -> &HistoryJournal {
        &self.journal
    }

    fn executor(&self) -> MutationExecutor<'_> {
        MutationExecutor {
            store: self.store.as_ref(),
            journal: self.journal.as_ref(),
            embedder: self.embedder.as_ref(),
            locks: &self.id_locks,
            clock: self.settings.clock,
        }
    }

    /// Turn one utterance into reconciled memory mutations.
    pub async fn add(&self, req: AddRequest, progress: &dyn ProgressSink) -> Result<AddOutcome> {
        if req.scope.is_empty() {
            return Err(MemoryError::Validation(
                "one of user_id, agent_id or run_id is required".to_string(),
            ));
        }
        if req.text.trim().is_empty() {
            return Err(MemoryError::Validation("text is empty".to_string()));
        }
        check_payload(&req.metadata)?;
        let scope_label = req.scope.label();
        let _scope_guard = self.scope_locks.lock(&scope_label).await;
        debug!(scope = %scope_label, text = truncate_str(&req.text, 80), "add request");

        let extracted = self.extractor.extract(&req.text).await?;
        progress.emit(ProgressEvent::FactsExtracted {
            count: extracted.facts.len(),
        });
        if extracted.facts.is_empty() {
            debug!(scope = %scope_label, "nothing to remember");
            return Ok(AddOutcome::nothing_added());
        }
        let facts = extracted.candidates();

        let mut filters = req.filters.clone();
        filters.extend(scope_filters(&req.scope));
        let accumulation = Accumulator {
            embedder: self.embedder.as_ref(),
            store: self.store.as_ref(),
            search_limit: self.settings.search_limit,
            parallel: self.settings.parallel_fact_search,
        }
        .accumulate(&facts, &filters, progress)
        .await?;

        let intents = self.decision.decide(&accumulation.candidates, &facts).await?;
        progress.emit(ProgressEvent::IntentsDecided {
            count: intents.len(),
        });

        let mut metadata = extracted.metadata.to_payload();
        for (k, v) in &req.metadata {
            if RESERVED_KEYS.contains(&k.as_str()) {
                warn!(key = %k, "ignoring reserved key in caller metadata");
                continue;
            }
            metadata.insert(k.clone(), v.clone());
        }
        let ctx = WriteContext {
            scope: req.scope.clone(),
            metadata,
        };

        let report = self
            .executor()
            .execute(
                &intents,
                &accumulation.candidates,
                &ctx,
                &accumulation.embeddings,
                progress,
            )
            .await;
        info!(
            scope = %scope_label,
            facts = facts.len(),
            candidates = accumulation.candidates.len(),
            applied = report.applied.len(),
            skipped = report.skipped.len(),
            "add complete"
        );
        Ok(AddOutcome {
            message: MESSAGE_OK.to_string(),
            details: report.applied,
            skipped: report.skipped,
            noted: report.noted,
        })
    }

    pub async fn get(&self, id: &str) -> Result<Option<MemoryItem>> {
        Ok(self.store.get(id).await?.as_ref().map(MemoryItem::from_record))
    }

    /// Every record under `scope` (all records when `scope` is empty).
    pub async fn get_all(&self, scope: &ScopeIds, limit: Option<usize>) -> Result<Vec<MemoryItem>> {
        let pages = self.store.list(&scope_filters(scope), limit).await?;
        Ok(pages
            .iter()
            .flatten()
            .map(MemoryItem::from_record)
            .collect())
    }

    /// Similarity search.  `min_score` overrides the store's threshold.
    pub async fn search(
        &self,
        query: &str,
        scope: &ScopeIds,
        filters: &Filters,
        limit: usize,
        min_score: Option<f32>,
    ) -> Result<Vec<MemoryItem>> {
        let vector = self.embedder.embed(query).await?;
        let mut filters = filters.clone();
        filters.extend(scope_filters(scope));
        let hits = match min_score {
            Some(min) => self.store.search_scored(&vector, limit, &filters, min).await?,
            None => self.store.search(&vector, limit, &filters).await?,
        };
        Ok(hits.iter().map(MemoryItem::from_scored).collect())
    }

    pub async fn update(&self, id: &str, data: &str) -> Result<AppliedMutation> {
        if data.trim().is_empty() {
            return Err(MemoryError::Validation("text is empty".to_string()));
        }
        self.executor().update_memory(id, data.trim(), &Payload::new()).await
    }

    pub async fn delete(&self, id: &str) -> Result<AppliedMutation> {
        self.executor().delete_memory(id).await
    }

    /// Delete every record under `scope`.  Per-record failures are logged
    /// and skipped; the number of deleted records is returned.
    pub async fn delete_all(&self, scope: &ScopeIds) -> Result<usize> {
        if scope.is_empty() {
            return Err(MemoryError::Validation(
                "delete_all needs at least one of user_id, agent_id or run_id".to_string(),
            ));
        }
        let pages = self.store.list(&scope_filters(scope), None).await?;
        let executor = self.executor();
        let mut deleted = 0usize;
        for record in pages.iter().flatten() {
            match executor.delete_memory(&record.id).await {
                Ok(_) => deleted += 1,
                Err(err) => warn!(memory_id = %record.id, error = %err, "delete_all: skipping record"),
            }
        }
        info!(scope = %scope.label(), deleted, "delete_all complete");
        Ok(deleted)
    }

    pub async fn history(&self, id: &str) -> Result<Vec<HistoryEntry>> {
        self.journal.get_history(id)
    }

    /// Wipe the collection and the journal.
    pub async fn reset(&self) -> Result<()> {
        self.store.delete_col().await?;
        self.journal.reset()?;
        warn!("memory store and history journal reset");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::MutationIntent;
    use crate::extract::FactMetadata;
    use crate::filter::FilterValue;
    use crate::progress::{ChannelProgress, NoopProgress};
    use crate::schema::{HistoryEvent, PayloadValue, content_hash};
    use crate::store::LocalVectorStore;
    use crate::testing::{
        EchoFactExtractor, HashEmbedder, ScriptedDecisionProtocol, StaticFactExtractor,
    };

    fn service_with(
        extractor: Arc<dyn FactExtractor>,
        decision: Arc<ScriptedDecisionProtocol>,
    ) -> MemoryService {
        MemoryService::new(
            Arc::new(LocalVectorStore::in_memory(0.5).unwrap()),
            Arc::new(HistoryJournal::in_memory().unwrap()),
            Arc::new(HashEmbedder::default()),
            extractor,
            decision,
            ServiceSettings::default(),
        )
    }

    fn echo_service(decision: Arc<ScriptedDecisionProtocol>) -> MemoryService {
        service_with(Arc::new(EchoFactExtractor::default()), decision)
    }

    #[tokio::test]
    async fn first_fact_in_empty_store_is_added_once() {
        let decision = Arc::new(ScriptedDecisionProtocol::add_everything());
        let svc = echo_service(decision.clone());

        let outcome = svc
            .add(AddRequest::new("Likes cheese pizza", ScopeIds::user("u1")), &NoopProgress)
            .await
            .unwrap();

        assert_eq!(outcome.message, "ok");
        assert_eq!(outcome.details.len(), 1);
        assert_eq!(outcome.details[0].event, HistoryEvent::Add);
        // Nothing to compare against: the decision saw the fact, no candidates.
        assert!(decision.calls()[0].candidates.is_empty());

        let id = &outcome.details[0].id;
        let item = svc.get(id).await.unwrap().unwrap();
        assert_eq!(item.memory, "Likes cheese pizza");
        assert_eq!(item.hash.as_deref(), Some(content_hash("Likes cheese pizza").as_str()));
        assert_eq!(item.scope.user_id.as_deref(), Some("u1"));
        assert_eq!(svc.history(id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn contradicting_fact_deletes_the_matched_record() {
        let decision = Arc::new(ScriptedDecisionProtocol::new([
            vec![MutationIntent::add("Loves cheese pizza")],
            vec![MutationIntent::delete(0), MutationIntent::add("Dislikes cheese pizza")],
        ]));
        let svc = echo_service(decision.clone());
        let scope = ScopeIds::user("u1");

        let first = svc
            .add(AddRequest::new("Loves cheese pizza", scope.clone()), &NoopProgress)
            .await
            .unwrap();
        let old_id = first.details[0].id.clone();

        let second = svc
            .add(AddRequest::new("Dislikes cheese pizza", scope.clone()), &NoopProgress)
            .await
            .unwrap();

        let shown = &decision.calls()[1].candidates;
        assert_eq!(shown.len(), 1);
        assert_eq!(shown[0].memory_id, old_id);
        assert!(shown[0].score >= 0.5);

        assert_eq!(second.details[0].event, HistoryEvent::Delete);
        assert_eq!(second.details[0].id, old_id);
        assert!(svc.get(&old_id).await.unwrap().is_none());
        let history = svc.history(&old_id).await.unwrap();
        let deletes: Vec<_> = history.iter().filter(|h| h.event == HistoryEvent::Delete).collect();
        assert_eq!(deletes.len(), 1);
        assert!(deletes[0].is_deleted);

        let remaining = svc.get_all(&scope, None).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].memory, "Dislikes cheese pizza");
    }

    #[tokio::test]
    async fn refining_fact_updates_the_matched_record_in_place() {
        let decision = Arc::new(ScriptedDecisionProtocol::new([
            vec![MutationIntent::add("Loves cheese pizza")],
            vec![MutationIntent::update(0, "Loves cheese pizza with extra basil")],
        ]));
        let svc = echo_service(decision);
        let scope = ScopeIds::user("u1");

        let first = svc
            .add(AddRequest::new("Loves cheese pizza", scope.clone()), &NoopProgress)
            .await
            .unwrap();
        let id = first.details[0].id.clone();
        let before = svc.get(&id).await.unwrap().unwrap();

        let second = svc
            .add(AddRequest::new("Loves cheese pizza with basil", scope), &NoopProgress)
            .await
            .unwrap();
        assert_eq!(second.details[0].event, HistoryEvent::Update);
        assert_eq!(second.details[0].previous.as_deref(), Some("Loves cheese pizza"));

        let after = svc.get(&id).await.unwrap().unwrap();
        assert_eq!(after.memory, "Loves cheese pizza with extra basil");
        assert_eq!(after.created_at, before.created_at);
        assert!(after.updated_at.is_some());
    }

    #[tokio::test]
    async fn out_of_range_ordinal_is_skipped_and_the_rest_applies() {
        let decision = Arc::new(ScriptedDecisionProtocol::new([
            vec![
                MutationIntent::add("Loves cheese pizza"),
                MutationIntent::add("Loves cheese fondue"),
                MutationIntent::add("Loves cheese boards"),
            ],
            vec![
                MutationIntent::delete(99),
                MutationIntent::add("Loves cheese toasties"),
            ],
        ]));
        let svc = echo_service(decision.clone());
        let scope = ScopeIds::user("u1");
        svc.add(AddRequest::new("Loves cheese", scope.clone()), &NoopProgress)
            .await
            .unwrap();

        let outcome = svc
            .add(AddRequest::new("Loves cheese", scope.clone()), &NoopProgress)
            .await
            .unwrap();
        assert_eq!(decision.calls()[1].candidates.len(), 3);
        assert_eq!(outcome.message, "ok");
        assert_eq!(outcome.skipped.len(), 1);
        assert!(outcome.skipped[0].reason.contains("99"));
        assert_eq!(outcome.details.len(), 1);
        assert_eq!(outcome.details[0].data, "Loves cheese toasties");
        assert_eq!(svc.get_all(&scope, None).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn empty_extraction_reports_nothing_added() {
        let decision = Arc::new(ScriptedDecisionProtocol::add_everything());
        let svc = service_with(Arc::new(StaticFactExtractor::default()), decision.clone());
        let outcome = svc
            .add(AddRequest::new("hmm", ScopeIds::user("u1")), &NoopProgress)
            .await
            .unwrap();
        assert_eq!(outcome.message, "No memory added");
        assert!(outcome.details.is_empty());
        assert!(decision.calls().is_empty());
    }

    #[tokio::test]
    async fn missing_scope_is_rejected_before_any_work() {
        let decision = Arc::new(ScriptedDecisionProtocol::add_everything());
        let svc = echo_service(decision.clone());
        let err = svc
            .add(AddRequest::new("Likes tea", ScopeIds::default()), &NoopProgress)
            .await
            .unwrap_err();
        assert!(matches!(err, MemoryError::Validation(_)));
        assert!(decision.calls().is_empty());
    }

    #[tokio::test]
    async fn neighbours_from_other_users_are_never_candidates() {
        let decision = Arc::new(ScriptedDecisionProtocol::add_everything());
        let svc = echo_service(decision.clone());
        svc.add(AddRequest::new("Likes cheese pizza", ScopeIds::user("u2")), &NoopProgress)
            .await
            .unwrap();
        svc.add(AddRequest::new("Likes cheese pizza", ScopeIds::user("u1")), &NoopProgress)
            .await
            .unwrap();
        assert!(decision.calls()[1].candidates.is_empty());

        let hits = svc
            .search("Likes cheese pizza", &ScopeIds::user("u1"), &Filters::new(), 10, None)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits.iter().all(|h| h.scope.user_id.as_deref() == Some("u1")));
        assert!(hits[0].score.is_some());
    }

    #[tokio::test]
    async fn extractor_and_caller_metadata_land_on_records() {
        let extractor = EchoFactExtractor {
            metadata: FactMetadata {
                sentiment: Some("positive".into()),
                tags: vec!["food".into()],
                ..FactMetadata::default()
            },
        };
        let svc = service_with(
            Arc::new(extractor),
            Arc::new(ScriptedDecisionProtocol::add_everything()),
        );
        let mut req = AddRequest::new("Likes cheese pizza", ScopeIds::user("u1"));
        req.metadata.insert("source".into(), PayloadValue::from("chat"));
        req.metadata.insert("hash".into(), PayloadValue::from("forged"));
        let outcome = svc.add(req, &NoopProgress).await.unwrap();

        let item = svc.get(&outcome.details[0].id).await.unwrap().unwrap();
        assert_eq!(item.metadata["sentiment"], PayloadValue::from("positive"));
        assert_eq!(item.metadata["tags"], PayloadValue::StringList(vec!["food".into()]));
        assert_eq!(item.metadata["source"], PayloadValue::from("chat"));
        assert_eq!(item.hash.as_deref(), Some(content_hash("Likes cheese pizza").as_str()));

        let tagged = svc
            .search(
                "Likes cheese pizza",
                &ScopeIds::user("u1"),
                &Filters::from([(
                    "tags".to_string(),
                    FilterValue::AnyOf(vec!["travel".into(), "food".into()]),
                )]),
                5,
                None,
            )
            .await
            .unwrap();
        assert_eq!(tagged.len(), 1);
    }

    #[tokio::test]
    async fn progress_reports_each_stage() {
        let svc = echo_service(Arc::new(ScriptedDecisionProtocol::add_everything()));
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        svc.add(
            AddRequest::new("Likes tea", ScopeIds::user("u1")),
            &ChannelProgress::new(tx),
        )
        .await
        .unwrap();
        let mut stages = Vec::new();
        while let Ok(event) = rx.try_recv() {
            stages.push(serde_json::to_value(&event).unwrap()["stage"].as_str().unwrap().to_string());
        }
        assert_eq!(
            stages,
            vec!["facts_extracted", "fact_searched", "intents_decided", "mutation_applied"]
        );
    }

    #[tokio::test]
    async fn direct_update_and_delete_write_history() {
        let svc = echo_service(Arc::new(ScriptedDecisionProtocol::add_everything()));
        let added = svc
            .add(AddRequest::new("Likes tea", ScopeIds::user("u1")), &NoopProgress)
            .await
            .unwrap();
        let id = added.details[0].id.clone();

        svc.update(&id, "Likes green tea").await.unwrap();
        svc.delete(&id).await.unwrap();
        let events: Vec<_> = svc.history(&id).await.unwrap().iter().map(|h| h.event).collect();
        assert_eq!(events, vec![HistoryEvent::Add, HistoryEvent::Update, HistoryEvent::Delete]);
        assert!(matches!(
            svc.update(&id, "again").await,
            Err(MemoryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn delete_all_requires_scope_and_only_touches_it() {
        let svc = echo_service(Arc::new(ScriptedDecisionProtocol::add_everything()));
        for (text, user) in [("Likes tea", "u1"), ("Likes jazz", "u1"), ("Likes tea", "u2")] {
            svc.add(AddRequest::new(text, ScopeIds::user(user)), &NoopProgress)
                .await
                .unwrap();
        }
        assert!(matches!(
            svc.delete_all(&ScopeIds::default()).await,
            Err(MemoryError::Validation(_))
        ));
        assert_eq!(svc.delete_all(&ScopeIds::user("u1")).await.unwrap(), 2);
        assert!(svc.get_all(&ScopeIds::user("u1"), None).await.unwrap().is_empty());
        assert_eq!(svc.get_all(&ScopeIds::user("u2"), None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn reset_wipes_store_and_journal() {
        let svc = echo_service(Arc::new(ScriptedDecisionProtocol::add_everything()));
        svc.add(AddRequest::new("Likes tea", ScopeIds::user("u1")), &NoopProgress)
            .await
            .unwrap();
        svc.reset().await.unwrap();
        assert!(svc.get_all(&ScopeIds::default(), None).await.unwrap().is_empty());
        assert!(svc.journal().is_empty().unwrap());
    }

    #[tokio::test]
    async fn concurrent_updates_to_one_record_both_land_in_history() {
        let svc = Arc::new(echo_service(Arc::new(ScriptedDecisionProtocol::add_everything())));
        let added = svc
            .add(AddRequest::new("Likes tea", ScopeIds::user("u1")), &NoopProgress)
            .await
            .unwrap();
        let id = added.details[0].id.clone();

        let a = {
            let (svc, id) = (svc.clone(), id.clone());
            tokio::spawn(async move { svc.update(&id, "Likes black tea").await })
        };
        let b = {
            let (svc, id) = (svc.clone(), id.clone());
            tokio::spawn(async move { svc.update(&id, "Likes oolong tea").await })
        };
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        let history = svc.history(&id).await.unwrap();
        assert_eq!(history.len(), 3);
        // Serialised per id: each update saw the text the other left behind.
        assert_eq!(history[2].old_value, history[1].new_value);
    }

    #[tokio::test]
    async fn non_finite_metadata_is_rejected_before_any_write() {
        let decision = Arc::new(ScriptedDecisionProtocol::add_everything());
        let svc = echo_service(decision.clone());
        svc.add(AddRequest::new("Likes tea", ScopeIds::user("u2")), &NoopProgress)
            .await
            .unwrap();

        let mut req = AddRequest::new("Likes cheese pizza", ScopeIds::user("u1"));
        req.metadata.insert("score".into(), PayloadValue::Float(f64::NAN));
        let err = svc.add(req, &NoopProgress).await.unwrap_err();
        assert!(matches!(err, MemoryError::Codec { ref key, .. } if key == "score"));
        assert_eq!(decision.calls().len(), 1);

        assert!(svc.get_all(&ScopeIds::user("u1"), None).await.unwrap().is_empty());
        assert_eq!(svc.get_all(&ScopeIds::user("u2"), None).await.unwrap().len(), 1);
        assert_eq!(svc.get_all(&ScopeIds::default(), None).await.unwrap().len(), 1);
    }
}

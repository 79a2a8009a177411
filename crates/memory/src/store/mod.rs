//! Vector-store adapter surface.
//!
//! A backend persists `(vector, payload)` pairs under opaque string ids and
//! answers scored similarity queries under a [`Filters`] map.  Filter
//! semantics are shared by every backend; see [`crate::filter`].

use std::sync::Arc;

use async_trait::async_trait;
use recollect_config::{VectorStoreConfig, VectorStoreProvider};

use crate::codec::check_payload;
use crate::error::{MemoryError, Result};
use crate::filter::Filters;
use crate::schema::{MemoryRecord, Payload, ScoredRecord};

pub mod local;
#[cfg(feature = "qdrant")]
pub mod qdrant;

pub use local::LocalVectorStore;
#[cfg(feature = "qdrant")]
pub use qdrant::QdrantStore;

#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Short backend label for log lines.
    fn name(&self) -> &'static str;

    /// Minimum similarity [`VectorStore::search`] applies.
    fn default_score_threshold(&self) -> f32;

    /// Bulk upsert.  `vectors`, `ids` and `payloads` are paired by position.
    async fn insert(
        &self,
        vectors: Vec<Vec<f32>>,
        ids: Vec<String>,
        payloads: Vec<Payload>,
    ) -> Result<()>;

    /// Up to `limit` hits scoped by `filters`, best first, none scoring
    /// below `min_score`.
    async fn search_scored(
        &self,
        query: &[f32],
        limit: usize,
        filters: &Filters,
        min_score: f32,
    ) -> Result<Vec<ScoredRecord>>;

    async fn search(
        &self,
        query: &[f32],
        limit: usize,
        filters: &Filters,
    ) -> Result<Vec<ScoredRecord>> {
        self.search_scored(query, limit, filters, self.default_score_threshold())
            .await
    }

    async fn get(&self, id: &str) -> Result<Option<MemoryRecord>>;

    /// Replace the vector and/or payload of an existing record.
    /// Fails with [`MemoryError::NotFound`] when `id` is unknown.
    async fn update(&self, id: &str, vector: Option<Vec<f32>>, payload: Option<Payload>)
    -> Result<()>;

    /// Deleting an unknown id is a no-op.
    async fn delete(&self, id: &str) -> Result<()>;

    /// Records matching `filters`, in pages.  Embeddings are not returned.
    async fn list(&self, filters: &Filters, limit: Option<usize>) -> Result<Vec<Vec<MemoryRecord>>>;

    /// Drop the whole collection.
    async fn delete_col(&self) -> Result<()>;
}

/// Check the positional pairing contract of [`VectorStore::insert`] and that
/// every payload can be persisted.
pub(crate) fn check_insert_shape(vectors: &[Vec<f32>], ids: &[String], payloads: &[Payload]) -> Result<()> {
    if vectors.len() != ids.len() || ids.len() != payloads.len() {
        return Err(MemoryError::StoreWrite(format!(
            "insert expects paired inputs, got {} vectors, {} ids, {} payloads",
            vectors.len(),
            ids.len(),
            payloads.len()
        )));
    }
    payloads.iter().try_for_each(check_payload)
}

/// Open the backend selected by `cfg`.
pub async fn open_vector_store(cfg: &VectorStoreConfig) -> Result<Arc<dyn VectorStore>> {
    match cfg.provider {
        VectorStoreProvider::Local => {
            let store = if cfg.path.trim().is_empty() {
                LocalVectorStore::in_memory(cfg.score_threshold)?
            } else {
                LocalVectorStore::open(&cfg.path, cfg.score_threshold)?
            };
            Ok(Arc::new(store))
        }
        #[cfg(feature = "qdrant")]
        VectorStoreProvider::Qdrant => {
            let store = QdrantStore::connect(
                &cfg.url,
                &cfg.collection_name,
                cfg.embedding_dims,
                cfg.score_threshold,
            )
            .await?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "qdrant"))]
        VectorStoreProvider::Qdrant => Err(MemoryError::Validation(
            "vector_store.provider = \"qdrant\" requires building with the `qdrant` feature".to_string(),
        )),
    }
}

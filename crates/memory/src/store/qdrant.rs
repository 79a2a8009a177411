//! Qdrant backend (cargo feature `qdrant`).
//!
//! Opaque ids are mapped onto qdrant's native point ids.  Only canonical
//! spellings map natively: a decimal without sign or leading zeros becomes a
//! numeric id and a lowercase hyphenated UUID stays a UUID.  Any other key is
//! hashed into a stable UUID with the caller's key kept in the payload under
//! `_key`, so results always carry the id the caller used and two spellings
//! of one number never share a point.

use std::collections::HashMap;

use async_trait::async_trait;
use qdrant_client::Qdrant;
use qdrant_client::qdrant::point_id::PointIdOptions;
use qdrant_client::qdrant::{
    Condition, CreateCollectionBuilder, DeletePointsBuilder, Distance, Filter, GetPointsBuilder,
    PointId, PointStruct, PointVectors, PointsIdsList, Range, RetrievedPoint, ScrollPointsBuilder,
    SearchPointsBuilder, SetPayloadPointsBuilder, UpdatePointVectorsBuilder, UpsertPointsBuilder,
    Value, VectorParamsBuilder,
};
use sha2::{Digest, Sha256};
use tracing::{debug, info};
use uuid::Uuid;

use super::{VectorStore, check_insert_shape};
use crate::codec::check_payload;
use crate::codec::qdrant::{payload_from_qdrant, payload_to_qdrant, value_to_qdrant};
use crate::error::{MemoryError, Result};
use crate::filter::{Clause, Filters, Predicate};
use crate::schema::{MemoryRecord, Payload, PayloadValue, ScoredRecord};

/// Payload key holding the caller's original id for hashed string keys.
const KEY_ORIGINAL_ID: &str = "_key";

/// Points requested per scroll call when walking the collection.
const SCROLL_PAGE: u32 = 256;

fn read_err(err: impl std::fmt::Display) -> MemoryError {
    MemoryError::StoreRead(err.to_string())
}

fn write_err(err: impl std::fmt::Display) -> MemoryError {
    MemoryError::StoreWrite(err.to_string())
}

pub struct QdrantStore {
    client: Qdrant,
    collection: String,
    dims: u64,
    score_threshold: f32,
}

impl QdrantStore {
    /// Connect and make sure the collection exists.  `delete_col` drops and
    /// recreates it, so the store stays usable after a wipe.
    pub async fn connect(
        url: &str,
        collection: &str,
        dims: u64,
        score_threshold: f32,
    ) -> Result<Self> {
        let client = Qdrant::from_url(url).build().map_err(read_err)?;
        let store = Self {
            client,
            collection: collection.to_string(),
            dims,
            score_threshold,
        };
        store.ensure_collection().await?;
        Ok(store)
    }

    async fn ensure_collection(&self) -> Result<()> {
        let exists = self
            .client
            .collection_exists(&self.collection)
            .await
            .map_err(read_err)?;
        if !exists {
            self.client
                .create_collection(
                    CreateCollectionBuilder::new(&self.collection)
                        .vectors_config(VectorParamsBuilder::new(self.dims, Distance::Cosine)),
                )
                .await
                .map_err(write_err)?;
            info!(collection = %self.collection, dims = self.dims, "created qdrant collection");
        }
        Ok(())
    }

    fn decode_payload(raw: &HashMap<String, Value>) -> Result<(Option<String>, Payload)> {
        let mut payload = payload_from_qdrant(raw)?;
        let original = match payload.remove(KEY_ORIGINAL_ID) {
            Some(PayloadValue::String(key)) => Some(key),
            _ => None,
        };
        Ok((original, payload))
    }

    fn decode_retrieved(point: &RetrievedPoint) -> Result<MemoryRecord> {
        let (original, payload) = Self::decode_payload(&point.payload)?;
        Ok(MemoryRecord {
            id: original.unwrap_or_else(|| point_id_to_string(point.id.as_ref())),
            embedding: None,
            payload,
        })
    }

    fn encode_payload(id: &str, payload: &Payload) -> HashMap<String, Value> {
        let mut raw = payload_to_qdrant(payload);
        if native_point_id(id).1 {
            raw.insert(
                KEY_ORIGINAL_ID.to_string(),
                value_to_qdrant(&PayloadValue::from(id)),
            );
        }
        raw
    }

    fn encode_point(id: &str, vector: Vec<f32>, payload: &Payload) -> PointStruct {
        let (point_id, _) = native_point_id(id);
        PointStruct::new(point_id, vector, Self::encode_payload(id, payload))
    }

    async fn fetch(&self, id: &str) -> Result<Option<RetrievedPoint>> {
        let (point_id, _) = native_point_id(id);
        let resp = self
            .client
            .get_points(
                GetPointsBuilder::new(&self.collection, vec![point_id])
                    .with_payload(true)
                    .with_vectors(false),
            )
            .await
            .map_err(read_err)?;
        Ok(resp.result.into_iter().next())
    }

    async fn scroll_page(
        &self,
        filter: Option<&Filter>,
        offset: Option<PointId>,
        size: u32,
    ) -> Result<(Vec<MemoryRecord>, Option<PointId>)> {
        let mut request = ScrollPointsBuilder::new(&self.collection)
            .with_payload(true)
            .with_vectors(false)
            .limit(size);
        if let Some(filter) = filter {
            request = request.filter(filter.clone());
        }
        if let Some(offset) = offset {
            request = request.offset(offset);
        }
        let resp = self.client.scroll(request).await.map_err(read_err)?;
        let records = resp
            .result
            .iter()
            .map(Self::decode_retrieved)
            .collect::<Result<Vec<_>>>()?;
        Ok((records, resp.next_page_offset))
    }
}

/// Follow a scroll cursor until it runs out or `limit` records are in hand.
/// Each fetched page is kept as one page of the result; an empty walk yields
/// a single empty page.
async fn scroll_pages<F, Fut>(
    limit: Option<usize>,
    page_size: u32,
    mut fetch: F,
) -> Result<Vec<Vec<MemoryRecord>>>
where
    F: FnMut(Option<PointId>, u32) -> Fut,
    Fut: Future<Output = Result<(Vec<MemoryRecord>, Option<PointId>)>>,
{
    let mut pages = Vec::new();
    let mut taken = 0usize;
    let mut offset = None;
    loop {
        let size = match limit {
            Some(cap) => match cap.saturating_sub(taken) {
                0 => break,
                left => left.min(page_size as usize) as u32,
            },
            None => page_size,
        };
        let (records, next) = fetch(offset.take(), size).await?;
        if records.is_empty() {
            break;
        }
        taken += records.len();
        pages.push(records);
        match next {
            Some(next) => offset = Some(next),
            None => break,
        }
    }
    if pages.is_empty() {
        pages.push(Vec::new());
    }
    Ok(pages)
}

/// Map an opaque id onto a qdrant point id.  The flag is `true` when the id
/// had to be hashed.
pub fn native_point_id(id: &str) -> (PointId, bool) {
    if let Some(num) = id.parse::<u64>().ok().filter(|n| n.to_string() == id) {
        return (PointId::from(num), false);
    }
    if let Some(uuid) = Uuid::parse_str(id)
        .ok()
        .filter(|u| u.hyphenated().to_string() == id)
    {
        return (PointId::from(uuid.to_string()), false);
    }
    let digest = Sha256::digest(id.as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    let uuid = uuid::Builder::from_random_bytes(bytes).into_uuid();
    (PointId::from(uuid.to_string()), true)
}

fn point_id_to_string(id: Option<&PointId>) -> String {
    match id.and_then(|p| p.point_id_options.as_ref()) {
        Some(PointIdOptions::Num(n)) => n.to_string(),
        Some(PointIdOptions::Uuid(u)) => u.clone(),
        None => String::new(),
    }
}

/// Numbers compare by value whether stored as int or float, so both become
/// a closed range on the single point.
fn clause_condition(key: &str, value: &PayloadValue) -> Condition {
    let exactly = |n: f64| {
        Condition::range(
            key,
            Range {
                gte: Some(n),
                lte: Some(n),
                ..Default::default()
            },
        )
    };
    match value {
        PayloadValue::String(s) => Condition::matches(key, s.clone()),
        PayloadValue::Int(i) => exactly(*i as f64),
        PayloadValue::Bool(b) => Condition::matches(key, *b),
        PayloadValue::Float(f) => exactly(*f),
        PayloadValue::StringList(items) => Condition::matches(key, items.clone()),
    }
}

/// `must` per key; a list-valued key becomes a nested `should` folded into
/// the same `must`.
pub fn to_native_filter(predicate: &Predicate) -> Option<Filter> {
    if predicate.is_empty() {
        return None;
    }
    let must: Vec<Condition> = predicate
        .must
        .iter()
        .map(|clause| match clause {
            Clause::Match { key, value } => clause_condition(key, value),
            Clause::AnyOf { key, values } => Condition::from(Filter::should(
                values.iter().map(|v| clause_condition(key, v)),
            )),
        })
        .collect();
    Some(Filter::must(must))
}

#[async_trait]
impl VectorStore for QdrantStore {
    fn name(&self) -> &'static str {
        "qdrant"
    }

    fn default_score_threshold(&self) -> f32 {
        self.score_threshold
    }

    async fn insert(
        &self,
        vectors: Vec<Vec<f32>>,
        ids: Vec<String>,
        payloads: Vec<Payload>,
    ) -> Result<()> {
        check_insert_shape(&vectors, &ids, &payloads)?;
        let points: Vec<PointStruct> = vectors
            .into_iter()
            .zip(ids.iter())
            .zip(payloads.iter())
            .map(|((vector, id), payload)| Self::encode_point(id, vector, payload))
            .collect();
        let count = points.len();
        self.client
            .upsert_points(UpsertPointsBuilder::new(&self.collection, points).wait(true))
            .await
            .map_err(write_err)?;
        debug!(count, collection = %self.collection, "upserted points");
        Ok(())
    }

    async fn search_scored(
        &self,
        query: &[f32],
        limit: usize,
        filters: &Filters,
        min_score: f32,
    ) -> Result<Vec<ScoredRecord>> {
        let mut request = SearchPointsBuilder::new(&self.collection, query.to_vec(), limit as u64)
            .with_payload(true)
            .score_threshold(min_score);
        if let Some(filter) = to_native_filter(&Predicate::translate(filters)) {
            request = request.filter(filter);
        }
        let resp = self.client.search_points(request).await.map_err(read_err)?;
        resp.result
            .iter()
            .map(|hit| {
                let (original, payload) = Self::decode_payload(&hit.payload)?;
                Ok(ScoredRecord {
                    id: original.unwrap_or_else(|| point_id_to_string(hit.id.as_ref())),
                    score: hit.score,
                    payload,
                })
            })
            .collect()
    }

    async fn get(&self, id: &str) -> Result<Option<MemoryRecord>> {
        match self.fetch(id).await? {
            Some(point) => Ok(Some(Self::decode_retrieved(&point)?)),
            None => Ok(None),
        }
    }

    async fn update(
        &self,
        id: &str,
        vector: Option<Vec<f32>>,
        payload: Option<Payload>,
    ) -> Result<()> {
        if let Some(payload) = &payload {
            check_payload(payload)?;
        }
        if self.fetch(id).await?.is_none() {
            return Err(MemoryError::NotFound(id.to_string()));
        }
        let (point_id, _) = native_point_id(id);
        match (vector, payload) {
            (Some(vector), Some(payload)) => {
                self.client
                    .upsert_points(
                        UpsertPointsBuilder::new(
                            &self.collection,
                            vec![Self::encode_point(id, vector, &payload)],
                        )
                        .wait(true),
                    )
                    .await
                    .map_err(write_err)?;
            }
            (Some(vector), None) => {
                let point = PointVectors {
                    id: Some(point_id),
                    vectors: Some(vector.into()),
                };
                self.client
                    .update_vectors(
                        UpdatePointVectorsBuilder::new(&self.collection, vec![point]).wait(true),
                    )
                    .await
                    .map_err(write_err)?;
            }
            (None, Some(payload)) => {
                let raw = Self::encode_payload(id, &payload);
                self.client
                    .overwrite_payload(
                        SetPayloadPointsBuilder::new(&self.collection, qdrant_client::Payload::from(raw))
                            .points_selector(PointsIdsList { ids: vec![point_id] })
                            .wait(true),
                    )
                    .await
                    .map_err(write_err)?;
            }
            (None, None) => {}
        }
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let (point_id, _) = native_point_id(id);
        self.client
            .delete_points(
                DeletePointsBuilder::new(&self.collection)
                    .points(PointsIdsList { ids: vec![point_id] })
                    .wait(true),
            )
            .await
            .map_err(write_err)?;
        Ok(())
    }

    async fn list(&self, filters: &Filters, limit: Option<usize>) -> Result<Vec<Vec<MemoryRecord>>> {
        let filter = to_native_filter(&Predicate::translate(filters));
        let filter = filter.as_ref();
        let store = self;
        let pages = scroll_pages(limit, SCROLL_PAGE, move |offset, size| {
            store.scroll_page(filter, offset, size)
        })
        .await?;
        debug!(
            pages = pages.len(),
            collection = %self.collection,
            "scrolled points"
        );
        Ok(pages)
    }

    async fn delete_col(&self) -> Result<()> {
        self.client
            .delete_collection(&self.collection)
            .await
            .map_err(write_err)?;
        info!(collection = %self.collection, "qdrant collection dropped");
        self.ensure_collection().await
    }
}

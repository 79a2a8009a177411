//! Embedded vector store backed by [`redb`].
//!
//! Points are kept in a single table keyed by id.  Search is a brute-force
//! cosine scan with the shared filter predicate applied in-process, which is
//! fine for the per-user memory volumes this backend targets.  A small
//! [`lru`] cache sits in front of `get`.
//!
//! # Tables
//!
//! | Name     | Key         | Value                          |
//! |----------|-------------|--------------------------------|
//! | `points` | id (&str)   | JSON-encoded [`StoredPoint`]   |

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use lru::LruCache;
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{VectorStore, check_insert_shape};
use crate::codec::check_payload;
use crate::error::{MemoryError, Result};
use crate::filter::{Filters, Predicate};
use crate::schema::{MemoryRecord, Payload, ScoredRecord};

const POINTS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("points");

/// Number of decoded records held in the `get` cache.
const LRU_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredPoint {
    vector: Vec<f32>,
    payload: Payload,
}

fn read_err(err: impl std::fmt::Display) -> MemoryError {
    MemoryError::StoreRead(err.to_string())
}

fn write_err(err: impl std::fmt::Display) -> MemoryError {
    MemoryError::StoreWrite(err.to_string())
}

pub struct LocalVectorStore {
    db: Database,
    path: Option<PathBuf>,
    score_threshold: f32,
    cache: Mutex<LruCache<String, MemoryRecord>>,
}

impl LocalVectorStore {
    /// Open or create the store file at `path`.
    pub fn open(path: impl AsRef<Path>, score_threshold: f32) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(write_err)?;
        }
        let db = Database::create(&path)
            .map_err(|e| write_err(format!("opening {}: {e}", path.display())))?;
        Self::from_db(db, Some(path), score_threshold)
    }

    /// A store that lives only as long as the value.
    pub fn in_memory(score_threshold: f32) -> Result<Self> {
        let db = Database::builder()
            .create_with_backend(redb::backends::InMemoryBackend::new())
            .map_err(write_err)?;
        Self::from_db(db, None, score_threshold)
    }

    fn from_db(db: Database, path: Option<PathBuf>, score_threshold: f32) -> Result<Self> {
        let store = Self {
            db,
            path,
            score_threshold,
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(LRU_CAPACITY).unwrap_or(NonZeroUsize::MIN),
            )),
        };
        store.ensure_table()?;
        Ok(store)
    }

    fn ensure_table(&self) -> Result<()> {
        let tx = self.db.begin_write().map_err(write_err)?;
        tx.open_table(POINTS_TABLE).map_err(write_err)?;
        tx.commit().map_err(write_err)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Number of stored points.
    pub fn len(&self) -> Result<usize> {
        let tx = self.db.begin_read().map_err(read_err)?;
        let tbl = tx.open_table(POINTS_TABLE).map_err(read_err)?;
        Ok(tbl.len().map_err(read_err)? as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    fn cache(&self) -> std::sync::MutexGuard<'_, LruCache<String, MemoryRecord>> {
        self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn load(&self, id: &str) -> Result<Option<StoredPoint>> {
        let tx = self.db.begin_read().map_err(read_err)?;
        let tbl = tx.open_table(POINTS_TABLE).map_err(read_err)?;
        match tbl.get(id).map_err(read_err)? {
            None => Ok(None),
            Some(v) => Ok(Some(serde_json::from_slice(v.value()).map_err(read_err)?)),
        }
    }

    fn write_points(&self, points: &[(&str, &StoredPoint)]) -> Result<()> {
        let tx = self.db.begin_write().map_err(write_err)?;
        {
            let mut tbl = tx.open_table(POINTS_TABLE).map_err(write_err)?;
            for (id, point) in points {
                let bytes = serde_json::to_vec(point).map_err(write_err)?;
                tbl.insert(*id, bytes.as_slice()).map_err(write_err)?;
            }
        }
        tx.commit().map_err(write_err)
    }

    /// Decode every point, keeping those accepted by `keep`.
    fn scan(&self, mut keep: impl FnMut(&str, &StoredPoint) -> bool) -> Result<Vec<(String, StoredPoint)>> {
        let tx = self.db.begin_read().map_err(read_err)?;
        let tbl = tx.open_table(POINTS_TABLE).map_err(read_err)?;
        let mut out = Vec::new();
        for row in tbl.iter().map_err(read_err)? {
            let (k, v) = row.map_err(read_err)?;
            let point: StoredPoint = serde_json::from_slice(v.value()).map_err(read_err)?;
            if keep(k.value(), &point) {
                out.push((k.value().to_string(), point));
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl VectorStore for LocalVectorStore {
    fn name(&self) -> &'static str {
        "local"
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
        let points: Vec<StoredPoint> = vectors
            .into_iter()
            .zip(payloads)
            .map(|(vector, payload)| StoredPoint { vector, payload })
            .collect();
        let pairs: Vec<(&str, &StoredPoint)> =
            ids.iter().map(String::as_str).zip(points.iter()).collect();
        self.write_points(&pairs)?;

        let mut cache = self.cache();
        for id in &ids {
            cache.pop(id);
        }
        debug!(count = ids.len(), "inserted points into local store");
        Ok(())
    }

    async fn search_scored(
        &self,
        query: &[f32],
        limit: usize,
        filters: &Filters,
        min_score: f32,
    ) -> Result<Vec<ScoredRecord>> {
        let predicate = Predicate::translate(filters);
        let mut hits: Vec<ScoredRecord> = self
            .scan(|_, point| predicate.matches(&point.payload))?
            .into_iter()
            .map(|(id, point)| ScoredRecord {
                score: cosine_similarity(&point.vector, query),
                id,
                payload: point.payload,
            })
            .filter(|hit| hit.score >= min_score)
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(limit);
        Ok(hits)
    }

    async fn get(&self, id: &str) -> Result<Option<MemoryRecord>> {
        // Held across the read so a writer's invalidation, which runs after
        // its commit, cannot land between our load and our put.
        let mut cache = self.cache();
        if let Some(hit) = cache.get(id) {
            return Ok(Some(hit.clone()));
        }
        let Some(point) = self.load(id)? else {
            return Ok(None);
        };
        let record = MemoryRecord {
            id: id.to_string(),
            embedding: Some(point.vector),
            payload: point.payload,
        };
        cache.put(id.to_string(), record.clone());
        Ok(Some(record))
    }

    async fn update(
        &self,
        id: &str,
        vector: Option<Vec<f32>>,
        payload: Option<Payload>,
    ) -> Result<()> {
        let mut point = self
            .load(id)?
            .ok_or_else(|| MemoryError::NotFound(id.to_string()))?;
        if let Some(vector) = vector {
            point.vector = vector;
        }
        if let Some(payload) = payload {
            check_payload(&payload)?;
            point.payload = payload;
        }
        self.write_points(&[(id, &point)])?;
        self.cache().pop(id);
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let tx = self.db.begin_write().map_err(write_err)?;
        {
            let mut tbl = tx.open_table(POINTS_TABLE).map_err(write_err)?;
            tbl.remove(id).map_err(write_err)?;
        }
        tx.commit().map_err(write_err)?;
        self.cache().pop(id);
        Ok(())
    }

    async fn list(&self, filters: &Filters, limit: Option<usize>) -> Result<Vec<Vec<MemoryRecord>>> {
        let predicate = Predicate::translate(filters);
        let cap = limit.unwrap_or(usize::MAX);
        let mut taken = 0usize;
        let records = self
            .scan(|_, point| {
                if taken < cap && predicate.matches(&point.payload) {
                    taken += 1;
                    true
                } else {
                    false
                }
            })?
            .into_iter()
            .map(|(id, point)| MemoryRecord {
                id,
                embedding: None,
                payload: point.payload,
            })
            .collect();
        Ok(vec![records])
    }

    async fn delete_col(&self) -> Result<()> {
        let tx = self.db.begin_write().map_err(write_err)?;
        tx.delete_table(POINTS_TABLE).map_err(write_err)?;
        tx.open_table(POINTS_TABLE).map_err(write_err)?;
        tx.commit().map_err(write_err)?;
        self.cache().clear();
        debug!("local store collection dropped");
        Ok(())
    }
}

/// Cosine similarity clamped to `[0, 1]`; mismatched or zero vectors score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }
    (dot / (mag_a * mag_b)).clamp(0.0, 1.0)
}

//! In-process vector index and nearest-neighbour search.
//!
//! Embeddings live in the `content_embedding` blob column; this index
//! mirrors them in memory so kNN probes don't deserialize blobs per query.
//! If the index cannot be built at startup the store falls back to an
//! exact cosine scan over the table and reports `brute_force_fallback()`.

use chrono::{DateTime, Utc};
use std::collections::HashMap;

use super::*;
use crate::ai::{bytes_to_embedding, cosine};

pub(super) struct VecEntry {
    pub emb: Vec<f32>,
    pub mem_type: MemoryType,
    pub archived: bool,
    pub created_at: DateTime<Utc>,
}

pub(super) struct VecIndex {
    entries: HashMap<i64, VecEntry>,
}

impl VecIndex {
    pub(super) fn new() -> Self {
        Self { entries: HashMap::new() }
    }
}

/// Candidate filter for kNN probes.
#[derive(Debug, Default, Clone, Copy)]
pub struct KnnFilter {
    pub mem_type: Option<MemoryType>,
    pub exclude_id: Option<i64>,
    pub include_archived: bool,
    pub since: Option<DateTime<Utc>>,
}

impl KnnFilter {
    fn admits(&self, id: i64, mem_type: MemoryType, archived: bool, created_at: DateTime<Utc>) -> bool {
        if self.exclude_id == Some(id) {
            return false;
        }
        if archived && !self.include_archived {
            return false;
        }
        if let Some(t) = self.mem_type {
            if t != mem_type {
                return false;
            }
        }
        if let Some(bound) = self.since {
            if created_at < bound {
                return false;
            }
        }
        true
    }
}

impl MemoryDB {
    /// Load all stored embeddings into the index. Returns false when the
    /// index could not be built; callers then run brute-force scans.
    pub(super) fn load_vec_index(&self) -> bool {
        let rows = match self.embedding_rows() {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, "vector index load failed");
                return false;
            }
        };
        let Ok(mut idx) = self.vec_index.write() else {
            return false;
        };
        idx.entries.clear();
        let count = rows.len();
        for (id, entry) in rows {
            idx.entries.insert(id, entry);
        }
        tracing::debug!(count, "vector index loaded");
        true
    }

    fn embedding_rows(&self) -> Result<Vec<(i64, VecEntry)>, EngramError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, type, archived, created_at, content_embedding \
             FROM memories WHERE content_embedding IS NOT NULL",
        )?;
        let rows = stmt
            .query_map([], |r| {
                let type_str: String = r.get(1)?;
                let blob: Vec<u8> = r.get(4)?;
                Ok((
                    r.get::<_, i64>(0)?,
                    VecEntry {
                        emb: bytes_to_embedding(&blob),
                        mem_type: type_str.parse().unwrap_or(MemoryType::Fact),
                        archived: r.get::<_, i64>(2)? != 0,
                        created_at: r.get(3)?,
                    },
                ))
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    pub(super) fn vec_put(
        &self,
        id: i64,
        emb: Vec<f32>,
        mem_type: MemoryType,
        archived: bool,
        created_at: DateTime<Utc>,
    ) {
        if let Ok(mut idx) = self.vec_index.write() {
            idx.entries.insert(id, VecEntry { emb, mem_type, archived, created_at });
        }
    }

    pub(super) fn vec_remove(&self, id: i64) {
        if let Ok(mut idx) = self.vec_index.write() {
            idx.entries.remove(&id);
        }
    }

    pub(super) fn vec_set_archived(&self, id: i64, archived: bool) {
        if let Ok(mut idx) = self.vec_index.write() {
            if let Some(entry) = idx.entries.get_mut(&id) {
                entry.archived = archived;
            }
        }
    }

    /// k nearest neighbours by cosine distance (`1 − cosine`), ascending.
    /// Degrades to an exact scan over stored blobs when the index is
    /// unavailable, and to an empty result when even that fails — callers
    /// treat an empty probe as "no neighbours", never as an error.
    pub fn knn(&self, query: &[f32], k: usize, filter: KnnFilter) -> Vec<(i64, f64)> {
        if k == 0 {
            return vec![];
        }
        if !self.brute_force_fallback() {
            if let Ok(idx) = self.vec_index.read() {
                let mut scored: Vec<(i64, f64)> = idx
                    .entries
                    .iter()
                    .filter(|(&id, e)| filter.admits(id, e.mem_type, e.archived, e.created_at))
                    .map(|(&id, e)| (id, 1.0 - cosine(query, &e.emb).unwrap_or(0.0)))
                    .collect();
                scored.sort_by(|a, b| {
                    a.1.partial_cmp(&b.1)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then_with(|| a.0.cmp(&b.0))
                });
                scored.truncate(k);
                return scored;
            }
        }

        // Exact scan straight off the table.
        let rows = match self.embedding_rows() {
            Ok(r) => r,
            Err(e) => {
                tracing::debug!(error = %e, "knn brute-force scan failed");
                return vec![];
            }
        };
        let mut scored: Vec<(i64, f64)> = rows
            .into_iter()
            .filter(|(id, e)| filter.admits(*id, e.mem_type, e.archived, e.created_at))
            .map(|(id, e)| (id, 1.0 - cosine(query, &e.emb).unwrap_or(0.0)))
            .collect();
        scored.sort_by(|a, b| {
            a.1.partial_cmp(&b.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        scored.truncate(k);
        scored
    }

    /// Every non-archived memory that has an embedding, ascending id.
    /// Drives the consolidation merge pass and the duplicate diagnostics.
    pub fn all_with_embeddings(&self) -> Result<Vec<(Memory, Vec<f32>)>, EngramError> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {MEMORY_COLS}, content_embedding FROM memories \
             WHERE archived = 0 AND content_embedding IS NOT NULL ORDER BY id ASC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows: Vec<(Memory, Vec<f32>)> = stmt
            .query_map([], |r| {
                let mem = row_to_memory(r)?;
                let blob: Vec<u8> = r.get("content_embedding")?;
                Ok((mem, bytes_to_embedding(&blob)))
            })?
            .filter_map(|r| r.map_err(|e| tracing::warn!("row parse: {e}")).ok())
            .collect();
        Ok(rows)
    }
}

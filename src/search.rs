//! Retrieval primitives: semantic kNN, lexical BM25, and hybrid fusion
//! with optional cross-encoder reranking and link-graph expansion.

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::ai::{self, Embedder};
use crate::db::{KnnFilter, Memory, MemoryDB, MemoryType};
use crate::error::EngramError;
use crate::thresholds::RRF_K;
use crate::write::embed_text;

/// Score appended to results reached only through the link graph.
pub const EXPANSION_SCORE: f64 = -1.0;

#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    #[serde(flatten)]
    pub memory: Memory,
    pub score: f64,
}

#[derive(Debug, Clone)]
pub struct SemanticOptions {
    pub k: usize,
    pub mem_type: Option<MemoryType>,
    pub since: Option<DateTime<Utc>>,
    pub include_archived: bool,
}

impl Default for SemanticOptions {
    fn default() -> Self {
        Self { k: 10, mem_type: None, since: None, include_archived: false }
    }
}

/// Embed the query and probe the vector index, over-fetching 2·k before
/// the final truncation.
pub async fn search_semantic(
    db: &MemoryDB,
    embedder: &dyn Embedder,
    query: &str,
    opts: &SemanticOptions,
) -> Result<Vec<SearchHit>, EngramError> {
    if query.trim().is_empty() {
        return Err(EngramError::EmptyQuery);
    }
    let emb = embedder.embed(query).await?;
    let pairs = db.knn(
        &emb,
        opts.k * 2,
        KnnFilter {
            mem_type: opts.mem_type,
            include_archived: opts.include_archived,
            since: opts.since,
            exclude_id: None,
        },
    );
    let mut hits = Vec::with_capacity(pairs.len());
    for (id, distance) in pairs {
        if let Some(memory) = db.get(id)? {
            hits.push(SearchHit { memory, score: 1.0 - distance });
        }
    }
    hits.truncate(opts.k);
    Ok(hits)
}

/// BM25 keyword search; archived rows never match.
pub fn search_lexical(
    db: &MemoryDB,
    query: &str,
    k: usize,
    mem_type: Option<MemoryType>,
    since: Option<DateTime<Utc>>,
) -> Result<Vec<SearchHit>, EngramError> {
    if query.trim().is_empty() {
        return Err(EngramError::EmptyQuery);
    }
    let pairs = db.fts_search(query, k, mem_type, since);
    let mut hits = Vec::with_capacity(pairs.len());
    for (id, score) in pairs {
        if let Some(memory) = db.get(id)? {
            hits.push(SearchHit { memory, score });
        }
    }
    Ok(hits)
}

#[derive(Debug, Clone)]
pub struct HybridOptions {
    pub k: usize,
    pub mem_type: Option<MemoryType>,
    pub since: Option<DateTime<Utc>>,
    pub rrf_k: f64,
    pub rerank: bool,
    pub hops: usize,
    /// Hard cap on result size after graph expansion; defaults to `k`.
    pub max_total: Option<usize>,
}

impl Default for HybridOptions {
    fn default() -> Self {
        Self {
            k: 10,
            mem_type: None,
            since: None,
            rrf_k: RRF_K,
            rerank: false,
            hops: 0,
            max_total: None,
        }
    }
}

/// Importance/strength prior multiplied into each RRF contribution.
fn quality_boost(m: &Memory) -> f64 {
    1.0 + 0.1 * (m.importance - 0.5) + 0.05 * (m.strength - 0.5)
}

/// Hybrid retrieval: both lists are over-fetched at `max(3k, 20)`, fused
/// by reciprocal rank, optionally reranked by the cross-encoder, then
/// optionally expanded along the link graph. Expansion runs even when
/// reranking is on.
pub async fn search_hybrid(
    db: &MemoryDB,
    embedder: &dyn Embedder,
    query: &str,
    opts: &HybridOptions,
) -> Result<Vec<SearchHit>, EngramError> {
    if query.trim().is_empty() {
        return Err(EngramError::EmptyQuery);
    }
    let fetch = (3 * opts.k).max(20);

    let semantic = search_semantic(
        db,
        embedder,
        query,
        &SemanticOptions {
            k: fetch,
            mem_type: opts.mem_type,
            since: opts.since,
            include_archived: false,
        },
    )
    .await?;
    let lexical = search_lexical(db, query, fetch, opts.mem_type, opts.since)?;

    // Reciprocal rank fusion, contributions weighted by the quality prior.
    // First-seen order is kept so equal scores stay stable.
    let mut order: Vec<i64> = Vec::new();
    let mut by_id: HashMap<i64, Memory> = HashMap::new();
    let mut scores: HashMap<i64, f64> = HashMap::new();
    for list in [&semantic, &lexical] {
        for (rank, hit) in list.iter().enumerate() {
            let id = hit.memory.id;
            let boost = quality_boost(&hit.memory);
            let contribution = boost / (opts.rrf_k + rank as f64 + 1.0);
            *scores.entry(id).or_insert(0.0) += contribution;
            if !by_id.contains_key(&id) {
                order.push(id);
                by_id.insert(id, hit.memory.clone());
            }
        }
    }

    let mut fused: Vec<SearchHit> = order
        .into_iter()
        .filter_map(|id| {
            let memory = by_id.remove(&id)?;
            Some(SearchHit { score: scores.get(&id).copied().unwrap_or(0.0), memory })
        })
        .collect();
    fused.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

    let mut results = if opts.rerank && !fused.is_empty() {
        let width = (2 * opts.k).max(10).min(fused.len());
        let candidates = &fused[..width];
        let docs: Vec<String> = candidates
            .iter()
            .map(|h| embed_text(&h.memory.title, &h.memory.content))
            .collect();
        let ranked = ai::rerank(embedder, query, &docs, None).await?;
        debug!(candidates = docs.len(), "cross-encoder rerank");
        let mut out: Vec<SearchHit> = ranked
            .into_iter()
            .map(|item| SearchHit {
                memory: candidates[item.index].memory.clone(),
                score: item.score,
            })
            .collect();
        out.truncate(opts.k);
        out
    } else {
        fused.truncate(opts.k);
        fused
    };

    if opts.hops > 0 {
        expand_graph(db, &mut results, opts.hops, opts.max_total.unwrap_or(opts.k))?;
    }

    Ok(results)
}

/// Breadth-first expansion along links (both directions) up to `hops`
/// layers, skipping ids already present and archived memories, appending
/// with the sentinel score until `max_total` results exist.
fn expand_graph(
    db: &MemoryDB,
    results: &mut Vec<SearchHit>,
    hops: usize,
    max_total: usize,
) -> Result<(), EngramError> {
    let mut seen: HashSet<i64> = results.iter().map(|h| h.memory.id).collect();
    let mut frontier: VecDeque<i64> = results.iter().map(|h| h.memory.id).collect();

    for _ in 0..hops {
        if results.len() >= max_total {
            break;
        }
        let mut next: VecDeque<i64> = VecDeque::new();
        while let Some(id) = frontier.pop_front() {
            for neighbor in db.neighbor_ids(id)? {
                if results.len() >= max_total {
                    return Ok(());
                }
                if !seen.insert(neighbor) {
                    continue;
                }
                let Some(memory) = db.get(neighbor)? else { continue };
                if memory.archived {
                    continue;
                }
                next.push_back(neighbor);
                results.push(SearchHit { memory, score: EXPANSION_SCORE });
            }
        }
        frontier = next;
        if frontier.is_empty() {
            break;
        }
    }
    Ok(())
}

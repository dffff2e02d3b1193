//! Shared test support: a deterministic offline embedder that projects
//! token counts into the embedding space, so similarity tracks lexical
//! overlap and identical inputs always embed identically.
#![allow(dead_code)]

use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};

use async_trait::async_trait;

use engram::ai::{normalize, Embedder};
use engram::db::MemoryDB;
use engram::error::EngramError;
use engram::thresholds::EMBED_DIM;

pub fn test_db() -> MemoryDB {
    MemoryDB::open(":memory:").expect("in-memory db")
}

fn tokens(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Hash each token into one of the 1024 buckets and L2-normalize the
/// counts. Cosine between two such vectors approximates token overlap.
pub fn hash_embed(text: &str) -> Vec<f32> {
    let mut v = vec![0.0_f32; EMBED_DIM];
    for token in tokens(text) {
        let mut h = DefaultHasher::new();
        token.hash(&mut h);
        v[(h.finish() % EMBED_DIM as u64) as usize] += 1.0;
    }
    normalize(v)
}

pub struct HashEmbedder;

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EngramError> {
        Ok(texts.iter().map(|t| hash_embed(t)).collect())
    }

    /// Jaccard overlap between query and document tokens, already in [0,1].
    async fn rerank_scores(&self, query: &str, docs: &[String]) -> Result<Vec<f64>, EngramError> {
        let q: HashSet<String> = tokens(query).into_iter().collect();
        Ok(docs
            .iter()
            .map(|d| {
                let dt: HashSet<String> = tokens(d).into_iter().collect();
                let inter = q.intersection(&dt).count();
                let union = q.union(&dt).count();
                if union == 0 {
                    0.0
                } else {
                    inter as f64 / union as f64
                }
            })
            .collect())
    }
}

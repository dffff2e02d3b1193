//! Embedding and cross-encoder reranking over OpenAI-compatible
//! `/embeddings` and Jina/Cohere-compatible `/rerank` endpoints.
//! The `Embedder` trait is the seam: anything producing 1024-dim
//! unit-norm vectors and scalar relevance scores plugs in.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::EngramError;
use crate::thresholds::{EMBED_CACHE_CAP, EMBED_DIM};

const AI_TIMEOUT: Duration = Duration::from_secs(60);

fn ai_err(msg: impl Into<String>) -> EngramError {
    EngramError::Embedding(msg.into())
}

/// Pluggable encoder + cross-encoder pair.
///
/// `embed_batch` must return one unit-norm vector of `EMBED_DIM` floats per
/// input; `rerank_scores` must return one relevance score in [0,1] per
/// document, aligned with the input order.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EngramError>;

    async fn rerank_scores(&self, query: &str, docs: &[String]) -> Result<Vec<f64>, EngramError>;

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EngramError> {
        let mut out = self.embed_batch(std::slice::from_ref(&text.to_string())).await?;
        out.pop().ok_or_else(|| ai_err("empty embedding batch response"))
    }
}

/// One reranked document.
#[derive(Debug, Clone, Serialize)]
pub struct RerankItem {
    pub index: usize,
    pub score: f64,
    pub text: String,
}

/// Cross-encode `docs` against `query`, sorted by score descending.
pub async fn rerank(
    embedder: &dyn Embedder,
    query: &str,
    docs: &[String],
    top_k: Option<usize>,
) -> Result<Vec<RerankItem>, EngramError> {
    let scores = embedder.rerank_scores(query, docs).await?;
    if scores.len() != docs.len() {
        return Err(ai_err(format!(
            "rerank count mismatch: sent {} docs, got {} scores",
            docs.len(),
            scores.len()
        )));
    }
    let mut items: Vec<RerankItem> = scores
        .into_iter()
        .zip(docs.iter())
        .enumerate()
        .map(|(index, (score, text))| RerankItem { index, score, text: text.clone() })
        .collect();
    items.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    if let Some(k) = top_k {
        items.truncate(k);
    }
    Ok(items)
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AiConfig {
    pub embed_url: String,
    pub embed_key: String,
    pub embed_model: String,
    pub rerank_url: String,
    pub rerank_key: String,
    pub rerank_model: String,
    pub client: reqwest::Client,
}

impl AiConfig {
    /// Returns `None` if `ENGRAM_EMBED_URL` is not set.
    pub fn from_env() -> Option<Self> {
        let embed_url = std::env::var("ENGRAM_EMBED_URL").ok()?;
        let embed_key = std::env::var("ENGRAM_EMBED_KEY").unwrap_or_default();
        let embed_model =
            std::env::var("ENGRAM_EMBED_MODEL").unwrap_or_else(|_| "bge-m3".into());

        let rerank_url = std::env::var("ENGRAM_RERANK_URL").unwrap_or_else(|_| {
            if embed_url.contains("/embeddings") {
                embed_url.replace("/embeddings", "/rerank")
            } else {
                format!("{}/rerank", embed_url.trim_end_matches('/'))
            }
        });
        let rerank_key = std::env::var("ENGRAM_RERANK_KEY").unwrap_or_else(|_| embed_key.clone());
        let rerank_model = std::env::var("ENGRAM_RERANK_MODEL")
            .unwrap_or_else(|_| "bge-reranker-v2-m3".into());

        let client = reqwest::Client::builder()
            .timeout(AI_TIMEOUT)
            .build()
            .expect("failed to build HTTP client");

        Some(Self {
            embed_url,
            embed_key,
            embed_model,
            rerank_url,
            rerank_key,
            rerank_model,
            client,
        })
    }
}

// ---------------------------------------------------------------------------
// HTTP-backed implementation
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct EmbedRequest {
    model: String,
    input: Vec<String>,
}

#[derive(Deserialize)]
struct EmbedResponse {
    data: Vec<EmbedData>,
}

#[derive(Deserialize)]
struct EmbedData {
    embedding: Vec<f32>,
}

#[derive(Serialize)]
struct RerankRequest {
    model: String,
    query: String,
    documents: Vec<String>,
}

#[derive(Deserialize)]
struct RerankResponse {
    results: Vec<RerankResult>,
}

#[derive(Deserialize)]
struct RerankResult {
    index: usize,
    relevance_score: f64,
}

/// HTTP embedder with a small LRU cache over input texts, so repeated
/// queries (the common recall pattern) skip the network round-trip.
pub struct HttpEmbedder {
    cfg: AiConfig,
    cache: parking_lot::Mutex<LruCache<String, Vec<f32>>>,
}

impl HttpEmbedder {
    pub fn new(cfg: AiConfig) -> Self {
        let cap = NonZeroUsize::new(EMBED_CACHE_CAP)
            .unwrap_or(NonZeroUsize::new(1).expect("nonzero"));
        Self { cfg, cache: parking_lot::Mutex::new(LruCache::new(cap)) }
    }

    async fn fetch_embeddings(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EngramError> {
        use backon::{ExponentialBuilder, Retryable};

        let req = EmbedRequest { model: self.cfg.embed_model.clone(), input: texts.to_vec() };

        let send = || async {
            let mut builder = self.cfg.client.post(&self.cfg.embed_url).json(&req);
            if !self.cfg.embed_key.is_empty() {
                builder =
                    builder.header("Authorization", format!("Bearer {}", self.cfg.embed_key));
            }
            let resp = builder
                .send()
                .await
                .map_err(|e| ai_err(format!("embedding request failed: {e}")))?;
            if !resp.status().is_success() {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                return Err(ai_err(format!("embedding API returned {status}: {body}")));
            }
            resp.json::<EmbedResponse>()
                .await
                .map_err(|e| ai_err(format!("embedding response parse failed: {e}")))
        };

        let resp = send
            .retry(ExponentialBuilder::default().with_max_times(3))
            .notify(|err, dur| {
                warn!(error = %err, retry_after = ?dur, "embedding request failed, retrying");
            })
            .await?;

        if resp.data.len() != texts.len() {
            return Err(ai_err(format!(
                "embedding count mismatch: sent {} texts, got {} embeddings",
                texts.len(),
                resp.data.len()
            )));
        }

        let mut out = Vec::with_capacity(resp.data.len());
        for d in resp.data {
            if d.embedding.len() != EMBED_DIM {
                return Err(ai_err(format!(
                    "embedding dimension {} from backend, expected {EMBED_DIM}",
                    d.embedding.len()
                )));
            }
            out.push(normalize(d.embedding));
        }
        Ok(out)
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EngramError> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        let mut results: Vec<Option<Vec<f32>>> = vec![None; texts.len()];
        let mut misses: Vec<usize> = Vec::new();
        {
            let mut cache = self.cache.lock();
            for (i, t) in texts.iter().enumerate() {
                match cache.get(t) {
                    Some(v) => results[i] = Some(v.clone()),
                    None => misses.push(i),
                }
            }
        }

        if !misses.is_empty() {
            let wanted: Vec<String> = misses.iter().map(|&i| texts[i].clone()).collect();
            let fetched = self.fetch_embeddings(&wanted).await?;
            let mut cache = self.cache.lock();
            for (&i, emb) in misses.iter().zip(fetched) {
                cache.put(texts[i].clone(), emb.clone());
                results[i] = Some(emb);
            }
        }

        Ok(results.into_iter().flatten().collect())
    }

    async fn rerank_scores(&self, query: &str, docs: &[String]) -> Result<Vec<f64>, EngramError> {
        if docs.is_empty() {
            return Ok(vec![]);
        }
        let req = RerankRequest {
            model: self.cfg.rerank_model.clone(),
            query: query.to_string(),
            documents: docs.to_vec(),
        };
        let mut builder = self.cfg.client.post(&self.cfg.rerank_url).json(&req);
        if !self.cfg.rerank_key.is_empty() {
            builder = builder.header("Authorization", format!("Bearer {}", self.cfg.rerank_key));
        }
        let resp = builder
            .send()
            .await
            .map_err(|e| ai_err(format!("rerank request failed: {e}")))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(ai_err(format!("rerank API returned {status}: {body}")));
        }
        let parsed: RerankResponse = resp
            .json()
            .await
            .map_err(|e| ai_err(format!("rerank response parse failed: {e}")))?;

        let mut scores = vec![0.0_f64; docs.len()];
        for r in parsed.results {
            if r.index >= scores.len() {
                return Err(ai_err(format!("rerank returned out-of-range index {}", r.index)));
            }
            // Cross-encoders emit raw logits; reranker services usually emit
            // probabilities. Squash only what is outside [0,1].
            scores[r.index] = if (0.0..=1.0).contains(&r.relevance_score) {
                r.relevance_score
            } else {
                sigmoid(r.relevance_score)
            };
        }
        Ok(scores)
    }
}

// ---------------------------------------------------------------------------
// Process-wide lazy service
// ---------------------------------------------------------------------------

static SERVICE: parking_lot::RwLock<Option<Arc<HttpEmbedder>>> = parking_lot::RwLock::new(None);

/// Lazily build the process-wide embedder from the environment.
/// A failed attempt leaves the slot empty so the next call retries;
/// the first success is cached for every later caller.
pub fn service() -> Result<Arc<HttpEmbedder>, EngramError> {
    if let Some(svc) = SERVICE.read().as_ref() {
        return Ok(svc.clone());
    }
    let cfg = AiConfig::from_env().ok_or(EngramError::EmbedderNotConfigured)?;
    debug!(model = %cfg.embed_model, "embedding service initialized");
    let svc = Arc::new(HttpEmbedder::new(cfg));
    let mut slot = SERVICE.write();
    if slot.is_none() {
        *slot = Some(svc.clone());
    }
    Ok(slot.as_ref().map(Arc::clone).unwrap_or(svc))
}

/// Test hook: drop the cached service so the next `service()` call
/// re-reads the environment.
pub fn reset_service() {
    *SERVICE.write() = None;
}

// ---------------------------------------------------------------------------
// Vector utilities
// ---------------------------------------------------------------------------

pub fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// L2-normalize in place; zero vectors pass through unchanged.
pub fn normalize(mut v: Vec<f32>) -> Vec<f32> {
    let norm: f64 = v.iter().map(|&x| (x as f64) * (x as f64)).sum::<f64>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x = (*x as f64 / norm) as f32;
        }
    }
    v
}

/// Cosine similarity. Errors on dimension mismatch; returns 0.0 when either
/// norm is zero.
pub fn cosine(a: &[f32], b: &[f32]) -> Result<f64, EngramError> {
    if a.len() != b.len() {
        return Err(EngramError::DimensionMismatch(a.len(), b.len()));
    }
    let (mut dot, mut na, mut nb) = (0.0_f64, 0.0_f64, 0.0_f64);
    for i in 0..a.len() {
        let (ai, bi) = (a[i] as f64, b[i] as f64);
        dot += ai * bi;
        na += ai * ai;
        nb += bi * bi;
    }
    let denom = na.sqrt() * nb.sqrt();
    if denom == 0.0 {
        Ok(0.0)
    } else {
        Ok(dot / denom)
    }
}

/// Serialize an f32 vector to little-endian bytes for BLOB storage.
pub fn embedding_to_bytes(v: &[f32]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(v.len() * 4);
    for &f in v {
        buf.extend_from_slice(&f.to_le_bytes());
    }
    buf
}

/// Deserialize little-endian bytes back to an f32 vector. Trailing bytes
/// that don't fill a whole float are ignored.
pub fn bytes_to_embedding(b: &[u8]) -> Vec<f32> {
    b.chunks_exact(4)
        .map(|chunk| {
            let arr: [u8; 4] = chunk.try_into().expect("4 bytes");
            f32::from_le_bytes(arr)
        })
        .collect()
}

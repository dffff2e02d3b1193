//! Focus of Attention: hybrid retrieval composed with importance,
//! strength, and recency, packed into a token budget.

use serde::Serialize;
use std::fmt::Write as _;
use tracing::debug;

use crate::ai::Embedder;
use crate::db::{now, Memory, MemoryDB, MemoryType};
use crate::error::EngramError;
use crate::search::{search_hybrid, HybridOptions};
use crate::util::{days_between, estimate_tokens};

#[derive(Debug, Clone)]
pub struct RecallOptions {
    pub k: usize,
    pub budget: usize,
    pub mem_type: Option<MemoryType>,
    pub session_id: Option<String>,
}

impl Default for RecallOptions {
    fn default() -> Self {
        Self { k: 10, budget: 4000, mem_type: None, session_id: None }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScoredMemory {
    #[serde(flatten)]
    pub memory: Memory,
    pub relevance: f64,
    pub score: f64,
}

#[derive(Debug, Serialize)]
pub struct RecallResult {
    pub memories: Vec<ScoredMemory>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_context: Option<String>,
    pub total_tokens: usize,
}

/// Rendered form of one memory, shared by the packer and the formatter so
/// the estimate matches what the agent actually receives.
fn render(m: &Memory) -> String {
    format!("[{}] {}\n{}", m.mem_type, m.title, m.content)
}

/// Recency bonus: full weight for just-touched memories, floor 0.1 after
/// nine idle days; never-accessed memories sit at 0.5.
fn recency_bonus(m: &Memory) -> f64 {
    match m.last_accessed_at {
        Some(at) => (1.0 - 0.1 * days_between(at, now())).max(0.1),
        None => 0.5,
    }
}

fn composite_score(m: &Memory, relevance: f64) -> f64 {
    relevance * m.importance * m.strength * recency_bonus(m)
}

/// Assemble task-relevant context for a query inside a token budget.
pub async fn recall(
    db: &MemoryDB,
    embedder: &dyn Embedder,
    query: &str,
    opts: &RecallOptions,
) -> Result<RecallResult, EngramError> {
    let hits = search_hybrid(
        db,
        embedder,
        query,
        &HybridOptions { k: opts.k, mem_type: opts.mem_type, ..Default::default() },
    )
    .await?;

    let mut scored: Vec<ScoredMemory> = hits
        .into_iter()
        .map(|h| ScoredMemory {
            score: composite_score(&h.memory, h.score),
            relevance: h.score,
            memory: h.memory,
        })
        .collect();
    scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

    // Budget packing: always at least one memory, stop at first overflow.
    let mut selected: Vec<ScoredMemory> = Vec::new();
    let mut total_tokens = 0usize;
    for sm in scored {
        let tokens = estimate_tokens(&render(&sm.memory));
        if !selected.is_empty() && total_tokens + tokens > opts.budget {
            break;
        }
        total_tokens += tokens;
        selected.push(sm);
    }

    let session_context = match opts.session_id.as_deref() {
        Some(sid) => {
            let summary = db.get_session(sid)?.and_then(|s| s.summary);
            if let Some(ref text) = summary {
                total_tokens += estimate_tokens(text);
            }
            summary
        }
        None => None,
    };

    // Best-effort access logging; recall composition never fails on it.
    for sm in &selected {
        if let Err(e) = db.log_access(
            sm.memory.id,
            opts.session_id.as_deref(),
            Some(query),
            Some(sm.score),
        ) {
            debug!(id = sm.memory.id, error = %e, "access log failed");
        }
    }

    Ok(RecallResult { memories: selected, session_context, total_tokens })
}

/// Fixed Markdown layout for agent consumption.
pub fn format_recall(result: &RecallResult, short: bool) -> String {
    let mut out = String::new();
    if let Some(ref ctx) = result.session_context {
        out.push_str("## Session Context\n");
        out.push_str(ctx);
        out.push_str("\n\n");
    }
    out.push_str("## Relevant Memories\n");
    for sm in &result.memories {
        let m = &sm.memory;
        let _ = writeln!(out, "\n### [{}] {}", m.mem_type, m.title);
        if !short && !m.content.is_empty() {
            out.push_str(&m.content);
            out.push('\n');
        }
    }
    let _ = write!(
        out,
        "\n_{} memories | ~{} tokens_",
        result.memories.len(),
        result.total_tokens
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn memory(importance: f64, strength: f64) -> Memory {
        Memory {
            id: 1,
            mem_type: MemoryType::Fact,
            title: "t".into(),
            content: "c".into(),
            embedding: None,
            importance,
            strength,
            access_count: 0,
            last_accessed_at: None,
            created_at: now(),
            updated_at: now(),
            source_conversation_id: None,
            source_type: crate::db::SourceType::Manual,
            archived: false,
            tags: vec![],
        }
    }

    #[test]
    fn recency_defaults_to_half_when_never_accessed() {
        let m = memory(0.5, 1.0);
        assert_eq!(recency_bonus(&m), 0.5);
    }

    #[test]
    fn recency_floors_at_tenth() {
        let mut m = memory(0.5, 1.0);
        m.last_accessed_at = Some(now() - Duration::days(100));
        assert!((recency_bonus(&m) - 0.1).abs() < 1e-9);
    }

    #[test]
    fn recency_fresh_access_near_one() {
        let mut m = memory(0.5, 1.0);
        m.last_accessed_at = Some(now());
        assert!(recency_bonus(&m) > 0.99);
    }

    #[test]
    fn composite_multiplies_priors() {
        let mut m = memory(0.8, 0.5);
        m.last_accessed_at = Some(now());
        let score = composite_score(&m, 0.5);
        assert!((score - 0.5 * 0.8 * 0.5 * recency_bonus(&m)).abs() < 1e-9);
    }
}

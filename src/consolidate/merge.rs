//! The consolidation merge pass: fold near-identical same-type memories
//! into one record, keeping the better-scored of each pair.

use std::collections::{HashMap, HashSet};

use tracing::{debug, info};

use crate::ai::{cosine, Embedder};
use crate::db::{KnnFilter, Memory, MemoryDB, MemoryPatch};
use crate::error::EngramError;
use crate::write::embed_text;

/// Ranking used to choose which memory of a pair survives.
fn keep_score(m: &Memory) -> f64 {
    m.importance + 0.1 * m.access_count as f64
}

/// Deterministic keeper choice: higher score wins, ties go to the lower id.
fn pick_keeper(a: Memory, b: Memory) -> (Memory, Memory) {
    let (sa, sb) = (keep_score(&a), keep_score(&b));
    if sa > sb || (sa == sb && a.id < b.id) {
        (a, b)
    } else {
        (b, a)
    }
}

/// Walk non-archived memories in ascending id order and merge each into its
/// nearest same-type neighbour at or above `threshold`. With `dry_run` the
/// pass only counts pairs; `embedder` may then be `None`.
///
/// When the vector index is unavailable this degrades to an O(n²) pairwise
/// comparison over the same candidates.
pub(crate) async fn merge_pass(
    db: &MemoryDB,
    embedder: Option<&dyn Embedder>,
    threshold: f64,
    dry_run: bool,
) -> Result<usize, EngramError> {
    let all = db.all_with_embeddings()?;
    if all.len() < 2 {
        return Ok(0);
    }

    let use_index = !db.brute_force_fallback();
    // Local mirror for the pairwise fallback; refreshed after each merge so
    // later comparisons see the keeper's new embedding.
    let mut embs: HashMap<i64, Vec<f32>> = all.iter().map(|(m, e)| (m.id, e.clone())).collect();
    let types: HashMap<i64, _> = all.iter().map(|(m, _)| (m.id, m.mem_type)).collect();

    let mut gone: HashSet<i64> = HashSet::new();
    let mut merged = 0usize;

    for (orig, orig_emb) in &all {
        if gone.contains(&orig.id) {
            continue;
        }
        let current = if dry_run {
            orig.clone()
        } else {
            match db.get(orig.id)? {
                Some(m) if !m.archived => m,
                _ => {
                    gone.insert(orig.id);
                    continue;
                }
            }
        };
        let cur_emb = embs.get(&current.id).cloned().unwrap_or_else(|| orig_emb.clone());

        let neighbor = if use_index {
            db.knn(
                &cur_emb,
                5,
                KnnFilter {
                    mem_type: Some(current.mem_type),
                    exclude_id: Some(current.id),
                    ..Default::default()
                },
            )
            .into_iter()
            .map(|(id, dist)| (id, 1.0 - dist))
            .find(|(id, _)| !gone.contains(id))
        } else {
            embs.iter()
                .filter(|(&id, _)| {
                    id != current.id
                        && !gone.contains(&id)
                        && types.get(&id) == Some(&current.mem_type)
                })
                .map(|(&id, e)| (id, cosine(&cur_emb, e).unwrap_or(0.0)))
                .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
        };

        let Some((neighbor_id, similarity)) = neighbor else { continue };
        if similarity < threshold {
            continue;
        }

        merged += 1;
        if dry_run {
            gone.insert(neighbor_id);
            continue;
        }

        let Some(other) = db.get(neighbor_id)? else { continue };
        let (kept, loser) = pick_keeper(current, other);
        debug!(
            kept = kept.id,
            absorbed = loser.id,
            similarity = format!("{similarity:.3}"),
            "consolidation merge"
        );

        let merged_content =
            format!("{}\n\n[Merged from: {}]\n{}", kept.content, loser.title, loser.content);
        let new_embedding = match embedder {
            Some(e) => e.embed(&embed_text(&kept.title, &merged_content)).await?,
            None => {
                return Err(EngramError::Internal(
                    "merge pass requires an embedder outside dry runs".into(),
                ))
            }
        };

        db.update_fields(
            kept.id,
            &MemoryPatch {
                content: Some(merged_content),
                embedding: Some(new_embedding.clone()),
                importance: Some(kept.importance.max(loser.importance)),
                strength: Some(kept.strength.max(loser.strength)),
                access_count: Some(kept.access_count + loser.access_count),
                ..Default::default()
            },
        )?;
        db.set_archived(loser.id, true)?;
        db.rewrite_links(loser.id, kept.id)?;

        embs.insert(kept.id, new_embedding);
        embs.remove(&loser.id);
        gone.insert(loser.id);
    }

    if merged > 0 && !dry_run {
        info!(merged, "merge pass folded near-duplicates");
    }
    Ok(merged)
}

//! The write path: exact-duplicate detection, semantic merge-on-write,
//! tag application, explicit links, and auto-linking.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::ai::Embedder;
use crate::db::{
    KnnFilter, LinkRelation, LinkWriteMode, MemoryDB, MemoryPatch, MemoryType, NewMemory,
    SourceType,
};
use crate::error::EngramError;
use crate::thresholds::{
    AUTO_LINK_PROBE_EXTRA, AUTO_LINK_SIM, MAX_AUTO_LINKS, MERGE_REINFORCE, MERGE_SIM,
    PERMANENT_TAG,
};

/// Separator inserted between old and new content when a write merges into
/// an existing memory.
pub const MERGE_SEPARATOR: &str = "\n\n---\n";

#[derive(Debug, Clone, Deserialize)]
pub struct LinkSpec {
    pub target_id: i64,
    pub relation: LinkRelation,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AddInput {
    #[serde(rename = "type")]
    pub mem_type: MemoryType,
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub importance: Option<f64>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub links: Vec<LinkSpec>,
    #[serde(default)]
    pub source_conversation_id: Option<String>,
    #[serde(default)]
    pub permanent: bool,
    #[serde(default = "default_true")]
    pub auto_link: bool,
}

fn default_true() -> bool {
    true
}

impl AddInput {
    pub fn new(mem_type: MemoryType, title: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            mem_type,
            title: title.into(),
            content: content.into(),
            importance: None,
            tags: Vec::new(),
            links: Vec::new(),
            source_conversation_id: None,
            permanent: false,
            auto_link: true,
        }
    }

    pub fn importance(mut self, i: f64) -> Self {
        self.importance = Some(i);
        self
    }

    pub fn tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn permanent(mut self) -> Self {
        self.permanent = true;
        self
    }

    pub fn no_auto_link(mut self) -> Self {
        self.auto_link = false;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AddStatus {
    Created,
    Duplicate,
    Merged,
}

#[derive(Debug, Clone, Serialize)]
pub struct AddOutcome {
    pub id: i64,
    pub status: AddStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merged_into: Option<i64>,
}

/// Text fed to the encoder for a memory: title and content on one line
/// break. The same shape is used for rerank documents.
pub fn embed_text(title: &str, content: &str) -> String {
    format!("{title}\n{content}")
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

/// Store a memory. Ordered checks: exact duplicate (same type + title) →
/// embed → semantic merge-on-write → insert → tags → explicit links →
/// auto-link. Merge and auto-link silently degrade to no-ops when the
/// vector probe yields nothing.
pub async fn add(
    db: &MemoryDB,
    embedder: &dyn Embedder,
    input: AddInput,
) -> Result<AddOutcome, EngramError> {
    let title = input.title.trim().to_string();
    if title.is_empty() {
        return Err(EngramError::EmptyTitle);
    }
    if let Some(i) = input.importance {
        if !(0.0..=1.0).contains(&i) || !i.is_finite() {
            return Err(EngramError::InvalidImportance(i));
        }
    }
    let mut tags = input.tags.clone();
    if input.permanent && !tags.iter().any(|t| t == PERMANENT_TAG) {
        tags.push(PERMANENT_TAG.to_string());
    }

    // 1. Exact duplicate: reinforce instead of re-storing. Incoming tags
    //    still apply to the existing memory.
    if let Some(existing) = db.find_duplicate(input.mem_type, &title)? {
        debug!(id = existing.id, "duplicate add, reinforcing");
        db.touch(existing.id)?;
        db.add_tags(existing.id, &tags)?;
        return Ok(AddOutcome { id: existing.id, status: AddStatus::Duplicate, merged_into: None });
    }

    // 2. Embed. Failure here propagates; nothing has been written yet.
    let embedding = embedder.embed(&embed_text(&title, &input.content)).await?;

    // 3. Semantic near-duplicate within the same type.
    let probe = db.knn(
        &embedding,
        1,
        KnnFilter { mem_type: Some(input.mem_type), ..Default::default() },
    );
    if let Some(&(neighbor_id, distance)) = probe.first() {
        let similarity = 1.0 - distance;
        if similarity >= MERGE_SIM {
            if let Some(kept) = db.get(neighbor_id)? {
                debug!(
                    id = kept.id,
                    similarity = format!("{similarity:.3}"),
                    "merge-on-write"
                );
                let merged_content = if kept.content.contains(&input.content) {
                    kept.content.clone()
                } else {
                    format!("{}{MERGE_SEPARATOR}{}", kept.content, input.content)
                };
                let merged_title = if title.chars().count() > kept.title.chars().count() {
                    title.clone()
                } else {
                    kept.title.clone()
                };
                let new_embedding =
                    embedder.embed(&embed_text(&merged_title, &merged_content)).await?;
                db.update_fields(
                    kept.id,
                    &MemoryPatch {
                        title: Some(merged_title),
                        content: Some(merged_content),
                        embedding: Some(new_embedding),
                        strength: Some((kept.strength * MERGE_REINFORCE).min(1.0)),
                        ..Default::default()
                    },
                )?;
                db.touch(kept.id)?;
                db.add_tags(kept.id, &tags)?;
                return Ok(AddOutcome {
                    id: kept.id,
                    status: AddStatus::Merged,
                    merged_into: Some(kept.id),
                });
            }
        }
    }

    // 4. Insert.
    let mem = db.insert(NewMemory {
        mem_type: input.mem_type,
        title,
        content: input.content,
        embedding: Some(embedding.clone()),
        importance: input.importance.unwrap_or(0.5),
        source_conversation_id: input.source_conversation_id,
        source_type: SourceType::Manual,
    })?;

    // 5. Tags.
    db.add_tags(mem.id, &tags)?;

    // 6. Explicit links.
    for spec in &input.links {
        db.insert_link(mem.id, spec.target_id, spec.relation, 0.5, LinkWriteMode::Replace)?;
    }

    // 7. Auto-link to nearest neighbours.
    if input.auto_link {
        let neighbors = db.knn(
            &embedding,
            MAX_AUTO_LINKS + AUTO_LINK_PROBE_EXTRA,
            KnnFilter { exclude_id: Some(mem.id), ..Default::default() },
        );
        let mut created = 0usize;
        for (neighbor_id, distance) in neighbors {
            if created >= MAX_AUTO_LINKS {
                break;
            }
            let similarity = 1.0 - distance;
            if similarity < AUTO_LINK_SIM {
                break;
            }
            db.insert_link(
                mem.id,
                neighbor_id,
                LinkRelation::RelatedTo,
                round2(similarity),
                LinkWriteMode::Ignore,
            )?;
            created += 1;
        }
        if created > 0 {
            debug!(id = mem.id, links = created, "auto-linked");
        }
    }

    Ok(AddOutcome { id: mem.id, status: AddStatus::Created, merged_into: None })
}

/// Caller-facing partial update; re-embeds when title or content changes.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateInput {
    pub title: Option<String>,
    pub content: Option<String>,
    pub importance: Option<f64>,
}

/// Returns `false` when the memory does not exist.
pub async fn update(
    db: &MemoryDB,
    embedder: &dyn Embedder,
    id: i64,
    input: UpdateInput,
) -> Result<bool, EngramError> {
    let Some(existing) = db.get(id)? else {
        return Ok(false);
    };

    let needs_embed = input.title.is_some() || input.content.is_some();
    let embedding = if needs_embed {
        let title = input.title.as_deref().unwrap_or(&existing.title);
        let content = input.content.as_deref().unwrap_or(&existing.content);
        Some(embedder.embed(&embed_text(title, content)).await?)
    } else {
        None
    };

    db.update_fields(
        id,
        &MemoryPatch {
            title: input.title,
            content: input.content,
            importance: input.importance,
            embedding,
            ..Default::default()
        },
    )
}

#[derive(Debug, Default, Serialize)]
pub struct IngestReport {
    pub created: usize,
    pub duplicates: usize,
    pub merged: usize,
    pub failures: Vec<IngestFailure>,
}

#[derive(Debug, Serialize)]
pub struct IngestFailure {
    pub index: usize,
    pub title: String,
    pub error: String,
}

impl IngestReport {
    pub fn all_ok(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Batch write. Per-item failures are collected, not fatal; the batch
/// succeeds only when every item does.
pub async fn ingest(
    db: &MemoryDB,
    embedder: &dyn Embedder,
    items: Vec<AddInput>,
) -> Result<IngestReport, EngramError> {
    let mut report = IngestReport::default();
    for (index, item) in items.into_iter().enumerate() {
        let title = item.title.clone();
        match add(db, embedder, item).await {
            Ok(outcome) => match outcome.status {
                AddStatus::Created => report.created += 1,
                AddStatus::Duplicate => report.duplicates += 1,
                AddStatus::Merged => report.merged += 1,
            },
            Err(e) => {
                warn!(index, error = %e, "ingest item failed");
                report.failures.push(IngestFailure { index, title, error: e.to_string() });
            }
        }
    }
    Ok(report)
}

//! Memory CRUD, tag, and link operations.

use chrono::{DateTime, Utc};
use rusqlite::params;
use std::collections::HashSet;

use super::*;
use crate::ai::embedding_to_bytes;
use crate::thresholds::{EMBED_DIM, PERMANENT_TAG};

/// Conflict handling for link inserts: explicit links replace, auto-links
/// never clobber an existing edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkWriteMode {
    Replace,
    Ignore,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryPatch {
    pub title: Option<String>,
    pub content: Option<String>,
    pub importance: Option<f64>,
    pub strength: Option<f64>,
    pub embedding: Option<Vec<f32>>,
    pub access_count: Option<i64>,
}

impl MemoryPatch {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.content.is_none()
            && self.importance.is_none()
            && self.strength.is_none()
            && self.embedding.is_none()
            && self.access_count.is_none()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TagCount {
    pub name: String,
    pub count: i64,
}

#[derive(Debug, Default, Serialize)]
pub struct Stats {
    pub total: usize,
    pub active: usize,
    pub archived: usize,
    pub by_type: std::collections::BTreeMap<String, usize>,
    pub with_embedding: usize,
    pub tags: usize,
    pub links: usize,
    pub sessions: usize,
    pub db_size_bytes: i64,
    pub brute_force_fallback: bool,
}

impl MemoryDB {
    pub fn insert(&self, new: NewMemory) -> Result<Memory, EngramError> {
        validate_title(&new.title)?;
        validate_content(&new.content)?;
        validate_importance(new.importance)?;
        if let Some(ref emb) = new.embedding {
            if emb.len() != EMBED_DIM {
                return Err(EngramError::DimensionMismatch(emb.len(), EMBED_DIM));
            }
        }

        let ts = now();
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO memories \
             (type, title, content, content_embedding, importance, strength, access_count, \
              created_at, updated_at, source_conversation_id, source_type, archived) \
             VALUES (?1, ?2, ?3, ?4, ?5, 1.0, 0, ?6, ?6, ?7, ?8, 0)",
            params![
                new.mem_type.as_str(),
                new.title,
                new.content,
                new.embedding.as_deref().map(embedding_to_bytes),
                new.importance,
                ts,
                new.source_conversation_id,
                new.source_type.as_str(),
            ],
        )?;
        let id = conn.last_insert_rowid();
        drop(conn);

        if let Some(ref emb) = new.embedding {
            self.vec_put(id, emb.clone(), new.mem_type, false, ts);
        }

        Ok(Memory {
            id,
            mem_type: new.mem_type,
            title: new.title,
            content: new.content,
            embedding: new.embedding,
            importance: new.importance,
            strength: 1.0,
            access_count: 0,
            last_accessed_at: None,
            created_at: ts,
            updated_at: ts,
            source_conversation_id: new.source_conversation_id,
            source_type: new.source_type,
            archived: false,
            tags: Vec::new(),
        })
    }

    pub fn get(&self, id: i64) -> Result<Option<Memory>, EngramError> {
        let found = {
            let conn = self.conn()?;
            let sql = format!("SELECT {MEMORY_COLS} FROM memories WHERE id = ?1");
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query(params![id])?;
            match rows.next()? {
                Some(row) => Some(row_to_memory(row)?),
                None => None,
            }
        };
        match found {
            Some(mut mem) => {
                mem.tags = self.tags_for(id)?;
                Ok(Some(mem))
            }
            None => Ok(None),
        }
    }

    pub fn get_embedding(&self, id: i64) -> Result<Option<Vec<f32>>, EngramError> {
        let conn = self.conn()?;
        let blob: Option<Option<Vec<u8>>> = conn
            .query_row("SELECT content_embedding FROM memories WHERE id = ?1", params![id], |r| {
                r.get(0)
            })
            .ok();
        Ok(blob.flatten().map(|b| crate::ai::bytes_to_embedding(&b)))
    }

    /// Non-archived memory with the same type and title, if any.
    pub fn find_duplicate(
        &self,
        mem_type: MemoryType,
        title: &str,
    ) -> Result<Option<Memory>, EngramError> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {MEMORY_COLS} FROM memories \
             WHERE type = ?1 AND title = ?2 AND archived = 0 LIMIT 1"
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(params![mem_type.as_str(), title])?;
        match rows.next()? {
            Some(row) => {
                let mut mem = row_to_memory(row)?;
                drop(rows);
                drop(stmt);
                drop(conn);
                mem.tags = self.tags_for(mem.id)?;
                Ok(Some(mem))
            }
            None => Ok(None),
        }
    }

    /// Record one access: bump the counter and move `last_accessed_at`
    /// forward. Used by access logging and by duplicate/merged adds.
    pub fn touch(&self, id: i64) -> Result<(), EngramError> {
        self.conn()?.execute(
            "UPDATE memories SET access_count = access_count + 1, last_accessed_at = ?1 \
             WHERE id = ?2",
            params![now(), id],
        )?;
        Ok(())
    }

    /// Apply a partial update. Returns `false` when the memory is missing.
    /// Bumps `updated_at` on any change.
    pub fn update_fields(&self, id: i64, patch: &MemoryPatch) -> Result<bool, EngramError> {
        let Some(existing) = self.get(id)? else {
            return Ok(false);
        };
        if patch.is_empty() {
            return Ok(true);
        }

        if let Some(ref t) = patch.title {
            validate_title(t)?;
        }
        if let Some(ref c) = patch.content {
            validate_content(c)?;
        }
        if let Some(i) = patch.importance {
            validate_importance(i)?;
        }
        if let Some(ref emb) = patch.embedding {
            if emb.len() != EMBED_DIM {
                return Err(EngramError::DimensionMismatch(emb.len(), EMBED_DIM));
            }
        }

        let mut set_clauses: Vec<&str> = Vec::new();
        let mut values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        if let Some(ref t) = patch.title {
            set_clauses.push("title = ?");
            values.push(Box::new(t.clone()));
        }
        if let Some(ref c) = patch.content {
            set_clauses.push("content = ?");
            values.push(Box::new(c.clone()));
        }
        if let Some(i) = patch.importance {
            set_clauses.push("importance = ?");
            values.push(Box::new(i));
        }
        if let Some(s) = patch.strength {
            set_clauses.push("strength = ?");
            values.push(Box::new(s.clamp(0.0, 1.0)));
        }
        if let Some(ref emb) = patch.embedding {
            set_clauses.push("content_embedding = ?");
            values.push(Box::new(embedding_to_bytes(emb)));
        }
        if let Some(ac) = patch.access_count {
            set_clauses.push("access_count = ?");
            values.push(Box::new(ac.max(0)));
        }
        set_clauses.push("updated_at = ?");
        values.push(Box::new(now()));
        values.push(Box::new(id));

        let sql = format!("UPDATE memories SET {} WHERE id = ?", set_clauses.join(", "));
        let refs: Vec<&dyn rusqlite::types::ToSql> =
            values.iter().map(std::convert::AsRef::as_ref).collect();
        self.conn()?.execute(&sql, refs.as_slice())?;

        if let Some(ref emb) = patch.embedding {
            self.vec_put(id, emb.clone(), existing.mem_type, existing.archived, existing.created_at);
        }
        Ok(true)
    }

    pub fn set_embedding(&self, id: i64, embedding: &[f32]) -> Result<(), EngramError> {
        if embedding.len() != EMBED_DIM {
            return Err(EngramError::DimensionMismatch(embedding.len(), EMBED_DIM));
        }
        let Some(existing) = self.get(id)? else {
            return Err(EngramError::NotFound);
        };
        self.conn()?.execute(
            "UPDATE memories SET content_embedding = ?1, updated_at = ?2 WHERE id = ?3",
            params![embedding_to_bytes(embedding), now(), id],
        )?;
        self.vec_put(id, embedding.to_vec(), existing.mem_type, existing.archived, existing.created_at);
        Ok(())
    }

    /// Flip the archived bit. Archived memories disappear from every read
    /// path except explicit inspection.
    pub fn set_archived(&self, id: i64, archived: bool) -> Result<bool, EngramError> {
        let n = self.conn()?.execute(
            "UPDATE memories SET archived = ?1, updated_at = ?2 WHERE id = ?3",
            params![archived as i64, now(), id],
        )?;
        if n > 0 {
            self.vec_set_archived(id, archived);
        }
        Ok(n > 0)
    }

    /// Hard delete; tag joins, links, and access log rows cascade.
    pub fn delete(&self, id: i64) -> Result<bool, EngramError> {
        let n = self.conn()?.execute("DELETE FROM memories WHERE id = ?1", params![id])?;
        if n > 0 {
            self.vec_remove(id);
        }
        Ok(n > 0)
    }

    pub fn list(
        &self,
        mem_type: Option<MemoryType>,
        include_archived: bool,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Memory>, EngramError> {
        let conn = self.conn()?;
        let mut sql = format!("SELECT {MEMORY_COLS} FROM memories WHERE 1=1");
        let mut values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();
        if let Some(t) = mem_type {
            values.push(Box::new(t.as_str().to_string()));
            sql.push_str(&format!(" AND type = ?{}", values.len()));
        }
        if !include_archived {
            sql.push_str(" AND archived = 0");
        }
        values.push(Box::new(limit as i64));
        let limit_idx = values.len();
        values.push(Box::new(offset as i64));
        let offset_idx = values.len();
        sql.push_str(&format!(" ORDER BY created_at DESC LIMIT ?{limit_idx} OFFSET ?{offset_idx}"));

        let refs: Vec<&dyn rusqlite::types::ToSql> =
            values.iter().map(std::convert::AsRef::as_ref).collect();
        let mut stmt = conn.prepare(&sql)?;
        let rows: Vec<Memory> = stmt
            .query_map(refs.as_slice(), row_to_memory)?
            .filter_map(|r| r.map_err(|e| tracing::warn!("row parse: {e}")).ok())
            .collect();
        drop(stmt);
        drop(conn);
        let mut out = rows;
        for m in out.iter_mut() {
            m.tags = self.tags_for(m.id)?;
        }
        Ok(out)
    }

    /// The n weakest non-archived memories, candidates for the next prune.
    pub fn weakest(&self, n: usize) -> Result<Vec<Memory>, EngramError> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {MEMORY_COLS} FROM memories WHERE archived = 0 \
             ORDER BY strength ASC, id ASC LIMIT ?1"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![n as i64], row_to_memory)?
            .filter_map(|r| r.map_err(|e| tracing::warn!("row parse: {e}")).ok())
            .collect();
        Ok(rows)
    }

    // -- Tags --

    /// Upsert normalized tags and join them to the memory. Idempotent on
    /// the join; empty labels are dropped.
    pub fn add_tags(&self, id: i64, tags: &[String]) -> Result<(), EngramError> {
        validate_tags(tags)?;
        let conn = self.conn()?;
        for raw in tags {
            let name = normalize_tag(raw);
            if name.is_empty() {
                continue;
            }
            conn.execute("INSERT OR IGNORE INTO tags (name) VALUES (?1)", params![name])?;
            conn.execute(
                "INSERT OR IGNORE INTO memory_tags (memory_id, tag_id) \
                 SELECT ?1, id FROM tags WHERE name = ?2",
                params![id, name],
            )?;
        }
        Ok(())
    }

    pub fn remove_tag(&self, id: i64, tag: &str) -> Result<bool, EngramError> {
        let name = normalize_tag(tag);
        let n = self.conn()?.execute(
            "DELETE FROM memory_tags WHERE memory_id = ?1 \
             AND tag_id IN (SELECT id FROM tags WHERE name = ?2)",
            params![id, name],
        )?;
        Ok(n > 0)
    }

    pub fn tags_for(&self, id: i64) -> Result<Vec<String>, EngramError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT t.name FROM tags t \
             JOIN memory_tags mt ON mt.tag_id = t.id \
             WHERE mt.memory_id = ?1 ORDER BY t.name",
        )?;
        let rows = stmt
            .query_map(params![id], |r| r.get(0))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    pub fn has_tag(&self, id: i64, tag: &str) -> Result<bool, EngramError> {
        let name = normalize_tag(tag);
        let n: i64 = self.conn()?.query_row(
            "SELECT COUNT(*) FROM memory_tags mt JOIN tags t ON t.id = mt.tag_id \
             WHERE mt.memory_id = ?1 AND t.name = ?2",
            params![id, name],
            |r| r.get(0),
        )?;
        Ok(n > 0)
    }

    pub fn list_tag_counts(&self) -> Result<Vec<TagCount>, EngramError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT t.name, COUNT(mt.memory_id) AS n FROM tags t \
             LEFT JOIN memory_tags mt ON mt.tag_id = t.id \
             GROUP BY t.id ORDER BY n DESC, t.name",
        )?;
        let rows = stmt
            .query_map([], |r| Ok(TagCount { name: r.get(0)?, count: r.get(1)? }))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    /// Ids of memories carrying the `permanent` tag; exempt from decay and
    /// prune.
    pub fn permanent_ids(&self) -> Result<HashSet<i64>, EngramError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT mt.memory_id FROM memory_tags mt \
             JOIN tags t ON t.id = mt.tag_id WHERE t.name = ?1",
        )?;
        let rows = stmt
            .query_map(params![PERMANENT_TAG], |r| r.get(0))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    // -- Links --

    pub fn insert_link(
        &self,
        source_id: i64,
        target_id: i64,
        relation: LinkRelation,
        strength: f64,
        mode: LinkWriteMode,
    ) -> Result<(), EngramError> {
        if source_id == target_id {
            return Err(EngramError::Validation("cannot link a memory to itself".into()));
        }
        let verb = match mode {
            LinkWriteMode::Replace => "INSERT OR REPLACE",
            LinkWriteMode::Ignore => "INSERT OR IGNORE",
        };
        let sql = format!(
            "{verb} INTO links (source_id, target_id, relation, strength, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)"
        );
        self.conn()?.execute(
            &sql,
            params![source_id, target_id, relation.as_str(), strength, now()],
        )?;
        Ok(())
    }

    pub fn delete_link(&self, source_id: i64, target_id: i64) -> Result<bool, EngramError> {
        let n = self.conn()?.execute(
            "DELETE FROM links WHERE source_id = ?1 AND target_id = ?2",
            params![source_id, target_id],
        )?;
        Ok(n > 0)
    }

    /// All edges touching the memory, both directions.
    pub fn links_of(&self, id: i64) -> Result<Vec<Link>, EngramError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT source_id, target_id, relation, strength, created_at FROM links \
             WHERE source_id = ?1 OR target_id = ?1 ORDER BY created_at",
        )?;
        let rows = stmt
            .query_map(params![id], |r| {
                let relation: String = r.get(2)?;
                Ok(Link {
                    source_id: r.get(0)?,
                    target_id: r.get(1)?,
                    relation: relation.parse().unwrap_or(LinkRelation::RelatedTo),
                    strength: r.get(3)?,
                    created_at: r.get(4)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    /// Ids reachable in one hop, both directions, archived excluded.
    pub fn neighbor_ids(&self, id: i64) -> Result<Vec<i64>, EngramError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT CASE WHEN l.source_id = ?1 THEN l.target_id ELSE l.source_id END AS other \
             FROM links l JOIN memories m ON m.id = \
                 (CASE WHEN l.source_id = ?1 THEN l.target_id ELSE l.source_id END) \
             WHERE (l.source_id = ?1 OR l.target_id = ?1) AND m.archived = 0 \
             ORDER BY other",
        )?;
        let rows = stmt
            .query_map(params![id], |r| r.get(0))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    /// Repoint every edge touching `old_id` at `new_id`, replacing on
    /// conflict and dropping would-be self-loops. Used when a merge
    /// archives a memory.
    pub fn rewrite_links(&self, old_id: i64, new_id: i64) -> Result<(), EngramError> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM links WHERE (source_id = ?1 AND target_id = ?2) \
             OR (source_id = ?2 AND target_id = ?1)",
            params![old_id, new_id],
        )?;
        conn.execute(
            "UPDATE OR REPLACE links SET source_id = ?2 WHERE source_id = ?1",
            params![old_id, new_id],
        )?;
        conn.execute(
            "UPDATE OR REPLACE links SET target_id = ?2 WHERE target_id = ?1",
            params![old_id, new_id],
        )?;
        Ok(())
    }

    // -- Stats & export --

    pub fn stats(&self) -> Result<Stats, EngramError> {
        let conn = self.conn()?;
        let mut s = Stats {
            db_size_bytes: 0,
            brute_force_fallback: self.brute_force_fallback(),
            ..Default::default()
        };

        let mut stmt = conn.prepare("SELECT type, archived, COUNT(*) FROM memories GROUP BY type, archived")?;
        let rows: Vec<(String, i64, i64)> = stmt
            .query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))?
            .filter_map(|r| r.ok())
            .collect();
        for (ty, archived, n) in rows {
            s.total += n as usize;
            if archived != 0 {
                s.archived += n as usize;
            } else {
                s.active += n as usize;
                *s.by_type.entry(ty).or_insert(0) += n as usize;
            }
        }
        s.with_embedding = conn
            .query_row(
                "SELECT COUNT(*) FROM memories WHERE content_embedding IS NOT NULL",
                [],
                |r| r.get::<_, i64>(0),
            )
            .unwrap_or(0) as usize;
        s.tags = conn
            .query_row("SELECT COUNT(*) FROM tags", [], |r| r.get::<_, i64>(0))
            .unwrap_or(0) as usize;
        s.links = conn
            .query_row("SELECT COUNT(*) FROM links", [], |r| r.get::<_, i64>(0))
            .unwrap_or(0) as usize;
        s.sessions = conn
            .query_row("SELECT COUNT(*) FROM sessions", [], |r| r.get::<_, i64>(0))
            .unwrap_or(0) as usize;
        drop(stmt);
        drop(conn);
        s.db_size_bytes = self.db_size_bytes();
        Ok(s)
    }

    /// Every memory including archived ones, oldest first, with tags.
    /// Embeddings are not included; exports stay portable.
    pub fn export_all(&self) -> Result<Vec<Memory>, EngramError> {
        let conn = self.conn()?;
        let sql = format!("SELECT {MEMORY_COLS} FROM memories ORDER BY id ASC");
        let mut stmt = conn.prepare(&sql)?;
        let rows: Vec<Memory> = stmt
            .query_map([], row_to_memory)?
            .filter_map(|r| r.map_err(|e| tracing::warn!("row parse: {e}")).ok())
            .collect();
        drop(stmt);
        drop(conn);
        let mut out = rows;
        for m in out.iter_mut() {
            m.tags = self.tags_for(m.id)?;
        }
        Ok(out)
    }

    pub fn all_links(&self) -> Result<Vec<Link>, EngramError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT source_id, target_id, relation, strength, created_at FROM links \
             ORDER BY source_id, target_id",
        )?;
        let rows = stmt
            .query_map([], |r| {
                let relation: String = r.get(2)?;
                Ok(Link {
                    source_id: r.get(0)?,
                    target_id: r.get(1)?,
                    relation: relation.parse().unwrap_or(LinkRelation::RelatedTo),
                    strength: r.get(3)?,
                    created_at: r.get(4)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    /// Decay bookkeeping rows: id, strength, and the per-row fallback base
    /// timestamp, for every non-archived memory.
    pub(crate) fn decay_rows(
        &self,
    ) -> Result<Vec<(i64, f64, DateTime<Utc>)>, EngramError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, strength, COALESCE(last_accessed_at, created_at) \
             FROM memories WHERE archived = 0 ORDER BY id",
        )?;
        let rows = stmt
            .query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    /// Non-archived, non-permanent memories below the prune threshold.
    /// The permanent exemption lives in the SQL itself so a tagged memory
    /// can never slip through.
    pub(crate) fn prune_candidates(&self, threshold: f64) -> Result<Vec<i64>, EngramError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id FROM memories WHERE archived = 0 AND strength < ?1 \
             AND id NOT IN (SELECT mt.memory_id FROM memory_tags mt \
                            JOIN tags t ON t.id = mt.tag_id WHERE t.name = ?2) \
             ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![threshold, PERMANENT_TAG], |r| r.get(0))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    /// Non-archived memories with at least `min_access` recorded accesses:
    /// (id, strength) pairs for the boost step.
    pub(crate) fn boost_candidates(
        &self,
        min_access: i64,
    ) -> Result<Vec<(i64, f64)>, EngramError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, strength FROM memories \
             WHERE archived = 0 AND access_count >= ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![min_access], |r| Ok((r.get(0)?, r.get(1)?)))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    /// Batch strength update in one transaction.
    pub(crate) fn set_strengths(&self, updates: &[(i64, f64)]) -> Result<(), EngramError> {
        if updates.is_empty() {
            return Ok(());
        }
        let conn = self.conn()?;
        conn.execute_batch("BEGIN")?;
        let result = (|| -> Result<(), EngramError> {
            let mut stmt =
                conn.prepare("UPDATE memories SET strength = ?1 WHERE id = ?2")?;
            for &(id, strength) in updates {
                stmt.execute(params![strength.clamp(0.0, 1.0), id])?;
            }
            Ok(())
        })();
        match result {
            Ok(()) => {
                conn.execute_batch("COMMIT")?;
                Ok(())
            }
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK");
                Err(e)
            }
        }
    }
}

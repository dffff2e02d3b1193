//! FTS5 lexical search. The index is maintained by the `memories_ai` /
//! `memories_ad` / `memories_au` triggers; nothing here writes it.

use chrono::{DateTime, Utc};
use rusqlite::params;

use super::*;

impl MemoryDB {
    /// BM25 keyword search over `(title, content, type)`. Returns
    /// `(id, score)` with higher scores better; archived rows never match.
    pub fn fts_search(
        &self,
        query: &str,
        k: usize,
        mem_type: Option<MemoryType>,
        since: Option<DateTime<Utc>>,
    ) -> Vec<(i64, f64)> {
        let sanitized: String = query
            .chars()
            .map(|c| if c.is_alphanumeric() { c } else { ' ' })
            .collect();
        let sanitized = sanitized.trim();
        if sanitized.is_empty() {
            return vec![];
        }
        // Quote every term so bare words can't be read as FTS operators.
        let fts_query: String = sanitized
            .split_whitespace()
            .map(|w| format!("\"{w}\""))
            .collect::<Vec<_>>()
            .join(" OR ");

        let mut sql = String::from(
            "SELECT m.id, memories_fts.rank FROM memories_fts \
             JOIN memories m ON m.id = memories_fts.rowid \
             WHERE memories_fts MATCH ?1 AND m.archived = 0",
        );
        let mut values: Vec<Box<dyn rusqlite::types::ToSql>> = vec![Box::new(fts_query)];
        if let Some(t) = mem_type {
            values.push(Box::new(t.as_str().to_string()));
            sql.push_str(&format!(" AND m.type = ?{}", values.len()));
        }
        if let Some(bound) = since {
            values.push(Box::new(bound));
            sql.push_str(&format!(" AND m.created_at >= ?{}", values.len()));
        }
        values.push(Box::new(k as i64));
        sql.push_str(&format!(" ORDER BY memories_fts.rank LIMIT ?{}", values.len()));

        let Ok(conn) = self.conn() else { return vec![] };
        let Ok(mut stmt) = conn.prepare(&sql) else { return vec![] };
        let refs: Vec<&dyn rusqlite::types::ToSql> =
            values.iter().map(std::convert::AsRef::as_ref).collect();
        stmt.query_map(refs.as_slice(), |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, f64>(1)?))
        })
        .map(|iter| {
            // rank is smaller-is-better (negative); flip so callers sort
            // descending like every other score in the system.
            iter.filter_map(|r| r.ok()).map(|(id, rank)| (id, -rank)).collect()
        })
        .unwrap_or_default()
    }

    /// FTS bookkeeping for diagnostics: (indexed rows, main-table rows).
    pub fn fts_counts(&self) -> (i64, i64) {
        let Ok(conn) = self.conn() else { return (0, 0) };
        let fts: i64 = conn
            .query_row("SELECT COUNT(*) FROM memories_fts", [], |r| r.get(0))
            .unwrap_or(0);
        let mem: i64 = conn
            .query_row("SELECT COUNT(*) FROM memories", [], |r| r.get(0))
            .unwrap_or(0);
        (fts, mem)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{MemoryDB, MemoryType, NewMemory, SourceType};

    fn test_db() -> MemoryDB {
        MemoryDB::open(":memory:").expect("in-memory db")
    }

    fn mem(mem_type: MemoryType, title: &str, content: &str) -> NewMemory {
        NewMemory {
            mem_type,
            title: title.into(),
            content: content.into(),
            embedding: None,
            importance: 0.5,
            source_conversation_id: None,
            source_type: SourceType::Manual,
        }
    }

    #[test]
    fn fts_finds_title_and_content_words() {
        let db = test_db();
        let m = db
            .insert(mem(MemoryType::Fact, "Quick brown fox", "jumps over the lazy dog"))
            .unwrap();

        for word in ["quick", "fox", "lazy", "dog"] {
            let hits = db.fts_search(word, 10, None, None);
            assert!(
                hits.iter().any(|(id, _)| *id == m.id),
                "word {word:?} should match memory {}",
                m.id
            );
        }
    }

    #[test]
    fn fts_sync_on_update_and_delete() {
        let db = test_db();
        let m = db.insert(mem(MemoryType::Fact, "Original title", "alpha beta")).unwrap();

        let patch = crate::db::MemoryPatch {
            content: Some("gamma delta".into()),
            ..Default::default()
        };
        db.update_fields(m.id, &patch).unwrap();

        assert!(db.fts_search("alpha", 10, None, None).is_empty(), "old tokens must not match");
        assert!(!db.fts_search("gamma", 10, None, None).is_empty(), "new tokens must match");

        db.delete(m.id).unwrap();
        assert!(db.fts_search("gamma", 10, None, None).is_empty());
        assert!(db.fts_search("original", 10, None, None).is_empty());
    }

    #[test]
    fn fts_excludes_archived() {
        let db = test_db();
        let m = db.insert(mem(MemoryType::Fact, "Hidden fact", "invisible content")).unwrap();
        db.set_archived(m.id, true).unwrap();
        assert!(db.fts_search("invisible", 10, None, None).is_empty());
    }

    #[test]
    fn fts_type_filter() {
        let db = test_db();
        db.insert(mem(MemoryType::Fact, "Shared word topic", "")).unwrap();
        let ep = db.insert(mem(MemoryType::Episode, "Shared word topic too", "")).unwrap();
        let hits = db.fts_search("shared", 10, Some(MemoryType::Episode), None);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, ep.id);
    }

    #[test]
    fn fts_query_sanitized() {
        let db = test_db();
        db.insert(mem(MemoryType::Fact, "Punctuation test", "hello world")).unwrap();
        // Raw FTS operators must not produce syntax errors.
        let hits = db.fts_search("hello AND \"world* (", 10, None, None);
        assert!(!hits.is_empty());
    }
}

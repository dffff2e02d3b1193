//! Session rows and the append-only access log.

use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::Serialize;

use super::*;
use crate::ai::embedding_to_bytes;

#[derive(Debug, Serialize)]
pub struct SessionContext {
    pub session: Session,
    /// Distinct memories accessed under this session, most recent first.
    pub memories: Vec<Memory>,
}

fn row_to_session(row: &rusqlite::Row) -> rusqlite::Result<Session> {
    Ok(Session {
        id: row.get("id")?,
        title: row.get("title")?,
        summary: row.get("summary")?,
        started_at: row.get("started_at")?,
        ended_at: row.get("ended_at")?,
    })
}

impl MemoryDB {
    /// Create or replace a session row with a fresh `started_at`.
    pub fn start_session(&self, id: &str, title: Option<&str>) -> Result<Session, EngramError> {
        if id.trim().is_empty() {
            return Err(EngramError::Validation("session id must not be empty".into()));
        }
        let ts = now();
        self.conn()?.execute(
            "INSERT OR REPLACE INTO sessions (id, title, summary, summary_embedding, started_at, ended_at) \
             VALUES (?1, ?2, NULL, NULL, ?3, NULL)",
            params![id, title, ts],
        )?;
        Ok(Session {
            id: id.to_string(),
            title: title.map(str::to_string),
            summary: None,
            started_at: ts,
            ended_at: None,
        })
    }

    /// Close a session. The summary and its embedding are stored together
    /// when provided. Returns `false` when the session does not exist.
    pub fn end_session(
        &self,
        id: &str,
        summary: Option<&str>,
        summary_embedding: Option<&[f32]>,
    ) -> Result<bool, EngramError> {
        let ts = now();
        let n = match summary {
            Some(text) => self.conn()?.execute(
                "UPDATE sessions SET ended_at = ?1, summary = ?2, summary_embedding = ?3 \
                 WHERE id = ?4",
                params![ts, text, summary_embedding.map(embedding_to_bytes), id],
            )?,
            None => self.conn()?.execute(
                "UPDATE sessions SET ended_at = ?1 WHERE id = ?2",
                params![ts, id],
            )?,
        };
        Ok(n > 0)
    }

    pub fn get_session(&self, id: &str) -> Result<Option<Session>, EngramError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, title, summary, started_at, ended_at FROM sessions WHERE id = ?1",
        )?;
        let mut rows = stmt.query(params![id])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_session(row)?)),
            None => Ok(None),
        }
    }

    pub fn session_context(&self, id: &str) -> Result<Option<SessionContext>, EngramError> {
        let Some(session) = self.get_session(id)? else {
            return Ok(None);
        };
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {MEMORY_COLS} FROM memories WHERE id IN \
             (SELECT memory_id FROM access_log WHERE session_id = ?1) \
             ORDER BY (SELECT MAX(accessed_at) FROM access_log a \
                       WHERE a.memory_id = memories.id AND a.session_id = ?1) DESC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows: Vec<Memory> = stmt
            .query_map(params![id], row_to_memory)?
            .filter_map(|r| r.map_err(|e| tracing::warn!("row parse: {e}")).ok())
            .collect();
        drop(stmt);
        drop(conn);
        let mut memories = rows;
        for m in memories.iter_mut() {
            m.tags = self.tags_for(m.id)?;
        }
        Ok(Some(SessionContext { session, memories }))
    }

    pub fn list_sessions(
        &self,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<Session>, EngramError> {
        let conn = self.conn()?;
        let mut sql = String::from(
            "SELECT id, title, summary, started_at, ended_at FROM sessions WHERE 1=1",
        );
        let mut values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();
        if let Some(s) = since {
            values.push(Box::new(s));
            sql.push_str(&format!(" AND started_at >= ?{}", values.len()));
        }
        if let Some(u) = until {
            values.push(Box::new(u));
            sql.push_str(&format!(" AND started_at <= ?{}", values.len()));
        }
        values.push(Box::new(limit as i64));
        sql.push_str(&format!(" ORDER BY started_at DESC LIMIT ?{}", values.len()));

        let refs: Vec<&dyn rusqlite::types::ToSql> =
            values.iter().map(std::convert::AsRef::as_ref).collect();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(refs.as_slice(), row_to_session)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    /// Append to the access log and atomically bump the memory's counter
    /// and `last_accessed_at`.
    pub fn log_access(
        &self,
        memory_id: i64,
        session_id: Option<&str>,
        query: Option<&str>,
        relevance_score: Option<f64>,
    ) -> Result<(), EngramError> {
        let conn = self.conn()?;
        let ts = now();
        conn.execute_batch("BEGIN")?;
        let result = (|| -> Result<(), EngramError> {
            conn.execute(
                "INSERT INTO access_log (memory_id, session_id, query, relevance_score, accessed_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![memory_id, session_id, query, relevance_score, ts],
            )?;
            conn.execute(
                "UPDATE memories SET access_count = access_count + 1, last_accessed_at = ?1 \
                 WHERE id = ?2",
                params![ts, memory_id],
            )?;
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

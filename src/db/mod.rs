//! SQLite-backed memory storage: relational tables, an FTS5 lexical index
//! kept in sync by triggers, and an in-process vector index over the
//! embedding blobs.

mod fts;
mod memory;
mod session;
mod vec;

pub use memory::{LinkWriteMode, MemoryPatch, Stats, TagCount};
pub use session::SessionContext;
pub use vec::KnnFilter;

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use serde::{Deserialize, Serialize};

use crate::error::EngramError;
use crate::thresholds::{MAX_CONTENT_LEN, MAX_TAGS, MAX_TAG_LEN};

/// Per-connection setup for every connection handed out by the pool.
/// busy_timeout prevents SQLITE_BUSY under concurrent write pressure;
/// foreign_keys is a per-connection pragma, so cascades need it here and
/// not just on the connection that ran the migrations.
#[derive(Debug)]
struct ConnCustomizer;
impl r2d2::CustomizeConnection<rusqlite::Connection, rusqlite::Error> for ConnCustomizer {
    fn on_acquire(&self, conn: &mut rusqlite::Connection) -> Result<(), rusqlite::Error> {
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.pragma_update(None, "foreign_keys", true)?;
        Ok(())
    }
}

type PooledConn = r2d2::PooledConnection<SqliteConnectionManager>;

pub fn now() -> DateTime<Utc> {
    Utc::now()
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryType {
    Reflex,
    Episode,
    Fact,
    Preference,
    Decision,
    SessionSummary,
}

impl MemoryType {
    pub const ALL: [MemoryType; 6] = [
        MemoryType::Reflex,
        MemoryType::Episode,
        MemoryType::Fact,
        MemoryType::Preference,
        MemoryType::Decision,
        MemoryType::SessionSummary,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MemoryType::Reflex => "reflex",
            MemoryType::Episode => "episode",
            MemoryType::Fact => "fact",
            MemoryType::Preference => "preference",
            MemoryType::Decision => "decision",
            MemoryType::SessionSummary => "session_summary",
        }
    }

    /// Types whose content is worth pinning by default when added manually.
    pub fn default_permanent(self) -> bool {
        matches!(self, MemoryType::Reflex | MemoryType::Preference)
    }
}

impl FromStr for MemoryType {
    type Err = EngramError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reflex" => Ok(MemoryType::Reflex),
            "episode" => Ok(MemoryType::Episode),
            "fact" => Ok(MemoryType::Fact),
            "preference" => Ok(MemoryType::Preference),
            "decision" => Ok(MemoryType::Decision),
            "session_summary" => Ok(MemoryType::SessionSummary),
            other => Err(EngramError::InvalidType(other.to_string())),
        }
    }
}

impl fmt::Display for MemoryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkRelation {
    RelatedTo,
    CausedBy,
    EvolvedFrom,
    Contradicts,
    Supersedes,
}

impl LinkRelation {
    pub fn as_str(self) -> &'static str {
        match self {
            LinkRelation::RelatedTo => "related_to",
            LinkRelation::CausedBy => "caused_by",
            LinkRelation::EvolvedFrom => "evolved_from",
            LinkRelation::Contradicts => "contradicts",
            LinkRelation::Supersedes => "supersedes",
        }
    }
}

impl FromStr for LinkRelation {
    type Err = EngramError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "related_to" => Ok(LinkRelation::RelatedTo),
            "caused_by" => Ok(LinkRelation::CausedBy),
            "evolved_from" => Ok(LinkRelation::EvolvedFrom),
            "contradicts" => Ok(LinkRelation::Contradicts),
            "supersedes" => Ok(LinkRelation::Supersedes),
            other => Err(EngramError::InvalidRelation(other.to_string())),
        }
    }
}

impl fmt::Display for LinkRelation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Manual,
    Auto,
    Migration,
}

impl SourceType {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceType::Manual => "manual",
            SourceType::Auto => "auto",
            SourceType::Migration => "migration",
        }
    }
}

impl FromStr for SourceType {
    type Err = EngramError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(SourceType::Manual),
            "auto" => Ok(SourceType::Auto),
            "migration" => Ok(SourceType::Migration),
            other => Err(EngramError::Validation(format!("invalid source type: {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct Memory {
    pub id: i64,
    #[serde(rename = "type")]
    pub mem_type: MemoryType,
    pub title: String,
    pub content: String,
    #[serde(skip)]
    pub embedding: Option<Vec<f32>>,
    pub importance: f64,
    pub strength: f64,
    pub access_count: i64,
    pub last_accessed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_conversation_id: Option<String>,
    pub source_type: SourceType,
    pub archived: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

/// Row to insert; everything the write path decides before touching SQL.
#[derive(Debug, Clone)]
pub struct NewMemory {
    pub mem_type: MemoryType,
    pub title: String,
    pub content: String,
    pub embedding: Option<Vec<f32>>,
    pub importance: f64,
    pub source_conversation_id: Option<String>,
    pub source_type: SourceType,
}

#[derive(Debug, Clone, Serialize)]
pub struct Link {
    pub source_id: i64,
    pub target_id: i64,
    pub relation: LinkRelation,
    pub strength: f64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Normalize a tag label: lowercase, trimmed.
pub fn normalize_tag(tag: &str) -> String {
    tag.trim().to_lowercase()
}

pub(crate) fn validate_title(title: &str) -> Result<(), EngramError> {
    if title.trim().is_empty() {
        return Err(EngramError::EmptyTitle);
    }
    Ok(())
}

pub(crate) fn validate_content(content: &str) -> Result<(), EngramError> {
    if content.chars().count() > MAX_CONTENT_LEN {
        return Err(EngramError::ContentTooLong);
    }
    Ok(())
}

pub(crate) fn validate_importance(importance: f64) -> Result<(), EngramError> {
    if !(0.0..=1.0).contains(&importance) || !importance.is_finite() {
        return Err(EngramError::InvalidImportance(importance));
    }
    Ok(())
}

pub(crate) fn validate_tags(tags: &[String]) -> Result<(), EngramError> {
    if tags.len() > MAX_TAGS {
        return Err(EngramError::Validation(format!("too many tags (max {MAX_TAGS})")));
    }
    if let Some(t) = tags.iter().find(|t| t.chars().count() > MAX_TAG_LEN) {
        return Err(EngramError::Validation(format!("tag '{t}' too long (max {MAX_TAG_LEN})")));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

pub const SCHEMA_VERSION: i64 = 1;

const META_SCHEMA: &str = "CREATE TABLE IF NOT EXISTS system_meta (\
    key TEXT PRIMARY KEY, value TEXT NOT NULL)";

const SCHEMA_V1: &str = r#"
CREATE TABLE IF NOT EXISTS memories (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    type TEXT NOT NULL CHECK (type IN
        ('reflex','episode','fact','preference','decision','session_summary')),
    title TEXT NOT NULL CHECK (length(title) > 0),
    content TEXT NOT NULL DEFAULT '',
    content_embedding BLOB,
    importance REAL NOT NULL DEFAULT 0.5 CHECK (importance >= 0.0 AND importance <= 1.0),
    strength REAL NOT NULL DEFAULT 1.0 CHECK (strength >= 0.0 AND strength <= 1.0),
    access_count INTEGER NOT NULL DEFAULT 0 CHECK (access_count >= 0),
    last_accessed_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    source_conversation_id TEXT,
    source_type TEXT NOT NULL DEFAULT 'manual' CHECK (source_type IN ('manual','auto','migration')),
    archived INTEGER NOT NULL DEFAULT 0 CHECK (archived IN (0,1))
);
CREATE INDEX IF NOT EXISTS idx_memories_type ON memories(type);
CREATE INDEX IF NOT EXISTS idx_memories_archived ON memories(archived);
CREATE INDEX IF NOT EXISTS idx_memories_strength ON memories(strength);

CREATE TABLE IF NOT EXISTS tags (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS memory_tags (
    memory_id INTEGER NOT NULL REFERENCES memories(id) ON DELETE CASCADE,
    tag_id INTEGER NOT NULL REFERENCES tags(id) ON DELETE CASCADE,
    PRIMARY KEY (memory_id, tag_id)
);

CREATE TABLE IF NOT EXISTS links (
    source_id INTEGER NOT NULL REFERENCES memories(id) ON DELETE CASCADE,
    target_id INTEGER NOT NULL REFERENCES memories(id) ON DELETE CASCADE,
    relation TEXT NOT NULL CHECK (relation IN
        ('related_to','caused_by','evolved_from','contradicts','supersedes')),
    strength REAL NOT NULL DEFAULT 0.5,
    created_at TEXT NOT NULL,
    PRIMARY KEY (source_id, target_id)
);
CREATE INDEX IF NOT EXISTS idx_links_target ON links(target_id);

CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    title TEXT,
    summary TEXT,
    summary_embedding BLOB,
    started_at TEXT NOT NULL,
    ended_at TEXT
);

CREATE TABLE IF NOT EXISTS access_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    memory_id INTEGER NOT NULL REFERENCES memories(id) ON DELETE CASCADE,
    session_id TEXT,
    query TEXT,
    relevance_score REAL,
    accessed_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_access_log_memory ON access_log(memory_id);
CREATE INDEX IF NOT EXISTS idx_access_log_session ON access_log(session_id);

CREATE VIRTUAL TABLE IF NOT EXISTS memories_fts USING fts5(
    title, content, type, content='memories', content_rowid='id');

CREATE TRIGGER IF NOT EXISTS memories_ai AFTER INSERT ON memories BEGIN
    INSERT INTO memories_fts(rowid, title, content, type)
    VALUES (new.id, new.title, new.content, new.type);
END;

CREATE TRIGGER IF NOT EXISTS memories_ad AFTER DELETE ON memories BEGIN
    INSERT INTO memories_fts(memories_fts, rowid, title, content, type)
    VALUES ('delete', old.id, old.title, old.content, old.type);
END;

CREATE TRIGGER IF NOT EXISTS memories_au AFTER UPDATE ON memories BEGIN
    INSERT INTO memories_fts(memories_fts, rowid, title, content, type)
    VALUES ('delete', old.id, old.title, old.content, old.type);
    INSERT INTO memories_fts(rowid, title, content, type)
    VALUES (new.id, new.title, new.content, new.type);
END;
"#;

/// Versioned migrations. Each entry runs inside its own transaction and the
/// recorded `schema_version` advances monotonically.
const MIGRATIONS: &[(i64, &str)] = &[(1, SCHEMA_V1)];

// ---------------------------------------------------------------------------
// Store handle
// ---------------------------------------------------------------------------

/// Process-wide store handle. Pass by reference into every operation; open
/// once, close at shutdown by dropping.
pub struct MemoryDB {
    pool: Pool<SqliteConnectionManager>,
    vec_index: RwLock<vec::VecIndex>,
    brute_force: AtomicBool,
}

impl MemoryDB {
    /// Open (or create) a database at the given path and run migrations.
    /// `":memory:"` opens a private shared-cache database so all pool
    /// connections see the same data (one unique name per open).
    pub fn open(path: &str) -> Result<Self, EngramError> {
        let pool_size = if path == ":memory:" { 2 } else { 8 };
        let manager = if path == ":memory:" {
            let name = uuid::Uuid::new_v4().to_string();
            SqliteConnectionManager::file(format!("file:{name}?mode=memory&cache=shared"))
        } else {
            if let Some(parent) = std::path::Path::new(path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| EngramError::Storage(format!("create {parent:?}: {e}")))?;
                }
            }
            SqliteConnectionManager::file(path)
        };
        let pool = Pool::builder()
            .max_size(pool_size)
            .connection_customizer(Box::new(ConnCustomizer))
            .build(manager)
            .map_err(|e| EngramError::Storage(format!("pool: {e}")))?;

        let conn = pool.get().map_err(|e| EngramError::Storage(e.to_string()))?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(|e| EngramError::Storage(format!("pragmas: {e}")))?;
        run_migrations(&conn).map_err(|e| EngramError::Storage(format!("migrate: {e}")))?;
        drop(conn);

        let db = Self {
            pool,
            vec_index: RwLock::new(vec::VecIndex::new()),
            brute_force: AtomicBool::new(false),
        };
        if !db.load_vec_index() {
            tracing::warn!("vector index unavailable, falling back to brute-force scans");
            db.brute_force.store(true, Ordering::Relaxed);
        }
        Ok(db)
    }

    fn conn(&self) -> Result<PooledConn, EngramError> {
        self.pool.get().map_err(|e| EngramError::Internal(format!("pool: {e}")))
    }

    /// True when the startup index build failed and semantic queries run as
    /// exact full-table scans.
    pub fn brute_force_fallback(&self) -> bool {
        self.brute_force.load(Ordering::Relaxed)
    }

    pub fn get_meta(&self, key: &str) -> Option<String> {
        self.conn().ok().and_then(|c| {
            c.query_row("SELECT value FROM system_meta WHERE key = ?1", [key], |r| r.get(0)).ok()
        })
    }

    pub fn set_meta(&self, key: &str, value: &str) -> Result<(), EngramError> {
        self.conn()?.execute(
            "INSERT OR REPLACE INTO system_meta (key, value) VALUES (?1, ?2)",
            rusqlite::params![key, value],
        )?;
        Ok(())
    }

    pub fn delete_meta(&self, key: &str) -> Result<(), EngramError> {
        self.conn()?.execute("DELETE FROM system_meta WHERE key = ?1", [key])?;
        Ok(())
    }

    /// Database file size in bytes (via SQLite pragma).
    pub fn db_size_bytes(&self) -> i64 {
        self.conn()
            .and_then(|c| {
                c.query_row(
                    "SELECT page_count * page_size FROM pragma_page_count, pragma_page_size",
                    [],
                    |r| r.get(0),
                )
                .map_err(EngramError::from)
            })
            .unwrap_or(0)
    }
}

fn run_migrations(conn: &rusqlite::Connection) -> Result<(), EngramError> {
    conn.execute(META_SCHEMA, [])?;

    let current: i64 = conn
        .query_row("SELECT value FROM system_meta WHERE key = 'schema_version'", [], |r| {
            r.get::<_, String>(0)
        })
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);

    if current == 0 {
        conn.execute(
            "INSERT OR IGNORE INTO system_meta (key, value) VALUES ('created_at', ?1)",
            [now().to_rfc3339()],
        )?;
    }

    for &(version, sql) in MIGRATIONS {
        if version <= current {
            continue;
        }
        conn.execute_batch("BEGIN")?;
        let applied = (|| -> Result<(), EngramError> {
            conn.execute_batch(sql)?;
            conn.execute(
                "INSERT OR REPLACE INTO system_meta (key, value) VALUES ('schema_version', ?1)",
                [version.to_string()],
            )?;
            Ok(())
        })();
        match applied {
            Ok(()) => conn.execute_batch("COMMIT")?,
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK");
                return Err(e);
            }
        }
        tracing::info!(version, "schema migration applied");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

/// Column list for memory queries, without the embedding blob; queries that
/// need the vector select it explicitly.
pub(crate) const MEMORY_COLS: &str = "id, type, title, content, importance, strength, \
    access_count, last_accessed_at, created_at, updated_at, source_conversation_id, \
    source_type, archived";

pub(crate) fn row_to_memory(row: &rusqlite::Row) -> rusqlite::Result<Memory> {
    let type_str: String = row.get("type")?;
    let source_str: String = row.get("source_type")?;
    Ok(Memory {
        id: row.get("id")?,
        mem_type: type_str.parse().unwrap_or(MemoryType::Fact),
        title: row.get("title")?,
        content: row.get("content")?,
        embedding: None,
        importance: row.get("importance")?,
        strength: row.get("strength")?,
        access_count: row.get("access_count")?,
        last_accessed_at: row.get("last_accessed_at")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
        source_conversation_id: row.get("source_conversation_id")?,
        source_type: source_str.parse().unwrap_or(SourceType::Manual),
        archived: row.get::<_, i64>("archived")? != 0,
        tags: Vec::new(),
    })
}

#[cfg(test)]
mod meta_tests {
    use super::*;

    #[test]
    fn meta_get_set() {
        let db = MemoryDB::open(":memory:").unwrap();
        assert_eq!(db.get_meta("nonexistent"), None);
        db.set_meta("last_consolidation_at", "2026-01-01T00:00:00Z").unwrap();
        assert_eq!(db.get_meta("last_consolidation_at"), Some("2026-01-01T00:00:00Z".into()));
        db.set_meta("last_consolidation_at", "2026-02-01T00:00:00Z").unwrap();
        assert_eq!(db.get_meta("last_consolidation_at"), Some("2026-02-01T00:00:00Z".into()));
        db.delete_meta("last_consolidation_at").unwrap();
        assert_eq!(db.get_meta("last_consolidation_at"), None);
    }

    #[test]
    fn migrations_are_idempotent() {
        let db = MemoryDB::open(":memory:").unwrap();
        let conn = db.conn().unwrap();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();
        assert_eq!(db.get_meta("schema_version"), Some(SCHEMA_VERSION.to_string()));
        assert!(db.get_meta("created_at").is_some());
    }

    #[test]
    fn type_round_trip() {
        for t in MemoryType::ALL {
            assert_eq!(t.as_str().parse::<MemoryType>().unwrap(), t);
        }
        assert!("nonsense".parse::<MemoryType>().is_err());
    }

    #[test]
    fn relation_round_trip() {
        for r in ["related_to", "caused_by", "evolved_from", "contradicts", "supersedes"] {
            assert_eq!(r.parse::<LinkRelation>().unwrap().as_str(), r);
        }
        assert!("friends_with".parse::<LinkRelation>().is_err());
    }

    #[test]
    fn tag_normalization() {
        assert_eq!(normalize_tag("  Rust  "), "rust");
        assert_eq!(normalize_tag("ALREADY-lower"), "already-lower");
    }
}

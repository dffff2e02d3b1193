mod common;

use common::{hash_embed, test_db};

use engram::db::{MemoryType, NewMemory, SourceType};

fn plain_memory(title: &str) -> NewMemory {
    NewMemory {
        mem_type: MemoryType::Episode,
        title: title.into(),
        content: format!("{title} happened"),
        embedding: None,
        importance: 0.5,
        source_conversation_id: None,
        source_type: SourceType::Manual,
    }
}

#[test]
fn start_replaces_existing_session() {
    let db = test_db();
    db.start_session("s1", Some("first run")).unwrap();
    db.end_session("s1", None, None).unwrap();

    let restarted = db.start_session("s1", Some("second run")).unwrap();
    assert_eq!(restarted.title.as_deref(), Some("second run"));

    let got = db.get_session("s1").unwrap().unwrap();
    assert_eq!(got.title.as_deref(), Some("second run"));
    assert!(got.ended_at.is_none(), "restart clears the end marker");
}

#[test]
fn end_session_stores_summary_and_embedding() {
    let db = test_db();
    db.start_session("s1", None).unwrap();

    let summary = "Refactored the retrieval funnel and fixed packing.";
    let ok = db.end_session("s1", Some(summary), Some(&hash_embed(summary))).unwrap();
    assert!(ok);

    let got = db.get_session("s1").unwrap().unwrap();
    assert_eq!(got.summary.as_deref(), Some(summary));
    assert!(got.ended_at.is_some());

    assert!(!db.end_session("missing", None, None).unwrap());
}

#[test]
fn empty_session_id_rejected() {
    let db = test_db();
    assert!(db.start_session("  ", None).is_err());
}

#[test]
fn list_sessions_newest_first_with_limit() {
    let db = test_db();
    db.start_session("a", None).unwrap();
    db.start_session("b", None).unwrap();
    db.start_session("c", None).unwrap();

    let sessions = db.list_sessions(None, None, 2).unwrap();
    assert_eq!(sessions.len(), 2);
    assert_eq!(sessions[0].id, "c");
    assert_eq!(sessions[1].id, "b");
}

#[test]
fn access_log_bumps_counter_and_timestamp() {
    let db = test_db();
    let m = db.insert(plain_memory("Observed")).unwrap();
    assert!(m.last_accessed_at.is_none());

    db.log_access(m.id, None, Some("a query"), Some(0.7)).unwrap();
    db.log_access(m.id, None, None, None).unwrap();

    let got = db.get(m.id).unwrap().unwrap();
    assert_eq!(got.access_count, 2);
    assert!(got.last_accessed_at.is_some());
}

#[test]
fn session_context_lists_distinct_memories_recent_first() {
    let db = test_db();
    db.start_session("work", Some("context test")).unwrap();
    let m1 = db.insert(plain_memory("First")).unwrap();
    let m2 = db.insert(plain_memory("Second")).unwrap();

    db.log_access(m1.id, Some("work"), Some("q1"), None).unwrap();
    std::thread::sleep(std::time::Duration::from_millis(5));
    db.log_access(m2.id, Some("work"), Some("q2"), None).unwrap();
    std::thread::sleep(std::time::Duration::from_millis(5));
    db.log_access(m1.id, Some("work"), Some("q3"), None).unwrap();

    let ctx = db.session_context("work").unwrap().unwrap();
    assert_eq!(ctx.session.id, "work");
    let ids: Vec<i64> = ctx.memories.iter().map(|m| m.id).collect();
    assert_eq!(ids, vec![m1.id, m2.id], "distinct, most recently accessed first");

    assert!(db.session_context("missing").unwrap().is_none());
}

#[test]
fn access_log_cascades_on_memory_delete() {
    let db = test_db();
    db.start_session("work", None).unwrap();
    let m = db.insert(plain_memory("Ephemeral")).unwrap();
    db.log_access(m.id, Some("work"), None, None).unwrap();

    db.delete(m.id).unwrap();
    let ctx = db.session_context("work").unwrap().unwrap();
    assert!(ctx.memories.is_empty(), "log rows cascade with the memory");
}

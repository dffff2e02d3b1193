mod common;

use common::{hash_embed, test_db};

use engram::db::{
    LinkRelation, LinkWriteMode, MemoryPatch, MemoryType, NewMemory, SourceType,
};
use engram::export::{export, ExportFormat};
use engram::thresholds::EMBED_DIM;

fn plain(title: &str, mem_type: MemoryType) -> NewMemory {
    NewMemory {
        mem_type,
        title: title.into(),
        content: format!("{title} content"),
        embedding: None,
        importance: 0.5,
        source_conversation_id: None,
        source_type: SourceType::Manual,
    }
}

#[test]
fn insert_rejects_wrong_embedding_dimension() {
    let db = test_db();
    let mut bad = plain("Wrong dim", MemoryType::Fact);
    bad.embedding = Some(vec![0.5; 17]);
    assert!(db.insert(bad).is_err());
}

#[test]
fn set_embedding_enforces_dimension_and_presence() {
    let db = test_db();
    let m = db.insert(plain("Embeddable", MemoryType::Fact)).unwrap();
    assert!(db.set_embedding(m.id, &vec![0.1; 3]).is_err());
    db.set_embedding(m.id, &hash_embed("Embeddable content")).unwrap();
    let emb = db.get_embedding(m.id).unwrap().unwrap();
    assert_eq!(emb.len(), EMBED_DIM);
}

#[test]
fn update_strength_clamps_to_unit_interval() {
    let db = test_db();
    let m = db.insert(plain("Clamped", MemoryType::Fact)).unwrap();
    db.update_fields(m.id, &MemoryPatch { strength: Some(7.0), ..Default::default() }).unwrap();
    assert!((db.get(m.id).unwrap().unwrap().strength - 1.0).abs() < f64::EPSILON);
}

#[test]
fn tag_join_is_idempotent() {
    let db = test_db();
    let m = db.insert(plain("Tagged", MemoryType::Fact)).unwrap();
    db.add_tags(m.id, &["Rust".into(), "rust".into(), " rust ".into()]).unwrap();
    db.add_tags(m.id, &["rust".into()]).unwrap();
    assert_eq!(db.tags_for(m.id).unwrap(), vec!["rust".to_string()]);

    assert!(db.remove_tag(m.id, "RUST").unwrap());
    assert!(db.tags_for(m.id).unwrap().is_empty());
    assert!(!db.remove_tag(m.id, "rust").unwrap());
}

#[test]
fn self_links_rejected_and_unique_pairs_enforced() {
    let db = test_db();
    let a = db.insert(plain("A", MemoryType::Fact)).unwrap();
    let b = db.insert(plain("B", MemoryType::Fact)).unwrap();

    assert!(db
        .insert_link(a.id, a.id, LinkRelation::RelatedTo, 0.5, LinkWriteMode::Replace)
        .is_err());

    db.insert_link(a.id, b.id, LinkRelation::RelatedTo, 0.5, LinkWriteMode::Replace).unwrap();
    // Ignore mode keeps the existing relation.
    db.insert_link(a.id, b.id, LinkRelation::Contradicts, 0.9, LinkWriteMode::Ignore).unwrap();
    let links = db.links_of(a.id).unwrap();
    assert_eq!(links.len(), 1);
    assert_eq!(links[0].relation, LinkRelation::RelatedTo);
    // Replace mode overwrites it.
    db.insert_link(a.id, b.id, LinkRelation::Supersedes, 0.9, LinkWriteMode::Replace).unwrap();
    assert_eq!(db.links_of(a.id).unwrap()[0].relation, LinkRelation::Supersedes);
}

#[test]
fn stats_counts_the_whole_store() {
    let db = test_db();
    let a = db.insert(plain("Active fact", MemoryType::Fact)).unwrap();
    let b = db.insert(plain("Archived episode", MemoryType::Episode)).unwrap();
    db.set_archived(b.id, true).unwrap();
    db.add_tags(a.id, &["metrics".into()]).unwrap();
    db.insert_link(a.id, b.id, LinkRelation::RelatedTo, 0.5, LinkWriteMode::Replace).unwrap();
    db.start_session("s", None).unwrap();

    let stats = db.stats().unwrap();
    assert_eq!(stats.total, 2);
    assert_eq!(stats.active, 1);
    assert_eq!(stats.archived, 1);
    assert_eq!(stats.by_type.get("fact"), Some(&1));
    assert_eq!(stats.tags, 1);
    assert_eq!(stats.links, 1);
    assert_eq!(stats.sessions, 1);
}

#[test]
fn export_json_parses_and_includes_tags() {
    let db = test_db();
    let m = db.insert(plain("Exported", MemoryType::Decision)).unwrap();
    db.add_tags(m.id, &["keep".into()]).unwrap();

    let dump = export(&db, ExportFormat::Json).unwrap();
    let doc: serde_json::Value = serde_json::from_str(&dump).unwrap();
    let memories = doc["memories"].as_array().unwrap();
    assert_eq!(memories.len(), 1);
    assert_eq!(memories[0]["type"], "decision");
    assert_eq!(memories[0]["tags"][0], "keep");
}

#[test]
fn export_markdown_groups_by_type() {
    let db = test_db();
    db.insert(plain("A decision", MemoryType::Decision)).unwrap();
    db.insert(plain("A fact", MemoryType::Fact)).unwrap();

    let dump = export(&db, ExportFormat::Markdown).unwrap();
    assert!(dump.starts_with("# Engram export"));
    assert!(dump.contains("## fact"));
    assert!(dump.contains("## decision"));
    assert!(dump.contains("### A fact"));
}

#[test]
fn list_filters_type_and_archived() {
    let db = test_db();
    let a = db.insert(plain("Visible", MemoryType::Fact)).unwrap();
    let b = db.insert(plain("Hidden", MemoryType::Fact)).unwrap();
    db.set_archived(b.id, true).unwrap();

    let active = db.list(Some(MemoryType::Fact), false, 50, 0).unwrap();
    assert_eq!(active.iter().map(|m| m.id).collect::<Vec<_>>(), vec![a.id]);

    let all = db.list(None, true, 50, 0).unwrap();
    assert_eq!(all.len(), 2, "explicit inspection still sees archived rows");
}

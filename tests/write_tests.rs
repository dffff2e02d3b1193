mod common;

use common::{test_db, HashEmbedder};

use engram::db::{LinkRelation, MemoryType};
use engram::error::EngramError;
use engram::write::{add, ingest, update, AddInput, AddStatus, UpdateInput, MERGE_SEPARATOR};

#[tokio::test]
async fn dedup_same_type_and_title_bumps_access() {
    let db = test_db();
    let e = HashEmbedder;

    let first = add(&db, &e, AddInput::new(MemoryType::Fact, "X", "content")).await.unwrap();
    assert_eq!(first.status, AddStatus::Created);

    let second = add(&db, &e, AddInput::new(MemoryType::Fact, "X", "content")).await.unwrap();
    assert_eq!(second.status, AddStatus::Duplicate);
    assert_eq!(second.id, first.id);

    let got = db.get(first.id).unwrap().unwrap();
    assert_eq!(got.access_count, 1);
    assert!(got.last_accessed_at.is_some());
}

#[tokio::test]
async fn duplicate_add_applies_new_tags() {
    let db = test_db();
    let e = HashEmbedder;

    let first = add(&db, &e, AddInput::new(MemoryType::Fact, "Tagged", "body")).await.unwrap();
    let input = AddInput::new(MemoryType::Fact, "Tagged", "body")
        .tags(vec!["Alpha".into(), "beta".into()]);
    let second = add(&db, &e, input).await.unwrap();
    assert_eq!(second.status, AddStatus::Duplicate);

    let tags = db.tags_for(first.id).unwrap();
    assert!(tags.contains(&"alpha".to_string()), "normalized tag applied: {tags:?}");
    assert!(tags.contains(&"beta".to_string()));
}

#[tokio::test]
async fn same_title_different_type_is_not_a_duplicate() {
    let db = test_db();
    let e = HashEmbedder;

    let a = add(&db, &e, AddInput::new(MemoryType::Fact, "Same title", "completely alpha"))
        .await
        .unwrap();
    let b = add(&db, &e, AddInput::new(MemoryType::Decision, "Same title", "unrelated beta"))
        .await
        .unwrap();
    assert_eq!(a.status, AddStatus::Created);
    assert_eq!(b.status, AddStatus::Created);
    assert_ne!(a.id, b.id);
}

const LIBSQL_BASE: &str =
    "LibSQL provides native vector search with DiskANN FTS5 triggers and incremental \
     vacuum for agent memory workloads.";

#[tokio::test]
async fn merge_on_write_concatenates_and_is_stable() {
    let db = test_db();
    let e = HashEmbedder;

    let first = add(
        &db,
        &e,
        AddInput::new(MemoryType::Fact, "LibSQL memory engine notes alpha", LIBSQL_BASE),
    )
    .await
    .unwrap();
    assert_eq!(first.status, AddStatus::Created);

    let second_content = format!("{LIBSQL_BASE} DiskANN rocks.");
    let second = add(
        &db,
        &e,
        AddInput::new(MemoryType::Fact, "LibSQL memory engine notes", second_content.clone()),
    )
    .await
    .unwrap();
    assert_eq!(second.status, AddStatus::Merged, "near-identical content should merge");
    assert_eq!(second.merged_into, Some(first.id));

    let merged = db.get(first.id).unwrap().unwrap();
    assert!(merged.content.contains(LIBSQL_BASE));
    assert!(merged.content.contains(&second_content));
    assert!(merged.content.contains(MERGE_SEPARATOR));
    // The longer title wins.
    assert_eq!(merged.title, "LibSQL memory engine notes alpha");
    assert_eq!(merged.access_count, 1);
    assert!(merged.strength <= 1.0);

    // Re-adding content that is now a substring leaves the record
    // byte-identical.
    let third = add(
        &db,
        &e,
        AddInput::new(MemoryType::Fact, "LibSQL memory engine notes", second_content),
    )
    .await
    .unwrap();
    assert_eq!(third.status, AddStatus::Merged);
    let after = db.get(first.id).unwrap().unwrap();
    assert_eq!(after.content, merged.content, "substring merge must not change content");
    assert_eq!(after.access_count, 2);
}

#[tokio::test]
async fn merge_does_not_cross_types() {
    let db = test_db();
    let e = HashEmbedder;

    let a = add(&db, &e, AddInput::new(MemoryType::Episode, "Episode entry", LIBSQL_BASE))
        .await
        .unwrap();
    let b = add(&db, &e, AddInput::new(MemoryType::Fact, "Fact entry", LIBSQL_BASE))
        .await
        .unwrap();
    assert_eq!(a.status, AddStatus::Created);
    assert_eq!(b.status, AddStatus::Created, "identical text in another type must not merge");
}

#[tokio::test]
async fn auto_link_connects_semantic_neighbours() {
    let db = test_db();
    let e = HashEmbedder;

    let a = add(&db, &e, AddInput::new(MemoryType::Episode, "Episode entry", LIBSQL_BASE))
        .await
        .unwrap();
    let b = add(&db, &e, AddInput::new(MemoryType::Fact, "Fact entry", LIBSQL_BASE))
        .await
        .unwrap();

    let links = db.links_of(b.id).unwrap();
    assert_eq!(links.len(), 1, "identical cross-type content should auto-link");
    assert_eq!(links[0].source_id, b.id);
    assert_eq!(links[0].target_id, a.id);
    assert_eq!(links[0].relation, LinkRelation::RelatedTo);
    assert!(links[0].strength >= 0.9, "strength tracks rounded similarity");
}

#[tokio::test]
async fn no_auto_link_flag_skips_linking() {
    let db = test_db();
    let e = HashEmbedder;

    add(&db, &e, AddInput::new(MemoryType::Episode, "Episode entry", LIBSQL_BASE)).await.unwrap();
    let b = add(
        &db,
        &e,
        AddInput::new(MemoryType::Fact, "Fact entry", LIBSQL_BASE).no_auto_link(),
    )
    .await
    .unwrap();
    assert!(db.links_of(b.id).unwrap().is_empty());
}

#[tokio::test]
async fn explicit_links_created_with_given_relation() {
    let db = test_db();
    let e = HashEmbedder;

    let a = add(&db, &e, AddInput::new(MemoryType::Decision, "Use SQLite", "storage decision"))
        .await
        .unwrap();
    let mut input = AddInput::new(MemoryType::Decision, "Use WAL mode", "journal decision");
    input.links = vec![engram::write::LinkSpec {
        target_id: a.id,
        relation: LinkRelation::CausedBy,
    }];
    input.auto_link = false;
    let b = add(&db, &e, input).await.unwrap();

    let links = db.links_of(b.id).unwrap();
    assert_eq!(links.len(), 1);
    assert_eq!(links[0].relation, LinkRelation::CausedBy);
    assert!((links[0].strength - 0.5).abs() < 1e-9);
}

#[tokio::test]
async fn permanent_flag_applies_tag() {
    let db = test_db();
    let e = HashEmbedder;

    let out = add(
        &db,
        &e,
        AddInput::new(MemoryType::Preference, "Tabs over spaces", "always").permanent(),
    )
    .await
    .unwrap();
    assert!(db.has_tag(out.id, "permanent").unwrap());
}

#[tokio::test]
async fn rejects_invalid_importance_and_empty_title() {
    let db = test_db();
    let e = HashEmbedder;

    let bad = add(
        &db,
        &e,
        AddInput::new(MemoryType::Fact, "Over range", "x").importance(1.5),
    )
    .await;
    assert!(matches!(bad, Err(EngramError::InvalidImportance(_))));

    let empty = add(&db, &e, AddInput::new(MemoryType::Fact, "   ", "x")).await;
    assert!(matches!(empty, Err(EngramError::EmptyTitle)));

    // Nothing was written.
    assert_eq!(db.stats().unwrap().total, 0);
}

#[tokio::test]
async fn update_reembeds_changed_content() {
    let db = test_db();
    let e = HashEmbedder;

    let out = add(&db, &e, AddInput::new(MemoryType::Fact, "Mutable", "original wording here"))
        .await
        .unwrap();

    let ok = update(
        &db,
        &e,
        out.id,
        UpdateInput { content: Some("fresh replacement text".into()), ..Default::default() },
    )
    .await
    .unwrap();
    assert!(ok);

    let opts = engram::search::SemanticOptions { k: 5, ..Default::default() };
    let hits = engram::search::search_semantic(&db, &e, "fresh replacement text", &opts)
        .await
        .unwrap();
    assert_eq!(hits.first().map(|h| h.memory.id), Some(out.id));
    assert!(hits[0].score > 0.8, "re-embedded content should match strongly");
}

#[tokio::test]
async fn update_missing_returns_false() {
    let db = test_db();
    let e = HashEmbedder;
    let ok = update(&db, &e, 999, UpdateInput::default()).await.unwrap();
    assert!(!ok);
}

#[tokio::test]
async fn delete_cascades_tags_links_and_log() {
    let db = test_db();
    let e = HashEmbedder;

    let a = add(
        &db,
        &e,
        AddInput::new(MemoryType::Fact, "Doomed", "to be deleted").tags(vec!["gone".into()]),
    )
    .await
    .unwrap();
    let b = add(&db, &e, AddInput::new(MemoryType::Fact, "Survivor", "stays around"))
        .await
        .unwrap();
    db.insert_link(a.id, b.id, LinkRelation::RelatedTo, 0.5, engram::db::LinkWriteMode::Replace)
        .unwrap();
    db.log_access(a.id, None, Some("q"), None).unwrap();

    assert!(db.delete(a.id).unwrap());
    assert!(db.get(a.id).unwrap().is_none());
    assert!(db.links_of(b.id).unwrap().is_empty(), "link rows cascade");
    assert!(!db.delete(a.id).unwrap(), "second delete reports missing");
}

#[tokio::test]
async fn ingest_collects_per_item_failures() {
    let db = test_db();
    let e = HashEmbedder;

    let items = vec![
        AddInput::new(MemoryType::Fact, "Good one", "alpha content"),
        AddInput::new(MemoryType::Fact, "  ", "missing title"),
        AddInput::new(MemoryType::Fact, "Good one", "alpha content"),
    ];
    let report = ingest(&db, &e, items).await.unwrap();
    assert_eq!(report.created, 1);
    assert_eq!(report.duplicates, 1);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].index, 1);
    assert!(!report.all_ok());
}
